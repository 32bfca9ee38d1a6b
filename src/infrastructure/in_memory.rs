use crate::domain::batch::{EventBatch, WriteAction};
use crate::domain::event::{
    DecisionEvent, EventRecord, GlobalTxEvent, ParticipatedEvent, TccTxEvent, TccTxType,
};
use crate::domain::ports::EventStore;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Rows of one globalTxId, per table, in insertion order.
#[derive(Default, Clone)]
struct Partition {
    global: Vec<EventRecord>,
    participated: Vec<EventRecord>,
    tcc: Vec<EventRecord>,
    decisions: Vec<EventRecord>,
}

impl Partition {
    fn table_mut(&mut self, record: &EventRecord) -> &mut Vec<EventRecord> {
        match record {
            EventRecord::Global(_) => &mut self.global,
            EventRecord::Participated(_) => &mut self.participated,
            EventRecord::Tcc(_) => &mut self.tcc,
            EventRecord::Decision(_) => &mut self.decisions,
        }
    }

    /// Start time while the transaction is started and not yet completed.
    fn open_since(&self) -> Option<DateTime<Utc>> {
        if self
            .decisions
            .iter()
            .any(|row| row.tx_type() == TccTxType::Completed)
        {
            return None;
        }
        self.global
            .iter()
            .find(|row| row.tx_type() == TccTxType::Started)
            .map(EventRecord::creation_time)
    }

    fn apply(&mut self, batch: EventBatch) -> Result<()> {
        for (record, mode) in batch.into_writes() {
            let rows = self.table_mut(&record);
            let position = rows.iter().position(|row| row.key() == record.key());
            match mode.resolve(position.map(|i| &rows[i]), &record)? {
                WriteAction::Insert => rows.push(record),
                WriteAction::Replace => {
                    if let Some(i) = position {
                        rows[i] = record;
                    }
                }
                WriteAction::Skip => {}
            }
        }
        Ok(())
    }
}

/// A thread-safe in-memory event store.
///
/// Every globalTxId owns a partition behind its own lock, so commits for
/// different global transactions never wait on each other. A commit is applied
/// to a copy of the partition and swapped in only when every write succeeded.
/// Unfinished transactions are indexed by start time for the recovery sweep.
#[derive(Default, Clone)]
pub struct InMemoryEventStore {
    partitions: Arc<RwLock<HashMap<String, Arc<Mutex<Partition>>>>>,
    unfinished: Arc<RwLock<BTreeSet<(DateTime<Utc>, String)>>>,
}

impl InMemoryEventStore {
    /// Creates a new, empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn partition(&self, global_tx_id: &str) -> Option<Arc<Mutex<Partition>>> {
        let partitions = self.partitions.read().await;
        partitions.get(global_tx_id).cloned()
    }

    async fn partition_or_create(&self, global_tx_id: &str) -> Arc<Mutex<Partition>> {
        if let Some(partition) = self.partition(global_tx_id).await {
            return partition;
        }
        let mut partitions = self.partitions.write().await;
        partitions
            .entry(global_tx_id.to_string())
            .or_default()
            .clone()
    }

    async fn rows<T>(
        &self,
        global_tx_id: &str,
        table: impl Fn(&Partition) -> &Vec<EventRecord>,
        pick: impl Fn(&EventRecord) -> Option<T>,
    ) -> Option<Vec<T>> {
        let partition = self.partition(global_tx_id).await?;
        let partition = partition.lock().await;
        let rows: Vec<T> = table(&partition).iter().filter_map(pick).collect();
        if rows.is_empty() { None } else { Some(rows) }
    }
}

fn as_global(record: &EventRecord) -> Option<GlobalTxEvent> {
    match record {
        EventRecord::Global(e) => Some(e.clone()),
        _ => None,
    }
}

fn as_participated(record: &EventRecord) -> Option<ParticipatedEvent> {
    match record {
        EventRecord::Participated(e) => Some(e.clone()),
        _ => None,
    }
}

fn as_tcc(record: &EventRecord) -> Option<TccTxEvent> {
    match record {
        EventRecord::Tcc(e) => Some(e.clone()),
        _ => None,
    }
}

fn as_decision(record: &EventRecord) -> Option<DecisionEvent> {
    match record {
        EventRecord::Decision(e) => Some(e.clone()),
        _ => None,
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn commit(&self, batch: EventBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let global_tx_id = batch.global_tx_id().to_string();
        let partition = self.partition_or_create(&global_tx_id).await;
        let mut partition = partition.lock().await;

        let before = partition.open_since();
        let mut staged = partition.clone();
        staged.apply(batch)?;
        let after = staged.open_since();
        *partition = staged;

        if before != after {
            let mut unfinished = self.unfinished.write().await;
            if let Some(started) = before {
                unfinished.remove(&(started, global_tx_id.clone()));
            }
            if let Some(started) = after {
                unfinished.insert((started, global_tx_id));
            }
        }
        Ok(())
    }

    async fn find_global_events(&self, global_tx_id: &str) -> Result<Option<Vec<GlobalTxEvent>>> {
        Ok(self.rows(global_tx_id, |p| &p.global, as_global).await)
    }

    async fn find_participations(
        &self,
        global_tx_id: &str,
    ) -> Result<Option<Vec<ParticipatedEvent>>> {
        Ok(self
            .rows(global_tx_id, |p| &p.participated, as_participated)
            .await)
    }

    async fn find_tcc_events(&self, global_tx_id: &str) -> Result<Option<Vec<TccTxEvent>>> {
        Ok(self.rows(global_tx_id, |p| &p.tcc, as_tcc).await)
    }

    async fn find_participation(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<ParticipatedEvent>> {
        let participations = self.find_participations(global_tx_id).await?;
        Ok(participations
            .into_iter()
            .flatten()
            .find(|p| p.tx.local_tx_id == local_tx_id))
    }

    async fn find_coordination(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<TccTxEvent>> {
        let events = self.find_tcc_events(global_tx_id).await?;
        Ok(events
            .into_iter()
            .flatten()
            .find(|e| e.is_coordination() && e.tx.local_tx_id == local_tx_id))
    }

    async fn find_decisions(&self, global_tx_id: &str) -> Result<Option<Vec<DecisionEvent>>> {
        Ok(self.rows(global_tx_id, |p| &p.decisions, as_decision).await)
    }

    async fn unfinished_global_tx_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let unfinished = self.unfinished.read().await;
        let mut ids: Vec<String> = unfinished
            .iter()
            .take_while(|(started, _)| *started < cutoff)
            .map(|(_, global_tx_id)| global_tx_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
