use crate::domain::batch::{EventBatch, WriteAction};
use crate::domain::event::{
    DecisionEvent, EventRecord, GlobalTxEvent, ParticipatedEvent, TccTxEvent, TccTxType,
};
use crate::domain::ports::EventStore;
use crate::error::{PersistenceError, Result, TxError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Column Family for global transaction boundaries.
pub const CF_GLOBAL_TX_EVENTS: &str = "global_tx_events";
/// Column Family for participations.
pub const CF_PARTICIPATED_EVENTS: &str = "participated_events";
/// Column Family for the TCC event journal.
pub const CF_TCC_TX_EVENTS: &str = "tcc_tx_events";
/// Column Family for the coordinator's DECIDED / COMPLETED rows.
pub const CF_TCC_DECISIONS: &str = "tcc_decisions";
/// Column Family mapping `(table, globalTxId, localTxId, type)` to a row key.
pub const CF_TX_KEYS: &str = "tx_keys";
/// Column Family of started, not yet completed transactions: `globalTxId` to
/// the STARTED time.
pub const CF_UNFINISHED: &str = "unfinished_tx";

const SEPARATOR: u8 = 0;
const COMMIT_STRIPES: usize = 64;

/// A persistent event store implementation using RocksDB.
///
/// Each table lives in its own Column Family. Row keys are
/// `globalTxId \0 sequence`, so a prefix scan returns one global transaction's
/// rows in insertion order. Uniqueness is enforced through `tx_keys`, and a
/// commit is a single `WriteBatch`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    sequence: Arc<AtomicU64>,
    stripes: Arc<Vec<Mutex<()>>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist and resumes the row
    /// sequence after the highest key already stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [
            CF_GLOBAL_TX_EVENTS,
            CF_PARTICIPATED_EVENTS,
            CF_TCC_TX_EVENTS,
            CF_TCC_DECISIONS,
            CF_TX_KEYS,
            CF_UNFINISHED,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, cfs).map_err(PersistenceError::from)?;

        let store = Self {
            db: Arc::new(db),
            sequence: Arc::new(AtomicU64::new(0)),
            stripes: Arc::new((0..COMMIT_STRIPES).map(|_| Mutex::new(())).collect()),
        };
        let last = store.last_sequence()?;
        store.sequence.store(last, Ordering::SeqCst);
        Ok(store)
    }

    fn cf(&self, name: &str) -> std::result::Result<&ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Unavailable(format!("{name} column family not found")))
    }

    fn read_cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| TxError::StorageUnavailable(format!("{name} column family not found")))
    }

    fn last_sequence(&self) -> Result<u64> {
        let mut last = 0;
        for name in [
            CF_GLOBAL_TX_EVENTS,
            CF_PARTICIPATED_EVENTS,
            CF_TCC_TX_EVENTS,
            CF_TCC_DECISIONS,
        ] {
            let cf = self.read_cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item.map_err(unavailable)?;
                if let Some(seq) = sequence_of(&key) {
                    last = last.max(seq);
                }
            }
        }
        Ok(last)
    }

    fn stripe(&self, global_tx_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        global_tx_id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str, global_tx_id: &str) -> Result<Option<Vec<T>>> {
        let cf = self.read_cf(cf_name)?;
        let prefix = partition_prefix(global_tx_id);
        let mut rows = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(unavailable)?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(serde_json::from_slice(&value).map_err(|e| {
                TxError::StorageUnavailable(format!("Failed to deserialize {cf_name} row: {e}"))
            })?);
        }

        Ok(if rows.is_empty() { None } else { Some(rows) })
    }

    fn lookup<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        global_tx_id: &str,
        local_tx_id: &str,
        tx_type: TccTxType,
    ) -> Result<Option<T>> {
        let keys = self.read_cf(CF_TX_KEYS)?;
        let index = index_key(cf_name, global_tx_id, local_tx_id, tx_type);
        let Some(row_key) = self.db.get_cf(keys, index).map_err(unavailable)? else {
            return Ok(None);
        };

        let cf = self.read_cf(cf_name)?;
        match self.db.get_cf(cf, row_key).map_err(unavailable)? {
            Some(bytes) => {
                let row = serde_json::from_slice(&bytes).map_err(|e| {
                    TxError::StorageUnavailable(format!("Failed to deserialize {cf_name} row: {e}"))
                })?;
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn stored_record(
        &self,
        record: &EventRecord,
        row_key: &[u8],
    ) -> std::result::Result<Option<EventRecord>, PersistenceError> {
        let cf = self.cf(record.table())?;
        let Some(bytes) = self.db.get_cf(cf, row_key)? else {
            return Ok(None);
        };
        let stored = match record {
            EventRecord::Global(_) => EventRecord::Global(serde_json::from_slice(&bytes)?),
            EventRecord::Participated(_) => {
                EventRecord::Participated(serde_json::from_slice(&bytes)?)
            }
            EventRecord::Tcc(_) => EventRecord::Tcc(serde_json::from_slice(&bytes)?),
            EventRecord::Decision(_) => EventRecord::Decision(serde_json::from_slice(&bytes)?),
        };
        Ok(Some(stored))
    }

    fn write_batch(&self, batch: EventBatch) -> std::result::Result<(), PersistenceError> {
        let keys_cf = self.cf(CF_TX_KEYS)?;
        let unfinished_cf = self.cf(CF_UNFINISHED)?;
        let global_tx_id = batch.global_tx_id().to_string();
        let completed_index = index_key(
            CF_TCC_DECISIONS,
            &global_tx_id,
            &global_tx_id,
            TccTxType::Completed,
        );
        let mut write = WriteBatch::default();
        // Rows staged earlier in this batch, by index key.
        let mut staged: HashMap<Vec<u8>, (Vec<u8>, EventRecord)> = HashMap::new();

        for (record, mode) in batch.into_writes() {
            let index = index_key(
                record.table(),
                record.global_tx_id(),
                record.local_tx_id(),
                record.tx_type(),
            );

            let existing = match staged.get(&index) {
                Some((row_key, row)) => Some((row_key.clone(), row.clone())),
                None => match self.db.get_cf(keys_cf, &index)? {
                    Some(row_key) => self
                        .stored_record(&record, &row_key)?
                        .map(|row| (row_key, row)),
                    None => None,
                },
            };

            let row_key = match mode.resolve(existing.as_ref().map(|(_, row)| row), &record)? {
                WriteAction::Skip => continue,
                WriteAction::Replace => match existing {
                    Some((row_key, _)) => row_key,
                    None => continue,
                },
                WriteAction::Insert => {
                    let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                    let row_key = sequenced_key(&global_tx_id, seq);
                    write.put_cf(keys_cf, &index, &row_key);
                    row_key
                }
            };

            match &record {
                EventRecord::Global(e) if e.tx_type == TccTxType::Started => {
                    let completed = staged.contains_key(&completed_index)
                        || self.db.get_cf(keys_cf, &completed_index)?.is_some();
                    if !completed {
                        let started = serde_json::to_vec(&e.creation_time)?;
                        write.put_cf(unfinished_cf, global_tx_id.as_bytes(), started);
                    }
                }
                EventRecord::Decision(e) if e.tx_type == TccTxType::Completed => {
                    write.delete_cf(unfinished_cf, global_tx_id.as_bytes());
                }
                _ => {}
            }

            let value = match &record {
                EventRecord::Global(e) => serde_json::to_vec(e)?,
                EventRecord::Participated(e) => serde_json::to_vec(e)?,
                EventRecord::Tcc(e) => serde_json::to_vec(e)?,
                EventRecord::Decision(e) => serde_json::to_vec(e)?,
            };
            write.put_cf(self.cf(record.table())?, &row_key, value);
            staged.insert(index, (row_key, record));
        }

        self.db.write(write)?;
        Ok(())
    }
}

fn unavailable(e: rocksdb::Error) -> TxError {
    TxError::StorageUnavailable(e.to_string())
}

fn partition_prefix(global_tx_id: &str) -> Vec<u8> {
    let mut prefix = global_tx_id.as_bytes().to_vec();
    prefix.push(SEPARATOR);
    prefix
}

fn sequenced_key(global_tx_id: &str, seq: u64) -> Vec<u8> {
    let mut key = partition_prefix(global_tx_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn sequence_of(row_key: &[u8]) -> Option<u64> {
    let tail = row_key.len().checked_sub(8)?;
    let bytes: [u8; 8] = row_key[tail..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn index_key(table: &str, global_tx_id: &str, local_tx_id: &str, tx_type: TccTxType) -> Vec<u8> {
    let mut key = Vec::new();
    for part in [table, global_tx_id, local_tx_id, tx_type.as_str()] {
        key.extend_from_slice(part.as_bytes());
        key.push(SEPARATOR);
    }
    key
}

#[async_trait]
impl EventStore for RocksDBStore {
    async fn commit(&self, batch: EventBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.stripe(batch.global_tx_id()).lock().await;
        self.write_batch(batch)?;
        Ok(())
    }

    async fn find_global_events(&self, global_tx_id: &str) -> Result<Option<Vec<GlobalTxEvent>>> {
        self.scan(CF_GLOBAL_TX_EVENTS, global_tx_id)
    }

    async fn find_participations(
        &self,
        global_tx_id: &str,
    ) -> Result<Option<Vec<ParticipatedEvent>>> {
        self.scan(CF_PARTICIPATED_EVENTS, global_tx_id)
    }

    async fn find_tcc_events(&self, global_tx_id: &str) -> Result<Option<Vec<TccTxEvent>>> {
        self.scan(CF_TCC_TX_EVENTS, global_tx_id)
    }

    async fn find_participation(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<ParticipatedEvent>> {
        self.lookup(
            CF_PARTICIPATED_EVENTS,
            global_tx_id,
            local_tx_id,
            TccTxType::Participated,
        )
    }

    async fn find_coordination(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<TccTxEvent>> {
        self.lookup(
            CF_TCC_TX_EVENTS,
            global_tx_id,
            local_tx_id,
            TccTxType::Coordinated,
        )
    }

    async fn find_decisions(&self, global_tx_id: &str) -> Result<Option<Vec<DecisionEvent>>> {
        self.scan(CF_TCC_DECISIONS, global_tx_id)
    }

    async fn unfinished_global_tx_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let cf = self.read_cf(CF_UNFINISHED)?;
        let mut ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(unavailable)?;
            let started: DateTime<Utc> = serde_json::from_slice(&value).map_err(|e| {
                TxError::StorageUnavailable(format!("Failed to deserialize start time: {e}"))
            })?;
            if started < cutoff {
                ids.push(String::from_utf8_lossy(&key).into_owned());
            }
        }

        Ok(ids)
    }
}
