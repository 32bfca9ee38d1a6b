use super::event::EventRecord;
use crate::error::PersistenceError;

/// How a staged record meets an existing row with the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// An identical row makes the write a no-op; a different one is a
    /// duplicate-key failure that aborts the batch.
    InsertIfAbsent,
    /// Replace the existing row in place (last write wins).
    Upsert,
}

/// What a store does with one staged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Insert,
    Replace,
    Skip,
}

impl WriteMode {
    /// Decides how `incoming` lands given the row currently stored under its key.
    pub fn resolve(
        &self,
        existing: Option<&EventRecord>,
        incoming: &EventRecord,
    ) -> Result<WriteAction, PersistenceError> {
        match (existing, self) {
            (None, _) => Ok(WriteAction::Insert),
            (Some(_), WriteMode::Upsert) => Ok(WriteAction::Replace),
            (Some(current), WriteMode::InsertIfAbsent) if current.same_fact(incoming) => {
                Ok(WriteAction::Skip)
            }
            (Some(_), WriteMode::InsertIfAbsent) => Err(PersistenceError::DuplicateKey {
                table: incoming.table(),
                global_tx_id: incoming.global_tx_id().to_string(),
                local_tx_id: incoming.local_tx_id().to_string(),
                tx_type: incoming.tx_type().to_string(),
            }),
        }
    }
}

/// The writes of one unit of work. All records belong to one globalTxId and
/// are applied all-or-nothing by [`crate::domain::ports::EventStore::commit`].
#[derive(Debug, Clone)]
pub struct EventBatch {
    global_tx_id: String,
    writes: Vec<(EventRecord, WriteMode)>,
}

impl EventBatch {
    pub fn new(global_tx_id: impl Into<String>) -> Self {
        Self {
            global_tx_id: global_tx_id.into(),
            writes: Vec::new(),
        }
    }

    pub fn global_tx_id(&self) -> &str {
        &self.global_tx_id
    }

    /// Adds a record. Returns `false` and leaves the batch untouched when the
    /// record belongs to another global transaction.
    pub fn push(&mut self, record: EventRecord, mode: WriteMode) -> bool {
        if record.global_tx_id() != self.global_tx_id {
            return false;
        }
        self.writes.push((record, mode));
        true
    }

    pub fn writes(&self) -> &[(EventRecord, WriteMode)] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<(EventRecord, WriteMode)> {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether any staged write targets the given table.
    pub fn touches(&self, table: &str) -> bool {
        self.writes.iter().any(|(record, _)| record.table() == table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{GlobalTxEvent, TransactionStatus, TxIdentity};

    #[test]
    fn test_batch_rejects_foreign_partition() {
        let mut batch = EventBatch::new("g1");
        let own = GlobalTxEvent::started(TxIdentity::new("s", "i", "g1", "l1", None));
        let foreign = GlobalTxEvent::started(TxIdentity::new("s", "i", "g2", "l1", None));

        assert!(batch.push(EventRecord::Global(own), WriteMode::InsertIfAbsent));
        assert!(!batch.push(EventRecord::Global(foreign), WriteMode::InsertIfAbsent));
        assert_eq!(batch.len(), 1);
        assert!(batch.touches("global_tx_events"));
        assert!(!batch.touches("tcc_tx_events"));
    }

    #[test]
    fn test_write_mode_resolution() {
        let tx = TxIdentity::new("s", "i", "g1", "l1", None);
        let ended = EventRecord::Global(GlobalTxEvent::ended(tx.clone(), TransactionStatus::Succeed));
        let same_again =
            EventRecord::Global(GlobalTxEvent::ended(tx.clone(), TransactionStatus::Succeed));
        let conflicting = EventRecord::Global(GlobalTxEvent::ended(tx, TransactionStatus::Failed));

        let insert = WriteMode::InsertIfAbsent;
        assert_eq!(insert.resolve(None, &ended).unwrap(), WriteAction::Insert);
        assert_eq!(insert.resolve(Some(&ended), &same_again).unwrap(), WriteAction::Skip);
        assert!(matches!(
            insert.resolve(Some(&ended), &conflicting),
            Err(PersistenceError::DuplicateKey { .. })
        ));
        assert_eq!(
            WriteMode::Upsert.resolve(Some(&ended), &conflicting).unwrap(),
            WriteAction::Replace
        );
    }
}
