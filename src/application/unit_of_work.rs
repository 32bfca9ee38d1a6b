use crate::domain::batch::{EventBatch, WriteMode};
use crate::domain::event::EventRecord;
use crate::domain::ports::EventStore;
use crate::error::{Result, TxError};

/// One event's worth of store writes, applied by [`UnitOfWork::commit`] or
/// not at all.
///
/// Dropping a unit of work without committing it writes nothing.
pub struct UnitOfWork<'a> {
    store: &'a dyn EventStore,
    batch: EventBatch,
}

impl<'a> UnitOfWork<'a> {
    pub fn begin(store: &'a dyn EventStore, global_tx_id: &str) -> Self {
        Self {
            store,
            batch: EventBatch::new(global_tx_id),
        }
    }

    pub fn stage(&mut self, record: EventRecord, mode: WriteMode) -> Result<()> {
        let global_tx_id = record.global_tx_id().to_string();
        if self.batch.push(record, mode) {
            Ok(())
        } else {
            Err(TxError::ProtocolViolation(format!(
                "record of {global_tx_id} staged in unit of work of {}",
                self.batch.global_tx_id()
            )))
        }
    }

    pub async fn commit(self) -> Result<()> {
        self.store.commit(self.batch).await
    }
}
