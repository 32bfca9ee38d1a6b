use super::batch::EventBatch;
use super::command::CoordinateCommand;
use super::command::Outcome;
use super::event::{DecisionEvent, GlobalTxEvent, ParticipatedEvent, TccTxEvent, TransactionStatus};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Durable storage for the three record tables.
///
/// Finders return `Ok(None)` when nothing is stored for the key and
/// `Err(TxError::StorageUnavailable)` when the query itself fails; they never
/// return `Ok(Some(vec![]))`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Applies every write of the batch or none of them.
    async fn commit(&self, batch: EventBatch) -> Result<()>;

    async fn find_global_events(&self, global_tx_id: &str) -> Result<Option<Vec<GlobalTxEvent>>>;

    async fn find_participations(
        &self,
        global_tx_id: &str,
    ) -> Result<Option<Vec<ParticipatedEvent>>>;

    async fn find_tcc_events(&self, global_tx_id: &str) -> Result<Option<Vec<TccTxEvent>>>;

    async fn find_participation(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<ParticipatedEvent>>;

    async fn find_coordination(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<TccTxEvent>>;

    /// The coordinator's DECIDED and COMPLETED rows for a global transaction.
    async fn find_decisions(&self, global_tx_id: &str) -> Result<Option<Vec<DecisionEvent>>>;

    /// Global transactions started before `cutoff` that have no COMPLETED
    /// row. Served from an index of unfinished transactions, so the cost
    /// follows what is still open rather than the whole history.
    async fn unfinished_global_tx_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;
}

pub type EventStoreRef = Arc<dyn EventStore>;

/// Outbound half of a participant connection.
#[async_trait]
pub trait OmegaCallback: Send + Sync {
    async fn send(&self, command: CoordinateCommand) -> Result<()>;
}

pub type CallbackRef = Arc<dyn OmegaCallback>;

/// What the ingestion service tells its listener after a commit succeeded.
#[derive(Debug, Clone, PartialEq)]
pub enum TxSignal {
    Started {
        global_tx_id: String,
        creation_time: DateTime<Utc>,
    },
    Participated {
        global_tx_id: String,
        local_tx_id: String,
        status: TransactionStatus,
    },
    Ended {
        global_tx_id: String,
        status: TransactionStatus,
        creation_time: DateTime<Utc>,
    },
    Coordinated {
        global_tx_id: String,
        local_tx_id: String,
        status: TransactionStatus,
        outcome: Option<Outcome>,
    },
}

impl TxSignal {
    pub fn global_tx_id(&self) -> &str {
        match self {
            TxSignal::Started { global_tx_id, .. }
            | TxSignal::Participated { global_tx_id, .. }
            | TxSignal::Ended { global_tx_id, .. }
            | TxSignal::Coordinated { global_tx_id, .. } => global_tx_id,
        }
    }
}

#[async_trait]
pub trait TxEventListener: Send + Sync {
    async fn on_signal(&self, signal: TxSignal);
}

pub type TxEventListenerRef = Arc<dyn TxEventListener>;
