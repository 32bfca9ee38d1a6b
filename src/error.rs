use thiserror::Error;

/// Failure to durably write a unit of work.
///
/// Any of these aborts the whole batch: nothing from it becomes visible.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Duplicate key ({global_tx_id}, {local_tx_id}, {tx_type}) in {table}")]
    DuplicateKey {
        table: &'static str,
        global_tx_id: String,
        local_tx_id: String,
        tx_type: String,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

#[derive(Error, Debug)]
pub enum TxError {
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("No acknowledgment from {local_tx_id} of {global_tx_id} within {timeout_ms}ms")]
    DispatchTimeout {
        global_tx_id: String,
        local_tx_id: String,
        timeout_ms: u128,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("No handler registered for method {0}")]
    UnknownMethod(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TxError {
    /// Whether the same event may be submitted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxError::Persistence(PersistenceError::Unavailable(_))
                | TxError::StorageUnavailable(_)
                | TxError::DispatchTimeout { .. }
                | TxError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
