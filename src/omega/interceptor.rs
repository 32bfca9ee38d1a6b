use super::context::OmegaContext;
use crate::domain::event::{GlobalTxEvent, TransactionStatus, TxIdentity};
use crate::domain::message::AlphaMessage;
use crate::error::{Result, TxError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub enum TxEventType {
    TxStartedEvent,
    TxEndedEvent,
    TxAbortedEvent,
}

impl fmt::Display for TxEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxEventType::TxStartedEvent => f.write_str("TxStartedEvent"),
            TxEventType::TxEndedEvent => f.write_str("TxEndedEvent"),
            TxEventType::TxAbortedEvent => f.write_str("TxAbortedEvent"),
        }
    }
}

/// What the interceptor reports about one local unit of work.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TxEvent {
    pub event_type: TxEventType,
    pub global_tx_id: String,
    pub local_tx_id: String,
    pub parent_tx_id: Option<String>,
    /// Input of the unit of work for a started event, the error text for an
    /// aborted one, empty otherwise.
    pub payloads: Vec<Value>,
}

impl TxEvent {
    /// Maps the event onto the coordinator's global transaction records. A
    /// started event carries its payloads as a JSON array. An aborted unit of
    /// work ends the transaction with `Failed`.
    pub fn into_alpha_message(self, service_name: &str, instance_id: &str) -> Result<AlphaMessage> {
        let tx = TxIdentity::new(
            service_name,
            instance_id,
            self.global_tx_id,
            self.local_tx_id,
            self.parent_tx_id,
        );
        let message = match self.event_type {
            TxEventType::TxStartedEvent => {
                let payload = serde_json::to_vec(&self.payloads)?;
                AlphaMessage::TccStarted(GlobalTxEvent::started(tx).with_payload(payload))
            }
            TxEventType::TxEndedEvent => {
                AlphaMessage::TccEnded(GlobalTxEvent::ended(tx, TransactionStatus::Succeed))
            }
            TxEventType::TxAbortedEvent => {
                AlphaMessage::TccEnded(GlobalTxEvent::ended(tx, TransactionStatus::Failed))
            }
        };
        Ok(message)
    }
}

pub trait MessageSerializer: Send + Sync {
    fn serialize(&self, event: &TxEvent) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonMessageSerializer;

impl MessageSerializer for JsonMessageSerializer {
    fn serialize(&self, event: &TxEvent) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }
}

/// Wraps a participant's unit of work with Started and Ended/Aborted
/// messages. Sending is attempted once; a failed send is returned, never
/// retried.
#[derive(Clone)]
pub struct TransactionInterceptor {
    serializer: Arc<dyn MessageSerializer>,
    sender: Arc<dyn MessageSender>,
}

impl TransactionInterceptor {
    pub fn new(serializer: Arc<dyn MessageSerializer>, sender: Arc<dyn MessageSender>) -> Self {
        Self { serializer, sender }
    }

    /// Runs `work` inside the transaction described by `context`.
    ///
    /// Without a globalTxId the work runs on its own and nothing is sent. If
    /// the Started message cannot be sent the work does not run.
    pub async fn intercept<T, F, Fut>(
        &self,
        context: &OmegaContext,
        payloads: Vec<Value>,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (Some(global_tx_id), Some(local_tx_id)) = (context.global_tx_id(), context.local_tx_id())
        else {
            return work().await;
        };
        let event = |event_type: TxEventType, payloads: Vec<Value>| TxEvent {
            event_type,
            global_tx_id: global_tx_id.to_string(),
            local_tx_id: local_tx_id.to_string(),
            parent_tx_id: context.parent_tx_id().map(str::to_string),
            payloads,
        };

        self.emit(event(TxEventType::TxStartedEvent, payloads)).await?;
        match work().await {
            Ok(value) => {
                self.emit(event(TxEventType::TxEndedEvent, Vec::new())).await?;
                Ok(value)
            }
            Err(e) => {
                let aborted = event(TxEventType::TxAbortedEvent, vec![Value::String(e.to_string())]);
                if let Err(send_error) = self.emit(aborted).await {
                    warn!(
                        global_tx_id = %global_tx_id,
                        local_tx_id = %local_tx_id,
                        error = %send_error,
                        "Failed to report aborted unit of work"
                    );
                }
                Err(e)
            }
        }
    }

    async fn emit(&self, event: TxEvent) -> Result<()> {
        let bytes = self.serializer.serialize(&event)?;
        self.sender.send(bytes).await?;
        debug!(
            global_tx_id = %event.global_tx_id,
            local_tx_id = %event.local_tx_id,
            event = %event.event_type,
            "Transaction event sent"
        );
        Ok(())
    }
}

/// Sender that rejects everything, for participants without a coordinator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisconnectedSender;

#[async_trait]
impl MessageSender for DisconnectedSender {
    async fn send(&self, _message: Vec<u8>) -> Result<()> {
        Err(TxError::Transport("no coordinator connection".to_string()))
    }
}
