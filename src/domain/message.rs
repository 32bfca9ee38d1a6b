use super::event::{GlobalTxEvent, ParticipatedEvent, TccTxEvent, TxIdentity};
use serde::{Deserialize, Serialize};

/// Participant to coordinator message. The wire encoding is up to the
/// transport; this is only the schema.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlphaMessage {
    TccStarted(GlobalTxEvent),
    Participated(ParticipatedEvent),
    TccEnded(GlobalTxEvent),
    Coordinated(TccTxEvent),
}

impl AlphaMessage {
    pub fn tx(&self) -> &TxIdentity {
        match self {
            AlphaMessage::TccStarted(e) | AlphaMessage::TccEnded(e) => &e.tx,
            AlphaMessage::Participated(e) => &e.tx,
            AlphaMessage::Coordinated(e) => &e.tx,
        }
    }

    pub fn global_tx_id(&self) -> &str {
        &self.tx().global_tx_id
    }
}
