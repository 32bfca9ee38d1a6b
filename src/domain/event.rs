use super::command::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome a participant reports for its part of a transaction.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
pub enum TransactionStatus {
    Succeed,
    Failed,
}

impl TransactionStatus {
    pub fn is_success(&self) -> bool {
        *self == TransactionStatus::Succeed
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Succeed => f.write_str("Succeed"),
            TransactionStatus::Failed => f.write_str("Failed"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
pub enum TccTxType {
    Started,
    Ended,
    Participated,
    Coordinated,
    Decided,
    Completed,
}

impl TccTxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TccTxType::Started => "STARTED",
            TccTxType::Ended => "ENDED",
            TccTxType::Participated => "PARTICIPATED",
            TccTxType::Coordinated => "COORDINATED",
            TccTxType::Decided => "DECIDED",
            TccTxType::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TccTxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who reported an event and which leg of which global transaction it belongs to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone)]
pub struct TxIdentity {
    pub service_name: String,
    pub instance_id: String,
    pub global_tx_id: String,
    pub local_tx_id: String,
    #[serde(default)]
    pub parent_tx_id: Option<String>,
}

impl TxIdentity {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
        parent_tx_id: Option<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            global_tx_id: global_tx_id.into(),
            local_tx_id: local_tx_id.into(),
            parent_tx_id,
        }
    }
}

/// Boundary of a global transaction: one row per STARTED and per ENDED.
///
/// A STARTED event may carry the initiator's input as opaque bytes.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GlobalTxEvent {
    #[serde(flatten)]
    pub tx: TxIdentity,
    pub tx_type: TccTxType,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    pub creation_time: DateTime<Utc>,
}

impl GlobalTxEvent {
    pub fn new(tx: TxIdentity, tx_type: TccTxType, status: TransactionStatus) -> Self {
        Self {
            tx,
            tx_type,
            status,
            payload: Vec::new(),
            creation_time: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn started(tx: TxIdentity) -> Self {
        Self::new(tx, TccTxType::Started, TransactionStatus::Succeed)
    }

    pub fn ended(tx: TxIdentity, status: TransactionStatus) -> Self {
        Self::new(tx, TccTxType::Ended, status)
    }
}

/// A participant joining a global transaction, with the methods that confirm
/// or cancel its tentative work.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ParticipatedEvent {
    #[serde(flatten)]
    pub tx: TxIdentity,
    pub confirm_method: String,
    pub cancel_method: String,
    pub status: TransactionStatus,
    pub creation_time: DateTime<Utc>,
}

impl ParticipatedEvent {
    pub fn new(
        tx: TxIdentity,
        confirm_method: impl Into<String>,
        cancel_method: impl Into<String>,
        status: TransactionStatus,
    ) -> Self {
        Self {
            tx,
            confirm_method: confirm_method.into(),
            cancel_method: cancel_method.into(),
            status,
            creation_time: Utc::now(),
        }
    }
}

/// Row of the TCC event journal.
///
/// Every ingested event leaves one of these next to its own row. Rows of type
/// `COORDINATED` are the coordination records: the participant ran the
/// confirm or cancel method it was sent, named by `outcome` when the
/// participant reports it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TccTxEvent {
    #[serde(flatten)]
    pub tx: TxIdentity,
    pub tx_type: TccTxType,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub creation_time: DateTime<Utc>,
}

impl TccTxEvent {
    pub fn new(tx: TxIdentity, tx_type: TccTxType, status: TransactionStatus) -> Self {
        Self {
            tx,
            tx_type,
            status,
            outcome: None,
            creation_time: Utc::now(),
        }
    }

    pub fn coordinated(tx: TxIdentity, status: TransactionStatus) -> Self {
        Self::new(tx, TccTxType::Coordinated, status)
    }

    /// Names the command this coordination report answers.
    pub fn answering(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn is_coordination(&self) -> bool {
        self.tx_type == TccTxType::Coordinated
    }
}

impl From<&GlobalTxEvent> for TccTxEvent {
    fn from(event: &GlobalTxEvent) -> Self {
        Self {
            tx: event.tx.clone(),
            tx_type: event.tx_type,
            status: event.status,
            outcome: None,
            creation_time: event.creation_time,
        }
    }
}

impl From<&ParticipatedEvent> for TccTxEvent {
    fn from(event: &ParticipatedEvent) -> Self {
        Self {
            tx: event.tx.clone(),
            tx_type: TccTxType::Participated,
            status: event.status,
            outcome: None,
            creation_time: event.creation_time,
        }
    }
}

/// The coordinator's own journal: the outcome it decided for a global
/// transaction (`DECIDED`, written before any command goes out) and, once
/// every leg settled, its completion (`COMPLETED`).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DecisionEvent {
    pub global_tx_id: String,
    pub tx_type: TccTxType,
    pub outcome: Outcome,
    pub creation_time: DateTime<Utc>,
}

impl DecisionEvent {
    pub fn decided(global_tx_id: impl Into<String>, outcome: Outcome) -> Self {
        Self::new(global_tx_id, TccTxType::Decided, outcome)
    }

    pub fn completed(global_tx_id: impl Into<String>, outcome: Outcome) -> Self {
        Self::new(global_tx_id, TccTxType::Completed, outcome)
    }

    fn new(global_tx_id: impl Into<String>, tx_type: TccTxType, outcome: Outcome) -> Self {
        Self {
            global_tx_id: global_tx_id.into(),
            tx_type,
            outcome,
            creation_time: Utc::now(),
        }
    }
}

/// Any persisted record, tagged with the table it lives in.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum EventRecord {
    Global(GlobalTxEvent),
    Participated(ParticipatedEvent),
    Tcc(TccTxEvent),
    Decision(DecisionEvent),
}

impl EventRecord {
    pub fn global_tx_id(&self) -> &str {
        match self {
            EventRecord::Global(e) => &e.tx.global_tx_id,
            EventRecord::Participated(e) => &e.tx.global_tx_id,
            EventRecord::Tcc(e) => &e.tx.global_tx_id,
            EventRecord::Decision(e) => &e.global_tx_id,
        }
    }

    /// Decisions belong to the whole transaction and use its globalTxId.
    pub fn local_tx_id(&self) -> &str {
        match self {
            EventRecord::Global(e) => &e.tx.local_tx_id,
            EventRecord::Participated(e) => &e.tx.local_tx_id,
            EventRecord::Tcc(e) => &e.tx.local_tx_id,
            EventRecord::Decision(e) => &e.global_tx_id,
        }
    }

    pub fn tx_type(&self) -> TccTxType {
        match self {
            EventRecord::Global(e) => e.tx_type,
            EventRecord::Participated(_) => TccTxType::Participated,
            EventRecord::Tcc(e) => e.tx_type,
            EventRecord::Decision(e) => e.tx_type,
        }
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        match self {
            EventRecord::Global(e) => e.creation_time,
            EventRecord::Participated(e) => e.creation_time,
            EventRecord::Tcc(e) => e.creation_time,
            EventRecord::Decision(e) => e.creation_time,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EventRecord::Global(_) => "global_tx_events",
            EventRecord::Participated(_) => "participated_events",
            EventRecord::Tcc(_) => "tcc_tx_events",
            EventRecord::Decision(_) => "tcc_decisions",
        }
    }

    /// Uniqueness key within its table: `(localTxId, type)` inside the
    /// globalTxId partition.
    pub fn key(&self) -> (&str, TccTxType) {
        (self.local_tx_id(), self.tx_type())
    }

    /// Equality on everything but `creation_time`, so a re-sent event matches
    /// the row its first delivery left.
    pub fn same_fact(&self, other: &EventRecord) -> bool {
        match (self, other) {
            (EventRecord::Global(a), EventRecord::Global(b)) => {
                a.tx == b.tx && a.tx_type == b.tx_type && a.status == b.status && a.payload == b.payload
            }
            (EventRecord::Participated(a), EventRecord::Participated(b)) => {
                a.tx == b.tx
                    && a.confirm_method == b.confirm_method
                    && a.cancel_method == b.cancel_method
                    && a.status == b.status
            }
            (EventRecord::Tcc(a), EventRecord::Tcc(b)) => {
                a.tx == b.tx && a.tx_type == b.tx_type && a.status == b.status && a.outcome == b.outcome
            }
            (EventRecord::Decision(a), EventRecord::Decision(b)) => {
                a.global_tx_id == b.global_tx_id && a.tx_type == b.tx_type && a.outcome == b.outcome
            }
            _ => false,
        }
    }
}
