use crate::domain::event::{GlobalTxEvent, ParticipatedEvent, TccTxEvent, TransactionStatus, TxIdentity};
use crate::domain::message::AlphaMessage;
use crate::error::{Result, TxError};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Started,
    Participated,
    Ended,
    Coordinated,
}

/// One line of an event replay file.
#[derive(Debug, Deserialize)]
pub struct EventRow {
    pub kind: RowKind,
    pub service: String,
    pub instance: String,
    pub global_tx_id: String,
    pub local_tx_id: String,
    pub parent_tx_id: Option<String>,
    pub status: Option<TransactionStatus>,
    pub confirm_method: Option<String>,
    pub cancel_method: Option<String>,
}

impl TryFrom<EventRow> for AlphaMessage {
    type Error = TxError;

    fn try_from(row: EventRow) -> Result<Self> {
        let status = row.status.unwrap_or(TransactionStatus::Succeed);
        let tx = TxIdentity::new(
            row.service,
            row.instance,
            row.global_tx_id,
            row.local_tx_id,
            row.parent_tx_id,
        );
        let message = match row.kind {
            RowKind::Started => AlphaMessage::TccStarted(GlobalTxEvent::started(tx)),
            RowKind::Ended => AlphaMessage::TccEnded(GlobalTxEvent::ended(tx, status)),
            RowKind::Coordinated => AlphaMessage::Coordinated(TccTxEvent::coordinated(tx, status)),
            RowKind::Participated => {
                let (Some(confirm), Some(cancel)) = (row.confirm_method, row.cancel_method) else {
                    return Err(TxError::ProtocolViolation(format!(
                        "participation of {} in {} without confirm and cancel methods",
                        tx.local_tx_id, tx.global_tx_id
                    )));
                };
                AlphaMessage::Participated(ParticipatedEvent::new(tx, confirm, cancel, status))
            }
        };
        Ok(message)
    }
}

/// Reads participant messages from a CSV source.
///
/// Wraps `csv::Reader`, trimming whitespace and tolerating short rows.
pub struct EventReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> EventReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads rows and converts them into messages, one result per row.
    pub fn messages(self) -> impl Iterator<Item = Result<AlphaMessage>> {
        self.reader.into_deserialize::<EventRow>().map(|row| {
            let row = row.map_err(TxError::from)?;
            AlphaMessage::try_from(row)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "kind,service,instance,global_tx_id,local_tx_id,parent_tx_id,status,confirm_method,cancel_method";

    #[test]
    fn test_reader_valid_stream() {
        let data = format!(
            "{HEADER}\nstarted, orders, o-1, G1, G1, , , ,\nparticipated, inventory, inv-1, G1, P1, G1, Succeed, confirmA, cancelA\nended, orders, o-1, G1, G1, , Succeed, ,"
        );
        let reader = EventReader::new(data.as_bytes());
        let results: Vec<Result<AlphaMessage>> = reader.messages().collect();

        assert_eq!(results.len(), 3);
        match results[1].as_ref().unwrap() {
            AlphaMessage::Participated(event) => {
                assert_eq!(event.tx.local_tx_id, "P1");
                assert_eq!(event.tx.parent_tx_id.as_deref(), Some("G1"));
                assert_eq!(event.confirm_method, "confirmA");
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(results[2], Ok(AlphaMessage::TccEnded(_))));
    }

    #[test]
    fn test_reader_malformed_lines() {
        let data = format!(
            "{HEADER}\nrefunded, orders, o-1, G1, G1, , , ,\nparticipated, inventory, inv-1, G1, P1, , Succeed, ,\nended, orders, o-1, G1, G1, , Maybe, ,"
        );
        let reader = EventReader::new(data.as_bytes());
        let results: Vec<Result<AlphaMessage>> = reader.messages().collect();

        assert!(matches!(results[0], Err(TxError::Csv(_))));
        assert!(matches!(results[1], Err(TxError::ProtocolViolation(_))));
        assert!(results[2].is_err());
    }
}
