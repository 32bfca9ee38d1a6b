use super::unit_of_work::UnitOfWork;
use crate::domain::batch::WriteMode;
use crate::domain::event::{
    EventRecord, GlobalTxEvent, ParticipatedEvent, TccTxEvent, TccTxType, TxIdentity,
};
use crate::domain::message::AlphaMessage;
use crate::domain::ports::{EventStoreRef, TxEventListenerRef, TxSignal};
use crate::error::{Result, TxError};
use tracing::{debug, warn};

/// Validates and records incoming transaction events.
///
/// Every `on_*` call is one unit of work: the event's own row plus its
/// journal row are committed together or not at all. Only after a successful
/// commit is the listener (normally the coordinator) told about the event, so
/// a failed save leaves no trace anywhere. The service keeps no state between
/// calls.
#[derive(Clone)]
pub struct IngestionService {
    store: EventStoreRef,
    listener: Option<TxEventListenerRef>,
}

impl IngestionService {
    pub fn new(store: EventStoreRef) -> Self {
        Self {
            store,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: TxEventListenerRef) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn store(&self) -> &EventStoreRef {
        &self.store
    }

    /// Routes a participant message to the matching handler.
    pub async fn handle(&self, message: AlphaMessage) -> Result<()> {
        match message {
            AlphaMessage::TccStarted(event) => self.on_global_tx_started(event).await,
            AlphaMessage::Participated(event) => self.on_participated(event).await,
            AlphaMessage::TccEnded(event) => self.on_global_tx_ended(event).await,
            AlphaMessage::Coordinated(event) => self.on_coordinated(event).await,
        }
    }

    pub async fn on_global_tx_started(&self, event: GlobalTxEvent) -> Result<()> {
        validate(&event.tx, event.tx_type, TccTxType::Started)?;
        let signal = TxSignal::Started {
            global_tx_id: event.tx.global_tx_id.clone(),
            creation_time: event.creation_time,
        };
        self.record_global(event).await?;
        self.notify(signal).await;
        Ok(())
    }

    pub async fn on_global_tx_ended(&self, event: GlobalTxEvent) -> Result<()> {
        validate(&event.tx, event.tx_type, TccTxType::Ended)?;
        let signal = TxSignal::Ended {
            global_tx_id: event.tx.global_tx_id.clone(),
            status: event.status,
            creation_time: event.creation_time,
        };
        self.record_global(event).await?;
        self.notify(signal).await;
        Ok(())
    }

    /// Records a participation. Re-sending it is accepted and the last
    /// submission is what the store keeps.
    pub async fn on_participated(&self, event: ParticipatedEvent) -> Result<()> {
        validate(&event.tx, TccTxType::Participated, TccTxType::Participated)?;
        let tx = event.tx.clone();
        let signal = TxSignal::Participated {
            global_tx_id: tx.global_tx_id.clone(),
            local_tx_id: tx.local_tx_id.clone(),
            status: event.status,
        };

        let mut uow = UnitOfWork::begin(self.store.as_ref(), &tx.global_tx_id);
        uow.stage(EventRecord::Tcc(TccTxEvent::from(&event)), WriteMode::Upsert)?;
        uow.stage(EventRecord::Participated(event), WriteMode::Upsert)?;
        self.commit(uow, &tx, TccTxType::Participated).await?;

        self.notify(signal).await;
        Ok(())
    }

    /// Records that a participant ran its confirm or cancel method.
    ///
    /// Rejected with [`TxError::ProtocolViolation`] when the leg never
    /// reported a participation. A repeated identical report is a no-op.
    pub async fn on_coordinated(&self, event: TccTxEvent) -> Result<()> {
        validate(&event.tx, event.tx_type, TccTxType::Coordinated)?;
        let tx = event.tx.clone();

        let participation = self
            .store
            .find_participation(&tx.global_tx_id, &tx.local_tx_id)
            .await?;
        if participation.is_none() {
            warn!(
                global_tx_id = %tx.global_tx_id,
                local_tx_id = %tx.local_tx_id,
                service = %tx.service_name,
                "Coordination reported for a leg that never participated"
            );
            return Err(TxError::ProtocolViolation(format!(
                "no participation of {} in {} to coordinate",
                tx.local_tx_id, tx.global_tx_id
            )));
        }

        let signal = TxSignal::Coordinated {
            global_tx_id: tx.global_tx_id.clone(),
            local_tx_id: tx.local_tx_id.clone(),
            status: event.status,
            outcome: event.outcome,
        };
        let mut uow = UnitOfWork::begin(self.store.as_ref(), &tx.global_tx_id);
        uow.stage(EventRecord::Tcc(event), WriteMode::InsertIfAbsent)?;
        self.commit(uow, &tx, TccTxType::Coordinated).await?;

        self.notify(signal).await;
        Ok(())
    }

    async fn record_global(&self, event: GlobalTxEvent) -> Result<()> {
        let tx = event.tx.clone();
        let tx_type = event.tx_type;
        let mut uow = UnitOfWork::begin(self.store.as_ref(), &tx.global_tx_id);
        uow.stage(EventRecord::Global(event.clone()), WriteMode::InsertIfAbsent)?;
        uow.stage(EventRecord::Tcc(TccTxEvent::from(&event)), WriteMode::InsertIfAbsent)?;
        self.commit(uow, &tx, tx_type).await
    }

    async fn commit(&self, uow: UnitOfWork<'_>, tx: &TxIdentity, tx_type: TccTxType) -> Result<()> {
        match uow.commit().await {
            Ok(()) => {
                debug!(
                    global_tx_id = %tx.global_tx_id,
                    local_tx_id = %tx.local_tx_id,
                    tx_type = %tx_type,
                    "Event recorded"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    global_tx_id = %tx.global_tx_id,
                    local_tx_id = %tx.local_tx_id,
                    tx_type = %tx_type,
                    error = %e,
                    "Failed to record event, unit of work rolled back"
                );
                Err(e)
            }
        }
    }

    async fn notify(&self, signal: TxSignal) {
        if let Some(listener) = &self.listener {
            listener.on_signal(signal).await;
        }
    }
}

fn validate(tx: &TxIdentity, actual: TccTxType, expected: TccTxType) -> Result<()> {
    if actual != expected {
        return Err(TxError::ProtocolViolation(format!(
            "expected a {expected} event, got {actual}"
        )));
    }
    if tx.global_tx_id.is_empty() || tx.local_tx_id.is_empty() {
        return Err(TxError::ProtocolViolation(format!(
            "{expected} event without globalTxId or localTxId"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::TransactionStatus;
    use crate::domain::ports::{EventStore, TxEventListener};
    use crate::error::PersistenceError;
    use crate::infrastructure::in_memory::InMemoryEventStore;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        signals: Mutex<Vec<TxSignal>>,
    }

    #[async_trait]
    impl TxEventListener for RecordingListener {
        async fn on_signal(&self, signal: TxSignal) {
            self.signals.lock().await.push(signal);
        }
    }

    fn identity(local: &str) -> TxIdentity {
        TxIdentity::new("svc", "svc-1", "g1", local, None)
    }

    fn participation(local: &str, confirm: &str) -> ParticipatedEvent {
        ParticipatedEvent::new(identity(local), confirm, "cancel", TransactionStatus::Succeed)
    }

    fn service() -> (IngestionService, Arc<InMemoryEventStore>, Arc<RecordingListener>) {
        let store = Arc::new(InMemoryEventStore::new());
        let listener = Arc::new(RecordingListener::default());
        let service = IngestionService::new(store.clone()).with_listener(listener.clone());
        (service, store, listener)
    }

    #[tokio::test]
    async fn test_started_writes_row_and_journal() {
        let (service, store, listener) = service();
        service
            .on_global_tx_started(GlobalTxEvent::started(identity("root")))
            .await
            .unwrap();

        let globals = store.find_global_events("g1").await.unwrap().unwrap();
        assert_eq!(globals.len(), 1);
        let journal = store.find_tcc_events("g1").await.unwrap().unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].tx_type, TccTxType::Started);
        assert_eq!(listener.signals.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_started_payload_is_stored() {
        let (service, store, _) = service();
        let started = GlobalTxEvent::started(identity("root")).with_payload(b"order-42".to_vec());
        service.on_global_tx_started(started.clone()).await.unwrap();
        // Same bytes again is the same fact
        service.on_global_tx_started(started).await.unwrap();

        let globals = store.find_global_events("g1").await.unwrap().unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].payload, b"order-42".to_vec());
    }

    #[tokio::test]
    async fn test_participation_is_idempotent() {
        let (service, store, _) = service();
        service.on_participated(participation("l1", "confirm")).await.unwrap();
        service.on_participated(participation("l1", "confirm")).await.unwrap();

        let rows = store.find_participations("g1").await.unwrap().unwrap();
        assert_eq!(rows.len(), 1);
        let journal = store.find_tcc_events("g1").await.unwrap().unwrap();
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn test_coordination_without_participation_is_rejected() {
        let (service, store, listener) = service();
        let err = service
            .on_coordinated(TccTxEvent::coordinated(identity("l1"), TransactionStatus::Succeed))
            .await
            .unwrap_err();

        assert!(matches!(err, TxError::ProtocolViolation(_)));
        assert!(store.find_tcc_events("g1").await.unwrap().is_none());
        assert!(listener.signals.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_coordination_is_noop() {
        let (service, store, _) = service();
        service.on_participated(participation("l1", "confirm")).await.unwrap();
        for _ in 0..2 {
            service
                .on_coordinated(TccTxEvent::coordinated(identity("l1"), TransactionStatus::Succeed))
                .await
                .unwrap();
        }

        let coordinations: Vec<_> = store
            .find_tcc_events("g1")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .filter(|e| e.is_coordination())
            .collect();
        assert_eq!(coordinations.len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_end_is_persistence_error() {
        let (service, store, listener) = service();
        service
            .on_global_tx_ended(GlobalTxEvent::ended(identity("root"), TransactionStatus::Succeed))
            .await
            .unwrap();
        let err = service
            .on_global_tx_ended(GlobalTxEvent::ended(identity("root"), TransactionStatus::Failed))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TxError::Persistence(PersistenceError::DuplicateKey { .. })
        ));
        let globals = store.find_global_events("g1").await.unwrap().unwrap();
        assert_eq!(globals.len(), 1);
        assert_eq!(globals[0].status, TransactionStatus::Succeed);
        assert_eq!(listener.signals.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_event_type_is_protocol_violation() {
        let (service, store, _) = service();
        let err = service
            .on_global_tx_started(GlobalTxEvent::ended(identity("root"), TransactionStatus::Succeed))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::ProtocolViolation(_)));

        let err = service
            .on_global_tx_started(GlobalTxEvent::started(TxIdentity::new("svc", "i", "", "l", None)))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::ProtocolViolation(_)));
        assert!(store.find_global_events("g1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_routes_messages() {
        let (service, store, listener) = service();
        service
            .handle(AlphaMessage::TccStarted(GlobalTxEvent::started(identity("root"))))
            .await
            .unwrap();
        service
            .handle(AlphaMessage::Participated(participation("l1", "confirm")))
            .await
            .unwrap();
        service
            .handle(AlphaMessage::TccEnded(GlobalTxEvent::ended(
                identity("root"),
                TransactionStatus::Succeed,
            )))
            .await
            .unwrap();

        assert_eq!(store.find_global_events("g1").await.unwrap().unwrap().len(), 2);
        let signals = listener.signals.lock().await;
        assert!(matches!(signals[0], TxSignal::Started { .. }));
        assert!(matches!(signals[1], TxSignal::Participated { .. }));
        assert!(matches!(
            signals[2],
            TxSignal::Ended {
                status: TransactionStatus::Succeed,
                ..
            }
        ));
    }
}
