#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga_tcc::application::coordinator::Coordinator;
use saga_tcc::application::ingestion::IngestionService;
use saga_tcc::application::registry::{CallbackRegistry, ParticipantKey};
use saga_tcc::config::CoordinatorConfig;
use saga_tcc::domain::batch::EventBatch;
use saga_tcc::domain::command::CoordinateCommand;
use saga_tcc::domain::event::{
    DecisionEvent, GlobalTxEvent, ParticipatedEvent, TccTxEvent, TransactionStatus, TxIdentity,
};
use saga_tcc::domain::ports::{EventStore, EventStoreRef, TxEventListener, TxSignal};
use saga_tcc::error::{PersistenceError, Result, TxError};
use saga_tcc::infrastructure::channel::ChannelCallback;
use saga_tcc::infrastructure::in_memory::InMemoryEventStore;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(5);

/// In-memory store whose journal writes, decision writes or reads can be
/// made to fail.
#[derive(Default)]
pub struct FaultyEventStore {
    inner: InMemoryEventStore,
    fail_journal: AtomicBool,
    fail_decisions: AtomicBool,
    fail_reads: AtomicBool,
}

impl FaultyEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_journal(&self, fail: bool) {
        self.fail_journal.store(fail, Ordering::SeqCst);
    }

    pub fn fail_decisions(&self, fail: bool) {
        self.fail_decisions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TxError::StorageUnavailable("read refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for FaultyEventStore {
    async fn commit(&self, batch: EventBatch) -> Result<()> {
        if self.fail_journal.load(Ordering::SeqCst) && batch.touches("tcc_tx_events") {
            return Err(PersistenceError::Unavailable("journal write refused".to_string()).into());
        }
        if self.fail_decisions.load(Ordering::SeqCst) && batch.touches("tcc_decisions") {
            return Err(PersistenceError::Unavailable("decision write refused".to_string()).into());
        }
        self.inner.commit(batch).await
    }

    async fn find_global_events(&self, global_tx_id: &str) -> Result<Option<Vec<GlobalTxEvent>>> {
        self.check_reads()?;
        self.inner.find_global_events(global_tx_id).await
    }

    async fn find_participations(&self, global_tx_id: &str) -> Result<Option<Vec<ParticipatedEvent>>> {
        self.check_reads()?;
        self.inner.find_participations(global_tx_id).await
    }

    async fn find_tcc_events(&self, global_tx_id: &str) -> Result<Option<Vec<TccTxEvent>>> {
        self.check_reads()?;
        self.inner.find_tcc_events(global_tx_id).await
    }

    async fn find_participation(
        &self,
        global_tx_id: &str,
        local_tx_id: &str,
    ) -> Result<Option<ParticipatedEvent>> {
        self.check_reads()?;
        self.inner.find_participation(global_tx_id, local_tx_id).await
    }

    async fn find_coordination(&self, global_tx_id: &str, local_tx_id: &str) -> Result<Option<TccTxEvent>> {
        self.check_reads()?;
        self.inner.find_coordination(global_tx_id, local_tx_id).await
    }

    async fn find_decisions(&self, global_tx_id: &str) -> Result<Option<Vec<DecisionEvent>>> {
        self.check_reads()?;
        self.inner.find_decisions(global_tx_id).await
    }

    async fn unfinished_global_tx_ids(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.check_reads()?;
        self.inner.unfinished_global_tx_ids(cutoff).await
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub signals: Mutex<Vec<TxSignal>>,
}

#[async_trait]
impl TxEventListener for RecordingListener {
    async fn on_signal(&self, signal: TxSignal) {
        self.signals.lock().await.push(signal);
    }
}

/// Configuration with short timeouts so retry paths finish quickly.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_attempts: 3,
        ack_timeout: Duration::from_millis(100),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(80),
        tx_timeout: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(60),
        done_retention: Duration::from_secs(60),
    }
}

/// Ingestion wired to a coordinator over `store`.
pub struct Harness {
    pub store: EventStoreRef,
    pub registry: CallbackRegistry,
    pub coordinator: Coordinator,
    pub ingestion: IngestionService,
}

impl Harness {
    pub fn new(store: EventStoreRef, config: CoordinatorConfig) -> Self {
        let registry = CallbackRegistry::new();
        let coordinator = Coordinator::new(store.clone(), registry.clone(), config);
        let ingestion =
            IngestionService::new(store.clone()).with_listener(Arc::new(coordinator.clone()));
        Self {
            store,
            registry,
            coordinator,
            ingestion,
        }
    }

    pub fn in_memory(config: CoordinatorConfig) -> Self {
        Self::new(Arc::new(InMemoryEventStore::new()), config)
    }

    /// Registers a channel for a service instance and returns the commands
    /// it receives.
    pub async fn connect(&self, service: &str, instance: &str) -> mpsc::Receiver<CoordinateCommand> {
        let (callback, commands) = ChannelCallback::pair(16);
        self.registry
            .register(ParticipantKey::instance(service, instance), Arc::new(callback))
            .await;
        commands
    }

    /// Reports a COORDINATED event answering a received command.
    pub async fn acknowledge(&self, command: &CoordinateCommand, instance: &str, status: TransactionStatus) -> Result<()> {
        let tx = TxIdentity::new(
            &command.service_name,
            instance,
            &command.global_tx_id,
            &command.local_tx_id,
            None,
        );
        self.ingestion
            .on_coordinated(TccTxEvent::coordinated(tx, status).answering(command.method.outcome()))
            .await
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn identity(service: &str, global_tx_id: &str, local_tx_id: &str) -> TxIdentity {
    TxIdentity::new(
        service,
        format!("{service}-1"),
        global_tx_id,
        local_tx_id,
        Some(global_tx_id.to_string()),
    )
}

pub fn started(global_tx_id: &str) -> GlobalTxEvent {
    GlobalTxEvent::started(TxIdentity::new("orders", "orders-1", global_tx_id, global_tx_id, None))
}

pub fn ended(global_tx_id: &str, status: TransactionStatus) -> GlobalTxEvent {
    GlobalTxEvent::ended(
        TxIdentity::new("orders", "orders-1", global_tx_id, global_tx_id, None),
        status,
    )
}

pub fn participated(
    service: &str,
    global_tx_id: &str,
    local_tx_id: &str,
    status: TransactionStatus,
) -> ParticipatedEvent {
    ParticipatedEvent::new(
        identity(service, global_tx_id, local_tx_id),
        format!("confirm_{local_tx_id}"),
        format!("cancel_{local_tx_id}"),
        status,
    )
}

pub const CSV_HEADER: [&str; 9] = [
    "kind",
    "service",
    "instance",
    "global_tx_id",
    "local_tx_id",
    "parent_tx_id",
    "status",
    "confirm_method",
    "cancel_method",
];

/// Writes a replay file with one complete global transaction per row group:
/// started, `participants` Succeed participations, ended.
pub fn generate_csv(path: &Path, transactions: usize, participants: usize) -> std::result::Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record(CSV_HEADER)?;

    for t in 1..=transactions {
        let global = format!("G{t}");
        wtr.write_record(["started", "orders", "orders-1", &global, &global, "", "", "", ""])?;
        for p in 1..=participants {
            let local = format!("G{t}-P{p}");
            let confirm = format!("confirm{p}");
            let cancel = format!("cancel{p}");
            wtr.write_record([
                "participated",
                "inventory",
                "inventory-1",
                &global,
                &local,
                &global,
                "Succeed",
                &confirm,
                &cancel,
            ])?;
        }
        wtr.write_record(["ended", "orders", "orders-1", &global, &global, "", "Succeed", "", ""])?;
    }

    wtr.flush()?;
    Ok(())
}

pub async fn next_command(commands: &mut mpsc::Receiver<CoordinateCommand>) -> CoordinateCommand {
    tokio::time::timeout(WAIT, commands.recv())
        .await
        .expect("no command within the wait limit")
        .expect("command channel closed")
}
