use clap::Parser;
use miette::{IntoDiagnostic, Result};
use saga_tcc::application::coordinator::Coordinator;
use saga_tcc::application::ingestion::IngestionService;
use saga_tcc::application::registry::CallbackRegistry;
use saga_tcc::config::{CoordinatorArgs, CoordinatorConfig};
use saga_tcc::domain::ports::EventStoreRef;
use saga_tcc::infrastructure::in_memory::InMemoryEventStore;
use saga_tcc::interfaces::csv::event_reader::EventReader;
use saga_tcc::interfaces::csv::report_writer::ReportWriter;
use saga_tcc::interfaces::loopback::LoopbackParticipant;
use saga_tcc::interfaces::session::ParticipantIdentity;
use saga_tcc::omega::runtime::{Acknowledge, ParticipantRuntime};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input events CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Participants receive commands but never acknowledge them
    #[arg(long)]
    no_auto_ack: bool,

    /// Seconds to wait for pending coordination before reporting
    #[arg(long, env = "SAGA_TCC_SETTLE_TIMEOUT_SECS", default_value_t = 30)]
    settle_timeout_secs: u64,

    #[command(flatten)]
    coordinator: CoordinatorArgs,
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(db_path: Option<&Path>) -> Result<EventStoreRef> {
    use saga_tcc::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => Ok(Arc::new(RocksDBStore::open(path).into_diagnostic()?)),
        None => Ok(Arc::new(InMemoryEventStore::new())),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(db_path: Option<&Path>) -> Result<EventStoreRef> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(Arc::new(InMemoryEventStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("saga_tcc=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let store = open_store(cli.db_path.as_deref())?;
    let registry = CallbackRegistry::new();
    let coordinator = Coordinator::new(
        store.clone(),
        registry.clone(),
        CoordinatorConfig::from(&cli.coordinator),
    );
    let ingestion = IngestionService::new(store).with_listener(Arc::new(coordinator.clone()));

    let recovered = coordinator.recover().await.into_diagnostic()?;
    if recovered > 0 {
        info!(recovered, "Resumed unfinished global transactions");
    }
    let sweep = coordinator.spawn_recovery_sweep();

    // Replay events, one loopback participant per service instance
    let file = File::open(&cli.input).into_diagnostic()?;
    let mut participants: HashMap<ParticipantIdentity, LoopbackParticipant> = HashMap::new();
    for (line, message) in EventReader::new(file).messages().enumerate() {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!(line = line + 2, error = %e, "Skipping malformed event row");
                continue;
            }
        };
        let tx = message.tx();
        let identity = ParticipantIdentity::new(&tx.service_name, &tx.instance_id);
        let participant = participants.entry(identity.clone()).or_insert_with(|| {
            let runtime = (!cli.no_auto_ack).then(|| {
                ParticipantRuntime::new(&identity.service_name, &identity.instance_id)
                    .with_fallback(Arc::new(Acknowledge))
            });
            LoopbackParticipant::connect(identity, runtime, ingestion.clone(), registry.clone(), 64)
        });

        let global_tx_id = message.global_tx_id().to_string();
        if let Err(e) = participant.send(message).await {
            warn!(line = line + 2, global_tx_id = %global_tx_id, error = %e, "Event rejected");
        }
    }

    if !coordinator
        .wait_settled(Duration::from_secs(cli.settle_timeout_secs))
        .await
    {
        warn!("Coordination still in flight when the report was taken");
    }

    let reports = coordinator.reports().await;
    let stdout = io::stdout();
    let mut writer = ReportWriter::new(stdout.lock());
    writer.write_reports(&reports).into_diagnostic()?;

    sweep.abort();
    for (_, participant) in participants {
        participant.close().await.into_diagnostic()?;
    }

    Ok(())
}
