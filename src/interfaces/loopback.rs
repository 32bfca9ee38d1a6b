use super::session::{Envelope, ParticipantIdentity, SessionStats, serve_session};
use crate::application::ingestion::IngestionService;
use crate::application::registry::CallbackRegistry;
use crate::domain::command::CoordinateCommand;
use crate::domain::message::AlphaMessage;
use crate::error::{Result, TxError};
use crate::infrastructure::channel::ChannelCallback;
use crate::omega::runtime::ParticipantRuntime;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// An in-process participant connected to the coordinator through a session.
///
/// Commands sent to it are executed by its [`ParticipantRuntime`] and the
/// coordination report is sent back over the same session. Without a runtime
/// commands are received and dropped, so the coordinator's retries run out.
pub struct LoopbackParticipant {
    outbound: mpsc::Sender<Envelope>,
    session: JoinHandle<SessionStats>,
    worker: JoinHandle<()>,
}

impl LoopbackParticipant {
    pub fn connect(
        identity: ParticipantIdentity,
        runtime: Option<ParticipantRuntime>,
        ingestion: IngestionService,
        registry: CallbackRegistry,
        capacity: usize,
    ) -> Self {
        let (callback, commands) = ChannelCallback::pair(capacity);
        let (outbound, inbound) = mpsc::channel(capacity);
        let session = tokio::spawn(serve_session(
            identity,
            ingestion,
            registry,
            inbound,
            Arc::new(callback),
        ));
        let worker = tokio::spawn(run_commands(commands, runtime, outbound.clone()));
        Self {
            outbound,
            session,
            worker,
        }
    }

    /// Sends a message and waits for the coordinator's ingestion result.
    pub async fn send(&self, message: AlphaMessage) -> Result<()> {
        submit(&self.outbound, message).await
    }

    /// Disconnects and returns the session's counters.
    pub async fn close(self) -> Result<SessionStats> {
        self.worker.abort();
        drop(self.outbound);
        self.session
            .await
            .map_err(|e| TxError::Transport(format!("session task failed: {e}")))
    }
}

async fn submit(outbound: &mpsc::Sender<Envelope>, message: AlphaMessage) -> Result<()> {
    let (envelope, reply) = Envelope::new(message);
    outbound
        .send(envelope)
        .await
        .map_err(|_| TxError::Transport("session closed".to_string()))?;
    reply
        .await
        .map_err(|_| TxError::Transport("session dropped the reply".to_string()))?
}

async fn run_commands(
    mut commands: mpsc::Receiver<CoordinateCommand>,
    runtime: Option<ParticipantRuntime>,
    outbound: mpsc::Sender<Envelope>,
) {
    while let Some(command) = commands.recv().await {
        let Some(runtime) = &runtime else {
            debug!(
                global_tx_id = %command.global_tx_id,
                local_tx_id = %command.local_tx_id,
                "Command dropped, participant does not acknowledge"
            );
            continue;
        };
        let report = match runtime.execute(&command).await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    global_tx_id = %command.global_tx_id,
                    local_tx_id = %command.local_tx_id,
                    error = %e,
                    "Command not executed"
                );
                continue;
            }
        };
        if let Err(e) = submit(&outbound, AlphaMessage::Coordinated(report)).await {
            warn!(
                global_tx_id = %command.global_tx_id,
                local_tx_id = %command.local_tx_id,
                error = %e,
                "Coordination report not accepted"
            );
        }
    }
}
