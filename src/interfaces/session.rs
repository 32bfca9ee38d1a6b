use crate::application::ingestion::IngestionService;
use crate::application::registry::{CallbackRegistry, ParticipantKey};
use crate::domain::message::AlphaMessage;
use crate::domain::ports::CallbackRef;
use crate::error::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One inbound message and the slot its ingestion result is returned on.
pub struct Envelope {
    pub message: AlphaMessage,
    pub reply: oneshot::Sender<Result<()>>,
}

impl Envelope {
    pub fn new(message: AlphaMessage) -> (Self, oneshot::Receiver<Result<()>>) {
        let (reply, receiver) = oneshot::channel();
        (Self { message, reply }, receiver)
    }
}

/// The service instance on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParticipantIdentity {
    pub service_name: String,
    pub instance_id: String,
}

impl ParticipantIdentity {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }

    pub fn key(&self) -> ParticipantKey {
        ParticipantKey::instance(&self.service_name, &self.instance_id)
    }
}

/// Leg key count at which a session first drops keys the coordinator has
/// already released.
const LEG_KEYS_PRUNE_AT: usize = 64;

/// Leg keys a session registered. Pruned whenever the list doubles, so a
/// long-lived connection only holds keys of unfinished legs.
struct SessionLegs {
    keys: Vec<ParticipantKey>,
    prune_at: usize,
}

impl SessionLegs {
    fn new() -> Self {
        Self {
            keys: Vec::new(),
            prune_at: LEG_KEYS_PRUNE_AT,
        }
    }

    async fn push(&mut self, key: ParticipantKey, registry: &CallbackRegistry, callback: &CallbackRef) {
        self.keys.push(key);
        if self.keys.len() >= self.prune_at {
            registry.retain_registered(&mut self.keys, callback).await;
            self.prune_at = (self.keys.len() * 2).max(LEG_KEYS_PRUNE_AT);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub processed: usize,
    pub rejected: usize,
}

/// Serves one participant connection until its inbound side closes.
///
/// The connection's callback is registered under the instance key for the
/// whole session, and under the leg key of every participation it reports.
/// Messages are ingested in arrival order and each result is replied to the
/// sender. On disconnect only the keys that still point at this connection's
/// callback are removed, so a reconnect that already replaced them survives.
pub async fn serve_session(
    identity: ParticipantIdentity,
    ingestion: IngestionService,
    registry: CallbackRegistry,
    mut inbound: mpsc::Receiver<Envelope>,
    callback: CallbackRef,
) -> SessionStats {
    let instance_key = identity.key();
    if registry
        .register(instance_key.clone(), callback.clone())
        .await
        .is_some()
    {
        info!(participant = %instance_key, "Participant reconnected, previous channel replaced");
    } else {
        info!(participant = %instance_key, "Participant connected");
    }

    let mut stats = SessionStats::default();
    let mut legs = SessionLegs::new();
    while let Some(Envelope { message, reply }) = inbound.recv().await {
        let leg_key = match &message {
            AlphaMessage::Participated(event) => Some(ParticipantKey::leg(
                &event.tx.global_tx_id,
                &event.tx.local_tx_id,
            )),
            _ => None,
        };
        let global_tx_id = message.global_tx_id().to_string();

        let result = ingestion.handle(message).await;
        stats.processed += 1;
        match &result {
            Ok(()) => {
                if let Some(key) = leg_key {
                    registry.register(key.clone(), callback.clone()).await;
                    legs.push(key, &registry, &callback).await;
                }
            }
            Err(e) => {
                stats.rejected += 1;
                warn!(
                    participant = %instance_key,
                    global_tx_id = %global_tx_id,
                    error = %e,
                    "Message rejected"
                );
            }
        }
        if reply.send(result).is_err() {
            debug!(participant = %instance_key, "Sender stopped waiting for the reply");
        }
    }

    registry.deregister_if_same(&instance_key, &callback).await;
    for key in &legs.keys {
        registry.deregister_if_same(key, &callback).await;
    }
    info!(
        participant = %instance_key,
        processed = stats.processed,
        rejected = stats.rejected,
        "Participant disconnected"
    );
    stats
}
