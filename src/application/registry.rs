use crate::domain::event::ParticipatedEvent;
use crate::domain::ports::CallbackRef;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Address of a participant channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParticipantKey {
    /// One leg of one global transaction.
    Leg {
        global_tx_id: String,
        local_tx_id: String,
    },
    /// A connected service instance, whatever transactions it takes part in.
    Instance {
        service_name: String,
        instance_id: String,
    },
}

impl ParticipantKey {
    pub fn leg(global_tx_id: impl Into<String>, local_tx_id: impl Into<String>) -> Self {
        ParticipantKey::Leg {
            global_tx_id: global_tx_id.into(),
            local_tx_id: local_tx_id.into(),
        }
    }

    pub fn instance(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        ParticipantKey::Instance {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantKey::Leg {
                global_tx_id,
                local_tx_id,
            } => write!(f, "{global_tx_id}/{local_tx_id}"),
            ParticipantKey::Instance {
                service_name,
                instance_id,
            } => write!(f, "{service_name}@{instance_id}"),
        }
    }
}

/// Addressing table from participant keys to live callback channels.
///
/// Holds no transaction state. Re-registering a key replaces the previous
/// channel. Cloning shares the same table.
#[derive(Default, Clone)]
pub struct CallbackRegistry {
    callbacks: Arc<RwLock<HashMap<ParticipantKey, CallbackRef>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `callback` with `key`, returning the channel it replaced.
    pub async fn register(&self, key: ParticipantKey, callback: CallbackRef) -> Option<CallbackRef> {
        let mut callbacks = self.callbacks.write().await;
        callbacks.insert(key, callback)
    }

    pub async fn lookup(&self, key: &ParticipantKey) -> Option<CallbackRef> {
        let callbacks = self.callbacks.read().await;
        callbacks.get(key).cloned()
    }

    /// Channel for a participant: its leg key if registered, else the channel
    /// of the service instance that reported the participation.
    pub async fn lookup_participant(&self, participation: &ParticipatedEvent) -> Option<CallbackRef> {
        let callbacks = self.callbacks.read().await;
        let tx = &participation.tx;
        callbacks
            .get(&ParticipantKey::leg(&tx.global_tx_id, &tx.local_tx_id))
            .or_else(|| callbacks.get(&ParticipantKey::instance(&tx.service_name, &tx.instance_id)))
            .cloned()
    }

    pub async fn deregister(&self, key: &ParticipantKey) -> Option<CallbackRef> {
        let mut callbacks = self.callbacks.write().await;
        callbacks.remove(key)
    }

    /// Removes `key` only while it still maps to `callback`, so tearing down a
    /// stale connection never drops the reconnect that replaced it.
    pub async fn deregister_if_same(&self, key: &ParticipantKey, callback: &CallbackRef) -> bool {
        let mut callbacks = self.callbacks.write().await;
        match callbacks.get(key) {
            Some(current) if Arc::ptr_eq(current, callback) => {
                callbacks.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drops from `keys` every key that no longer maps to `callback`.
    pub async fn retain_registered(&self, keys: &mut Vec<ParticipantKey>, callback: &CallbackRef) {
        let callbacks = self.callbacks.read().await;
        keys.retain(|key| {
            callbacks
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, callback))
        });
    }

    pub async fn len(&self) -> usize {
        self.callbacks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.callbacks.read().await.is_empty()
    }
}
