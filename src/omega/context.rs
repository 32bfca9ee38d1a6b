use uuid::Uuid;

/// Transaction ids the participant is currently working under.
///
/// An empty context (no globalTxId) means the current work is not part of a
/// global transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OmegaContext {
    global_tx_id: Option<String>,
    local_tx_id: Option<String>,
    parent_tx_id: Option<String>,
}

impl OmegaContext {
    pub fn new(
        global_tx_id: impl Into<String>,
        local_tx_id: impl Into<String>,
        parent_tx_id: Option<String>,
    ) -> Self {
        Self {
            global_tx_id: Some(global_tx_id.into()),
            local_tx_id: Some(local_tx_id.into()),
            parent_tx_id,
        }
    }

    /// Starts a new global transaction with freshly generated ids.
    pub fn new_global() -> Self {
        let global_tx_id = Uuid::new_v4().to_string();
        Self::new(global_tx_id.clone(), global_tx_id, None)
    }

    /// Context for a sub-transaction of the current one: same globalTxId, a
    /// fresh localTxId, and the current localTxId as parent.
    pub fn child(&self) -> Option<Self> {
        let global_tx_id = self.global_tx_id.clone()?;
        Some(Self::new(
            global_tx_id,
            Uuid::new_v4().to_string(),
            self.local_tx_id.clone(),
        ))
    }

    pub fn set_global_tx_id(&mut self, global_tx_id: impl Into<String>) {
        self.global_tx_id = Some(global_tx_id.into());
    }

    pub fn set_local_tx_id(&mut self, local_tx_id: impl Into<String>) {
        self.local_tx_id = Some(local_tx_id.into());
    }

    pub fn set_parent_tx_id(&mut self, parent_tx_id: impl Into<String>) {
        self.parent_tx_id = Some(parent_tx_id.into());
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn global_tx_id(&self) -> Option<&str> {
        self.global_tx_id.as_deref()
    }

    pub fn local_tx_id(&self) -> Option<&str> {
        self.local_tx_id.as_deref()
    }

    pub fn parent_tx_id(&self) -> Option<&str> {
        self.parent_tx_id.as_deref()
    }
}
