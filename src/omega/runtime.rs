use crate::domain::command::CoordinateCommand;
use crate::domain::event::{TccTxEvent, TransactionStatus, TxIdentity};
use crate::error::{Result, TxError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Business code behind one confirm or cancel method name.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn invoke(&self, command: &CoordinateCommand) -> Result<()>;
}

pub type MethodHandlerRef = Arc<dyn MethodHandler>;

/// Handler that succeeds without doing anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Acknowledge;

#[async_trait]
impl MethodHandler for Acknowledge {
    async fn invoke(&self, _command: &CoordinateCommand) -> Result<()> {
        Ok(())
    }
}

/// Adapts a synchronous closure.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(&CoordinateCommand) -> Result<()> + Send + Sync,
{
    async fn invoke(&self, command: &CoordinateCommand) -> Result<()> {
        (self.0)(command)
    }
}

/// Executes coordination commands on the participant side.
///
/// Method names are resolved through a table filled at startup, so a command
/// can only ever reach a handler that was registered for it.
#[derive(Clone)]
pub struct ParticipantRuntime {
    service_name: String,
    instance_id: String,
    handlers: HashMap<String, MethodHandlerRef>,
    fallback: Option<MethodHandlerRef>,
}

impl ParticipantRuntime {
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    pub fn with_method(mut self, method_name: impl Into<String>, handler: MethodHandlerRef) -> Self {
        self.handlers.insert(method_name.into(), handler);
        self
    }

    /// Handler for method names missing from the table.
    pub fn with_fallback(mut self, handler: MethodHandlerRef) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Runs the command's method and returns the COORDINATED report to send
    /// back: `Succeed` when the handler succeeded, `Failed` otherwise. The
    /// report names the command it answers.
    pub async fn execute(&self, command: &CoordinateCommand) -> Result<TccTxEvent> {
        let method = command.method.method_name();
        let handler = self
            .handlers
            .get(method)
            .or(self.fallback.as_ref())
            .ok_or_else(|| TxError::UnknownMethod(method.to_string()))?;

        let status = match handler.invoke(command).await {
            Ok(()) => {
                info!(
                    global_tx_id = %command.global_tx_id,
                    local_tx_id = %command.local_tx_id,
                    method = %method,
                    "Coordination method applied"
                );
                TransactionStatus::Succeed
            }
            Err(e) => {
                warn!(
                    global_tx_id = %command.global_tx_id,
                    local_tx_id = %command.local_tx_id,
                    method = %method,
                    error = %e,
                    "Coordination method failed"
                );
                TransactionStatus::Failed
            }
        };

        let tx = TxIdentity::new(
            &self.service_name,
            &self.instance_id,
            &command.global_tx_id,
            &command.local_tx_id,
            None,
        );
        Ok(TccTxEvent::coordinated(tx, status).answering(command.method.outcome()))
    }
}
