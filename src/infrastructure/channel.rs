use crate::domain::command::CoordinateCommand;
use crate::domain::ports::OmegaCallback;
use crate::error::{Result, TxError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Participant callback over an in-process `mpsc` channel.
///
/// The receiving half belongs to whatever carries commands to the participant
/// (a transport writer, or a participant runtime in tests and the loopback).
#[derive(Clone)]
pub struct ChannelCallback {
    sender: mpsc::Sender<CoordinateCommand>,
}

impl ChannelCallback {
    pub fn new(sender: mpsc::Sender<CoordinateCommand>) -> Self {
        Self { sender }
    }

    /// Creates a callback together with the receiver its commands arrive on.
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<CoordinateCommand>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl OmegaCallback for ChannelCallback {
    async fn send(&self, command: CoordinateCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|e| TxError::Transport(format!("participant channel closed: {e}")))
    }
}
