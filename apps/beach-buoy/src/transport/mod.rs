pub mod websocket;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ClientMessage, Signal};

pub use websocket::SignalingSocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("signaling connection failed: {0}")]
    Connection(String),
    #[error("signaling connection closed")]
    Closed,
    #[error("outbound channel closed")]
    ChannelClosed,
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handle onto the single outbound signaling queue.
///
/// Every clone feeds the same writer task, which serializes one message per
/// websocket frame.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub fn signal(&self, target: &str, payload: Signal) -> Result<(), TransportError> {
        self.send(ClientMessage::signal(target, payload))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
