//! Transport seam between a channel and the WebSocket library

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Inbound transport notifications, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { data: Vec<u8>, binary: bool },
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Peer closed the connection; always the last event
    Close { code: Option<u16>, reason: String },
    Error(String),
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

impl OutgoingFrame {
    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Transport closed")]
    Closed,
}

/// Write half of an open connection
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: OutgoingFrame) -> Result<(), TransportError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// An established connection: its write half and its inbound events
pub struct TransportConnection {
    pub sink: Box<dyn TransportSink>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens connections to a gateway URL
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and complete the WebSocket handshake
    async fn connect(&self, url: &str) -> Result<TransportConnection, TransportError>;
}
