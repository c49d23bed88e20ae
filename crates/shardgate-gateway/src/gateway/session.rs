//! Per-shard handshake and heartbeat state

use crate::error::GatewayError;
use crate::shard::ConnectMode;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub(crate) type HandshakeWaiter = oneshot::Sender<Result<(), GatewayError>>;

/// State for one connection attempt of one shard
#[derive(Debug, Default)]
pub(crate) struct ShardSession {
    /// How to answer Hello
    pub(crate) mode: Option<ConnectMode>,
    pub(crate) total_shards: u32,
    /// When the unacknowledged heartbeat went out
    pub(crate) heartbeat_sent_at: Option<Instant>,
    handshake: Option<HandshakeWaiter>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ShardSession {
    pub(crate) fn pending(mode: ConnectMode, total_shards: u32, waiter: HandshakeWaiter) -> Self {
        Self {
            mode: Some(mode),
            total_shards,
            heartbeat_sent_at: None,
            handshake: Some(waiter),
            heartbeat: None,
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.handshake.is_some()
    }

    /// Resolve the pending handshake, if any
    pub(crate) fn complete(&mut self, result: Result<(), GatewayError>) -> bool {
        match self.handshake.take() {
            Some(waiter) => waiter.send(result).is_ok(),
            None => false,
        }
    }

    pub(crate) fn take_handshake(&mut self) -> Option<HandshakeWaiter> {
        self.handshake.take()
    }

    pub(crate) fn replace_heartbeat(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.heartbeat.replace(handle) {
            previous.abort();
        }
        self.heartbeat_sent_at = None;
    }

    pub(crate) fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        self.heartbeat_sent_at = None;
    }
}

impl Drop for ShardSession {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
