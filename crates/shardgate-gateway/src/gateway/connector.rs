//! Shard connections driven by the orchestrator

use super::session::ShardSession;
use super::{GatewayInner, RESUMABLE_CLOSE};
use crate::error::GatewayError;
use crate::shard::{ConnectMode, ShardConnector};
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Operation tag reported when the breaker refuses a connection
const CONNECT_OPERATION: &str = "shard_connect";

#[async_trait]
impl ShardConnector for GatewayInner {
    fn permit(&self, shard_id: u32) -> Result<(), GatewayError> {
        if self.breaker.can_execute(CONNECT_OPERATION) {
            return Ok(());
        }
        let remaining_ms = self
            .breaker
            .remaining_timeout()
            .map_or(0, |remaining| remaining.as_millis() as u64);
        tracing::debug!(shard_id, remaining_ms, "Connection refused by open circuit");
        Err(GatewayError::CircuitOpen {
            operation: CONNECT_OPERATION.to_string(),
            remaining_ms,
        })
    }

    async fn connect_shard(&self, shard_id: u32, total_shards: u32, mode: ConnectMode) -> Result<(), GatewayError> {
        let url = match &mode {
            ConnectMode::Resume { .. } => self
                .orchestrator
                .shard(shard_id)
                .and_then(|record| record.resume_url().map(|base| self.config.connect_url_for(base)))
                .unwrap_or_else(|| self.config.connect_url()),
            ConnectMode::Identify => self.config.connect_url(),
        };

        let (waiter, handshake) = oneshot::channel();
        self.sessions
            .insert(shard_id, ShardSession::pending(mode, total_shards, waiter));

        let channel = self.channel(shard_id);
        channel
            .connect(&url)
            .await
            .map_err(|source| GatewayError::channel(shard_id, source))?;

        match handshake.await {
            Ok(Ok(())) => {
                self.breaker.record_success();
                Ok(())
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(GatewayError::Closed {
                shard_id,
                code: None,
                reason: "handshake abandoned".to_string(),
            }),
        }
    }

    async fn connect_failed(&self, shard_id: u32, error: &GatewayError) {
        if let Some(mut session) = self.sessions.get_mut(&shard_id) {
            session.stop_heartbeat();
            session.take_handshake();
        }
        if let Some(channel) = self.existing_channel(shard_id) {
            channel.close(RESUMABLE_CLOSE, "connect failed").await;
        }
        if !matches!(error, GatewayError::CircuitOpen { .. } | GatewayError::ShuttingDown) {
            self.breaker.record_failure(&error.to_string(), error.failure_category());
        }
    }

    async fn disconnect_shard(&self, shard_id: u32) {
        if let Some(mut session) = self.sessions.get_mut(&shard_id) {
            session.stop_heartbeat();
        }
        if let Some(channel) = self.existing_channel(shard_id) {
            channel.close(RESUMABLE_CLOSE, "reconnecting").await;
        }
    }
}
