//! Broadcast fan-out of gateway events

use super::GatewayEvent;
use tokio::sync::broadcast;

/// Events buffered per subscriber before it starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Publishes [`GatewayEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Log the event and hand it to current subscribers
    pub fn emit(&self, event: GatewayEvent) {
        trace_event(&event);
        // No subscribers is fine; the log line above is the record
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

fn trace_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::ShardSpawn { shard_id } => {
            tracing::info!(shard_id, "Shard spawning");
        }
        GatewayEvent::ShardReady {
            shard_id,
            total_shards,
            session_id,
            entity_count,
        } => {
            tracing::info!(shard_id, total_shards, session_id = %session_id, entity_count, "Shard ready");
        }
        GatewayEvent::ShardDisconnect {
            shard_id,
            close_code,
            reason,
            will_reconnect,
        } => {
            tracing::warn!(shard_id, ?close_code, reason = %reason, will_reconnect, "Shard disconnected");
        }
        GatewayEvent::ShardReconnect { shard_id, attempt } => {
            tracing::info!(shard_id, attempt, "Shard reconnecting");
        }
        GatewayEvent::ShardResume {
            shard_id,
            session_id,
        } => {
            tracing::info!(shard_id, session_id = %session_id, "Shard resumed");
        }
        GatewayEvent::ShardLatency {
            shard_id,
            latency_ms,
        } => {
            tracing::trace!(shard_id, latency_ms, "Heartbeat acknowledged");
        }
        GatewayEvent::CircuitStateChange {
            previous,
            state,
            category,
            failure_count,
            reset_timeout_ms,
        } => {
            tracing::warn!(
                ?previous,
                ?state,
                ?category,
                failure_count,
                reset_timeout_ms,
                "Circuit state changed"
            );
        }
        GatewayEvent::CircuitBlocked {
            operation,
            state,
            remaining_ms,
        } => {
            tracing::debug!(operation = %operation, ?state, remaining_ms, "Circuit blocked operation");
        }
        GatewayEvent::Dispatch {
            shard_id,
            event_type,
            sequence,
            ..
        } => {
            tracing::trace!(shard_id, event_type = %event_type, ?sequence, "Dispatch");
        }
        GatewayEvent::Debug(d) => {
            tracing::debug!(code = d.code, shard_id = ?d.shard_id, "{}", d.message);
        }
        GatewayEvent::Warn(d) => {
            tracing::warn!(code = d.code, shard_id = ?d.shard_id, "{}", d.message);
        }
        GatewayEvent::Error(d) => {
            tracing::error!(code = d.code, shard_id = ?d.shard_id, "{}", d.message);
        }
    }
}
