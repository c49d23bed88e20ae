//! Gateway event definitions

use crate::circuit::CircuitState;
use serde::Serialize;
use shardgate_core::FailureCategory;

/// Structured context for debug, warn and error events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Stable machine-readable code
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard_id: Option<u32>,
    pub message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            shard_id: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn for_shard(code: &'static str, shard_id: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            shard_id: Some(shard_id),
            message: message.into(),
        }
    }
}

/// Everything observable about the gateway's lifecycle
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// A shard's connection attempt was started
    ShardSpawn { shard_id: u32 },

    /// A shard completed Identify and received READY
    ShardReady {
        shard_id: u32,
        total_shards: u32,
        session_id: String,
        entity_count: usize,
    },

    /// A shard's connection went away
    ShardDisconnect {
        shard_id: u32,
        close_code: Option<u16>,
        reason: String,
        will_reconnect: bool,
    },

    /// A reconnect attempt is starting
    ShardReconnect { shard_id: u32, attempt: u32 },

    /// A shard resumed its previous session
    ShardResume { shard_id: u32, session_id: String },

    /// Heartbeat round trip measured
    ShardLatency { shard_id: u32, latency_ms: u64 },

    CircuitStateChange {
        previous: CircuitState,
        state: CircuitState,
        category: Option<FailureCategory>,
        failure_count: u32,
        reset_timeout_ms: u64,
    },

    /// An operation was refused by the open circuit
    CircuitBlocked {
        operation: String,
        state: CircuitState,
        remaining_ms: u64,
    },

    /// Application-level dispatch forwarded from a shard
    Dispatch {
        shard_id: u32,
        event_type: String,
        sequence: Option<u64>,
        data: serde_json::Value,
    },

    Debug(Diagnostic),
    Warn(Diagnostic),
    Error(Diagnostic),
}

impl GatewayEvent {
    /// Short name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ShardSpawn { .. } => "shard_spawn",
            Self::ShardReady { .. } => "shard_ready",
            Self::ShardDisconnect { .. } => "shard_disconnect",
            Self::ShardReconnect { .. } => "shard_reconnect",
            Self::ShardResume { .. } => "shard_resume",
            Self::ShardLatency { .. } => "shard_latency",
            Self::CircuitStateChange { .. } => "circuit_state_change",
            Self::CircuitBlocked { .. } => "circuit_blocked",
            Self::Dispatch { .. } => "dispatch",
            Self::Debug(_) => "debug",
            Self::Warn(_) => "warn",
            Self::Error(_) => "error",
        }
    }

    /// Shard the event concerns, if any
    #[must_use]
    pub fn shard_id(&self) -> Option<u32> {
        match self {
            Self::ShardSpawn { shard_id }
            | Self::ShardReady { shard_id, .. }
            | Self::ShardDisconnect { shard_id, .. }
            | Self::ShardReconnect { shard_id, .. }
            | Self::ShardResume { shard_id, .. }
            | Self::ShardLatency { shard_id, .. }
            | Self::Dispatch { shard_id, .. } => Some(*shard_id),
            Self::Debug(d) | Self::Warn(d) | Self::Error(d) => d.shard_id,
            Self::CircuitStateChange { .. } | Self::CircuitBlocked { .. } => None,
        }
    }

    /// Error code for error events
    #[must_use]
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Error(d) => Some(d.code),
            _ => None,
        }
    }
}
