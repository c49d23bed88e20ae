//! Gateway error taxonomy

use crate::bootstrap::BootstrapError;
use crate::circuit::classify_failure;
use crate::connection::ChannelError;
use crate::protocol::CloseCode;
use shardgate_common::ConfigError;
use shardgate_core::{FailureCategory, ShardingError};

/// Errors surfaced by the gateway and its orchestrator
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // =========================================================================
    // Planning
    // =========================================================================
    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Session start limit exceeded: {required} shards to start, {remaining} starts remaining (resets in {reset_after_ms}ms)")]
    SessionLimitExceeded {
        required: u32,
        remaining: u32,
        reset_after_ms: u64,
    },

    // =========================================================================
    // Provider
    // =========================================================================
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("Provider degraded: {0}")]
    ProviderDegraded(String),

    // =========================================================================
    // Connection
    // =========================================================================
    #[error("Shard {shard_id} did not complete its handoff within {timeout_ms}ms (timeout)")]
    SpawnTimeout { shard_id: u32, timeout_ms: u64 },

    #[error("Circuit open, {operation} blocked for another {remaining_ms}ms")]
    CircuitOpen { operation: String, remaining_ms: u64 },

    #[error("Shard {shard_id} gave up after {attempts} reconnect attempts")]
    MaxReconnectAttemptsExceeded { shard_id: u32, attempts: u32 },

    #[error("Shard {shard_id}: {source}")]
    Channel {
        shard_id: u32,
        #[source]
        source: ChannelError,
    },

    #[error("Shard {shard_id} closed with code {}: {reason}", close_code_label(.code))]
    Closed {
        shard_id: u32,
        code: Option<u16>,
        reason: String,
    },

    #[error("Gateway protocol error on shard {shard_id}: {message}")]
    Protocol { shard_id: u32, message: String },

    // =========================================================================
    // Lookups and lifecycle
    // =========================================================================
    #[error("Shard {0} is not managed by this process")]
    ShardNotFound(u32),

    #[error("Shard {0} is not ready")]
    ShardNotReady(u32),

    #[error("Gateway has not been started")]
    NotStarted,

    #[error("Gateway is already running")]
    AlreadyStarted,

    #[error("Gateway is shutting down")]
    ShuttingDown,

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Get an error code string for events
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sharding(e) => e.code(),
            Self::Config(_) => "CONFIG_ERROR",
            Self::SessionLimitExceeded { .. } => "SESSION_LIMIT_EXCEEDED",
            Self::Bootstrap(_) => "BOOTSTRAP_ERROR",
            Self::ProviderDegraded(_) => "PROVIDER_DEGRADED",
            Self::SpawnTimeout { .. } => "SPAWN_TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::MaxReconnectAttemptsExceeded { .. } => "MAX_RECONNECT_ATTEMPTS_EXCEEDED",
            Self::Channel {
                source: ChannelError::Codec(_),
                ..
            } => "CODEC_ERROR",
            Self::Channel { .. } => "CONNECTION_ERROR",
            Self::Closed { .. } => "CONNECTION_CLOSED",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::ShardNotFound(_) => "SHARD_NOT_FOUND",
            Self::ShardNotReady(_) => "SHARD_NOT_READY",
            Self::NotStarted => "NOT_STARTED",
            Self::AlreadyStarted => "ALREADY_STARTED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether trying again later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SpawnTimeout { .. }
            | Self::CircuitOpen { .. }
            | Self::SessionLimitExceeded { .. }
            | Self::ProviderDegraded(_)
            | Self::Channel { .. }
            | Self::Protocol { .. } => true,
            Self::Closed { code, .. } => code
                .and_then(CloseCode::from_u16)
                .is_none_or(CloseCode::should_reconnect),
            Self::Bootstrap(e) => !matches!(e, BootstrapError::Unauthorized),
            _ => false,
        }
    }

    /// Failure category reported to the circuit breaker
    pub fn failure_category(&self) -> FailureCategory {
        match self {
            Self::SpawnTimeout { .. } => FailureCategory::Timeout,
            Self::Bootstrap(BootstrapError::Unauthorized) => FailureCategory::Authentication,
            Self::Bootstrap(BootstrapError::RateLimited { .. }) => FailureCategory::RateLimit,
            Self::Channel {
                source: ChannelError::Codec(_),
                ..
            } => FailureCategory::TransportProtocol,
            Self::Closed { code: Some(code), .. } => match CloseCode::from_u16(*code) {
                Some(CloseCode::AuthenticationFailed) => FailureCategory::Authentication,
                Some(CloseCode::RateLimited) => FailureCategory::RateLimit,
                Some(CloseCode::SessionTimedOut) => FailureCategory::Timeout,
                Some(_) => FailureCategory::GatewayProtocol,
                None => classify_failure(&self.to_string()),
            },
            Self::Closed { code: None, .. } => FailureCategory::Network,
            Self::Protocol { .. } => FailureCategory::GatewayProtocol,
            other => classify_failure(&other.to_string()),
        }
    }

    pub(crate) fn channel(shard_id: u32, source: ChannelError) -> Self {
        Self::Channel { shard_id, source }
    }
}

fn close_code_label(code: &Option<u16>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
