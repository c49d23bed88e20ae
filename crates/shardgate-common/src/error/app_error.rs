//! Application error types
//!
//! Errors surfaced by the process entry point.

use crate::config::ConfigError;
use crate::telemetry::TracingError;
use shardgate_core::ShardingError;

/// Application-wide error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Telemetry(#[from] TracingError),

    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Interrupted by signal")]
    Interrupted,
}

impl AppError {
    /// Process exit code for this error
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Sharding(_) => 78, // EX_CONFIG
            Self::Telemetry(_) => 70,                  // EX_SOFTWARE
            Self::Gateway(_) => 69,                    // EX_UNAVAILABLE
            Self::Interrupted => 130,
        }
    }

    /// Get an error code string
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Telemetry(_) => "TELEMETRY_ERROR",
            Self::Sharding(e) => e.code(),
            Self::Gateway(_) => "GATEWAY_ERROR",
            Self::Interrupted => "INTERRUPTED",
        }
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
