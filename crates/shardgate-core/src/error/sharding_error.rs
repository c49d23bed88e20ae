//! Shard planning errors - raised synchronously before any shard is touched

use thiserror::Error;

/// Errors produced while validating a shard plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShardingError {
    // =========================================================================
    // Configuration Bounds
    // =========================================================================
    #[error("Invalid shard configuration: {0}")]
    InvalidShardConfig(String),

    #[error("Shard {shard_id} is out of range for {total_shards} total shards")]
    ShardOutOfRange { shard_id: u32, total_shards: u32 },

    #[error("{total_shards} shards is below the minimum of {minimum} for {entity_count} entities")]
    TooFewShards {
        total_shards: u32,
        minimum: u32,
        entity_count: u64,
    },

    // =========================================================================
    // Large Bot Rule
    // =========================================================================
    #[error(
        "Large bot sharding: {total_shards} shards is not a multiple of the recommended {recommended_shards}"
    )]
    LargeBotSharding {
        total_shards: u32,
        recommended_shards: u32,
    },
}

impl ShardingError {
    /// Get an error code string for events
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidShardConfig(_) | Self::ShardOutOfRange { .. } | Self::TooFewShards { .. } => {
                "INVALID_SHARD_CONFIG"
            }
            Self::LargeBotSharding { .. } => "LARGE_BOT_SHARDING_ERROR",
        }
    }

    /// Check if this is a large-bot multiple-of-recommended violation
    pub fn is_large_bot(&self) -> bool {
        matches!(self, Self::LargeBotSharding { .. })
    }
}
