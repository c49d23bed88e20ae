//! Shard plans

use crate::bootstrap::BootstrapInfo;
use shardgate_common::ShardingConfig;
use shardgate_core::{
    compute_total_shards, effective_max_concurrency, group_buckets, validate_shard_list,
    ShardingError, SizingInput, TotalShards,
};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Validated shard layout for this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    pub total_shards: u32,
    pub max_concurrency: u32,
    /// Shards run by this process, ascending
    pub shard_ids: Vec<u32>,
    /// Start-up buckets keyed by `shard_id mod max_concurrency`
    pub buckets: BTreeMap<u32, Vec<u32>>,
    /// Session starts the provider reported as left; caps the first identify window
    pub session_starts_remaining: u32,
}

impl ShardPlan {
    /// Size and validate a plan. Nothing is touched when this fails.
    pub fn build(
        config: &ShardingConfig,
        requested: TotalShards,
        entity_count: u64,
        info: &BootstrapInfo,
    ) -> Result<Self, ShardingError> {
        let total_shards = compute_total_shards(&SizingInput {
            entity_count,
            requested,
            recommended_shards: info.recommended_shard_count,
            large_threshold: config.large_threshold,
            very_large_threshold: config.very_large_threshold,
        })?;
        let shard_ids = validate_shard_list(&config.shard_list, total_shards)?;
        let max_concurrency =
            effective_max_concurrency(info.max_concurrency(), config.max_concurrency_ceiling);
        let buckets = group_buckets(&shard_ids, max_concurrency);

        Ok(Self {
            total_shards,
            max_concurrency,
            shard_ids,
            buckets,
            session_starts_remaining: info.session_start_limit.remaining,
        })
    }

    /// Same plan with a fresher session-start count
    #[must_use]
    pub fn with_session_starts(mut self, remaining: u32) -> Self {
        self.session_starts_remaining = remaining;
        self
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        u32::try_from(self.shard_ids.len()).unwrap_or(u32::MAX)
    }
}

/// What a start-up pass did
#[derive(Debug, Clone, Default)]
pub struct SpawnReport {
    /// Shards whose connection attempt was started, in start order
    pub launched: Vec<u32>,
    /// When each bucket began
    pub bucket_starts: Vec<(u32, Instant)>,
    /// A newer plan replaced this one part-way through
    pub superseded: bool,
}
