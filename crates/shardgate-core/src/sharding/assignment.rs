//! Entity to shard assignment and rate-limit bucketing

use crate::error::ShardingError;
use crate::value_objects::Snowflake;
use std::collections::{BTreeMap, BTreeSet};

/// Shard that always owns direct-message traffic
pub const DIRECT_MESSAGE_SHARD: u32 = 0;

/// Client-side ceiling on the provider's `max_concurrency`
pub const MAX_CONCURRENCY_CEILING: u32 = 16;

/// `(entity_id >> 22) mod total_shards`
///
/// A zero shard count is treated as a single shard.
#[inline]
pub fn shard_for_entity(entity: Snowflake, total_shards: u32) -> u32 {
    let total = u64::from(total_shards.max(1));
    ((entity.into_inner() >> 22) % total) as u32
}

/// Route traffic that may or may not belong to an entity.
///
/// Traffic without an owning entity (direct messages) always goes to shard 0.
#[inline]
pub fn shard_for_route(entity: Option<Snowflake>, total_shards: u32) -> u32 {
    entity.map_or(DIRECT_MESSAGE_SHARD, |id| shard_for_entity(id, total_shards))
}

/// `shard_id mod max_concurrency`
#[inline]
pub fn bucket_for_shard(shard_id: u32, max_concurrency: u32) -> u32 {
    shard_id % max_concurrency.max(1)
}

/// Clamp the provider's `max_concurrency` to `1..=ceiling`
#[inline]
pub fn effective_max_concurrency(reported: u32, ceiling: u32) -> u32 {
    reported.clamp(1, ceiling.max(1))
}

/// Group shards into rate-limit buckets keyed by `shard_id mod max_concurrency`.
///
/// Keys iterate in ascending order; shard IDs within a bucket are sorted.
pub fn group_buckets(shard_ids: &[u32], max_concurrency: u32) -> BTreeMap<u32, Vec<u32>> {
    let mut buckets: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let unique: BTreeSet<u32> = shard_ids.iter().copied().collect();

    for shard_id in unique {
        buckets
            .entry(bucket_for_shard(shard_id, max_concurrency))
            .or_default()
            .push(shard_id);
    }

    buckets
}

/// Resolve the shards this process runs.
///
/// An empty list means every shard in `0..total_shards`. Entries must be
/// unique and below `total_shards`.
pub fn validate_shard_list(shard_list: &[u32], total_shards: u32) -> Result<Vec<u32>, ShardingError> {
    if total_shards == 0 {
        return Err(ShardingError::InvalidShardConfig(
            "total_shards must be positive".to_string(),
        ));
    }

    if shard_list.is_empty() {
        return Ok((0..total_shards).collect());
    }

    let mut seen = BTreeSet::new();
    for &shard_id in shard_list {
        if shard_id >= total_shards {
            return Err(ShardingError::ShardOutOfRange {
                shard_id,
                total_shards,
            });
        }
        if !seen.insert(shard_id) {
            return Err(ShardingError::InvalidShardConfig(format!(
                "shard {shard_id} listed more than once"
            )));
        }
    }

    Ok(seen.into_iter().collect())
}
