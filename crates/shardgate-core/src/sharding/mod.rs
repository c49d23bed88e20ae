//! Shard planning
//!
//! Pure functions for sizing, entity assignment and rate-limit bucketing.

mod assignment;
mod plan;

pub use assignment::{
    bucket_for_shard, effective_max_concurrency, group_buckets, shard_for_entity, shard_for_route,
    validate_shard_list, DIRECT_MESSAGE_SHARD, MAX_CONCURRENCY_CEILING,
};
pub use plan::{compute_total_shards, minimum_shards, SizingInput, TotalShards};
