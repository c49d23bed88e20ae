//! # shardgate-core
//!
//! Domain layer containing the identifier type and the pure shard planning
//! math (sizing, entity assignment, bucketing).
//! This crate has zero dependencies on infrastructure (network, runtime, etc.).

pub mod error;
pub mod sharding;
pub mod value_objects;

// Re-export commonly used types at crate root
pub use error::ShardingError;
pub use sharding::{
    bucket_for_shard, compute_total_shards, effective_max_concurrency, group_buckets,
    minimum_shards, shard_for_entity, shard_for_route, validate_shard_list, SizingInput,
    TotalShards, DIRECT_MESSAGE_SHARD, MAX_CONCURRENCY_CEILING,
};
pub use value_objects::{FailureCategory, Snowflake, SnowflakeGenerator, SnowflakeParseError};
