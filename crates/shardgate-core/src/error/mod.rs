//! Domain errors

mod sharding_error;

pub use sharding_error::ShardingError;
