//! Value objects - immutable types that represent domain concepts

mod failure_category;
mod snowflake;

pub use failure_category::FailureCategory;
pub use snowflake::{Snowflake, SnowflakeGenerator, SnowflakeParseError};
