//! Integration test utilities for shardgate
//!
//! In-memory transport and bootstrap doubles that speak just enough of the
//! gateway protocol to drive shards through Hello, Identify and READY.

pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;
