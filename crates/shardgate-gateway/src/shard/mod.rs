//! Shard lifecycle: planning, bucketed start-up, identify budget,
//! reconnection and health checks

mod orchestrator;
mod plan;
mod rate_limit;
mod reconnect;
mod record;

pub use orchestrator::Orchestrator;
pub use plan::{ShardPlan, SpawnReport};
pub use rate_limit::{identify_shares, RateLimitWindow};
pub use reconnect::{backoff_delay, ReconnectDecision, ReconnectState};
pub use record::{ShardHealth, ShardRecord, ShardStatus};

use crate::error::GatewayError;
use async_trait::async_trait;

/// How a shard (re)joins the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Start a new session; consumes identify budget
    Identify,
    /// Continue an existing session
    Resume {
        session_id: String,
        sequence: Option<u64>,
    },
}

impl ConnectMode {
    #[must_use]
    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Resume { .. })
    }
}

/// Connection side of shard start-up, driven by the [`Orchestrator`]
#[async_trait]
pub trait ShardConnector: Send + Sync {
    /// Checked before any identify budget is spent on `shard_id`
    fn permit(&self, shard_id: u32) -> Result<(), GatewayError>;

    /// Connect and complete the handshake; returns once the shard is ready
    async fn connect_shard(
        &self,
        shard_id: u32,
        total_shards: u32,
        mode: ConnectMode,
    ) -> Result<(), GatewayError>;

    /// Called after `connect_shard` failed or timed out
    async fn connect_failed(&self, shard_id: u32, error: &GatewayError);

    /// Tear down a live connection so the shard can be reconnected
    async fn disconnect_shard(&self, shard_id: u32);
}
