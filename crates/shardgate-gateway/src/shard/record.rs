//! Per-shard bookkeeping

use super::rate_limit::RateLimitWindow;
use super::reconnect::ReconnectState;
use serde::Serialize;
use shardgate_core::Snowflake;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// Shard lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Disconnected,
    Connecting,
    Resuming,
    Ready,
}

/// Heartbeat health
#[derive(Debug, Clone, Default)]
pub struct ShardHealth {
    pub last_heartbeat_ack: Option<Instant>,
    pub latency: Option<Duration>,
    pub consecutive_failed_heartbeats: u32,
}

/// Everything the orchestrator tracks about one shard
#[derive(Debug, Clone)]
pub struct ShardRecord {
    pub(crate) shard_id: u32,
    pub(crate) total_shards: u32,
    pub(crate) bucket_id: u32,
    pub(crate) status: ShardStatus,
    pub(crate) status_changed_at: Instant,
    pub(crate) connect_started_at: Option<Instant>,
    pub(crate) entities: HashSet<Snowflake>,
    pub(crate) session_id: Option<String>,
    pub(crate) sequence: Option<u64>,
    pub(crate) resume_url: Option<String>,
    pub(crate) health: ShardHealth,
    pub(crate) rate_limit: RateLimitWindow,
    pub(crate) reconnect: ReconnectState,
}

impl ShardRecord {
    pub(crate) fn new(shard_id: u32, total_shards: u32, bucket_id: u32, rate_limit: RateLimitWindow) -> Self {
        Self {
            shard_id,
            total_shards,
            bucket_id,
            status: ShardStatus::Disconnected,
            status_changed_at: Instant::now(),
            connect_started_at: None,
            entities: HashSet::new(),
            session_id: None,
            sequence: None,
            resume_url: None,
            health: ShardHealth::default(),
            rate_limit,
            reconnect: ReconnectState::default(),
        }
    }

    pub(crate) fn set_status(&mut self, status: ShardStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Instant::now();
        }
    }

    pub(crate) fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn bucket_id(&self) -> u32 {
        self.bucket_id
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    pub fn status_changed_at(&self) -> Instant {
        self.status_changed_at
    }

    pub fn entities(&self) -> &HashSet<Snowflake> {
        &self.entities
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Last dispatch sequence number received
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    pub fn health(&self) -> &ShardHealth {
        &self.health
    }

    pub fn rate_limit(&self) -> &RateLimitWindow {
        &self.rate_limit
    }

    pub fn reconnect(&self) -> &ReconnectState {
        &self.reconnect
    }

    pub fn is_ready(&self) -> bool {
        self.status == ShardStatus::Ready
    }
}
