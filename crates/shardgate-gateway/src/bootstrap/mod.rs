//! Provider bootstrap metadata
//!
//! Before planning shards the gateway asks the provider how many shards it
//! recommends, how many shards may identify concurrently, and how many
//! session starts remain in the current window.

mod http;

pub use http::HttpBootstrapClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session-start budget reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    #[serde(alias = "reset_after")]
    pub reset_after_ms: u64,
    /// Some providers report concurrency here instead of at the top level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
}

impl SessionStartLimit {
    #[must_use]
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}

impl Default for SessionStartLimit {
    fn default() -> Self {
        Self {
            total: 1_000,
            remaining: 1_000,
            reset_after_ms: 0,
            max_concurrency: None,
        }
    }
}

/// Provider metadata used for planning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapInfo {
    /// Gateway URL the provider wants clients to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(alias = "shards")]
    pub recommended_shard_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub session_start_limit: SessionStartLimit,
}

impl BootstrapInfo {
    /// Metadata for a provider without an HTTP endpoint
    #[must_use]
    pub fn new(recommended_shard_count: u32, max_concurrency: u32) -> Self {
        Self {
            url: None,
            recommended_shard_count,
            max_concurrency: Some(max_concurrency),
            session_start_limit: SessionStartLimit::default(),
        }
    }

    #[must_use]
    pub fn with_session_start_limit(mut self, limit: SessionStartLimit) -> Self {
        self.session_start_limit = limit;
        self
    }

    /// Reported concurrency, from whichever field carries it (default 1)
    #[must_use]
    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
            .or(self.session_start_limit.max_concurrency)
            .unwrap_or(1)
    }
}

/// Provider health as seen by a lightweight health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderHealth {
    Operational,
    Degraded(String),
}

impl ProviderHealth {
    #[must_use]
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Operational)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("Bootstrap request unauthorized: invalid token")]
    Unauthorized,

    #[error("Bootstrap request rate limited (429), retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Bootstrap request failed with status {0}")]
    Status(u16),

    #[error("Bootstrap request failed: {0}")]
    Request(String),

    #[error("Bootstrap response could not be decoded: {0}")]
    Decode(String),
}

/// Source of bootstrap metadata
#[async_trait]
pub trait BootstrapClient: Send + Sync {
    async fn fetch(&self) -> Result<BootstrapInfo, BootstrapError>;

    async fn health(&self) -> Result<ProviderHealth, BootstrapError>;
}

/// Fixed metadata, for deployments that configure sharding by hand
#[derive(Debug, Clone)]
pub struct StaticBootstrap {
    info: BootstrapInfo,
}

impl StaticBootstrap {
    #[must_use]
    pub fn new(info: BootstrapInfo) -> Self {
        Self { info }
    }
}

#[async_trait]
impl BootstrapClient for StaticBootstrap {
    async fn fetch(&self) -> Result<BootstrapInfo, BootstrapError> {
        Ok(self.info.clone())
    }

    async fn health(&self) -> Result<ProviderHealth, BootstrapError> {
        Ok(ProviderHealth::Operational)
    }
}
