//! Payload bodies carried in the `d` field

use serde::{Deserialize, Serialize};
use shardgate_core::Snowflake;

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub intents: u64,
    pub properties: ConnectionProperties,
    /// `[shard_id, total_shards]`
    pub shard: [u32; 2],
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compress: bool,
}

impl IdentifyPayload {
    #[must_use]
    pub fn new(token: impl Into<String>, intents: u64, shard_id: u32, total_shards: u32) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
            shard: [shard_id, total_shards],
            compress: false,
        }
    }
}

/// Client connection properties sent with Identify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "shardgate".to_string(),
            device: "shardgate".to_string(),
        }
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    /// Last sequence number received
    pub seq: Option<u64>,
}

/// Body of the `READY` dispatch
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// Entity stub delivered in `READY` and `GUILD_DELETE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: Option<bool>,
}
