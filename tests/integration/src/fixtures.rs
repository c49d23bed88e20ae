//! Test fixtures and data generators

use flate2::write::ZlibEncoder;
use shardgate_common::{CompressionMode, GatewayConfig};
use shardgate_core::{Snowflake, TotalShards};
use shardgate_gateway::BootstrapInfo;
use std::io::Write;

/// Test token; never sent anywhere real
pub const TEST_TOKEN: &str = "test-token";

/// Spawn delay used by gateway tests
pub const TEST_SPAWN_DELAY_MS: u64 = 5_000;

/// How the mock server encodes frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireEncoding {
    #[default]
    Json,
    ZlibStream,
    ZstdStream,
}

impl WireEncoding {
    pub fn compression(self) -> CompressionMode {
        match self {
            Self::Json => CompressionMode::None,
            Self::ZlibStream => CompressionMode::ZlibStream,
            Self::ZstdStream => CompressionMode::ZstdStream,
        }
    }
}

/// Gateway configuration pointing at the mock server, uncompressed
pub fn test_config(total_shards: TotalShards) -> GatewayConfig {
    test_config_with(total_shards, WireEncoding::Json)
}

/// Gateway configuration negotiating `encoding`
pub fn test_config_with(total_shards: TotalShards, encoding: WireEncoding) -> GatewayConfig {
    let mut config = GatewayConfig::new(TEST_TOKEN);
    config.gateway_url = "wss://gateway.test".to_string();
    config.compression = encoding.compression();
    config.sharding.total_shards = total_shards;
    config.sharding.spawn_delay_ms = TEST_SPAWN_DELAY_MS;
    config.sharding.reconnect_base_delay_ms = 100;
    config.sharding.reconnect_max_delay_ms = 1_000;
    config.sharding.reconnect_tick_ms = 50;
    config
}

/// Bootstrap metadata with a roomy session budget
pub fn bootstrap_info(recommended_shards: u32, max_concurrency: u32) -> BootstrapInfo {
    BootstrapInfo::new(recommended_shards, max_concurrency)
}

/// Entity id whose shard under `total_shards` is `index mod total_shards`
pub fn entity(index: u64) -> Snowflake {
    Snowflake::new((index << 22) | 0x1F)
}

/// `count` distinct entities
pub fn entities(count: u64) -> Vec<Snowflake> {
    (0..count).map(entity).collect()
}

/// Compress one message on a persistent zlib stream, ending in the sync-flush marker
pub fn encode_zlib_stream(encoder: &mut ZlibEncoder<Vec<u8>>, payload: &[u8]) -> Vec<u8> {
    encoder.write_all(payload).expect("zlib write");
    encoder.flush().expect("zlib flush");
    std::mem::take(encoder.get_mut())
}

/// One self-contained zstd frame
pub fn encode_zstd(payload: &[u8]) -> Vec<u8> {
    zstd::encode_all(payload, 0).expect("zstd encode")
}

/// Gateway dispatch envelope
pub fn dispatch(event_type: &str, sequence: u64, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"op": 0, "t": event_type, "s": sequence, "d": data})
}
