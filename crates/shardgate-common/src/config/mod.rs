//! Configuration management

mod gateway_config;

pub use gateway_config::{
    CircuitConfig, CompressionMode, ConfigError, Environment, GatewayConfig, ShardingConfig,
};
