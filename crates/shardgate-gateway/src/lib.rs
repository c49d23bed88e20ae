//! # shardgate-gateway
//!
//! Client for a sharded, Discord-style WebSocket gateway: shard planning and
//! bucketed start-up, streaming decompression, circuit breaking, and the
//! `Gateway` facade tying them together.

pub mod bootstrap;
pub mod circuit;
pub mod compression;
pub mod connection;
pub mod error;
pub mod events;
pub mod gateway;
pub mod protocol;
pub mod shard;

pub use bootstrap::{
    BootstrapClient, BootstrapError, BootstrapInfo, HttpBootstrapClient, ProviderHealth,
    SessionStartLimit, StaticBootstrap,
};
pub use circuit::{classify_failure, CircuitBreaker, CircuitState, CircuitStats};
pub use compression::{CodecError, Decompressor, StreamDecompressor};
pub use connection::{
    ChannelError, ChannelEvent, ChannelEventKind, ChannelState, ConnectionChannel, OutgoingFrame,
    Transport, TransportConnection, TransportError, TransportEvent, TransportSink,
    TungsteniteTransport,
};
pub use error::{GatewayError, GatewayResult};
pub use events::{Diagnostic, EventBus, GatewayEvent};
pub use gateway::Gateway;
pub use protocol::{CloseCode, GatewayMessage, OpCode};
pub use shard::{
    ConnectMode, Orchestrator, ReconnectDecision, ShardConnector, ShardPlan, ShardRecord,
    ShardStatus, SpawnReport,
};
