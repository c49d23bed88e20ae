//! Per-shard WebSocket connections

mod channel;
mod transport;
mod tungstenite;

pub use channel::{
    ChannelError, ChannelEvent, ChannelEventKind, ChannelState, ChannelStats, ConnectionChannel,
    NORMAL_CLOSE,
};
pub use transport::{
    OutgoingFrame, Transport, TransportConnection, TransportError, TransportEvent, TransportSink,
};
pub use tungstenite::TungsteniteTransport;
