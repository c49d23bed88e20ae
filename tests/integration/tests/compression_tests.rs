//! Compressed transports end to end
//!
//! Run with: cargo test -p integration-tests --test compression_tests

use integration_tests::*;
use serde_json::{json, Value};
use shardgate_core::TotalShards;
use shardgate_gateway::{
    ChannelError, ChannelEvent, ChannelEventKind, ChannelState, ConnectionChannel, Gateway, GatewayEvent,
    TransportEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn next_event(events: &mut mpsc::Receiver<ChannelEvent>) -> ChannelEventKind {
    tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .expect("channel event in time")
        .expect("channel event stream open")
        .kind
}

async fn next_payload(events: &mut mpsc::Receiver<ChannelEvent>) -> Value {
    loop {
        if let ChannelEventKind::Payload(bytes) = next_event(events).await {
            return serde_json::from_slice(&bytes).expect("payload is JSON");
        }
    }
}

fn channel_for(encoding: WireEncoding) -> (Arc<MockTransport>, ConnectionChannel, mpsc::Receiver<ChannelEvent>) {
    let transport = Arc::new(MockTransport::new().with_encoding(encoding).without_handshake());
    let (sender, receiver) = mpsc::channel(64);
    let channel = ConnectionChannel::new(0, encoding.compression(), transport.clone(), sender);
    (transport, channel, receiver)
}

// ============================================================================
// Channel level
// ============================================================================

#[tokio::test]
async fn test_zlib_stream_reassembles_split_frames() {
    let (transport, channel, mut events) = channel_for(WireEncoding::ZlibStream);
    channel.connect("wss://gateway.test").await.unwrap();
    assert_eq!(next_event(&mut events).await, ChannelEventKind::Open);

    let connection = transport.connections().pop().unwrap();
    let first = json!({"op": 10, "d": {"heartbeat_interval": 41250}});
    let second = dispatch("MESSAGE_CREATE", 2, json!({"content": "hello ".repeat(64)}));
    connection.push(first.clone()).await;
    connection.push(second.clone()).await;

    assert_eq!(next_payload(&mut events).await, first);
    assert_eq!(next_payload(&mut events).await, second);

    // Two transport frames per message
    assert_eq!(channel.stats().frames_received, 4);
}

#[tokio::test]
async fn test_zstd_stream_decodes_each_frame() {
    let (transport, channel, mut events) = channel_for(WireEncoding::ZstdStream);
    channel.connect("wss://gateway.test").await.unwrap();

    let connection = transport.connections().pop().unwrap();
    for sequence in 1..=3 {
        connection.push(dispatch("TYPING_START", sequence, json!({"n": sequence}))).await;
    }
    for sequence in 1..=3u64 {
        let payload = next_payload(&mut events).await;
        assert_eq!(payload["s"], sequence);
    }
}

#[tokio::test]
async fn test_corrupt_frame_closes_channel() {
    let (transport, channel, mut events) = channel_for(WireEncoding::ZlibStream);
    channel.connect("wss://gateway.test").await.unwrap();
    assert_eq!(next_event(&mut events).await, ChannelEventKind::Open);

    let connection = transport.connections().pop().unwrap();
    connection
        .push_raw(TransportEvent::Message {
            data: vec![0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0xFF, 0xFF],
            binary: true,
        })
        .await;

    assert!(matches!(
        next_event(&mut events).await,
        ChannelEventKind::Error(ChannelError::Codec(_))
    ));
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEventKind::Closed { code: Some(1007), .. }
    ));
    assert_eq!(channel.state().await, ChannelState::Closed);
    assert_eq!(connection.close_code(), Some(1007));
}

#[tokio::test]
async fn test_reconnect_starts_a_fresh_context() {
    let (transport, channel, mut events) = channel_for(WireEncoding::ZlibStream);
    channel.connect("wss://gateway.test").await.unwrap();
    let first = transport.connections().pop().unwrap();
    first.push(json!({"op": 11})).await;
    assert_eq!(next_payload(&mut events).await, json!({"op": 11}));

    channel.connect("wss://gateway.test").await.unwrap();
    assert_eq!(channel.generation(), 2);

    // The new server stream starts with its own zlib header
    let second = transport.connections().pop().unwrap();
    second.push(json!({"op": 11, "s": null})).await;
    assert_eq!(next_payload(&mut events).await["op"], 11);
}

// ============================================================================
// Gateway level
// ============================================================================

async fn start_compressed(encoding: WireEncoding) {
    let transport = Arc::new(
        MockTransport::new()
            .with_encoding(encoding)
            .with_guilds(|shard_id, _| vec![entity(u64::from(shard_id)).into_inner()]),
    );
    let bootstrap = Arc::new(MockBootstrap::new(bootstrap_info(2, 1)));
    let gateway = Gateway::new(
        test_config_with(TotalShards::Fixed(2), encoding),
        transport.clone(),
        bootstrap,
    )
    .unwrap();
    let mut events = gateway.subscribe();

    gateway.start().await.unwrap();
    let orchestrator = gateway.orchestrator().clone();
    assert!(wait_until(TIMEOUT, || orchestrator.ready_shards().len() == 2).await);

    let query = encoding.compression().query_value().unwrap();
    for connection in transport.connections() {
        assert!(connection.url.contains(&format!("compress={query}")));
    }
    assert_eq!(orchestrator.shard(1).unwrap().entity_count(), 1);

    let codec_errors = drain_events(&mut events)
        .into_iter()
        .filter(|event| matches!(event, GatewayEvent::Error(d) if d.code.starts_with("CODEC")))
        .count();
    assert_eq!(codec_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn test_gateway_over_zlib_stream() {
    start_compressed(WireEncoding::ZlibStream).await;
}

#[tokio::test(start_paused = true)]
async fn test_gateway_over_zstd_stream() {
    start_compressed(WireEncoding::ZstdStream).await;
}
