//! Test doubles for integration tests
//!
//! `MockTransport` plays the gateway server: it sends Hello on connect,
//! answers Identify with READY, Resume with RESUMED, heartbeats with acks
//! and pings with pongs, encoding every frame the way the configured
//! compression expects.

use crate::fixtures::{encode_zlib_stream, encode_zstd, WireEncoding};
use async_trait::async_trait;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde_json::{json, Value};
use shardgate_gateway::{
    BootstrapClient, BootstrapError, BootstrapInfo, GatewayEvent, OutgoingFrame, ProviderHealth,
    Transport, TransportConnection, TransportError, TransportEvent, TransportSink,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Heartbeat interval advertised in Hello
pub const HEARTBEAT_INTERVAL_MS: u64 = 41_250;

/// Resume URL advertised in READY
pub const RESUME_URL: &str = "wss://resume.test";

type GuildSource = Arc<dyn Fn(u32, u32) -> Vec<u64> + Send + Sync>;

enum WireEncoder {
    Json,
    Zlib(ZlibEncoder<Vec<u8>>),
    Zstd,
}

impl WireEncoder {
    fn new(encoding: WireEncoding) -> Self {
        match encoding {
            WireEncoding::Json => Self::Json,
            WireEncoding::ZlibStream => Self::Zlib(ZlibEncoder::new(Vec::new(), Compression::default())),
            WireEncoding::ZstdStream => Self::Zstd,
        }
    }

    /// One server message as transport frames; zlib frames arrive in two pieces
    fn encode(&mut self, message: &Value) -> Vec<TransportEvent> {
        let text = message.to_string().into_bytes();
        match self {
            Self::Json => vec![TransportEvent::Message {
                data: text,
                binary: false,
            }],
            Self::Zlib(encoder) => {
                let frame = encode_zlib_stream(encoder, &text);
                let (head, tail) = frame.split_at(frame.len() / 2);
                vec![
                    TransportEvent::Message {
                        data: head.to_vec(),
                        binary: true,
                    },
                    TransportEvent::Message {
                        data: tail.to_vec(),
                        binary: true,
                    },
                ]
            }
            Self::Zstd => vec![TransportEvent::Message {
                data: encode_zstd(&text),
                binary: true,
            }],
        }
    }
}

/// Server side of one mock connection
pub struct MockConnection {
    pub index: usize,
    pub url: String,
    inbound: mpsc::Sender<TransportEvent>,
    wire: Mutex<WireEncoder>,
    sent: Mutex<Vec<Value>>,
    pings: AtomicUsize,
    close_code: Mutex<Option<u16>>,
    shard: Mutex<Option<u32>>,
}

impl MockConnection {
    /// Deliver a gateway message to the client
    pub async fn push(&self, message: Value) {
        let frames = self.wire.lock().encode(&message);
        for frame in frames {
            let _ = self.inbound.send(frame).await;
        }
    }

    pub async fn push_raw(&self, event: TransportEvent) {
        let _ = self.inbound.send(event).await;
    }

    /// Close from the server side with `code`
    pub async fn close_from_server(&self, code: u16, reason: &str) {
        self.push_raw(TransportEvent::Close {
            code: Some(code),
            reason: reason.to_string(),
        })
        .await;
    }

    /// Every JSON message the client sent on this connection
    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    pub fn sent_ops(&self) -> Vec<u64> {
        self.sent().iter().filter_map(|m| m["op"].as_u64()).collect()
    }

    /// Transport pings the client sent
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Close code the client used, if it closed
    pub fn close_code(&self) -> Option<u16> {
        *self.close_code.lock()
    }

    /// Shard that identified or resumed on this connection
    pub fn shard(&self) -> Option<u32> {
        *self.shard.lock()
    }
}

/// In-memory gateway server
pub struct MockTransport {
    encoding: WireEncoding,
    auto_handshake: bool,
    guilds: GuildSource,
    refuse: AtomicBool,
    attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            encoding: WireEncoding::Json,
            auto_handshake: true,
            guilds: Arc::new(|_, _| Vec::new()),
            refuse: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn with_encoding(mut self, encoding: WireEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Only accept connections; the test drives the protocol itself
    pub fn without_handshake(mut self) -> Self {
        self.auto_handshake = false;
        self
    }

    /// Guild ids listed in READY for `(shard_id, total_shards)`
    pub fn with_guilds(mut self, guilds: impl Fn(u32, u32) -> Vec<u64> + Send + Sync + 'static) -> Self {
        self.guilds = Arc::new(guilds);
        self
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connect calls, refused ones included
    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Most recent connection a shard identified or resumed on
    pub fn latest_for_shard(&self, shard_id: u32) -> Option<Arc<MockConnection>> {
        self.connections
            .lock()
            .iter()
            .rev()
            .find(|connection| connection.shard() == Some(shard_id))
            .cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<TransportConnection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (inbound, events) = mpsc::channel(64);
        let connection = {
            let mut connections = self.connections.lock();
            let connection = Arc::new(MockConnection {
                index: connections.len(),
                url: url.to_string(),
                inbound,
                wire: Mutex::new(WireEncoder::new(self.encoding)),
                sent: Mutex::new(Vec::new()),
                pings: AtomicUsize::new(0),
                close_code: Mutex::new(None),
                shard: Mutex::new(None),
            });
            connections.push(Arc::clone(&connection));
            connection
        };

        if self.auto_handshake {
            connection
                .push(json!({"op": 10, "d": {"heartbeat_interval": HEARTBEAT_INTERVAL_MS}}))
                .await;
        }

        Ok(TransportConnection {
            sink: Box::new(MockSink {
                connection,
                auto_handshake: self.auto_handshake,
                guilds: Arc::clone(&self.guilds),
            }),
            events,
        })
    }
}

struct MockSink {
    connection: Arc<MockConnection>,
    auto_handshake: bool,
    guilds: GuildSource,
}

impl MockSink {
    async fn respond(&self, message: &Value) {
        let data = &message["d"];
        match message["op"].as_u64() {
            Some(1) => self.connection.push(json!({"op": 11})).await,
            Some(2) => {
                let shard_id = data["shard"][0].as_u64().unwrap_or(0) as u32;
                let total = data["shard"][1].as_u64().unwrap_or(1) as u32;
                *self.connection.shard.lock() = Some(shard_id);

                let guilds: Vec<Value> = (self.guilds)(shard_id, total)
                    .into_iter()
                    .map(|id| json!({"id": id.to_string(), "unavailable": true}))
                    .collect();
                self.connection
                    .push(json!({
                        "op": 0,
                        "t": "READY",
                        "s": 1,
                        "d": {
                            "session_id": format!("session-{shard_id}-{}", self.connection.index),
                            "resume_gateway_url": RESUME_URL,
                            "guilds": guilds,
                            "shard": [shard_id, total],
                        }
                    }))
                    .await;
            }
            Some(6) => {
                let shard_id = data["session_id"]
                    .as_str()
                    .and_then(|session| session.split('-').nth(1))
                    .and_then(|shard| shard.parse().ok());
                *self.connection.shard.lock() = shard_id;
                let next = data["seq"].as_u64().unwrap_or(0) + 1;
                self.connection
                    .push(json!({"op": 0, "t": "RESUMED", "s": next, "d": {}}))
                    .await;
            }
            _ => {}
        }
    }
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, frame: OutgoingFrame) -> Result<(), TransportError> {
        if self.connection.close_code().is_some() {
            return Err(TransportError::Closed);
        }
        match frame {
            OutgoingFrame::Text(text) => {
                let Ok(message) = serde_json::from_str::<Value>(&text) else {
                    return Ok(());
                };
                self.connection.sent.lock().push(message.clone());
                if self.auto_handshake {
                    self.respond(&message).await;
                }
            }
            OutgoingFrame::Ping(payload) => {
                self.connection.pings.fetch_add(1, Ordering::SeqCst);
                if self.auto_handshake {
                    self.connection.push_raw(TransportEvent::Pong(payload)).await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), TransportError> {
        *self.connection.close_code.lock() = Some(code);
        Ok(())
    }
}

/// Bootstrap metadata that tests can change between calls
pub struct MockBootstrap {
    info: Mutex<BootstrapInfo>,
    health: Mutex<ProviderHealth>,
    fetches: AtomicUsize,
}

impl MockBootstrap {
    pub fn new(info: BootstrapInfo) -> Self {
        Self {
            info: Mutex::new(info),
            health: Mutex::new(ProviderHealth::Operational),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_info(&self, info: BootstrapInfo) {
        *self.info.lock() = info;
    }

    pub fn set_health(&self, health: ProviderHealth) {
        *self.health.lock() = health;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BootstrapClient for MockBootstrap {
    async fn fetch(&self) -> Result<BootstrapInfo, BootstrapError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.info.lock().clone())
    }

    async fn health(&self) -> Result<ProviderHealth, BootstrapError> {
        Ok(self.health.lock().clone())
    }
}

/// Everything currently buffered on `events`
pub fn drain_events(events: &mut broadcast::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    drained
}

/// Wait until an event matching `predicate` arrives
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<GatewayEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<GatewayEvent>
where
    F: FnMut(&GatewayEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `condition` every 10ms (of test time) until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let spawned tasks run without moving the clock
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
