//! Connection channel
//!
//! Owns one shard's transport connection and the decompressor bound to it.
//! Decoded payloads and lifecycle changes are reported as [`ChannelEvent`]s
//! tagged with a connection generation, so events from a torn-down
//! connection can be told apart from the current one.

use super::transport::{OutgoingFrame, Transport, TransportEvent, TransportSink};
use crate::compression::{CodecError, Decompressor, StreamDecompressor};
use serde::Serialize;
use shardgate_common::CompressionMode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Normal closure; the remote session is discarded
pub const NORMAL_CLOSE: u16 = 1000;

/// Sent when a frame cannot be decompressed
const CODEC_FAILURE_CLOSE: u16 = 1007;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Channel is not open (state: {0:?})")]
    NotOpen(ChannelState),

    #[error("Send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// What happened on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    Open,
    /// One complete decompressed message
    Payload(Vec<u8>),
    /// Round trip of a transport-level ping
    Latency(Duration),
    Closed { code: Option<u16>, reason: String },
    Error(ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub shard_id: u32,
    pub generation: u64,
    pub kind: ChannelEventKind,
}

/// Transfer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub generation: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

struct ChannelShared {
    state: RwLock<ChannelState>,
    sink: Mutex<Option<Box<dyn TransportSink>>>,
    last_error: RwLock<Option<String>>,
    generation: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    ping_sent_at: parking_lot::Mutex<Option<Instant>>,
}

/// A shard's connection
pub struct ConnectionChannel {
    shard_id: u32,
    compression: CompressionMode,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<ChannelEvent>,
    shared: Arc<ChannelShared>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionChannel {
    pub fn new(
        shard_id: u32,
        compression: CompressionMode,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            shard_id,
            compression,
            transport,
            events,
            shared: Arc::new(ChannelShared {
                state: RwLock::new(ChannelState::Idle),
                sink: Mutex::new(None),
                last_error: RwLock::new(None),
                generation: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                ping_sent_at: parking_lot::Mutex::new(None),
            }),
            reader: parking_lot::Mutex::new(None),
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub async fn state(&self) -> ChannelState {
        *self.shared.state.read().await
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == ChannelState::Open
    }

    /// Generation of the current (or most recent) connection
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().await.clone()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            generation: self.generation(),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
        }
    }

    /// Open a connection with a fresh decompression context.
    ///
    /// A live connection is torn down first. Failures are returned and also
    /// reported as an error event.
    pub async fn connect(&self, url: &str) -> Result<(), ChannelError> {
        if matches!(
            self.state().await,
            ChannelState::Connecting | ChannelState::Open | ChannelState::Closing
        ) {
            self.destroy().await;
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.state.write().await = ChannelState::Connecting;
        *self.shared.last_error.write().await = None;

        let decompressor = match Decompressor::new(self.compression) {
            Ok(decompressor) => decompressor,
            Err(e) => return Err(self.fail(generation, ChannelError::Codec(e)).await),
        };

        let connection = match self.transport.connect(url).await {
            Ok(connection) => connection,
            Err(e) => {
                return Err(self
                    .fail(generation, ChannelError::Connect(e.to_string()))
                    .await)
            }
        };

        *self.shared.sink.lock().await = Some(connection.sink);
        *self.shared.state.write().await = ChannelState::Open;
        tracing::debug!(shard_id = self.shard_id, generation, "Channel open");
        emit(&self.events, self.shard_id, generation, ChannelEventKind::Open).await;

        let reader = ReadLoop {
            shard_id: self.shard_id,
            generation,
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
        };
        let handle = tokio::spawn(reader.run(decompressor, connection.events));
        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Send a frame; rejected unless the channel is open
    pub async fn send(&self, frame: OutgoingFrame) -> Result<(), ChannelError> {
        let generation = self.generation();
        let state = self.state().await;
        if state != ChannelState::Open {
            let error = ChannelError::NotOpen(state);
            emit(&self.events, self.shard_id, generation, ChannelEventKind::Error(error.clone())).await;
            return Err(error);
        }

        let len = frame.len() as u64;
        let result = {
            let mut sink = self.shared.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink
                    .send(frame)
                    .await
                    .map_err(|e| ChannelError::Send(e.to_string())),
                None => Err(ChannelError::NotOpen(ChannelState::Closed)),
            }
        };

        match result {
            Ok(()) => {
                self.shared.bytes_sent.fetch_add(len, Ordering::Relaxed);
                self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(error) => {
                *self.shared.last_error.write().await = Some(error.to_string());
                emit(&self.events, self.shard_id, generation, ChannelEventKind::Error(error.clone())).await;
                Err(error)
            }
        }
    }

    pub async fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.send(OutgoingFrame::Text(text)).await
    }

    /// Transport-level ping; the matching pong produces a latency event
    pub async fn ping(&self) -> Result<(), ChannelError> {
        *self.shared.ping_sent_at.lock() = Some(Instant::now());
        self.send(OutgoingFrame::Ping(Vec::new())).await
    }

    /// Close with a normal closure code and release everything
    pub async fn destroy(&self) {
        self.close(NORMAL_CLOSE, "channel destroyed").await;
    }

    /// Close with `code` and release everything.
    ///
    /// No close event is emitted; the caller initiated it. Safe to call on a
    /// channel that is already closed.
    pub async fn close(&self, code: u16, reason: &str) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        let sink = self.shared.sink.lock().await.take();
        {
            let mut state = self.shared.state.write().await;
            if sink.is_none() && matches!(*state, ChannelState::Idle | ChannelState::Closed) {
                return;
            }
            *state = ChannelState::Closing;
        }

        if let Some(mut sink) = sink {
            if let Err(e) = sink.close(code, reason).await {
                tracing::debug!(shard_id = self.shard_id, error = %e, "Close frame not delivered");
            }
        }

        *self.shared.ping_sent_at.lock() = None;
        *self.shared.state.write().await = ChannelState::Closed;
        tracing::debug!(shard_id = self.shard_id, code, reason, "Channel closed");
    }

    async fn fail(&self, generation: u64, error: ChannelError) -> ChannelError {
        *self.shared.state.write().await = ChannelState::Closed;
        *self.shared.last_error.write().await = Some(error.to_string());
        emit(&self.events, self.shard_id, generation, ChannelEventKind::Error(error.clone())).await;
        error
    }
}

impl Drop for ConnectionChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

async fn emit(events: &mpsc::Sender<ChannelEvent>, shard_id: u32, generation: u64, kind: ChannelEventKind) {
    let _ = events
        .send(ChannelEvent {
            shard_id,
            generation,
            kind,
        })
        .await;
}

/// Reader task for one connection generation.
///
/// The decompressor is a local of `run`: decoders are `Send` but not `Sync`.
struct ReadLoop {
    shard_id: u32,
    generation: u64,
    shared: Arc<ChannelShared>,
    events: mpsc::Sender<ChannelEvent>,
}

impl ReadLoop {
    async fn run(self, mut decompressor: Decompressor, mut inbound: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Message { data, .. } => {
                    self.shared
                        .bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    self.shared.frames_received.fetch_add(1, Ordering::Relaxed);

                    let decoded = decompressor.push(&data);
                    match decoded {
                        Ok(Some(payload)) => self.emit(ChannelEventKind::Payload(payload)).await,
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(shard_id = self.shard_id, error = %e, "Decompression failed");
                            *self.shared.last_error.write().await = Some(e.to_string());
                            self.emit(ChannelEventKind::Error(ChannelError::Codec(e))).await;
                            if let Some(sink) = self.shared.sink.lock().await.as_mut() {
                                let _ = sink.close(CODEC_FAILURE_CLOSE, "decompression failure").await;
                            }
                            self.finish(Some(CODEC_FAILURE_CLOSE), "decompression failure".to_string())
                                .await;
                            return;
                        }
                    }
                }
                TransportEvent::Ping(payload) => {
                    if let Some(sink) = self.shared.sink.lock().await.as_mut() {
                        if let Err(e) = sink.send(OutgoingFrame::Pong(payload)).await {
                            tracing::debug!(shard_id = self.shard_id, error = %e, "Pong not delivered");
                        }
                    }
                }
                TransportEvent::Pong(_) => {
                    let sent_at = self.shared.ping_sent_at.lock().take();
                    if let Some(sent_at) = sent_at {
                        self.emit(ChannelEventKind::Latency(sent_at.elapsed())).await;
                    }
                }
                TransportEvent::Close { code, reason } => {
                    self.finish(code, reason).await;
                    return;
                }
                TransportEvent::Error(message) => {
                    *self.shared.last_error.write().await = Some(message.clone());
                    self.emit(ChannelEventKind::Error(ChannelError::Transport(message)))
                        .await;
                }
            }
        }

        self.finish(None, "transport stream ended".to_string()).await;
    }

    async fn finish(&self, code: Option<u16>, reason: String) {
        {
            let mut state = self.shared.state.write().await;
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        self.shared.sink.lock().await.take();
        tracing::debug!(shard_id = self.shard_id, ?code, reason = %reason, "Channel closed by peer");
        self.emit(ChannelEventKind::Closed { code, reason }).await;
    }

    async fn emit(&self, kind: ChannelEventKind) {
        emit(&self.events, self.shard_id, self.generation, kind).await;
    }
}
