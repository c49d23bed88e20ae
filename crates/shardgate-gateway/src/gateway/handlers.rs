//! Inbound channel events and gateway op codes

use super::{GatewayInner, RESUMABLE_CLOSE};
use crate::connection::{ChannelError, ChannelEvent, ChannelEventKind};
use crate::error::GatewayError;
use crate::events::{Diagnostic, DispatchKind, GatewayEvent};
use crate::protocol::{
    GatewayMessage, IdentifyPayload, OpCode, ResumePayload, UnavailableGuild,
};
use crate::shard::ConnectMode;
use rand::Rng;
use shardgate_core::Snowflake;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Route channel events to their handlers until the channel closes
pub(super) fn spawn_dispatcher(inner: Arc<GatewayInner>, mut receiver: mpsc::Receiver<ChannelEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            inner.handle_channel_event(event).await;
        }
        tracing::debug!("Channel event dispatcher stopped");
    })
}

impl GatewayInner {
    async fn handle_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        let shard_id = event.shard_id;
        let Some(channel) = self.existing_channel(shard_id) else {
            return;
        };
        if channel.generation() != event.generation {
            tracing::trace!(shard_id, generation = event.generation, "Dropping event from replaced connection");
            return;
        }

        match event.kind {
            ChannelEventKind::Open => {
                tracing::debug!(shard_id, "Connection open, waiting for Hello");
            }
            ChannelEventKind::Payload(bytes) => self.handle_payload(shard_id, &bytes).await,
            ChannelEventKind::Latency(latency) => self.orchestrator.record_latency(shard_id, latency),
            ChannelEventKind::Error(error) => self.handle_channel_error(shard_id, error),
            ChannelEventKind::Closed { code, reason } => self.connection_lost(shard_id, code, reason, true),
        }
    }

    fn handle_channel_error(&self, shard_id: u32, error: ChannelError) {
        let codec = matches!(error, ChannelError::Codec(_));
        let error = GatewayError::channel(shard_id, error);
        let diagnostic = Diagnostic::for_shard(error.code(), shard_id, error.to_string());
        if codec {
            self.events.emit(GatewayEvent::Error(diagnostic));
        } else {
            self.events.emit(GatewayEvent::Warn(diagnostic));
        }
    }

    async fn handle_payload(self: &Arc<Self>, shard_id: u32, bytes: &[u8]) {
        let message = match GatewayMessage::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                let error = GatewayError::Protocol {
                    shard_id,
                    message: format!("undecodable payload: {e}"),
                };
                self.events
                    .emit(GatewayEvent::Warn(Diagnostic::for_shard(error.code(), shard_id, error.to_string())));
                return;
            }
        };

        match message.op {
            OpCode::Hello => self.on_hello(shard_id, &message),
            OpCode::HeartbeatAck => self.on_heartbeat_ack(shard_id),
            OpCode::Heartbeat => self.spawn_heartbeat_now(shard_id),
            OpCode::Dispatch => self.on_dispatch(shard_id, message),
            OpCode::Reconnect => {
                self.close_channel(shard_id, "reconnect requested").await;
                self.connection_lost(shard_id, None, "reconnect requested".to_string(), false);
            }
            OpCode::InvalidSession => {
                let resumable = message.as_invalid_session().unwrap_or(false);
                if !resumable {
                    self.orchestrator.invalidate_session(shard_id);
                }
                self.close_channel(shard_id, "invalid session").await;
                self.connection_lost(shard_id, None, "invalid session".to_string(), false);
            }
            other => {
                tracing::debug!(shard_id, op = %other, "Ignoring unexpected op code");
            }
        }
    }

    /// Start heartbeating and answer with Identify or Resume
    fn on_hello(self: &Arc<Self>, shard_id: u32, message: &GatewayMessage) {
        let Some(hello) = message.as_hello() else {
            self.events.emit(GatewayEvent::Warn(Diagnostic::for_shard(
                "PROTOCOL_ERROR",
                shard_id,
                "Hello without a heartbeat interval",
            )));
            return;
        };
        let interval = Duration::from_millis(hello.heartbeat_interval.max(1));

        let handshake = {
            let Some(mut session) = self.sessions.get_mut(&shard_id) else {
                tracing::debug!(shard_id, "Hello for a shard with no pending session");
                return;
            };
            session.replace_heartbeat(spawn_heartbeat(Arc::downgrade(self), shard_id, interval));
            session.mode.clone().map(|mode| (mode, session.total_shards))
        };
        tracing::debug!(shard_id, interval_ms = hello.heartbeat_interval, "Hello received");

        let Some((mode, total_shards)) = handshake else {
            return;
        };
        let reply = match mode {
            ConnectMode::Identify => GatewayMessage::identify(&IdentifyPayload::new(
                self.config.token.clone(),
                self.config.intents,
                shard_id,
                total_shards,
            )),
            ConnectMode::Resume { session_id, sequence } => GatewayMessage::resume(&ResumePayload {
                token: self.config.token.clone(),
                session_id,
                seq: sequence,
            }),
        };
        match reply {
            Ok(reply) => self.spawn_transmit(shard_id, reply),
            Err(e) => self.fail_handshake(shard_id, GatewayError::Serialization(e)),
        }
    }

    fn on_heartbeat_ack(&self, shard_id: u32) {
        let latency = self
            .sessions
            .get_mut(&shard_id)
            .and_then(|mut session| session.heartbeat_sent_at.take())
            .map(|sent_at| sent_at.elapsed());
        self.orchestrator.record_heartbeat_ack(shard_id, latency);
    }

    fn on_dispatch(&self, shard_id: u32, message: GatewayMessage) {
        if let Some(sequence) = message.s {
            self.orchestrator.record_sequence(shard_id, sequence);
        }
        let event_type = message.t.clone().unwrap_or_default();

        match DispatchKind::from_name(&event_type) {
            DispatchKind::Ready => match message.as_ready() {
                Some(ready) => {
                    let entities = ready.guilds.iter().map(|guild| guild.id);
                    self.orchestrator
                        .mark_ready(shard_id, ready.session_id.clone(), ready.resume_gateway_url.clone(), entities);
                    self.complete_handshake(shard_id);
                }
                None => self.fail_handshake(
                    shard_id,
                    GatewayError::Protocol {
                        shard_id,
                        message: "malformed READY payload".to_string(),
                    },
                ),
            },
            DispatchKind::Resumed => {
                self.orchestrator.mark_resumed(shard_id);
                self.complete_handshake(shard_id);
            }
            DispatchKind::GuildCreate => {
                if let Some(id) = entity_id(message.d.as_ref()) {
                    self.orchestrator.add_entity(id);
                }
            }
            DispatchKind::GuildDelete => {
                let guild = message
                    .d
                    .as_ref()
                    .and_then(|d| serde_json::from_value::<UnavailableGuild>(d.clone()).ok());
                // Unavailable means an outage, not a departure
                if let Some(guild) = guild.filter(|guild| guild.unavailable != Some(true)) {
                    self.orchestrator.remove_entity(guild.id);
                }
            }
            DispatchKind::Other => {}
        }

        self.events.emit(GatewayEvent::Dispatch {
            shard_id,
            event_type,
            sequence: message.s,
            data: message.d.unwrap_or(serde_json::Value::Null),
        });
    }

    fn complete_handshake(&self, shard_id: u32) {
        if let Some(mut session) = self.sessions.get_mut(&shard_id) {
            session.complete(Ok(()));
        }
    }

    fn fail_handshake(&self, shard_id: u32, error: GatewayError) {
        let resolved = self
            .sessions
            .get_mut(&shard_id)
            .is_some_and(|mut session| session.complete(Err(error)));
        if !resolved {
            tracing::debug!(shard_id, "Handshake failure with no pending handshake");
        }
    }

    async fn close_channel(&self, shard_id: u32, reason: &str) {
        if let Some(channel) = self.existing_channel(shard_id) {
            channel.close(RESUMABLE_CLOSE, reason).await;
        }
    }

    /// The connection is gone: stop heartbeating and hand the shard back to
    /// the orchestrator (or to the pending handshake)
    pub(super) fn connection_lost(&self, shard_id: u32, code: Option<u16>, reason: String, failure: bool) {
        let waiter = self.sessions.get_mut(&shard_id).and_then(|mut session| {
            session.stop_heartbeat();
            session.take_handshake()
        });
        if self.orchestrator.is_shutting_down() {
            return;
        }

        let error = GatewayError::Closed {
            shard_id,
            code,
            reason: reason.clone(),
        };
        if let Some(waiter) = waiter {
            // The connect attempt reports this failure itself
            let _ = waiter.send(Err(error));
            return;
        }

        if failure {
            self.breaker.record_failure(&error.to_string(), error.failure_category());
        }
        self.orchestrator.mark_disconnected(shard_id, code, &reason);
    }

    fn spawn_transmit(self: &Arc<Self>, shard_id: u32, message: GatewayMessage) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = inner.transmit(shard_id, &message).await {
                tracing::debug!(shard_id, op = %message.op, error = %error, "Send failed");
            }
        });
    }

    fn spawn_heartbeat_now(self: &Arc<Self>, shard_id: u32) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = inner.send_heartbeat(shard_id).await {
                tracing::debug!(shard_id, error = %error, "Requested heartbeat not sent");
            }
        });
    }

    async fn send_heartbeat(&self, shard_id: u32) -> Result<(), GatewayError> {
        let sequence = self.orchestrator.sequence(shard_id);
        if let Some(mut session) = self.sessions.get_mut(&shard_id) {
            session.heartbeat_sent_at = Some(Instant::now());
        }
        self.transmit(shard_id, &GatewayMessage::heartbeat(sequence)).await
    }

    /// Transport-level ping; the pong reports round-trip latency
    async fn ping_transport(&self, shard_id: u32) {
        let Some(channel) = self.existing_channel(shard_id) else {
            return;
        };
        if let Err(error) = channel.ping().await {
            tracing::debug!(shard_id, error = %error, "Transport ping not sent");
        }
    }
}

/// Heartbeat loop: first beat after a random fraction of the interval,
/// each beat followed by a transport ping
fn spawn_heartbeat(inner: Weak<GatewayInner>, shard_id: u32, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        tokio::time::sleep(interval.mul_f64(jitter)).await;

        loop {
            let Some(gateway) = inner.upgrade() else {
                break;
            };
            if let Err(error) = gateway.send_heartbeat(shard_id).await {
                tracing::debug!(shard_id, error = %error, "Heartbeat not sent, stopping");
                break;
            }
            gateway.ping_transport(shard_id).await;
            drop(gateway);
            tokio::time::sleep(interval).await;
        }
    })
}

fn entity_id(data: Option<&serde_json::Value>) -> Option<Snowflake> {
    data.and_then(|d| d.get("id"))
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}
