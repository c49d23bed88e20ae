//! Gateway facade
//!
//! Composes the orchestrator, one connection channel per shard and the
//! process-wide circuit breaker behind a small public API.

mod connector;
mod handlers;
mod session;

use crate::bootstrap::{BootstrapClient, BootstrapInfo, ProviderHealth};
use crate::circuit::{CircuitBreaker, CircuitStats};
use crate::connection::{ChannelEvent, ConnectionChannel, Transport, NORMAL_CLOSE};
use crate::error::{GatewayError, GatewayResult};
use crate::events::{Diagnostic, EventBus, GatewayEvent};
use crate::protocol::GatewayMessage;
use crate::shard::{Orchestrator, ShardConnector, ShardPlan, ShardRecord, SpawnReport};
use dashmap::DashMap;
use parking_lot::Mutex;
use session::ShardSession;
use shardgate_common::GatewayConfig;
use shardgate_core::{Snowflake, TotalShards};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Channel events buffered between the readers and the dispatcher
const CHANNEL_EVENT_BUFFER: usize = 1024;

/// Close code that keeps the remote session resumable
pub(crate) const RESUMABLE_CLOSE: u16 = 4000;

/// Shared state behind a [`Gateway`]
pub(crate) struct GatewayInner {
    config: GatewayConfig,
    orchestrator: Arc<Orchestrator>,
    breaker: CircuitBreaker,
    transport: Arc<dyn Transport>,
    bootstrap: Arc<dyn BootstrapClient>,
    events: EventBus,
    channels: DashMap<u32, Arc<ConnectionChannel>>,
    sessions: DashMap<u32, ShardSession>,
    channel_events: mpsc::Sender<ChannelEvent>,
}

impl GatewayInner {
    /// Existing channel for `shard_id`, or a new one
    fn channel(&self, shard_id: u32) -> Arc<ConnectionChannel> {
        self.channels
            .entry(shard_id)
            .or_insert_with(|| {
                Arc::new(ConnectionChannel::new(
                    shard_id,
                    self.config.compression,
                    Arc::clone(&self.transport),
                    self.channel_events.clone(),
                ))
            })
            .clone()
    }

    fn existing_channel(&self, shard_id: u32) -> Option<Arc<ConnectionChannel>> {
        self.channels.get(&shard_id).map(|channel| Arc::clone(&channel))
    }

    /// Serialize and send without checking shard readiness
    async fn transmit(&self, shard_id: u32, message: &GatewayMessage) -> GatewayResult<()> {
        let channel = self
            .existing_channel(shard_id)
            .ok_or(GatewayError::ShardNotFound(shard_id))?;
        let text = message.to_json()?;
        channel
            .send_text(text)
            .await
            .map_err(|source| GatewayError::channel(shard_id, source))
    }

    /// Close every channel and forget all handshake state
    async fn teardown(&self, code: u16, reason: &str) {
        self.sessions.clear();
        let channels: Vec<Arc<ConnectionChannel>> =
            self.channels.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.channels.clear();
        for channel in channels {
            channel.close(code, reason).await;
        }
    }
}

#[derive(Default)]
struct GatewayTasks {
    dispatcher: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
    started: bool,
}

/// Sharded gateway client
pub struct Gateway {
    inner: Arc<GatewayInner>,
    receiver: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    tasks: Mutex<GatewayTasks>,
}

impl Gateway {
    /// Build a gateway; nothing connects until [`Gateway::start`]
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        bootstrap: Arc<dyn BootstrapClient>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let events = EventBus::default();
        let breaker = CircuitBreaker::new(config.circuit.clone()).with_events(events.clone());
        let orchestrator = Arc::new(Orchestrator::new(config.sharding.clone(), events.clone()));
        let (sender, receiver) = mpsc::channel(CHANNEL_EVENT_BUFFER);

        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                orchestrator,
                breaker,
                transport,
                bootstrap,
                events,
                channels: DashMap::new(),
                sessions: DashMap::new(),
                channel_events: sender,
            }),
            receiver: Mutex::new(Some(receiver)),
            tasks: Mutex::new(GatewayTasks::default()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Register entities known ahead of READY (they count towards sizing)
    pub fn seed_entities(&self, entities: impl IntoIterator<Item = Snowflake>) {
        self.inner.orchestrator.seed_entities(entities);
    }

    /// Fetch bootstrap metadata and start every local shard
    pub async fn start(&self) -> GatewayResult<SpawnReport> {
        let info = self.inner.bootstrap.fetch().await?;
        self.start_with(info).await
    }

    /// Start every local shard using already-fetched bootstrap metadata.
    ///
    /// Configuration and sizing errors are returned before any connection
    /// is opened.
    pub async fn start_with(&self, info: BootstrapInfo) -> GatewayResult<SpawnReport> {
        if self.inner.orchestrator.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }
        {
            let mut tasks = self.tasks.lock();
            if tasks.started {
                return Err(GatewayError::AlreadyStarted);
            }
            tasks.started = true;
        }

        let result = self.launch(info).await;
        if result.is_err() {
            self.tasks.lock().started = false;
        }
        result
    }

    async fn launch(&self, info: BootstrapInfo) -> GatewayResult<SpawnReport> {
        let orchestrator = &self.inner.orchestrator;
        let plan = orchestrator.plan(self.inner.config.sharding.total_shards, &info)?;
        let info = orchestrator
            .await_session_budget(self.inner.bootstrap.as_ref(), info, plan.shard_count())
            .await?;
        let plan = plan.with_session_starts(info.session_start_limit.remaining);

        self.ensure_dispatcher();
        orchestrator.apply_plan(plan);

        let connector: Arc<dyn ShardConnector> = self.inner.clone();
        let report = orchestrator.spawn(Arc::clone(&connector)).await?;

        let supervisor = orchestrator.supervise(connector);
        if let Some(previous) = self.tasks.lock().supervisor.replace(supervisor) {
            previous.abort();
        }
        Ok(report)
    }

    fn ensure_dispatcher(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let handle = handlers::spawn_dispatcher(Arc::clone(&self.inner), receiver);
        self.tasks.lock().dispatcher = Some(handle);
    }

    /// Send to one shard; the shard must be ready
    pub async fn send(&self, shard_id: u32, message: &GatewayMessage) -> GatewayResult<()> {
        let record = self
            .inner
            .orchestrator
            .shard(shard_id)
            .ok_or(GatewayError::ShardNotFound(shard_id))?;
        if !record.is_ready() {
            return Err(GatewayError::ShardNotReady(shard_id));
        }
        self.inner.transmit(shard_id, message).await
    }

    /// Send on the shard owning `entity`; `None` routes to shard 0
    pub async fn send_to_entity(&self, entity: Option<Snowflake>, message: &GatewayMessage) -> GatewayResult<u32> {
        let shard_id = self.inner.orchestrator.shard_for(entity);
        self.send(shard_id, message).await?;
        Ok(shard_id)
    }

    /// Send to every ready shard; returns how many accepted the message
    pub async fn broadcast(&self, message: &GatewayMessage) -> usize {
        let mut delivered = 0;
        for shard_id in self.inner.orchestrator.ready_shards() {
            match self.inner.transmit(shard_id, message).await {
                Ok(()) => delivered += 1,
                Err(error) => self.inner.events.emit(GatewayEvent::Warn(Diagnostic::for_shard(
                    error.code(),
                    shard_id,
                    format!("broadcast not delivered: {error}"),
                ))),
            }
        }
        delivered
    }

    /// Re-plan with a new shard count, carrying entity membership over.
    ///
    /// Provider health is checked first; a degraded provider or an invalid plan
    /// aborts before any shard is touched.
    pub async fn rescale(&self, requested: TotalShards) -> GatewayResult<SpawnReport> {
        if !self.tasks.lock().started {
            return Err(GatewayError::NotStarted);
        }
        let orchestrator = &self.inner.orchestrator;
        if orchestrator.is_shutting_down() {
            return Err(GatewayError::ShuttingDown);
        }

        if let ProviderHealth::Degraded(reason) = self.inner.bootstrap.health().await? {
            self.inner.events.emit(GatewayEvent::Warn(Diagnostic::new(
                "RESCALE_ABORTED",
                format!("provider degraded: {reason}"),
            )));
            return Err(GatewayError::ProviderDegraded(reason));
        }

        let info = self.inner.bootstrap.fetch().await?;
        let plan = orchestrator.plan(requested, &info)?;
        let info = orchestrator
            .await_session_budget(self.inner.bootstrap.as_ref(), info, plan.shard_count())
            .await?;
        let plan = plan.with_session_starts(info.session_start_limit.remaining);

        tracing::info!(
            from = orchestrator.total_shards(),
            to = plan.total_shards,
            "Rescaling shards"
        );
        orchestrator.abort_launches();
        self.inner.teardown(NORMAL_CLOSE, "rescaling").await;
        orchestrator.apply_plan(plan);

        let connector: Arc<dyn ShardConnector> = self.inner.clone();
        orchestrator.spawn(connector).await
    }

    /// Stop every shard and background task
    pub async fn shutdown(&self) {
        self.inner.orchestrator.shutdown();
        let (dispatcher, supervisor) = {
            let mut tasks = self.tasks.lock();
            (tasks.dispatcher.take(), tasks.supervisor.take())
        };
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }

        self.inner.teardown(NORMAL_CLOSE, "shutting down").await;

        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        self.inner
            .events
            .emit(GatewayEvent::Debug(Diagnostic::new("GATEWAY_SHUTDOWN", "all shards stopped")));
    }

    #[must_use]
    pub fn shard_snapshots(&self) -> Vec<ShardRecord> {
        self.inner.orchestrator.shard_snapshots()
    }

    #[must_use]
    pub fn plan(&self) -> Option<ShardPlan> {
        self.inner.orchestrator.plan_snapshot()
    }

    #[must_use]
    pub fn circuit_stats(&self) -> CircuitStats {
        self.inner.breaker.stats()
    }

    /// Number of shards this process runs
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.inner.orchestrator.local_shards().len()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        for handle in [tasks.dispatcher.take(), tasks.supervisor.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("orchestrator", &self.inner.orchestrator)
            .field("channels", &self.inner.channels.len())
            .finish_non_exhaustive()
    }
}
