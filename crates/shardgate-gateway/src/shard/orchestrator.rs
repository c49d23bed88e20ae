//! Shard orchestrator
//!
//! Owns the shard table, entity membership and identify budget. Every
//! mutation goes through a method that takes the state lock; no lock is
//! held across an await.

use super::plan::{ShardPlan, SpawnReport};
use super::rate_limit::{identify_shares, RateLimitWindow};
use super::reconnect::{backoff_delay, ReconnectDecision};
use super::record::{ShardRecord, ShardStatus};
use super::{ConnectMode, ShardConnector};
use crate::bootstrap::{BootstrapClient, BootstrapInfo};
use crate::error::GatewayError;
use crate::events::{Diagnostic, EventBus, GatewayEvent};
use crate::protocol::CloseCode;
use parking_lot::Mutex;
use shardgate_common::ShardingConfig;
use shardgate_core::{shard_for_entity, shard_for_route, ShardingError, Snowflake, TotalShards};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

/// Missed heartbeat sweeps before a shard is forcibly reconnected
pub const HEARTBEAT_FAILURE_LIMIT: u32 = 3;

#[derive(Debug, Default)]
struct OrchestratorState {
    plan: Option<ShardPlan>,
    shards: BTreeMap<u32, ShardRecord>,
    /// Known entities owned by no local shard
    unassigned: HashSet<Snowflake>,
    bucket_starts: Vec<(u32, Instant)>,
}

impl OrchestratorState {
    fn total_shards(&self) -> u32 {
        self.plan.as_ref().map_or(1, |plan| plan.total_shards)
    }

    fn all_entities(&self) -> HashSet<Snowflake> {
        let mut entities = self.unassigned.clone();
        for record in self.shards.values() {
            entities.extend(record.entities.iter().copied());
        }
        entities
    }

    fn forget_entity(&mut self, entity: Snowflake) -> bool {
        let mut removed = self.unassigned.remove(&entity);
        for record in self.shards.values_mut() {
            removed |= record.entities.remove(&entity);
        }
        removed
    }

    /// Place an entity on its owning shard; returns that shard's id
    fn assign_entity(&mut self, entity: Snowflake) -> u32 {
        self.forget_entity(entity);
        let owner = shard_for_entity(entity, self.total_shards());
        match self.shards.get_mut(&owner) {
            Some(record) if self.plan.is_some() => {
                record.entities.insert(entity);
            }
            _ => {
                self.unassigned.insert(entity);
            }
        }
        owner
    }
}

/// Plans, starts, supervises and reconnects shards
pub struct Orchestrator {
    config: ShardingConfig,
    events: EventBus,
    state: Mutex<OrchestratorState>,
    launches: Mutex<JoinSet<()>>,
    /// Bumped whenever the plan is replaced or torn down
    epoch: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: ShardingConfig, events: EventBus) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            events,
            state: Mutex::new(OrchestratorState::default()),
            launches: Mutex::new(JoinSet::new()),
            epoch: AtomicU64::new(0),
            shutdown,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn publish(&self, events: Vec<GatewayEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // =========================================================================
    // Planning and membership
    // =========================================================================

    /// Register entities known before (or independently of) READY
    pub fn seed_entities(&self, entities: impl IntoIterator<Item = Snowflake>) {
        let mut state = self.state.lock();
        for entity in entities {
            state.assign_entity(entity);
        }
    }

    #[must_use]
    pub fn known_entity_count(&self) -> u64 {
        self.state.lock().all_entities().len() as u64
    }

    /// Size a plan from the current entity count
    pub fn plan(&self, requested: TotalShards, info: &BootstrapInfo) -> Result<ShardPlan, ShardingError> {
        ShardPlan::build(&self.config, requested, self.known_entity_count(), info)
    }

    /// Replace the shard table with `plan`, carrying every known entity over.
    ///
    /// Membership is snapshotted and redistributed under one lock, so
    /// concurrent add/remove calls land either before or after the move.
    /// Identifies already spent in the current window stay spent: the
    /// unspent remainder and the latest reset time of the outgoing table
    /// are redistributed, further capped by the provider's session-start
    /// count.
    pub fn apply_plan(&self, plan: ShardPlan) {
        let now = Instant::now();
        let window = self.config.identify_window();
        let limit = self.config.identify_limit;
        let capacities = identify_shares(limit, plan.shard_ids.len());
        let total_shards = plan.total_shards;
        let shard_count = plan.shard_ids.len();

        let entity_count = {
            let mut state = self.state.lock();
            self.epoch.fetch_add(1, Ordering::SeqCst);

            let (unspent, window_reset_time) =
                carried_budget(&mut state.shards, now, window).unwrap_or((limit, now + window));
            let available = unspent.min(limit).min(plan.session_starts_remaining);
            let remaining = identify_shares(available, plan.shard_ids.len());

            let entities = state.all_entities();
            let mut shards = BTreeMap::new();
            for ((&shard_id, &capacity), &left) in plan.shard_ids.iter().zip(&capacities).zip(&remaining) {
                let bucket_id = shard_id % plan.max_concurrency.max(1);
                let budget = RateLimitWindow::with_remaining(capacity, left, window_reset_time);
                shards.insert(shard_id, ShardRecord::new(shard_id, total_shards, bucket_id, budget));
            }

            state.shards = shards;
            state.unassigned.clear();
            state.bucket_starts.clear();
            state.plan = Some(plan);
            for &entity in &entities {
                state.assign_entity(entity);
            }
            entities.len()
        };

        self.events.emit(GatewayEvent::Debug(Diagnostic::new(
            "PLAN_APPLIED",
            format!("{shard_count} local shards of {total_shards}, {entity_count} entities redistributed"),
        )));
    }

    /// Record a new entity (e.g. GUILD_CREATE); returns its shard
    pub fn add_entity(&self, entity: Snowflake) -> u32 {
        self.state.lock().assign_entity(entity)
    }

    /// Forget an entity (e.g. GUILD_DELETE)
    pub fn remove_entity(&self, entity: Snowflake) -> bool {
        self.state.lock().forget_entity(entity)
    }

    /// Shard responsible for traffic about `entity`; `None` is direct-message traffic
    #[must_use]
    pub fn shard_for(&self, entity: Option<Snowflake>) -> u32 {
        shard_for_route(entity, self.total_shards())
    }

    // =========================================================================
    // Start-up
    // =========================================================================

    /// Start every shard of the applied plan, bucket by bucket.
    ///
    /// Shards in a bucket are initiated back to back; the next bucket waits
    /// `spawn_delay` after the previous one began. Individual shard failures
    /// are reported as events and scheduled for reconnection.
    pub async fn spawn(self: &Arc<Self>, connector: Arc<dyn ShardConnector>) -> Result<SpawnReport, GatewayError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(GatewayError::ShuttingDown);
        }

        let (epoch, buckets) = {
            let state = self.state.lock();
            let plan = state.plan.as_ref().ok_or(GatewayError::NotStarted)?;
            (self.current_epoch(), plan.buckets.clone())
        };

        let mut report = SpawnReport::default();
        let last = buckets.len().saturating_sub(1);

        for (index, (bucket, shard_ids)) in buckets.into_iter().enumerate() {
            if self.current_epoch() != epoch {
                report.superseded = true;
                break;
            }

            let started = Instant::now();
            self.state.lock().bucket_starts.push((bucket, started));
            report.bucket_starts.push((bucket, started));
            tracing::info!(bucket, shards = ?shard_ids, "Starting bucket");

            for shard_id in shard_ids {
                if self.launch(&connector, shard_id, epoch).await? {
                    report.launched.push(shard_id);
                }
            }

            if index < last {
                tokio::select! {
                    () = tokio::time::sleep(self.config.spawn_delay()) => {}
                    _ = shutdown.changed() => return Err(GatewayError::ShuttingDown),
                }
            }
        }

        Ok(report)
    }

    /// Begin one shard's connection attempt.
    ///
    /// Returns `Ok(false)` when the attempt was deferred or the shard is
    /// already connecting.
    async fn launch(
        self: &Arc<Self>,
        connector: &Arc<dyn ShardConnector>,
        shard_id: u32,
        epoch: u64,
    ) -> Result<bool, GatewayError> {
        if let Err(error) = connector.permit(shard_id) {
            self.handle_start_failure(shard_id, &error);
            return Ok(false);
        }

        let Some((mode, total_shards)) = self.connect_mode(shard_id) else {
            return Ok(false);
        };
        if !mode.is_resume() {
            self.acquire_identify(shard_id).await?;
        }
        if self.current_epoch() != epoch {
            return Ok(false);
        }
        self.begin_connect(shard_id, &mode);

        let this = Arc::clone(self);
        let connector = Arc::clone(connector);
        let handoff = self.config.handoff_timeout();
        let mut launches = self.launches.lock();
        launches.spawn(async move {
            let outcome = match tokio::time::timeout(handoff, connector.connect_shard(shard_id, total_shards, mode)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::SpawnTimeout {
                    shard_id,
                    timeout_ms: duration_ms(handoff),
                }),
            };

            if let Err(error) = outcome {
                if this.current_epoch() != epoch {
                    return;
                }
                connector.connect_failed(shard_id, &error).await;
                this.handle_start_failure(shard_id, &error);
            }
        });
        while launches.try_join_next().is_some() {}

        Ok(true)
    }

    /// Decide between Identify and Resume; `None` if the shard is unknown or busy
    fn connect_mode(&self, shard_id: u32) -> Option<(ConnectMode, u32)> {
        let mut state = self.state.lock();
        let record = state.shards.get_mut(&shard_id)?;
        if record.status != ShardStatus::Disconnected || record.reconnect.exhausted {
            return None;
        }
        record.reconnect.next_attempt_at = None;

        let mode = match &record.session_id {
            Some(session_id) => ConnectMode::Resume {
                session_id: session_id.clone(),
                sequence: record.sequence,
            },
            None => ConnectMode::Identify,
        };
        Some((mode, record.total_shards))
    }

    fn begin_connect(&self, shard_id: u32, mode: &ConnectMode) {
        {
            let mut state = self.state.lock();
            let Some(record) = state.shards.get_mut(&shard_id) else {
                return;
            };
            record.set_status(if mode.is_resume() {
                ShardStatus::Resuming
            } else {
                ShardStatus::Connecting
            });
            record.connect_started_at = Some(Instant::now());
            record.health.consecutive_failed_heartbeats = 0;
        }

        let path = if mode.is_resume() {
            "resuming previous session"
        } else {
            "identifying with a new session"
        };
        self.publish(vec![
            GatewayEvent::ShardSpawn { shard_id },
            GatewayEvent::Debug(Diagnostic::for_shard("CONNECT_PATH", shard_id, path)),
        ]);
    }

    /// Take one identify from the budget, waiting for a window reset if none is left.
    ///
    /// The shard's own window is preferred; any other local window with
    /// budget left is used next.
    async fn acquire_identify(&self, shard_id: u32) -> Result<(), GatewayError> {
        let mut shutdown = self.shutdown.subscribe();
        let window = self.config.identify_window();

        loop {
            if *shutdown.borrow_and_update() {
                return Err(GatewayError::ShuttingDown);
            }

            let wake_at = {
                let mut state = self.state.lock();
                let now = Instant::now();
                for record in state.shards.values_mut() {
                    record.rate_limit.refill_if_expired(now, window);
                }

                if state
                    .shards
                    .get_mut(&shard_id)
                    .is_some_and(|record| record.rate_limit.try_take())
                {
                    return Ok(());
                }
                if state.shards.values_mut().any(|record| record.rate_limit.try_take()) {
                    return Ok(());
                }

                state
                    .shards
                    .values()
                    .filter(|record| record.rate_limit.capacity > 0)
                    .map(|record| record.rate_limit.window_reset_time)
                    .min()
            };

            let Some(wake_at) = wake_at else {
                return Err(GatewayError::SessionLimitExceeded {
                    required: 1,
                    remaining: 0,
                    reset_after_ms: 0,
                });
            };

            let wait = wake_at.saturating_duration_since(Instant::now());
            self.events.emit(GatewayEvent::Debug(Diagnostic::for_shard(
                "IDENTIFY_BUDGET_WAIT",
                shard_id,
                format!("identify budget exhausted, waiting {}ms", duration_ms(wait)),
            )));

            tokio::select! {
                () = tokio::time::sleep_until(wake_at) => {}
                _ = shutdown.changed() => return Err(GatewayError::ShuttingDown),
            }
        }
    }

    /// Wait for the provider's session-start budget to cover `required` starts.
    ///
    /// Waits one reset period and re-fetches; fails if still short.
    pub async fn await_session_budget(
        &self,
        bootstrap: &dyn BootstrapClient,
        info: BootstrapInfo,
        required: u32,
    ) -> Result<BootstrapInfo, GatewayError> {
        let limit = info.session_start_limit;
        if limit.remaining >= required {
            return Ok(info);
        }

        self.events.emit(GatewayEvent::Warn(Diagnostic::new(
            "SESSION_LIMIT_WAIT",
            format!(
                "{required} session starts needed, {} remaining; waiting {}ms",
                limit.remaining, limit.reset_after_ms
            ),
        )));

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            () = tokio::time::sleep(limit.reset_after()) => {}
            _ = shutdown.changed() => return Err(GatewayError::ShuttingDown),
        }

        let refreshed = bootstrap.fetch().await?;
        let limit = refreshed.session_start_limit;
        if limit.remaining >= required {
            Ok(refreshed)
        } else {
            Err(GatewayError::SessionLimitExceeded {
                required,
                remaining: limit.remaining,
                reset_after_ms: limit.reset_after_ms,
            })
        }
    }

    fn handle_start_failure(&self, shard_id: u32, error: &GatewayError) {
        match error {
            GatewayError::ShuttingDown => {}
            GatewayError::CircuitOpen { remaining_ms, .. } => {
                let retry_in = Duration::from_millis(*remaining_ms).max(self.config.reconnect_tick());
                {
                    let mut state = self.state.lock();
                    if let Some(record) = state.shards.get_mut(&shard_id) {
                        record.set_status(ShardStatus::Disconnected);
                        record.reconnect.next_attempt_at = Some(Instant::now() + retry_in);
                    }
                }
                self.events.emit(GatewayEvent::Warn(Diagnostic::for_shard(
                    error.code(),
                    shard_id,
                    format!("{error}; retrying in {}ms", duration_ms(retry_in)),
                )));
            }
            _ => {
                self.events
                    .emit(GatewayEvent::Error(Diagnostic::for_shard(error.code(), shard_id, error.to_string())));
                let (code, reason) = match error {
                    GatewayError::Closed { code, reason, .. } => (*code, reason.clone()),
                    other => (None, other.to_string()),
                };
                self.mark_disconnected(shard_id, code, &reason);
            }
        }
    }

    // =========================================================================
    // Session progress
    // =========================================================================

    /// READY received: the shard owns a session and the entities it listed
    pub fn mark_ready(
        &self,
        shard_id: u32,
        session_id: String,
        resume_url: Option<String>,
        entities: impl IntoIterator<Item = Snowflake>,
    ) -> bool {
        let event = {
            let mut state = self.state.lock();
            let Some(record) = state.shards.get_mut(&shard_id) else {
                return false;
            };
            let now = Instant::now();
            record.set_status(ShardStatus::Ready);
            record.session_id = Some(session_id.clone());
            record.resume_url = resume_url;
            record.connect_started_at = None;
            record.reconnect.reset();
            record.health.last_heartbeat_ack = Some(now);
            record.health.consecutive_failed_heartbeats = 0;
            let total_shards = record.total_shards;

            for entity in entities {
                state.assign_entity(entity);
            }
            let entity_count = state.shards.get(&shard_id).map_or(0, ShardRecord::entity_count);

            GatewayEvent::ShardReady {
                shard_id,
                total_shards,
                session_id,
                entity_count,
            }
        };
        self.events.emit(event);
        true
    }

    /// RESUMED received
    pub fn mark_resumed(&self, shard_id: u32) -> bool {
        let session_id = {
            let mut state = self.state.lock();
            let Some(record) = state.shards.get_mut(&shard_id) else {
                return false;
            };
            record.set_status(ShardStatus::Ready);
            record.connect_started_at = None;
            record.reconnect.reset();
            record.health.last_heartbeat_ack = Some(Instant::now());
            record.health.consecutive_failed_heartbeats = 0;
            record.session_id.clone().unwrap_or_default()
        };
        self.events.emit(GatewayEvent::ShardResume { shard_id, session_id });
        true
    }

    pub fn record_sequence(&self, shard_id: u32, sequence: u64) {
        if let Some(record) = self.state.lock().shards.get_mut(&shard_id) {
            record.sequence = Some(sequence);
        }
    }

    #[must_use]
    pub fn sequence(&self, shard_id: u32) -> Option<u64> {
        self.state.lock().shards.get(&shard_id).and_then(|record| record.sequence)
    }

    /// Heartbeat acknowledged, optionally with the measured round trip
    pub fn record_heartbeat_ack(&self, shard_id: u32, latency: Option<Duration>) {
        {
            let mut state = self.state.lock();
            let Some(record) = state.shards.get_mut(&shard_id) else {
                return;
            };
            record.health.last_heartbeat_ack = Some(Instant::now());
            record.health.consecutive_failed_heartbeats = 0;
        }
        if let Some(latency) = latency {
            self.record_latency(shard_id, latency);
        }
    }

    /// Round trip of a heartbeat or a transport ping
    pub fn record_latency(&self, shard_id: u32, latency: Duration) {
        {
            let mut state = self.state.lock();
            let Some(record) = state.shards.get_mut(&shard_id) else {
                return;
            };
            record.health.latency = Some(latency);
        }
        self.events.emit(GatewayEvent::ShardLatency {
            shard_id,
            latency_ms: duration_ms(latency),
        });
    }

    /// Drop the saved session so the next attempt identifies
    pub fn invalidate_session(&self, shard_id: u32) {
        if let Some(record) = self.state.lock().shards.get_mut(&shard_id) {
            record.clear_session();
        }
        self.events.emit(GatewayEvent::Debug(Diagnostic::for_shard(
            "SESSION_INVALIDATED",
            shard_id,
            "session discarded, next attempt will identify",
        )));
    }

    // =========================================================================
    // Disconnects and reconnection
    // =========================================================================

    /// Record that a shard's connection went away and decide what happens next
    pub fn mark_disconnected(&self, shard_id: u32, code: Option<u16>, reason: &str) -> ReconnectDecision {
        let mut events = Vec::new();
        let decision = {
            let mut state = self.state.lock();
            let Some(record) = state.shards.get_mut(&shard_id) else {
                return ReconnectDecision::Unknown;
            };
            record.set_status(ShardStatus::Disconnected);
            record.connect_started_at = None;

            let close = code.and_then(CloseCode::from_u16);
            if close.is_some_and(CloseCode::invalidates_session) && record.session_id.is_some() {
                record.clear_session();
                events.push(GatewayEvent::Debug(Diagnostic::for_shard(
                    "SESSION_INVALIDATED",
                    shard_id,
                    format!("close code {} invalidated the session", code.unwrap_or_default()),
                )));
            }

            if let Some(fatal) = close.filter(|close| !close.should_reconnect()) {
                record.reconnect.exhausted = true;
                record.reconnect.next_attempt_at = None;
                ReconnectDecision::Fatal { code: fatal.as_u16() }
            } else if !self.config.auto_reconnect {
                ReconnectDecision::Disabled
            } else if record.reconnect.exhausted {
                ReconnectDecision::Exhausted {
                    attempts: record.reconnect.attempts,
                }
            } else if record.reconnect.next_attempt_at.is_some() {
                ReconnectDecision::AlreadyPending
            } else if record.reconnect.attempts >= self.config.max_reconnect_attempts {
                record.reconnect.exhausted = true;
                ReconnectDecision::Exhausted {
                    attempts: record.reconnect.attempts,
                }
            } else {
                record.reconnect.attempts += 1;
                let attempt = record.reconnect.attempts;
                let delay = backoff_delay(
                    attempt,
                    Duration::from_millis(self.config.reconnect_base_delay_ms),
                    Duration::from_millis(self.config.reconnect_max_delay_ms),
                );
                record.reconnect.next_attempt_at = Some(Instant::now() + delay);
                ReconnectDecision::Scheduled {
                    attempt,
                    delay,
                    resume: record.session_id.is_some(),
                }
            }
        };

        events.insert(
            0,
            GatewayEvent::ShardDisconnect {
                shard_id,
                close_code: code,
                reason: reason.to_string(),
                will_reconnect: decision.will_reconnect(),
            },
        );

        match &decision {
            ReconnectDecision::Scheduled { attempt, delay, resume } => {
                let path = if *resume { "resume" } else { "identify" };
                events.push(GatewayEvent::Debug(Diagnostic::for_shard(
                    "RECONNECT_SCHEDULED",
                    shard_id,
                    format!("attempt {attempt} ({path}) in {}ms", duration_ms(*delay)),
                )));
            }
            ReconnectDecision::Fatal { code } => {
                let description = CloseCode::from_u16(*code).map_or("unknown", CloseCode::description);
                events.push(GatewayEvent::Error(Diagnostic::for_shard(
                    "FATAL_CLOSE_CODE",
                    shard_id,
                    format!("closed with {code} ({description}), not reconnecting"),
                )));
            }
            ReconnectDecision::Exhausted { attempts } => {
                let error = GatewayError::MaxReconnectAttemptsExceeded {
                    shard_id,
                    attempts: *attempts,
                };
                events.push(GatewayEvent::Error(Diagnostic::for_shard(error.code(), shard_id, error.to_string())));
            }
            ReconnectDecision::Disabled => {
                events.push(GatewayEvent::Debug(Diagnostic::for_shard(
                    "RECONNECT_DISABLED",
                    shard_id,
                    "auto reconnect is off",
                )));
            }
            ReconnectDecision::AlreadyPending | ReconnectDecision::Unknown => {}
        }

        self.publish(events);
        decision
    }

    /// Shards whose scheduled reconnect is due at `now`
    #[must_use]
    pub fn due_reconnects(&self, now: Instant) -> Vec<(u32, u32)> {
        self.state
            .lock()
            .shards
            .values()
            .filter(|record| record.status == ShardStatus::Disconnected && !record.reconnect.exhausted)
            .filter(|record| record.reconnect.next_attempt_at.is_some_and(|at| at <= now))
            .map(|record| (record.shard_id, record.reconnect.attempts))
            .collect()
    }

    /// Count missed heartbeats; returns shards that must be reconnected
    pub fn health_sweep(&self, now: Instant) -> Vec<u32> {
        let timeout = self.config.heartbeat_timeout();
        let mut events = Vec::new();
        let mut stale = Vec::new();

        {
            let mut state = self.state.lock();
            for record in state.shards.values_mut() {
                if record.status == ShardStatus::Disconnected {
                    continue;
                }
                let since = record
                    .health
                    .last_heartbeat_ack
                    .or(record.connect_started_at)
                    .unwrap_or(record.status_changed_at);
                if now.saturating_duration_since(since) <= timeout {
                    continue;
                }

                record.health.consecutive_failed_heartbeats += 1;
                let missed = record.health.consecutive_failed_heartbeats;
                events.push(GatewayEvent::Warn(Diagnostic::for_shard(
                    "HEARTBEAT_TIMEOUT",
                    record.shard_id,
                    format!("no heartbeat ack for {}ms ({missed} consecutive)", duration_ms(now.saturating_duration_since(since))),
                )));

                if missed >= HEARTBEAT_FAILURE_LIMIT && self.config.auto_reconnect {
                    record.health.consecutive_failed_heartbeats = 0;
                    stale.push(record.shard_id);
                }
            }
        }

        self.publish(events);
        stale
    }

    /// Run reconnects and health sweeps until shutdown
    pub fn supervise(self: &Arc<Self>, connector: Arc<dyn ShardConnector>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut reconnect_tick = tokio::time::interval(this.config.reconnect_tick());
            reconnect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let health_period = this.config.health_check_interval();
            let mut health_tick = tokio::time::interval_at(Instant::now() + health_period, health_period);
            health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = reconnect_tick.tick() => {
                        if this.run_due_reconnects(&connector).await.is_err() {
                            break;
                        }
                    }
                    _ = health_tick.tick() => this.run_health_sweep(&connector).await,
                }
            }
            tracing::debug!("Shard supervisor stopped");
        })
    }

    async fn run_due_reconnects(self: &Arc<Self>, connector: &Arc<dyn ShardConnector>) -> Result<(), GatewayError> {
        let epoch = self.current_epoch();
        for (shard_id, attempt) in self.due_reconnects(Instant::now()) {
            self.events.emit(GatewayEvent::ShardReconnect { shard_id, attempt });
            self.launch(connector, shard_id, epoch).await?;
        }
        Ok(())
    }

    async fn run_health_sweep(&self, connector: &Arc<dyn ShardConnector>) {
        for shard_id in self.health_sweep(Instant::now()) {
            connector.disconnect_shard(shard_id).await;
            self.mark_disconnected(shard_id, None, "heartbeat timeout");
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Abandon in-flight connection attempts (used before a rescale)
    pub fn abort_launches(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.launches.lock().abort_all();
    }

    /// Cancel every wait and attempt and mark all shards disconnected
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.abort_launches();

        let mut state = self.state.lock();
        for record in state.shards.values_mut() {
            record.set_status(ShardStatus::Disconnected);
            record.connect_started_at = None;
            record.reconnect.next_attempt_at = None;
        }
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    #[must_use]
    pub fn shard_snapshots(&self) -> Vec<ShardRecord> {
        self.state.lock().shards.values().cloned().collect()
    }

    #[must_use]
    pub fn shard(&self, shard_id: u32) -> Option<ShardRecord> {
        self.state.lock().shards.get(&shard_id).cloned()
    }

    #[must_use]
    pub fn status(&self, shard_id: u32) -> Option<ShardStatus> {
        self.state.lock().shards.get(&shard_id).map(|record| record.status)
    }

    #[must_use]
    pub fn ready_shards(&self) -> Vec<u32> {
        self.state
            .lock()
            .shards
            .values()
            .filter(|record| record.is_ready())
            .map(|record| record.shard_id)
            .collect()
    }

    /// Shard ids run by this process
    #[must_use]
    pub fn local_shards(&self) -> Vec<u32> {
        self.state.lock().shards.keys().copied().collect()
    }

    #[must_use]
    pub fn plan_snapshot(&self) -> Option<ShardPlan> {
        self.state.lock().plan.clone()
    }

    #[must_use]
    pub fn bucket_starts(&self) -> Vec<(u32, Instant)> {
        self.state.lock().bucket_starts.clone()
    }

    #[must_use]
    pub fn total_shards(&self) -> u32 {
        self.state.lock().total_shards()
    }

    /// Every known entity, local or not
    #[must_use]
    pub fn entities(&self) -> HashSet<Snowflake> {
        self.state.lock().all_entities()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("epoch", &self.current_epoch())
            .field("total_shards", &self.total_shards())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

/// Unspent identifies and latest window reset across `shards`, after
/// refilling expired windows; `None` for an empty table
fn carried_budget(shards: &mut BTreeMap<u32, ShardRecord>, now: Instant, window: Duration) -> Option<(u32, Instant)> {
    let reset_at = shards
        .values_mut()
        .map(|record| {
            record.rate_limit.refill_if_expired(now, window);
            record.rate_limit.window_reset_time
        })
        .max()?;
    let unspent = shards
        .values()
        .map(|record| record.rate_limit.remaining_identifies)
        .sum();
    Some((unspent, reset_at))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
