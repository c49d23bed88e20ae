//! Circuit breaker
//!
//! Counts failures per category and opens once a category reaches its
//! threshold (or immediately, for configured categories). After the reset
//! timeout the circuit is HalfOpen and a single trial is let through; the
//! circuit is Open again while that trial is outstanding, and its outcome
//! closes the circuit or reopens it with a longer timeout.

use crate::events::{EventBus, GatewayEvent};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardgate_common::CircuitConfig;
use shardgate_core::FailureCategory;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation: attempts flow through
    Closed,
    /// Tripped: attempts are rejected until the reset timeout passes
    Open,
    /// Recovering: the next attempt is the trial
    HalfOpen,
}

/// Observable circuit breaker stats
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub failure_counts: BTreeMap<FailureCategory, u32>,
    pub last_failure_category: Option<FailureCategory>,
    pub last_error: Option<String>,
    pub current_reset_timeout_ms: u64,
    pub total_trips: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    counters: BTreeMap<FailureCategory, u32>,
    /// Start of the current Open wait
    anchor: Option<Instant>,
    last_failure_category: Option<FailureCategory>,
    last_error: Option<String>,
    /// Opens since the last success
    consecutive_opens: u32,
    current_reset_timeout: Duration,
    /// A HalfOpen trial was granted and has not reported yet
    trial_in_flight: bool,
    total_trips: u64,
    total_rejections: u64,
}

/// Category-aware circuit breaker
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        let base = config.reset_timeout();
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                counters: BTreeMap::new(),
                anchor: None,
                last_failure_category: None,
                last_error: None,
                consecutive_opens: 0,
                current_reset_timeout: base,
                trial_in_flight: false,
                total_trips: 0,
                total_rejections: 0,
            }),
            events: None,
        }
    }

    /// Publish state changes and rejections on `events`
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Ask permission for an attempt.
    ///
    /// Closed always allows. Open allows nothing until the reset timeout has
    /// elapsed, then moves to HalfOpen. HalfOpen grants the single trial and
    /// flips straight back to Open until the trial reports.
    pub fn can_execute(&self, operation: &str) -> bool {
        let now = Instant::now();
        let mut pending = Vec::new();

        let allowed = {
            let mut inner = self.inner.lock();
            self.refresh(&mut inner, now, &mut pending);

            let state = inner.state;
            match state {
                CircuitState::Closed => true,
                CircuitState::HalfOpen => {
                    inner.trial_in_flight = true;
                    inner.anchor = Some(now);
                    inner.state = CircuitState::Open;
                    pending.push(GatewayEvent::CircuitStateChange {
                        previous: CircuitState::HalfOpen,
                        state: CircuitState::Open,
                        category: inner.last_failure_category,
                        failure_count: inner.counters.values().sum(),
                        reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
                    });
                    true
                }
                CircuitState::Open => {
                    inner.total_rejections += 1;
                    pending.push(GatewayEvent::CircuitBlocked {
                        operation: operation.to_string(),
                        state,
                        remaining_ms: remaining(&inner, now).as_millis() as u64,
                    });
                    false
                }
            }
        };

        self.publish(pending);
        allowed
    }

    /// Record a successful attempt: close the circuit and reset every counter
    pub fn record_success(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.state != CircuitState::Closed {
                pending.push(GatewayEvent::CircuitStateChange {
                    previous: inner.state,
                    state: CircuitState::Closed,
                    category: None,
                    failure_count: 0,
                    reset_timeout_ms: self.config.reset_timeout_ms,
                });
                inner.state = CircuitState::Closed;
            }
            inner.counters.clear();
            inner.anchor = None;
            inner.consecutive_opens = 0;
            inner.current_reset_timeout = self.config.reset_timeout();
            inner.trial_in_flight = false;
        }
        self.publish(pending);
    }

    /// Record a failed attempt.
    ///
    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self, error: &str, category: FailureCategory) -> bool {
        let now = Instant::now();
        let mut pending = Vec::new();

        let opened = {
            let mut inner = self.inner.lock();
            let count = {
                let counter = inner.counters.entry(category).or_insert(0);
                *counter = counter.saturating_add(1);
                *counter
            };
            inner.last_failure_category = Some(category);
            inner.last_error = Some(error.to_string());

            let tripped = self.config.break_immediately.contains(&category)
                || count >= self.config.threshold_for(category);

            let state = inner.state;
            match state {
                CircuitState::HalfOpen => {
                    self.open(&mut inner, now, category, count, &mut pending);
                    true
                }
                // The outstanding trial failed
                CircuitState::Open if inner.trial_in_flight => {
                    self.open(&mut inner, now, category, count, &mut pending);
                    true
                }
                CircuitState::Closed if tripped => {
                    self.open(&mut inner, now, category, count, &mut pending);
                    true
                }
                CircuitState::Open => {
                    inner.anchor = Some(now);
                    false
                }
                CircuitState::Closed => false,
            }
        };

        self.publish(pending);
        opened
    }

    /// Current state, applying a due Open to HalfOpen move
    pub fn state(&self) -> CircuitState {
        let mut pending = Vec::new();
        let state = {
            let mut inner = self.inner.lock();
            self.refresh(&mut inner, Instant::now(), &mut pending);
            inner.state
        };
        self.publish(pending);
        state
    }

    /// Time left before an open circuit admits a trial
    pub fn remaining_timeout(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => None,
            _ => Some(remaining(&inner, Instant::now())),
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            failure_counts: inner.counters.clone(),
            last_failure_category: inner.last_failure_category,
            last_error: inner.last_error.clone(),
            current_reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
            total_trips: inner.total_trips,
            total_rejections: inner.total_rejections,
        }
    }

    fn open(
        &self,
        inner: &mut BreakerInner,
        now: Instant,
        category: FailureCategory,
        failure_count: u32,
        pending: &mut Vec<GatewayEvent>,
    ) {
        inner.consecutive_opens = inner.consecutive_opens.saturating_add(1);
        inner.current_reset_timeout = self.reset_timeout_for(inner.consecutive_opens);
        inner.trial_in_flight = false;
        inner.anchor = Some(now);
        inner.total_trips += 1;

        pending.push(GatewayEvent::CircuitStateChange {
            previous: inner.state,
            state: CircuitState::Open,
            category: Some(category),
            failure_count,
            reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
        });
        inner.state = CircuitState::Open;
    }

    /// `base * multiplier^(opens - 1)`, capped
    fn reset_timeout_for(&self, opens: u32) -> Duration {
        let base = self.config.reset_timeout().as_secs_f64();
        let exponent = i32::try_from(opens.saturating_sub(1)).unwrap_or(i32::MAX);
        let grown = base * self.config.reset_multiplier.powi(exponent);
        let max = self.config.max_reset_timeout();
        if grown.is_finite() && grown < max.as_secs_f64() {
            Duration::from_secs_f64(grown)
        } else {
            max
        }
    }

    /// Open to HalfOpen once the wait is over. A trial whose outcome never
    /// arrived is abandoned the same way, re-arming the next one.
    fn refresh(&self, inner: &mut BreakerInner, now: Instant, pending: &mut Vec<GatewayEvent>) {
        let expired = inner
            .anchor
            .is_some_and(|anchor| now.saturating_duration_since(anchor) >= inner.current_reset_timeout);
        if inner.state != CircuitState::Open || !expired {
            return;
        }

        pending.push(GatewayEvent::CircuitStateChange {
            previous: CircuitState::Open,
            state: CircuitState::HalfOpen,
            category: inner.last_failure_category,
            failure_count: inner.counters.values().sum(),
            reset_timeout_ms: inner.current_reset_timeout.as_millis() as u64,
        });
        inner.state = CircuitState::HalfOpen;
        inner.trial_in_flight = false;
    }

    fn publish(&self, pending: Vec<GatewayEvent>) {
        if let Some(events) = &self.events {
            for event in pending {
                events.emit(event);
            }
        }
    }
}

fn remaining(inner: &BreakerInner, now: Instant) -> Duration {
    inner.anchor.map_or(Duration::ZERO, |anchor| {
        inner
            .current_reset_timeout
            .saturating_sub(now.saturating_duration_since(anchor))
    })
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.inner.lock().state)
            .finish()
    }
}
