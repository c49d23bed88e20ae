//! Bounded reconnection with exponential backoff

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Retry bookkeeping for one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Failed attempts since the shard was last ready
    pub attempts: u32,
    /// When the next attempt is due; `None` while one is running
    pub next_attempt_at: Option<Instant>,
    /// No further attempts will be made
    pub exhausted: bool,
}

impl ReconnectState {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of reporting a disconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Another attempt is scheduled
    Scheduled {
        attempt: u32,
        delay: Duration,
        resume: bool,
    },
    /// An attempt was already scheduled
    AlreadyPending,
    /// Close code rules out reconnecting
    Fatal { code: u16 },
    /// Attempt budget used up
    Exhausted { attempts: u32 },
    /// Automatic reconnection is turned off
    Disabled,
    /// Shard is not managed here
    Unknown,
}

impl ReconnectDecision {
    #[must_use]
    pub fn will_reconnect(&self) -> bool {
        matches!(self, Self::Scheduled { .. } | Self::AlreadyPending)
    }
}

/// `min(base * 2^(attempt-1), max)` plus up to 25% jitter
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent).min(max);
    let jitter_ceiling = delay.as_millis() as u64 / 4;
    if jitter_ceiling == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ceiling))
}
