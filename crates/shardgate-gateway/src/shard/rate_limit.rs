//! Identify budget windows

use std::time::Duration;
use tokio::time::Instant;

/// One shard's share of the identify budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitWindow {
    pub capacity: u32,
    pub remaining_identifies: u32,
    pub window_reset_time: Instant,
}

impl RateLimitWindow {
    #[must_use]
    pub fn new(capacity: u32, now: Instant, window: Duration) -> Self {
        Self {
            capacity,
            remaining_identifies: capacity,
            window_reset_time: now + window,
        }
    }

    /// Window that has already spent part of its capacity
    #[must_use]
    pub fn with_remaining(capacity: u32, remaining: u32, window_reset_time: Instant) -> Self {
        Self {
            capacity,
            remaining_identifies: remaining.min(capacity),
            window_reset_time,
        }
    }

    /// Refill to capacity if the window has passed
    pub fn refill_if_expired(&mut self, now: Instant, window: Duration) -> bool {
        if now < self.window_reset_time {
            return false;
        }
        self.remaining_identifies = self.capacity;
        self.window_reset_time = now + window;
        true
    }

    pub fn try_take(&mut self) -> bool {
        if self.remaining_identifies == 0 {
            return false;
        }
        self.remaining_identifies -= 1;
        true
    }
}

/// Split `limit` identifies per window across `shards` local shards.
///
/// Shares differ by at most one and always sum to `limit`, so when there
/// are more shards than identifies some shares are zero and those shards
/// borrow from the others.
#[must_use]
pub fn identify_shares(limit: u32, shards: usize) -> Vec<u32> {
    if shards == 0 {
        return Vec::new();
    }
    let shards_u32 = u32::try_from(shards).unwrap_or(u32::MAX);
    let base = limit / shards_u32;
    let extra = (limit % shards_u32) as usize;
    (0..shards)
        .map(|index| base + u32::from(index < extra))
        .collect()
}
