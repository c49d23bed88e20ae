//! Snowflake ID - Discord-compatible 64-bit unique identifier
//!
//! Structure:
//! - Bits 63-22: Timestamp (milliseconds since custom epoch)
//! - Bits 21-17: Worker ID (0-31)
//! - Bits 16-12: Process ID (0-31)
//! - Bits 11-0:  Increment (0-4095)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Discord-compatible Snowflake ID (64-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Snowflake(u64);

impl Snowflake {
    /// Custom epoch: 2015-01-01 00:00:00 UTC (milliseconds)
    pub const EPOCH: u64 = 1_420_070_400_000;

    /// Largest timestamp offset that fits in 42 bits
    pub const MAX_TIMESTAMP_OFFSET: u64 = (1 << 42) - 1;

    /// Largest worker or process ID (5 bits)
    pub const MAX_NODE_ID: u8 = 0x1F;

    /// Increments per millisecond before the timestamp rolls over
    pub const INCREMENT_MODULUS: u32 = 4096;

    /// Shortest textual form accepted by [`Snowflake::parse`]
    pub const MIN_TEXT_LEN: usize = 17;

    /// Clock skew tolerated when parsing IDs from the future
    pub const MAX_FUTURE_SKEW_MS: u64 = 60 * 60 * 1000;

    /// Create a new Snowflake from a raw u64 value
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    #[inline]
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Check if the Snowflake is zero (uninitialized)
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Build an ID from its parts.
    ///
    /// `timestamp` is milliseconds since the Unix epoch. An `increment` at or
    /// above 4096 wraps and carries into the timestamp.
    pub fn generate(
        timestamp: u64,
        worker_id: u8,
        process_id: u8,
        increment: u32,
    ) -> Result<Self, SnowflakeParseError> {
        if worker_id > Self::MAX_NODE_ID {
            return Err(SnowflakeParseError::OutOfRange("worker_id"));
        }
        if process_id > Self::MAX_NODE_ID {
            return Err(SnowflakeParseError::OutOfRange("process_id"));
        }
        if timestamp < Self::EPOCH {
            return Err(SnowflakeParseError::OutOfRange("timestamp"));
        }

        let carry = u64::from(increment / Self::INCREMENT_MODULUS);
        let increment = u64::from(increment % Self::INCREMENT_MODULUS);
        let offset = timestamp - Self::EPOCH + carry;
        if offset > Self::MAX_TIMESTAMP_OFFSET {
            return Err(SnowflakeParseError::OutOfRange("timestamp"));
        }

        Ok(Self(
            (offset << 22)
                | (u64::from(worker_id) << 17)
                | (u64::from(process_id) << 12)
                | increment,
        ))
    }

    /// Extract timestamp (milliseconds since Unix epoch)
    #[inline]
    pub fn timestamp(&self) -> u64 {
        (self.0 >> 22) + Self::EPOCH
    }

    /// Extract worker ID (0-31)
    #[inline]
    pub fn worker_id(&self) -> u8 {
        ((self.0 >> 17) & 0x1F) as u8
    }

    /// Extract process ID (0-31)
    #[inline]
    pub fn process_id(&self) -> u8 {
        ((self.0 >> 12) & 0x1F) as u8
    }

    /// Extract increment (0-4095)
    #[inline]
    pub fn increment(&self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    /// Convert timestamp to DateTime<Utc>
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.timestamp() as i64).unwrap_or_default()
    }

    /// Numeric comparison
    #[inline]
    pub fn compare(a: Self, b: Self) -> CmpOrdering {
        a.0.cmp(&b.0)
    }

    /// Parse and validate a textual snowflake.
    ///
    /// Rejects non-digit input, anything shorter than 17 characters, and
    /// timestamps more than one hour ahead of the local clock.
    pub fn parse(s: &str) -> Result<Self, SnowflakeParseError> {
        Self::parse_at(s, current_millis())
    }

    /// Parse against an explicit "now" (milliseconds since Unix epoch)
    pub fn parse_at(s: &str, now_ms: u64) -> Result<Self, SnowflakeParseError> {
        if s.len() < Self::MIN_TEXT_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SnowflakeParseError::InvalidFormat);
        }

        let id = s
            .parse::<u64>()
            .map(Snowflake)
            .map_err(|_| SnowflakeParseError::InvalidFormat)?;

        if id.timestamp() < Self::EPOCH
            || id.timestamp() > now_ms.saturating_add(Self::MAX_FUTURE_SKEW_MS)
        {
            return Err(SnowflakeParseError::InvalidFormat);
        }

        Ok(id)
    }
}

/// Error when parsing or building a Snowflake
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SnowflakeParseError {
    #[error("invalid snowflake format")]
    InvalidFormat,

    #[error("snowflake {0} out of range")]
    OutOfRange(&'static str),
}

impl fmt::Display for Snowflake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Snowflake {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<Snowflake> for u64 {
    fn from(id: Snowflake) -> Self {
        id.0
    }
}

impl std::str::FromStr for Snowflake {
    type Err = SnowflakeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Snowflake::parse(s)
    }
}

// Serialize as string for JSON (JavaScript BigInt safety)
impl Serialize for Snowflake {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

// Deserialize from string or number
impl<'de> Deserialize<'de> for Snowflake {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct SnowflakeVisitor;

        impl Visitor<'_> for SnowflakeVisitor {
            type Value = Snowflake;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or integer representing a snowflake ID")
            }

            fn visit_i64<E>(self, value: i64) -> Result<Snowflake, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map(Snowflake)
                    .map_err(|_| de::Error::custom("negative snowflake"))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Snowflake, E>
            where
                E: de::Error,
            {
                Ok(Snowflake(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Snowflake, E>
            where
                E: de::Error,
            {
                value
                    .parse::<u64>()
                    .map(Snowflake)
                    .map_err(|_| de::Error::custom("invalid snowflake string"))
            }
        }

        deserializer.deserialize_any(SnowflakeVisitor)
    }
}

/// Thread-safe Snowflake ID generator for a fixed (worker, process) pair
///
/// IDs are strictly increasing. When more than 4096 IDs are requested in one
/// millisecond the increment wraps and the timestamp is advanced.
pub struct SnowflakeGenerator {
    worker_id: u8,
    process_id: u8,
    last: AtomicU64,
}

impl SnowflakeGenerator {
    /// Create a new generator
    ///
    /// # Panics
    /// Panics if either ID is >= 32
    pub fn new(worker_id: u8, process_id: u8) -> Self {
        assert!(worker_id <= Snowflake::MAX_NODE_ID, "Worker ID must be < 32");
        assert!(process_id <= Snowflake::MAX_NODE_ID, "Process ID must be < 32");
        Self {
            worker_id,
            process_id,
            last: AtomicU64::new(0),
        }
    }

    /// Generate a new unique Snowflake ID
    pub fn generate(&self) -> Snowflake {
        loop {
            let last = Snowflake::new(self.last.load(Ordering::Acquire));
            let now = current_millis().max(Snowflake::EPOCH);

            let candidate = if last.is_zero() || now > last.timestamp() {
                Snowflake::generate(now, self.worker_id, self.process_id, 0)
            } else {
                // Same (or earlier) millisecond: bump the increment, carrying on wrap
                Snowflake::generate(
                    last.timestamp(),
                    self.worker_id,
                    self.process_id,
                    u32::from(last.increment()) + 1,
                )
            };

            // Node IDs are validated in new() and the clock is past the epoch
            let Ok(candidate) = candidate else {
                continue;
            };

            if self
                .last
                .compare_exchange(
                    last.into_inner(),
                    candidate.into_inner(),
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Get the worker ID of this generator
    pub fn worker_id(&self) -> u8 {
        self.worker_id
    }

    /// Get the process ID of this generator
    pub fn process_id(&self) -> u8 {
        self.process_id
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
