//! Shard count sizing
//!
//! Decides how many shards to open from the entity count, an explicit
//! request and the provider's recommendation.

use crate::error::ShardingError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Requested total shard count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotalShards {
    /// Let the planner decide from the entity count and recommendation
    #[default]
    Auto,
    /// Use exactly this many shards
    Fixed(u32),
}

impl TotalShards {
    /// Literal shard count, if one was requested
    #[must_use]
    pub const fn fixed(self) -> Option<u32> {
        match self {
            Self::Auto => None,
            Self::Fixed(n) => Some(n),
        }
    }
}

impl fmt::Display for TotalShards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl FromStr for TotalShards {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<u32>() {
            Ok(0) | Err(_) => Err(ShardingError::InvalidShardConfig(format!(
                "total_shards must be \"auto\" or a positive integer, got {s:?}"
            ))),
            Ok(n) => Ok(Self::Fixed(n)),
        }
    }
}

impl Serialize for TotalShards {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fixed(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for TotalShards {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct TotalShardsVisitor;

        impl Visitor<'_> for TotalShardsVisitor {
            type Value = TotalShards;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("\"auto\" or a positive integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<TotalShards, E>
            where
                E: de::Error,
            {
                match u32::try_from(value) {
                    Ok(n) if n > 0 => Ok(TotalShards::Fixed(n)),
                    _ => Err(de::Error::custom("total_shards must be a positive u32")),
                }
            }

            fn visit_i64<E>(self, value: i64) -> Result<TotalShards, E>
            where
                E: de::Error,
            {
                u64::try_from(value)
                    .map_err(|_| de::Error::custom("total_shards must be positive"))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E>(self, value: &str) -> Result<TotalShards, E>
            where
                E: de::Error,
            {
                value.parse().map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(TotalShardsVisitor)
    }
}

/// Inputs to the sizing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizingInput {
    pub entity_count: u64,
    pub requested: TotalShards,
    pub recommended_shards: u32,
    pub large_threshold: u64,
    pub very_large_threshold: u64,
}

impl SizingInput {
    /// Default entities per shard before sharding is required
    pub const DEFAULT_LARGE_THRESHOLD: u64 = 2_500;

    /// Default entity count above which the large-bot rule applies
    pub const DEFAULT_VERY_LARGE_THRESHOLD: u64 = 150_000;

    /// Inputs with default thresholds
    #[must_use]
    pub fn new(entity_count: u64, requested: TotalShards, recommended_shards: u32) -> Self {
        Self {
            entity_count,
            requested,
            recommended_shards,
            large_threshold: Self::DEFAULT_LARGE_THRESHOLD,
            very_large_threshold: Self::DEFAULT_VERY_LARGE_THRESHOLD,
        }
    }
}

/// `ceil(entity_count / large_threshold)`, never below one
#[must_use]
pub fn minimum_shards(entity_count: u64, large_threshold: u64) -> u32 {
    let threshold = large_threshold.max(1);
    let shards = entity_count.div_ceil(threshold).max(1);
    u32::try_from(shards).unwrap_or(u32::MAX)
}

/// Decide the total shard count.
///
/// Bots at or above `very_large_threshold` must run a multiple of the
/// recommended count; the provider's recommendation is authoritative for
/// them, so the per-shard minimum is not enforced on top of it.
pub fn compute_total_shards(input: &SizingInput) -> Result<u32, ShardingError> {
    if input.large_threshold == 0 {
        return Err(ShardingError::InvalidShardConfig(
            "large_threshold must be positive".to_string(),
        ));
    }

    let minimum = minimum_shards(input.entity_count, input.large_threshold);
    let very_large = input.entity_count >= input.very_large_threshold;

    let total = match input.requested {
        TotalShards::Fixed(0) => {
            return Err(ShardingError::InvalidShardConfig(
                "total_shards must be positive".to_string(),
            ));
        }
        TotalShards::Fixed(n) => {
            if !very_large && n < minimum {
                return Err(ShardingError::TooFewShards {
                    total_shards: n,
                    minimum,
                    entity_count: input.entity_count,
                });
            }
            n
        }
        TotalShards::Auto if input.entity_count >= input.large_threshold => {
            let base = input.recommended_shards.max(minimum);
            if very_large && input.recommended_shards > 0 {
                base.div_ceil(input.recommended_shards) * input.recommended_shards
            } else {
                base
            }
        }
        TotalShards::Auto => 1,
    };

    if very_large {
        if input.recommended_shards == 0 {
            return Err(ShardingError::InvalidShardConfig(
                "recommended shard count must be positive for large bots".to_string(),
            ));
        }
        if total % input.recommended_shards != 0 {
            return Err(ShardingError::LargeBotSharding {
                total_shards: total,
                recommended_shards: input.recommended_shards,
            });
        }
    }

    Ok(total)
}
