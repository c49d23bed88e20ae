//! Failure categories used by the circuit breaker

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure domains a connection attempt can fail in
///
/// Declared in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Authentication,
    Network,
    RateLimit,
    Timeout,
    TransportProtocol,
    GatewayProtocol,
    Unknown,
}

impl FailureCategory {
    /// All categories in classification priority order
    pub const ALL: [Self; 7] = [
        Self::Authentication,
        Self::Network,
        Self::RateLimit,
        Self::Timeout,
        Self::TransportProtocol,
        Self::GatewayProtocol,
        Self::Unknown,
    ];

    /// Get the string representation of the category
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Network => "network",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::TransportProtocol => "transport_protocol",
            Self::GatewayProtocol => "gateway_protocol",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a category from its string representation
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
