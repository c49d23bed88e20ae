//! Failure classification from error text

use shardgate_core::FailureCategory;

/// Substrings per category, checked in priority order
const KEYWORDS: [(FailureCategory, &[&str]); 6] = [
    (
        FailureCategory::Authentication,
        &["authentication", "unauthorized", "invalid token", "forbidden"],
    ),
    (
        FailureCategory::Network,
        &[
            "econnrefused",
            "econnreset",
            "enotfound",
            "connection refused",
            "connection reset",
            "network",
            "dns",
            "unreachable",
            "broken pipe",
        ],
    ),
    (
        FailureCategory::RateLimit,
        &["rate limit", "ratelimit", "rate-limit", "too many requests"],
    ),
    (FailureCategory::Timeout, &["timeout", "timed out", "etimedout"]),
    (
        FailureCategory::TransportProtocol,
        &["websocket", "handshake", "tls", "frame", "inflate", "zstd"],
    ),
    (
        FailureCategory::GatewayProtocol,
        &["gateway", "opcode", "invalid session", "decode", "sequence"],
    ),
];

/// Status and close codes per category, matched as whole tokens
const CODES: [(FailureCategory, &[&str]); 4] = [
    (FailureCategory::Authentication, &["401", "403", "4004"]),
    (FailureCategory::RateLimit, &["429", "4008"]),
    (FailureCategory::Timeout, &["408", "4009"]),
    (
        FailureCategory::GatewayProtocol,
        &["4000", "4001", "4002", "4003", "4005", "4007", "4010", "4011", "4012", "4013", "4014"],
    ),
];

/// Map an error message to a failure category.
///
/// Categories are tried in priority order; the first with a matching
/// keyword or code wins. Unmatched text is `Unknown`.
pub fn classify_failure(message: &str) -> FailureCategory {
    let lower = message.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    for category in FailureCategory::ALL {
        let keyword_hit = KEYWORDS
            .iter()
            .find(|(c, _)| *c == category)
            .is_some_and(|(_, words)| words.iter().any(|w| lower.contains(w)));
        let code_hit = CODES
            .iter()
            .find(|(c, _)| *c == category)
            .is_some_and(|(_, codes)| codes.iter().any(|code| tokens.contains(code)));

        if keyword_hit || code_hit {
            return category;
        }
    }

    FailureCategory::Unknown
}
