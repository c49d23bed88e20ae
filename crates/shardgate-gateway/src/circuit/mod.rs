//! Category-aware circuit breaker guarding connection attempts

mod breaker;
mod classify;

pub use breaker::{CircuitBreaker, CircuitState, CircuitStats};
pub use classify::classify_failure;
