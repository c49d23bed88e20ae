//! Lifecycle events published by the gateway
//!
//! Every event is mirrored to `tracing` as it is published, so a process
//! without subscribers still gets a complete log.

mod bus;
mod dispatch_kind;
mod event_types;

pub use bus::{EventBus, DEFAULT_EVENT_CAPACITY};
pub use dispatch_kind::DispatchKind;
pub use event_types::{Diagnostic, GatewayEvent};
