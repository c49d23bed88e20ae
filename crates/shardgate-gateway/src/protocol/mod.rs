//! Gateway wire protocol
//!
//! Op codes, close codes and the JSON envelope exchanged with the gateway.

mod close_codes;
mod messages;
mod opcodes;
mod payloads;

pub use close_codes::CloseCode;
pub use messages::GatewayMessage;
pub use opcodes::OpCode;
pub use payloads::{
    ConnectionProperties, HelloPayload, IdentifyPayload, ReadyPayload, ResumePayload,
    UnavailableGuild,
};
