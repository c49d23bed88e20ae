//! Dispatch event names the gateway acts on itself

/// Dispatch (`t`) names with built-in handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchKind {
    /// Sent after a successful Identify
    Ready,
    /// Sent after a successful Resume
    Resumed,
    /// Entity became available or was joined
    GuildCreate,
    /// Entity left or became unavailable
    GuildDelete,
    /// Anything else; forwarded untouched
    Other,
}

impl DispatchKind {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "READY" => Self::Ready,
            "RESUMED" => Self::Resumed,
            "GUILD_CREATE" => Self::GuildCreate,
            "GUILD_DELETE" => Self::GuildDelete,
            _ => Self::Other,
        }
    }
}
