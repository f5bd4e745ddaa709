// Normalized platform events, produced by the gateway adapter.

use crate::core::permissions::Actor;

/// One event from the platform, reduced to what the core needs.
#[derive(Debug, Clone)]
pub struct Event {
    pub guild_id: u64,
    /// The acting user with their currently-held roles.
    pub actor: Actor,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    /// A chat message; the only event that can carry a command.
    Message {
        channel_id: u64,
        content: String,
        /// Users mentioned in the message, with their held roles (when the
        /// adapter could resolve them).
        mentioned: Vec<Actor>,
    },
    /// A member joined. Bootstraps the guild document for new guilds.
    MemberJoin,
}
