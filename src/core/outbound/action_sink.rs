// Outbound action sink - operations the platform client must provide.
//
// The core only ever talks to the platform through these three operations;
// moderation handlers use them to reply and enforce sanctions, and the
// expiry cycle uses them to reverse elapsed mutes.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("platform rejected the action: {0}")]
    Rejected(String),

    #[error("platform unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Grant,
    Remove,
}

#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn send_message(
        &self,
        guild_id: u64,
        channel_id: u64,
        text: &str,
    ) -> Result<(), SinkError>;

    async fn apply_role_change(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        change: RoleChange,
    ) -> Result<(), SinkError>;

    async fn remove_member(&self, guild_id: u64, user_id: u64) -> Result<(), SinkError>;
}
