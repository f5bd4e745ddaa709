// Outbound action sink over the serenity HTTP client.

use crate::core::outbound::{ActionSink, RoleChange, SinkError};
use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId, RoleId, UserId};
use std::sync::Arc;

pub struct DiscordActionSink {
    http: Arc<Http>,
}

impl DiscordActionSink {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn map_serenity_err(err: serenity::Error) -> SinkError {
    match &err {
        serenity::Error::Http(_) => SinkError::Rejected(err.to_string()),
        _ => SinkError::Unreachable(err.to_string()),
    }
}

#[async_trait]
impl ActionSink for DiscordActionSink {
    async fn send_message(
        &self,
        _guild_id: u64,
        channel_id: u64,
        text: &str,
    ) -> Result<(), SinkError> {
        ChannelId::new(channel_id)
            .say(&self.http, text)
            .await
            .map(|_| ())
            .map_err(map_serenity_err)
    }

    async fn apply_role_change(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        change: RoleChange,
    ) -> Result<(), SinkError> {
        let guild = GuildId::new(guild_id);
        let user = UserId::new(user_id);
        let role = RoleId::new(role_id);

        match change {
            RoleChange::Grant => self
                .http
                .add_member_role(guild, user, role, Some("moderation sanction"))
                .await
                .map_err(map_serenity_err),
            RoleChange::Remove => self
                .http
                .remove_member_role(guild, user, role, Some("moderation sanction lifted"))
                .await
                .map_err(map_serenity_err),
        }
    }

    async fn remove_member(&self, guild_id: u64, user_id: u64) -> Result<(), SinkError> {
        self.http
            .kick_member(
                GuildId::new(guild_id),
                UserId::new(user_id),
                Some("moderation sanction"),
            )
            .await
            .map_err(map_serenity_err)
    }
}
