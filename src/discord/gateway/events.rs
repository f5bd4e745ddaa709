// Gateway event adapter: serenity events in, normalized core events out.
//
// The handler does no business logic. It reshapes each platform event into
// the core Event type and hands it to the worker pool, which owns ordering
// and parallelism.

use crate::core::dispatch::{Event, EventKind, WorkerPool};
use crate::core::permissions::Actor;
use serenity::async_trait;
use serenity::client::{Context, EventHandler};
use serenity::model::channel::Message;
use serenity::model::gateway::Ready;
use serenity::model::guild::Member;
use std::sync::Arc;

pub struct GatewayHandler {
    pool: Arc<WorkerPool>,
}

impl GatewayHandler {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn message(&self, ctx: Context, msg: Message) {
        // Ignore bot messages (including our own).
        if msg.author.bot {
            return;
        }
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        let actor_roles: Vec<u64> = msg
            .member
            .as_ref()
            .map(|m| m.roles.iter().map(|r| r.get()).collect())
            .unwrap_or_default();
        let actor = Actor::new(msg.author.id.get(), actor_roles);

        // Resolve mentioned members' roles so the core can apply the rank
        // hierarchy guard. Only worth an HTTP round-trip for messages that
        // could be commands.
        let looks_like_command = msg
            .content
            .trim_start()
            .starts_with(|c: char| c.is_ascii_punctuation());
        let mut mentioned = Vec::with_capacity(msg.mentions.len());
        if looks_like_command {
            for user in &msg.mentions {
                let roles = match ctx.http.get_member(guild_id, user.id).await {
                    Ok(member) => member.roles.iter().map(|r| r.get()).collect(),
                    Err(err) => {
                        tracing::debug!(user_id = user.id.get(), error = %err, "could not resolve mentioned member");
                        Vec::new()
                    }
                };
                mentioned.push(Actor::new(user.id.get(), roles));
            }
        }

        self.pool
            .submit(Event {
                guild_id: guild_id.get(),
                actor,
                kind: EventKind::Message {
                    channel_id: msg.channel_id.get(),
                    content: msg.content.clone(),
                    mentioned,
                },
            })
            .await;
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        let roles = member.roles.iter().map(|r| r.get()).collect();
        self.pool
            .submit(Event {
                guild_id: member.guild_id.get(),
                actor: Actor::new(member.user.id.get(), roles),
                kind: EventKind::MemberJoin,
            })
            .await;
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, guilds = ready.guilds.len(), "gateway connected");
    }
}
