// The core module contains all business logic.
// Each component gets its own submodule; nothing in here imports serenity.

#[path = "audit/audit_service.rs"]
pub mod audit;

#[path = "commands/mod.rs"]
pub mod commands;

#[path = "dispatch/mod.rs"]
pub mod dispatch;

#[path = "guild/guild_models.rs"]
pub mod guild;

#[path = "moderation/mod.rs"]
pub mod moderation;

#[path = "outbound/action_sink.rs"]
pub mod outbound;

#[path = "permissions/permission_service.rs"]
pub mod permissions;

#[path = "ratelimit/rate_limiter.rs"]
pub mod ratelimit;

#[path = "storage/storage_gateway.rs"]
pub mod storage;
