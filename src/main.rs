// This is the entry point of the Discord moderation bot.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic)
// - `infra/` = Implementations of core traits (storage backends)
// - `discord/` = Discord-specific adapters (gateway events, action sink)
//
// This file's job is to:
// 1. Load configuration
// 2. Initialize services (dependency injection)
// 3. Start the background expiry timer
// 4. Connect the gateway client

// These attrs point each module declaration at a more descriptive root file
// so we don't end up with half a dozen mod.rs files that all look the same.
#[path = "core/core_layer.rs"]
mod core;
#[path = "discord/discord_layer.rs"]
mod discord;
#[path = "infra/infra_layer.rs"]
mod infra;

use anyhow::Context;

use crate::core::audit::TracingAuditSink;
use crate::core::commands::{build_registry, CommandRouter};
use crate::core::dispatch::{Engine, WorkerPool};
use crate::discord::action_sink::DiscordActionSink;
use crate::discord::events::GatewayHandler;
use crate::infra::storage::SqliteGuildStore;
use serenity::model::gateway::GatewayIntents;
use std::sync::Arc;

/// Cadence of the expiry scan. Independent of event processing; both paths
/// mutate cases through the same CAS-guarded service.
const EXPIRY_SCAN_SECS: u64 = 30;

const DEFAULT_WORKERS: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let token = std::env::var("DISCORD_TOKEN")
        .context("missing DISCORD_TOKEN environment variable; create a .env file with your bot token")?;

    // Keep the runtime database in a dedicated folder so the repo root stays tidy.
    let data_dir = "data";
    std::fs::create_dir_all(data_dir).context("creating data directory for SQLite files")?;
    let db_path =
        std::env::var("WARDEN_DB_PATH").unwrap_or_else(|_| format!("{}/warden.db", data_dir));

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================
    // Create our services with their dependencies.
    // This is the "composition root" where we wire everything together.

    let store = Arc::new(
        SqliteGuildStore::connect(&db_path)
            .await
            .context("initializing SQLite store")?,
    );

    // The command table is immutable after this point; a duplicate name is a
    // programming error and the one failure worth dying for.
    let registry = build_registry().expect("Duplicate command registration");
    let router = CommandRouter::new(registry, Arc::new(TracingAuditSink));

    // Standalone HTTP client for outbound actions; the gateway client below
    // keeps its own.
    let http = Arc::new(serenity::http::Http::new(&token));
    let sink = Arc::new(DiscordActionSink::new(http));

    let engine = Arc::new(Engine::new(router, store, sink));

    // Background expiry scan. Expired mutes get their role lifted through
    // the same sink the command handlers use.
    let expiry_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(EXPIRY_SCAN_SECS));
        loop {
            ticker.tick().await;
            let expired = expiry_engine.run_expiry_cycle(chrono::Utc::now()).await;
            if expired > 0 {
                tracing::info!(expired, "expiry cycle processed cases");
            }
        }
    });

    let workers = std::env::var("WARDEN_WORKERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_WORKERS);
    let pool = Arc::new(WorkerPool::spawn(Arc::clone(&engine), workers));

    // ========================================================================
    // GATEWAY CLIENT
    // ========================================================================

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT // Required to read message content
        | GatewayIntents::GUILD_MEMBERS;

    let mut client = serenity::Client::builder(&token, intents)
        .event_handler(GatewayHandler::new(pool))
        .await
        .context("creating gateway client")?;

    tracing::info!(workers, db_path, "warden starting");
    client.start().await.context("running gateway client")?;
    Ok(())
}
