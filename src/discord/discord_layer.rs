// Discord layer - adapters between serenity and the core.

#[path = "gateway/action_sink.rs"]
pub mod action_sink;

#[path = "gateway/events.rs"]
pub mod events;
