// Event ingress and dispatch: normalized events, the engine entry point,
// and the guild-keyed worker pool.

pub mod engine;
pub mod event_models;
pub mod worker_pool;

pub use engine::Engine;
pub use event_models::{Event, EventKind};
pub use worker_pool::WorkerPool;
