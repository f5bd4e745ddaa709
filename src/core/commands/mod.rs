// Command registry, router, and the handler implementations.

pub mod command_models;
pub mod command_router;
pub mod handlers;

pub use command_models::*;
pub use command_router::*;
pub use handlers::build_registry;
