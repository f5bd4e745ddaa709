// Core moderation module - case records, lifecycle, escalation, expiry.

pub mod case_models;
pub mod case_service;

pub use case_models::*;
pub use case_service::*;
