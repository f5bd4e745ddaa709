// Persistence gateway - the core's only door to durable storage.
//
// Every operation is atomic per document. The core never assumes
// multi-document transactions: cross-entity consistency (mute supersession)
// is built from the compare-and-swap primitives below.

use crate::core::guild::Guild;
use crate::core::moderation::{CaseStatus, ModerationCase, NewCase};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient backend trouble (connection refused, busy database).
    /// The case manager retries these with backoff.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Permanent backend failure. Not retried.
    #[error("storage failure: {0}")]
    Backend(String),

    /// A stored document failed to decode. Not retried.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Result of a compare-and-swap case-status update.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    /// The expected status matched; the returned record is post-transition.
    Applied(ModerationCase),
    /// Another writer got there first. Treated as a no-op by callers.
    Lost,
}

/// Atomic per-guild document operations against the external store.
///
/// Same port pattern as the other service stores: the core defines what it
/// needs, infra decides how (DashMap for tests and volatile runs, SQLite for
/// durable ones).
#[async_trait]
pub trait GuildStore: Send + Sync {
    async fn load_guild(&self, guild_id: u64) -> Result<Option<Guild>, StorageError>;

    /// Upsert the whole guild document.
    async fn save_guild(&self, guild: &Guild) -> Result<(), StorageError>;

    /// Insert a case, allocating the next strictly-increasing case id for
    /// the guild. Allocation and insert are a single atomic step.
    async fn create_case(&self, case: NewCase) -> Result<ModerationCase, StorageError>;

    async fn fetch_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<Option<ModerationCase>, StorageError>;

    /// Compare-and-swap the case status: applies `new` (and the resolution
    /// note) only if the stored status equals `expected`. A lost race is a
    /// `CasOutcome::Lost`, not an error.
    async fn update_case_status(
        &self,
        guild_id: u64,
        case_id: u64,
        expected: CaseStatus,
        new: CaseStatus,
        resolution: Option<String>,
    ) -> Result<CasOutcome, StorageError>;

    /// All cases for a target in a guild created at or after `since`,
    /// newest first.
    async fn cases_for_target(
        &self,
        guild_id: u64,
        target_id: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, StorageError>;

    /// Active cases whose expiry is at or before `ts`, across all guilds.
    async fn list_active_cases_due_before(
        &self,
        ts: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, StorageError>;

    /// Compare-and-swap the per-target "active mute case id" pointer.
    /// Returns false (no-op) if the stored pointer is not `expected`.
    async fn swap_active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
        expected: Option<u64>,
        new: Option<u64>,
    ) -> Result<bool, StorageError>;

    /// Current active-mute pointer for a target, if any.
    async fn active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
    ) -> Result<Option<u64>, StorageError>;
}
