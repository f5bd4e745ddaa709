// In-memory implementation of the persistence gateway.
//
// The concurrent test double for the whole moderation stack, and a usable
// volatile store for local runs. DashMap entry locks make every operation
// atomic per key, which is exactly the per-document atomicity the gateway
// contract promises.

use crate::core::guild::Guild;
use crate::core::moderation::{CaseStatus, ModerationCase, NewCase};
use crate::core::storage::{CasOutcome, GuildStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub struct InMemoryGuildStore {
    guilds: DashMap<u64, Guild>,
    /// Guild id -> cases ordered by case id; ids are allocated as len + 1
    /// under the entry lock, so they are strictly increasing per guild.
    cases: DashMap<u64, Vec<ModerationCase>>,
    /// (guild id, target id) -> active mute case id.
    active_mutes: DashMap<(u64, u64), u64>,
}

impl InMemoryGuildStore {
    pub fn new() -> Self {
        Self {
            guilds: DashMap::new(),
            cases: DashMap::new(),
            active_mutes: DashMap::new(),
        }
    }
}

impl Default for InMemoryGuildStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GuildStore for InMemoryGuildStore {
    async fn load_guild(&self, guild_id: u64) -> Result<Option<Guild>, StorageError> {
        Ok(self.guilds.get(&guild_id).map(|g| g.clone()))
    }

    async fn save_guild(&self, guild: &Guild) -> Result<(), StorageError> {
        self.guilds.insert(guild.id, guild.clone());
        Ok(())
    }

    async fn create_case(&self, case: NewCase) -> Result<ModerationCase, StorageError> {
        let mut guild_cases = self.cases.entry(case.guild_id).or_default();
        let record = ModerationCase {
            case_id: guild_cases.len() as u64 + 1,
            guild_id: case.guild_id,
            target_id: case.target_id,
            moderator_id: case.moderator_id,
            kind: case.kind,
            reason: case.reason,
            created_at: case.created_at,
            expires_at: case.expires_at,
            status: CaseStatus::Active,
            resolution: None,
        };
        guild_cases.push(record.clone());
        Ok(record)
    }

    async fn fetch_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<Option<ModerationCase>, StorageError> {
        Ok(self
            .cases
            .get(&guild_id)
            .and_then(|cases| cases.iter().find(|c| c.case_id == case_id).cloned()))
    }

    async fn update_case_status(
        &self,
        guild_id: u64,
        case_id: u64,
        expected: CaseStatus,
        new: CaseStatus,
        resolution: Option<String>,
    ) -> Result<CasOutcome, StorageError> {
        let Some(mut guild_cases) = self.cases.get_mut(&guild_id) else {
            return Ok(CasOutcome::Lost);
        };
        let Some(case) = guild_cases.iter_mut().find(|c| c.case_id == case_id) else {
            return Ok(CasOutcome::Lost);
        };

        if case.status != expected {
            return Ok(CasOutcome::Lost);
        }
        case.status = new;
        if resolution.is_some() {
            case.resolution = resolution;
        }
        Ok(CasOutcome::Applied(case.clone()))
    }

    async fn cases_for_target(
        &self,
        guild_id: u64,
        target_id: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, StorageError> {
        let mut matching: Vec<ModerationCase> = self
            .cases
            .get(&guild_id)
            .map(|cases| {
                cases
                    .iter()
                    .filter(|c| c.target_id == target_id && c.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by(|a, b| b.case_id.cmp(&a.case_id));
        Ok(matching)
    }

    async fn list_active_cases_due_before(
        &self,
        ts: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, StorageError> {
        let mut due = Vec::new();
        for guild_cases in self.cases.iter() {
            due.extend(
                guild_cases
                    .iter()
                    .filter(|c| {
                        c.status == CaseStatus::Active
                            && c.expires_at.map(|at| at <= ts).unwrap_or(false)
                    })
                    .cloned(),
            );
        }
        Ok(due)
    }

    async fn swap_active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
        expected: Option<u64>,
        new: Option<u64>,
    ) -> Result<bool, StorageError> {
        let swapped = match self.active_mutes.entry((guild_id, target_id)) {
            Entry::Occupied(mut occupied) => {
                if expected == Some(*occupied.get()) {
                    match new {
                        Some(case_id) => {
                            occupied.insert(case_id);
                        }
                        None => {
                            occupied.remove();
                        }
                    }
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    if let Some(case_id) = new {
                        vacant.insert(case_id);
                    }
                    true
                } else {
                    false
                }
            }
        };
        Ok(swapped)
    }

    async fn active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
    ) -> Result<Option<u64>, StorageError> {
        Ok(self.active_mutes.get(&(guild_id, target_id)).map(|id| *id))
    }
}
