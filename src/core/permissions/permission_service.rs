// Permission evaluator - computes an actor's effective capability set.
//
// Pure set computation over the guild's role table. No I/O, no error cases:
// a role id the guild doesn't know simply contributes nothing.

use crate::core::guild::Guild;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Closed set of permission tags a role can grant.
///
/// Commands name one of these as their required capability; handlers never
/// inspect roles directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CapabilityTag {
    /// Held implicitly by every actor, role or not.
    Everyone,
    /// Warn, mute, unmute, revoke cases, view case history.
    ModerateMembers,
    /// Remove members from the guild.
    KickMembers,
    /// Permanent and temporary bans.
    BanMembers,
    /// Edit guild configuration: policy, role capabilities, command toggles.
    ManageGuild,
}

impl std::fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityTag::Everyone => write!(f, "everyone"),
            CapabilityTag::ModerateMembers => write!(f, "moderate_members"),
            CapabilityTag::KickMembers => write!(f, "kick_members"),
            CapabilityTag::BanMembers => write!(f, "ban_members"),
            CapabilityTag::ManageGuild => write!(f, "manage_guild"),
        }
    }
}

impl CapabilityTag {
    /// Parse a tag from user input (the `rolecap` command).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "everyone" => Some(CapabilityTag::Everyone),
            "moderate_members" | "moderate" => Some(CapabilityTag::ModerateMembers),
            "kick_members" | "kick" => Some(CapabilityTag::KickMembers),
            "ban_members" | "ban" => Some(CapabilityTag::BanMembers),
            "manage_guild" | "manage" => Some(CapabilityTag::ManageGuild),
            _ => None,
        }
    }
}

/// A platform user plus the guild roles they currently hold.
///
/// Rebuilt from each incoming event, never persisted.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: u64,
    pub role_ids: Vec<u64>,
}

impl Actor {
    pub fn new(user_id: u64, role_ids: Vec<u64>) -> Self {
        Self { user_id, role_ids }
    }
}

/// Union of the capability sets of every role the actor holds in this guild,
/// plus the implicit `Everyone` tag.
pub fn capabilities_of(actor: &Actor, guild: &Guild) -> HashSet<CapabilityTag> {
    let mut tags = HashSet::new();
    tags.insert(CapabilityTag::Everyone);

    for role_id in &actor.role_ids {
        if let Some(role) = guild.roles.iter().find(|r| r.id == *role_id) {
            tags.extend(role.capabilities.iter().copied());
        }
    }

    tags
}

/// Highest rank among the actor's held roles, 0 with none.
///
/// Used by moderation handlers: a sanction requires the moderator's best
/// rank to exceed the target's.
pub fn best_rank(actor: &Actor, guild: &Guild) -> u32 {
    actor
        .role_ids
        .iter()
        .filter_map(|id| guild.roles.iter().find(|r| r.id == *id))
        .map(|r| r.rank)
        .max()
        .unwrap_or(0)
}
