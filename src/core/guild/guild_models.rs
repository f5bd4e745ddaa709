// Guild domain models - per-guild configuration the bot persists.
//
// One document per served community. Created with defaults on the first
// event from an unknown guild id; only admin commands mutate it afterwards.
// The bot never deletes a guild document.

use crate::core::permissions::CapabilityTag;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A guild role: named capability set plus a trust rank.
///
/// Higher rank means more trusted; moderation handlers refuse to sanction a
/// target whose best rank is equal or higher than the moderator's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: u64,
    pub name: String,
    pub capabilities: HashSet<CapabilityTag>,
    pub rank: u32,
}

/// Escalation thresholds and default sanction durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationPolicy {
    /// Non-revoked warns inside the lookback window that trigger auto-escalation.
    pub warn_threshold: u32,
    /// How far back warns count toward escalation, in days.
    pub lookback_days: i64,
    /// Default mute length when the moderator gives none, in minutes.
    pub default_mute_minutes: i64,
    /// Length of the auto-issued escalation mute, in minutes.
    pub escalation_mute_minutes: i64,
    /// Default temp-ban length in days. None means bans are permanent by default.
    pub default_ban_days: Option<i64>,
}

impl Default for ModerationPolicy {
    fn default() -> Self {
        Self {
            warn_threshold: 3,          // 3 warns...
            lookback_days: 30,          // ...within 30 days
            default_mute_minutes: 60,   // 1 hour mute
            escalation_mute_minutes: 120,
            default_ban_days: None,     // permanent unless a duration is given
        }
    }
}

/// Per-guild configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guild {
    pub id: u64,
    /// Command prefix, e.g. `!warn`.
    pub prefix: String,
    /// Ordered role table, highest-trust roles typically last.
    pub roles: Vec<Role>,
    /// Command name -> enabled. Commands absent from the map are enabled.
    pub command_toggles: HashMap<String, bool>,
    pub policy: ModerationPolicy,
    /// Role granted/removed to enforce mutes. Unset disables role enforcement
    /// (cases are still recorded).
    pub mute_role_id: Option<u64>,
    /// Channel that receives expiry notices and moderation log lines.
    pub log_channel_id: Option<u64>,
}

impl Guild {
    /// Fresh guild document with default policy and prefix.
    pub fn with_defaults(id: u64) -> Self {
        Self {
            id,
            prefix: "!".to_string(),
            roles: Vec::new(),
            command_toggles: HashMap::new(),
            policy: ModerationPolicy::default(),
            mute_role_id: None,
            log_channel_id: None,
        }
    }

    /// Whether a command is enabled here. Unlisted commands are enabled.
    pub fn command_enabled(&self, name: &str) -> bool {
        self.command_toggles.get(name).copied().unwrap_or(true)
    }

    pub fn role_mut(&mut self, role_id: u64) -> Option<&mut Role> {
        self.roles.iter_mut().find(|r| r.id == role_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_default_to_enabled() {
        let mut guild = Guild::with_defaults(1);
        assert!(guild.command_enabled("warn"));

        guild.command_toggles.insert("warn".to_string(), false);
        assert!(!guild.command_enabled("warn"));

        guild.command_toggles.insert("warn".to_string(), true);
        assert!(guild.command_enabled("warn"));
    }

    #[test]
    fn guild_document_round_trips_through_json() {
        let mut guild = Guild::with_defaults(42);
        guild.roles.push(Role {
            id: 7,
            name: "Mod".to_string(),
            capabilities: [CapabilityTag::ModerateMembers].into_iter().collect(),
            rank: 10,
        });
        guild.mute_role_id = Some(99);

        let json = serde_json::to_string(&guild).unwrap();
        let back: Guild = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, 42);
        assert_eq!(back.roles.len(), 1);
        assert_eq!(back.mute_role_id, Some(99));
        assert_eq!(back.policy.warn_threshold, 3);
    }
}
