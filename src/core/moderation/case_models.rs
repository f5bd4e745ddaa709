// Moderation case records - the durable unit of moderation history.
//
// Case lifecycle: Active -> Expired (timer) or Revoked (explicit reversal).
// Terminal states are final; the only write allowed afterwards is the
// resolution note set by the terminal transition itself.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Moderator identity attached to auto-issued escalation cases.
/// No real platform user carries id 0.
pub const SYSTEM_MODERATOR: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseKind {
    Warn,
    Mute,
    Kick,
    Ban,
}

impl std::fmt::Display for CaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseKind::Warn => write!(f, "warn"),
            CaseKind::Mute => write!(f, "mute"),
            CaseKind::Kick => write!(f, "kick"),
            CaseKind::Ban => write!(f, "ban"),
        }
    }
}

impl CaseKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(CaseKind::Warn),
            "mute" => Some(CaseKind::Mute),
            "kick" => Some(CaseKind::Kick),
            "ban" => Some(CaseKind::Ban),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Active,
    Expired,
    Revoked,
}

impl CaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::Expired | CaseStatus::Revoked)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaseStatus::Active => write!(f, "active"),
            CaseStatus::Expired => write!(f, "expired"),
            CaseStatus::Revoked => write!(f, "revoked"),
        }
    }
}

impl CaseStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CaseStatus::Active),
            "expired" => Some(CaseStatus::Expired),
            "revoked" => Some(CaseStatus::Revoked),
            _ => None,
        }
    }
}

/// A single moderation case. `case_id` is monotonic within its guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationCase {
    pub case_id: u64,
    pub guild_id: u64,
    pub target_id: u64,
    pub moderator_id: u64,
    pub kind: CaseKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    /// None = permanent sanction, never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub status: CaseStatus,
    /// Audit note written at the terminal transition (e.g. who revoked, why).
    pub resolution: Option<String>,
}

impl ModerationCase {
    pub fn is_active(&self) -> bool {
        self.status == CaseStatus::Active
    }
}

/// Fields the case manager supplies; the store allocates the case id.
#[derive(Debug, Clone)]
pub struct NewCase {
    pub guild_id: u64,
    pub target_id: u64,
    pub moderator_id: u64,
    pub kind: CaseKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What one `issue_sanction` call produced.
#[derive(Debug, Clone)]
pub struct SanctionOutcome {
    pub case: ModerationCase,
    /// Prior active mute this sanction revoked (mute supersession).
    pub superseded: Option<ModerationCase>,
    /// Auto-issued escalation case (warn threshold reached).
    pub escalation: Option<ModerationCase>,
}

/// Resolve the effective sanction length: explicit duration wins, otherwise
/// the guild policy default for the kind. Warns and kicks carry no expiry.
pub fn effective_duration(
    kind: CaseKind,
    explicit: Option<Duration>,
    policy: &crate::core::guild::ModerationPolicy,
) -> Option<Duration> {
    match kind {
        CaseKind::Warn | CaseKind::Kick => None,
        CaseKind::Mute => explicit.or(Some(Duration::minutes(policy.default_mute_minutes))),
        CaseKind::Ban => explicit.or(policy.default_ban_days.map(Duration::days)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guild::ModerationPolicy;

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!CaseStatus::Active.is_terminal());
        assert!(CaseStatus::Expired.is_terminal());
        assert!(CaseStatus::Revoked.is_terminal());
    }

    #[test]
    fn mute_duration_falls_back_to_policy_default() {
        let policy = ModerationPolicy::default();

        let explicit = effective_duration(CaseKind::Mute, Some(Duration::minutes(5)), &policy);
        assert_eq!(explicit, Some(Duration::minutes(5)));

        let default = effective_duration(CaseKind::Mute, None, &policy);
        assert_eq!(default, Some(Duration::minutes(60)));
    }

    #[test]
    fn bans_are_permanent_unless_policy_or_moderator_says_otherwise() {
        let mut policy = ModerationPolicy::default();
        assert_eq!(effective_duration(CaseKind::Ban, None, &policy), None);

        policy.default_ban_days = Some(7);
        assert_eq!(
            effective_duration(CaseKind::Ban, None, &policy),
            Some(Duration::days(7))
        );
    }

    #[test]
    fn warns_and_kicks_never_expire() {
        let policy = ModerationPolicy::default();
        assert_eq!(
            effective_duration(CaseKind::Warn, Some(Duration::minutes(5)), &policy),
            None
        );
        assert_eq!(effective_duration(CaseKind::Kick, None, &policy), None);
    }
}
