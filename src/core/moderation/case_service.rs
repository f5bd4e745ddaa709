// Moderation case manager - the stateful core.
//
// Owns every case mutation in the system:
// - issue_sanction (with mute supersession and warn escalation)
// - revoke / revoke_active_mute
// - expire_due_cases (periodic timer calls this, same CAS path as revoke)
//
// Consistency rules:
// - A case status change is always a compare-and-swap on the expected
//   status; a lost CAS is a no-op, never a blind overwrite.
// - "Which mute is active" is owned by the per-target active-mute pointer
//   (swap_active_mute), not by scanning case records. The store gives no
//   multi-document transactions, so the pointer is claimed and released
//   with CAS loops.
// - Transient storage errors are retried a bounded number of times with
//   jittered backoff; exhaustion surfaces StorageUnavailable and the
//   operation is abandoned without partial state.

use super::case_models::{
    effective_duration, CaseKind, CaseStatus, ModerationCase, NewCase, SanctionOutcome,
    SYSTEM_MODERATOR,
};
use crate::core::guild::Guild;
use crate::core::storage::{CasOutcome, GuildStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Attempts per storage write before giving up on a transient failure.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between retries; doubled per attempt, plus jitter.
const BACKOFF_BASE_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum CaseError {
    #[error("case #{0} does not exist")]
    NotFound(u64),

    #[error("case #{0} is not active")]
    NotActive(u64),

    /// Retries exhausted or a permanent backend failure. The command layer
    /// reports a generic failure to the invoking user.
    #[error("storage unavailable")]
    StorageUnavailable(#[source] StorageError),
}

pub struct CaseService<S: GuildStore> {
    store: Arc<S>,
}

impl<S: GuildStore> CaseService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Run a storage operation, retrying transient failures with backoff.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, CaseError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..BACKOFF_BASE_MS);
                    let backoff = BACKOFF_BASE_MS * (1 << attempt) + jitter;
                    tracing::warn!(attempt, backoff_ms = backoff, error = %err, "transient storage error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "storage operation failed");
                    return Err(CaseError::StorageUnavailable(err));
                }
            }
        }
    }

    /// Issue a sanction against a target, creating its case record.
    ///
    /// Mutes supersede any active mute for the target (the prior case is
    /// revoked before the new one exists, so no observation point sees two
    /// active mutes). A warn that reaches the policy threshold auto-issues
    /// the escalation mute as a second case attributed to the system
    /// moderator, in the same logical operation.
    pub async fn issue_sanction(
        &self,
        guild: &Guild,
        target_id: u64,
        moderator_id: u64,
        kind: CaseKind,
        reason: &str,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<SanctionOutcome, CaseError> {
        let (case, superseded) = self
            .create_sanction(guild, target_id, moderator_id, kind, reason, duration, now)
            .await?;

        let escalation = if kind == CaseKind::Warn {
            self.maybe_escalate(guild, target_id, now).await?
        } else {
            None
        };

        Ok(SanctionOutcome {
            case,
            superseded,
            escalation,
        })
    }

    /// Case creation without the escalation step. Shared by direct sanctions
    /// and the auto-issued escalation mute.
    async fn create_sanction(
        &self,
        guild: &Guild,
        target_id: u64,
        moderator_id: u64,
        kind: CaseKind,
        reason: &str,
        duration: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<(ModerationCase, Option<ModerationCase>), CaseError> {
        let expires_at = effective_duration(kind, duration, &guild.policy).map(|d| now + d);

        // Release any active mute before this case exists, so there is never
        // a moment with two active mute cases for the target.
        let mut superseded = None;
        if kind == CaseKind::Mute {
            superseded = self
                .release_active_mute(guild.id, target_id, "superseded by a newer mute")
                .await?;
        }

        let new_case = NewCase {
            guild_id: guild.id,
            target_id,
            moderator_id,
            kind,
            reason: reason.to_string(),
            created_at: now,
            expires_at,
        };
        let case = self
            .with_retry(|| self.store.create_case(new_case.clone()))
            .await?;

        if kind == CaseKind::Mute {
            // Claim the pointer. A concurrent mute may have claimed it since
            // the release above; whoever lands last owns it, earlier claims
            // get revoked on the way.
            loop {
                let claimed = self
                    .with_retry(|| {
                        self.store
                            .swap_active_mute(guild.id, target_id, None, Some(case.case_id))
                    })
                    .await?;
                if claimed {
                    break;
                }
                if let Some(prior) = self
                    .release_active_mute(guild.id, target_id, "superseded by a newer mute")
                    .await?
                {
                    superseded = Some(prior);
                }
            }
        }

        tracing::info!(
            guild_id = guild.id,
            case_id = case.case_id,
            target_id,
            moderator_id,
            kind = %kind,
            "moderation case created"
        );

        Ok((case, superseded))
    }

    /// Revoke whatever mute the active-mute pointer names and clear the
    /// pointer. Returns the revoked case, or None if there was nothing to
    /// release (or a concurrent writer already made it terminal).
    async fn release_active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
        resolution: &str,
    ) -> Result<Option<ModerationCase>, CaseError> {
        loop {
            let current = self
                .with_retry(|| self.store.active_mute(guild_id, target_id))
                .await?;
            let Some(old_id) = current else {
                return Ok(None);
            };

            // A lost CAS here means expiry or another revoke got the case
            // first; the pointer still needs clearing either way.
            let revoked = match self
                .with_retry(|| {
                    self.store.update_case_status(
                        guild_id,
                        old_id,
                        CaseStatus::Active,
                        CaseStatus::Revoked,
                        Some(resolution.to_string()),
                    )
                })
                .await?
            {
                CasOutcome::Applied(case) => Some(case),
                CasOutcome::Lost => None,
            };

            let cleared = self
                .with_retry(|| {
                    self.store
                        .swap_active_mute(guild_id, target_id, current, None)
                })
                .await?;
            if cleared {
                return Ok(revoked);
            }
            // Pointer moved underneath us; take another look.
        }
    }

    /// Explicit reversal of a case by id.
    pub async fn revoke(
        &self,
        guild_id: u64,
        case_id: u64,
        revoked_by: u64,
        reason: &str,
    ) -> Result<ModerationCase, CaseError> {
        if self
            .with_retry(|| self.store.fetch_case(guild_id, case_id))
            .await?
            .is_none()
        {
            return Err(CaseError::NotFound(case_id));
        }

        let resolution = if reason.is_empty() {
            format!("revoked by {revoked_by}")
        } else {
            format!("revoked by {revoked_by}: {reason}")
        };

        match self
            .with_retry(|| {
                self.store.update_case_status(
                    guild_id,
                    case_id,
                    CaseStatus::Active,
                    CaseStatus::Revoked,
                    Some(resolution.clone()),
                )
            })
            .await?
        {
            CasOutcome::Applied(case) => {
                if case.kind == CaseKind::Mute {
                    // Best-effort pointer clear; a newer mute owning the
                    // pointer makes this a no-op.
                    self.with_retry(|| {
                        self.store.swap_active_mute(
                            guild_id,
                            case.target_id,
                            Some(case_id),
                            None,
                        )
                    })
                    .await?;
                }
                Ok(case)
            }
            CasOutcome::Lost => Err(CaseError::NotActive(case_id)),
        }
    }

    /// Unmute: revoke the target's active mute, if any.
    pub async fn revoke_active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
        revoked_by: u64,
    ) -> Result<Option<ModerationCase>, CaseError> {
        self.release_active_mute(guild_id, target_id, &format!("unmuted by {revoked_by}"))
            .await
    }

    /// Transition every active case with expiry <= now to Expired and return
    /// the cases this call transitioned. Idempotent: a case another caller
    /// (or a concurrent revoke) already made terminal loses the CAS and is
    /// skipped, so a repeat call with the same `now` returns nothing.
    pub async fn expire_due_cases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, CaseError> {
        let due = self
            .with_retry(|| self.store.list_active_cases_due_before(now))
            .await?;

        let mut expired = Vec::new();
        for case in due {
            let outcome = self
                .with_retry(|| {
                    self.store.update_case_status(
                        case.guild_id,
                        case.case_id,
                        CaseStatus::Active,
                        CaseStatus::Expired,
                        Some("sanction period elapsed".to_string()),
                    )
                })
                .await?;

            match outcome {
                CasOutcome::Applied(expired_case) => {
                    if expired_case.kind == CaseKind::Mute {
                        self.with_retry(|| {
                            self.store.swap_active_mute(
                                expired_case.guild_id,
                                expired_case.target_id,
                                Some(expired_case.case_id),
                                None,
                            )
                        })
                        .await?;
                    }
                    expired.push(expired_case);
                }
                CasOutcome::Lost => {
                    tracing::debug!(
                        guild_id = case.guild_id,
                        case_id = case.case_id,
                        "expiry lost the status race, skipping"
                    );
                }
            }
        }

        Ok(expired)
    }

    /// Case history for a target, newest first.
    pub async fn history(
        &self,
        guild_id: u64,
        target_id: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, CaseError> {
        self.with_retry(|| self.store.cases_for_target(guild_id, target_id, since))
            .await
    }

    pub async fn get_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<ModerationCase, CaseError> {
        self.with_retry(|| self.store.fetch_case(guild_id, case_id))
            .await?
            .ok_or(CaseError::NotFound(case_id))
    }

    /// Auto-issue the escalation mute when the target's non-revoked warn
    /// count inside the lookback window lands exactly on the threshold.
    /// Escalation only ever looks at this guild's history.
    async fn maybe_escalate(
        &self,
        guild: &Guild,
        target_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<ModerationCase>, CaseError> {
        let policy = &guild.policy;
        if policy.warn_threshold == 0 {
            return Ok(None);
        }

        let since = now - Duration::days(policy.lookback_days);
        let history = self
            .with_retry(|| self.store.cases_for_target(guild.id, target_id, since))
            .await?;

        let warn_count = history
            .iter()
            .filter(|c| c.kind == CaseKind::Warn && c.status != CaseStatus::Revoked)
            .count() as u32;

        if warn_count != policy.warn_threshold {
            return Ok(None);
        }

        let reason = format!("escalation: {} warnings within {} days", warn_count, policy.lookback_days);
        let (case, _) = self
            .create_sanction(
                guild,
                target_id,
                SYSTEM_MODERATOR,
                CaseKind::Mute,
                &reason,
                Some(Duration::minutes(policy.escalation_mute_minutes)),
                now,
            )
            .await?;

        tracing::info!(
            guild_id = guild.id,
            target_id,
            case_id = case.case_id,
            "warn threshold reached, escalation mute issued"
        );

        Ok(Some(case))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::storage::memory_store::InMemoryGuildStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service() -> (CaseService<InMemoryGuildStore>, Guild) {
        let store = Arc::new(InMemoryGuildStore::new());
        (CaseService::new(store), Guild::with_defaults(1))
    }

    async fn active_mute_cases(
        svc: &CaseService<InMemoryGuildStore>,
        guild_id: u64,
        target: u64,
    ) -> Vec<ModerationCase> {
        svc.history(guild_id, target, DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.kind == CaseKind::Mute && c.is_active())
            .collect()
    }

    #[tokio::test]
    async fn case_ids_are_monotonic_per_guild() {
        let (svc, guild) = service();
        let now = Utc::now();

        let mut last = 0;
        for _ in 0..4 {
            let outcome = svc
                .issue_sanction(&guild, 50, 9, CaseKind::Kick, "spam", None, now)
                .await
                .unwrap();
            assert!(outcome.case.case_id > last);
            last = outcome.case.case_id;
        }
    }

    #[tokio::test]
    async fn new_mute_supersedes_the_active_one() {
        let (svc, guild) = service();
        let now = Utc::now();

        let first = svc
            .issue_sanction(&guild, 50, 9, CaseKind::Mute, "first", None, now)
            .await
            .unwrap();
        assert!(first.superseded.is_none());

        let second = svc
            .issue_sanction(&guild, 50, 9, CaseKind::Mute, "second", None, now)
            .await
            .unwrap();

        let superseded = second.superseded.expect("prior mute should be revoked");
        assert_eq!(superseded.case_id, first.case.case_id);
        assert_eq!(superseded.status, CaseStatus::Revoked);

        let actives = active_mute_cases(&svc, guild.id, 50).await;
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].case_id, second.case.case_id);
    }

    #[tokio::test]
    async fn repeated_mutes_leave_exactly_one_active() {
        let (svc, guild) = service();
        let now = Utc::now();

        for i in 0..5 {
            svc.issue_sanction(&guild, 50, 9, CaseKind::Mute, &format!("m{i}"), None, now)
                .await
                .unwrap();
            assert_eq!(active_mute_cases(&svc, guild.id, 50).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn expire_due_cases_is_idempotent() {
        let (svc, guild) = service();
        let now = Utc::now();

        svc.issue_sanction(
            &guild,
            50,
            9,
            CaseKind::Mute,
            "short",
            Some(Duration::minutes(10)),
            now,
        )
        .await
        .unwrap();

        let later = now + Duration::minutes(11);
        let first_pass = svc.expire_due_cases(later).await.unwrap();
        assert_eq!(first_pass.len(), 1);
        assert_eq!(first_pass[0].status, CaseStatus::Expired);

        let second_pass = svc.expire_due_cases(later).await.unwrap();
        assert!(second_pass.is_empty());
    }

    #[tokio::test]
    async fn expiry_skips_permanent_and_future_cases() {
        let (svc, guild) = service();
        let now = Utc::now();

        svc.issue_sanction(&guild, 50, 9, CaseKind::Ban, "permanent", None, now)
            .await
            .unwrap();
        svc.issue_sanction(
            &guild,
            51,
            9,
            CaseKind::Mute,
            "long",
            Some(Duration::hours(5)),
            now,
        )
        .await
        .unwrap();

        let expired = svc.expire_due_cases(now + Duration::minutes(1)).await.unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn revoke_on_terminal_case_is_rejected_and_harmless() {
        let (svc, guild) = service();
        let now = Utc::now();

        let outcome = svc
            .issue_sanction(&guild, 50, 9, CaseKind::Warn, "rude", None, now)
            .await
            .unwrap();
        let id = outcome.case.case_id;

        let revoked = svc.revoke(guild.id, id, 9, "appealed").await.unwrap();
        assert_eq!(revoked.status, CaseStatus::Revoked);

        let err = svc.revoke(guild.id, id, 9, "again").await.unwrap_err();
        assert!(matches!(err, CaseError::NotActive(i) if i == id));

        // Record unchanged by the failed second revoke.
        let case = svc.get_case(guild.id, id).await.unwrap();
        assert_eq!(case.status, CaseStatus::Revoked);
        assert_eq!(case.resolution.as_deref(), Some("revoked by 9: appealed"));
    }

    #[tokio::test]
    async fn revoke_unknown_case_reports_not_found() {
        let (svc, guild) = service();
        let err = svc.revoke(guild.id, 777, 9, "").await.unwrap_err();
        assert!(matches!(err, CaseError::NotFound(777)));
    }

    #[tokio::test]
    async fn third_warn_triggers_exactly_one_escalation_mute() {
        let (svc, guild) = service();
        let now = Utc::now();

        for i in 0..3 {
            let outcome = svc
                .issue_sanction(&guild, 50, 9, CaseKind::Warn, &format!("w{i}"), None, now)
                .await
                .unwrap();
            if i < 2 {
                assert!(outcome.escalation.is_none());
            } else {
                let esc = outcome.escalation.expect("third warn escalates");
                assert_eq!(esc.kind, CaseKind::Mute);
                assert_eq!(esc.moderator_id, SYSTEM_MODERATOR);
            }
        }

        let all = svc
            .history(guild.id, 50, DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(all.len(), 4); // 3 warns + 1 escalation mute

        let actives = active_mute_cases(&svc, guild.id, 50).await;
        assert_eq!(actives.len(), 1);
    }

    #[tokio::test]
    async fn warns_past_the_threshold_do_not_re_escalate() {
        let (svc, guild) = service();
        let now = Utc::now();

        for i in 0..4 {
            svc.issue_sanction(&guild, 50, 9, CaseKind::Warn, &format!("w{i}"), None, now)
                .await
                .unwrap();
        }

        let all = svc
            .history(guild.id, 50, DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        // 4 warns + the single escalation from warn #3.
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn revoked_warns_do_not_count_toward_escalation() {
        let (svc, guild) = service();
        let now = Utc::now();

        let first = svc
            .issue_sanction(&guild, 50, 9, CaseKind::Warn, "w0", None, now)
            .await
            .unwrap();
        svc.revoke(guild.id, first.case.case_id, 9, "mistake")
            .await
            .unwrap();

        for i in 1..3 {
            let outcome = svc
                .issue_sanction(&guild, 50, 9, CaseKind::Warn, &format!("w{i}"), None, now)
                .await
                .unwrap();
            assert!(outcome.escalation.is_none());
        }
    }

    #[tokio::test]
    async fn escalation_ignores_other_guilds() {
        let store = Arc::new(InMemoryGuildStore::new());
        let svc = CaseService::new(store);
        let guild_a = Guild::with_defaults(1);
        let guild_b = Guild::with_defaults(2);
        let now = Utc::now();

        for i in 0..2 {
            svc.issue_sanction(&guild_a, 50, 9, CaseKind::Warn, &format!("a{i}"), None, now)
                .await
                .unwrap();
        }
        // Third warn for the same target, but in another guild: no escalation.
        let outcome = svc
            .issue_sanction(&guild_b, 50, 9, CaseKind::Warn, "b0", None, now)
            .await
            .unwrap();
        assert!(outcome.escalation.is_none());
    }

    // Store wrapper that fails the first N calls with a transient error,
    // then delegates. Exercises the retry path without a real backend.
    struct FlakyStore {
        inner: InMemoryGuildStore,
        failures_left: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryGuildStore::new(),
                failures_left: AtomicU32::new(failures),
            }
        }

        fn trip(&self) -> Result<(), StorageError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err(StorageError::Unavailable("injected outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl GuildStore for FlakyStore {
        async fn load_guild(&self, guild_id: u64) -> Result<Option<Guild>, StorageError> {
            self.trip()?;
            self.inner.load_guild(guild_id).await
        }

        async fn save_guild(&self, guild: &Guild) -> Result<(), StorageError> {
            self.trip()?;
            self.inner.save_guild(guild).await
        }

        async fn create_case(&self, case: NewCase) -> Result<ModerationCase, StorageError> {
            self.trip()?;
            self.inner.create_case(case).await
        }

        async fn fetch_case(
            &self,
            guild_id: u64,
            case_id: u64,
        ) -> Result<Option<ModerationCase>, StorageError> {
            self.trip()?;
            self.inner.fetch_case(guild_id, case_id).await
        }

        async fn update_case_status(
            &self,
            guild_id: u64,
            case_id: u64,
            expected: CaseStatus,
            new: CaseStatus,
            resolution: Option<String>,
        ) -> Result<CasOutcome, StorageError> {
            self.trip()?;
            self.inner
                .update_case_status(guild_id, case_id, expected, new, resolution)
                .await
        }

        async fn cases_for_target(
            &self,
            guild_id: u64,
            target_id: u64,
            since: DateTime<Utc>,
        ) -> Result<Vec<ModerationCase>, StorageError> {
            self.trip()?;
            self.inner.cases_for_target(guild_id, target_id, since).await
        }

        async fn list_active_cases_due_before(
            &self,
            ts: DateTime<Utc>,
        ) -> Result<Vec<ModerationCase>, StorageError> {
            self.trip()?;
            self.inner.list_active_cases_due_before(ts).await
        }

        async fn swap_active_mute(
            &self,
            guild_id: u64,
            target_id: u64,
            expected: Option<u64>,
            new: Option<u64>,
        ) -> Result<bool, StorageError> {
            self.trip()?;
            self.inner
                .swap_active_mute(guild_id, target_id, expected, new)
                .await
        }

        async fn active_mute(
            &self,
            guild_id: u64,
            target_id: u64,
        ) -> Result<Option<u64>, StorageError> {
            self.trip()?;
            self.inner.active_mute(guild_id, target_id).await
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let store = Arc::new(FlakyStore::new(2));
        let svc = CaseService::new(store);
        let guild = Guild::with_defaults(1);

        let outcome = svc
            .issue_sanction(&guild, 50, 9, CaseKind::Warn, "w", None, Utc::now())
            .await
            .unwrap();
        assert!(outcome.case.is_active());
    }

    #[tokio::test]
    async fn exhausted_retries_surface_storage_unavailable() {
        // More consecutive failures than the retry budget of any single op.
        let store = Arc::new(FlakyStore::new(50));
        let svc = CaseService::new(store.clone());
        let guild = Guild::with_defaults(1);

        let err = svc
            .issue_sanction(&guild, 50, 9, CaseKind::Warn, "w", None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CaseError::StorageUnavailable(_)));

        // All-or-nothing: no case record was half-written.
        store.failures_left.store(0, Ordering::SeqCst);
        let history = svc
            .history(guild.id, 50, DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert!(history.is_empty());
    }
}
