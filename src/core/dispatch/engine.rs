// The engine ties ingress, router and case manager together.
//
// `handle` is the single entry point for normalized events and never
// propagates an error outward: every failure either becomes a user-visible
// reply or a log line. The expiry cycle runs here too, so the timer and the
// command path share one case-mutation code path.

use super::event_models::{Event, EventKind};
use crate::core::commands::{CommandRouter, DispatchError, HandlerEnv, HandlerError};
use crate::core::guild::Guild;
use crate::core::moderation::{CaseError, CaseKind, CaseService, ModerationCase};
use crate::core::outbound::{ActionSink, RoleChange};
use crate::core::storage::{GuildStore, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct Engine<S: GuildStore, A: ActionSink> {
    router: CommandRouter<S, A>,
    env: HandlerEnv<S, A>,
}

impl<S: GuildStore, A: ActionSink> Engine<S, A> {
    pub fn new(router: CommandRouter<S, A>, store: Arc<S>, sink: Arc<A>) -> Self {
        Self {
            router,
            env: HandlerEnv {
                cases: CaseService::new(store.clone()),
                store,
                sink,
            },
        }
    }

    /// Process one event. Failures are converted to replies or logs; this
    /// never returns an error to the gateway.
    pub async fn handle(&self, event: Event) {
        let guild = match self.ensure_guild(event.guild_id).await {
            Ok(guild) => guild,
            Err(err) => {
                tracing::error!(guild_id = event.guild_id, error = %err, "could not load guild, dropping event");
                return;
            }
        };

        match event.kind {
            EventKind::Message {
                channel_id,
                content,
                mentioned,
            } => {
                let result = self
                    .router
                    .dispatch(
                        &self.env,
                        &guild,
                        &event.actor,
                        &mentioned,
                        channel_id,
                        &content,
                        Utc::now(),
                    )
                    .await;

                match result {
                    Ok(Some(reply)) => self.say(&guild, channel_id, &reply).await,
                    Ok(None) => {}
                    Err(err) => {
                        self.report_dispatch_error(&guild, channel_id, err).await;
                    }
                }
            }
            EventKind::MemberJoin => {
                tracing::debug!(guild_id = guild.id, user_id = event.actor.user_id, "member joined");
            }
        }
    }

    /// Load the guild, creating the default document on first sight.
    async fn ensure_guild(&self, guild_id: u64) -> Result<Guild, StorageError> {
        if let Some(guild) = self.env.store.load_guild(guild_id).await? {
            return Ok(guild);
        }
        let guild = Guild::with_defaults(guild_id);
        self.env.store.save_guild(&guild).await?;
        tracing::info!(guild_id, "new guild bootstrapped with default configuration");
        Ok(guild)
    }

    async fn say(&self, guild: &Guild, channel_id: u64, text: &str) {
        if let Err(err) = self.env.sink.send_message(guild.id, channel_id, text).await {
            tracing::warn!(guild_id = guild.id, channel_id, error = %err, "reply could not be delivered");
        }
    }

    /// Decide what each dispatch failure looks like from the invoking
    /// channel: silent drop, user reply, or log-only.
    async fn report_dispatch_error(&self, guild: &Guild, channel_id: u64, err: DispatchError) {
        let reply = match &err {
            DispatchError::UnknownCommand(name) => {
                tracing::debug!(guild_id = guild.id, command = %name, "unknown command ignored");
                None
            }
            DispatchError::CommandDisabled(name) => {
                tracing::debug!(guild_id = guild.id, command = name, "disabled command ignored");
                None
            }
            DispatchError::RateLimited(name) => {
                tracing::debug!(guild_id = guild.id, command = name, "command shed by rate limiter");
                None
            }
            DispatchError::PermissionDenied { command, required } => Some(format!(
                "You need the `{required}` capability to use `{command}`."
            )),
            DispatchError::Argument {
                param,
                message,
                usage,
            } => Some(format!(
                "Invalid `{param}`: {message}. Usage: `{}{usage}`",
                guild.prefix
            )),
            DispatchError::HandlerTimeout(name) => {
                tracing::error!(guild_id = guild.id, command = name, "handler aborted: execution budget exceeded");
                None
            }
            DispatchError::Handler(handler_err) => match handler_err {
                HandlerError::Case(CaseError::NotFound(id)) => {
                    Some(format!("Case #{id} does not exist."))
                }
                HandlerError::Case(CaseError::NotActive(id)) => {
                    Some(format!("Case #{id} is not active."))
                }
                HandlerError::Case(CaseError::StorageUnavailable(_))
                | HandlerError::Storage(_) => {
                    tracing::error!(guild_id = guild.id, error = %handler_err, "storage failure surfaced to user as generic error");
                    Some("Something went wrong while saving; nothing was changed. Try again later.".to_string())
                }
                HandlerError::Denied(text) | HandlerError::Invalid(text) => Some(text.clone()),
                HandlerError::Sink(_) => {
                    tracing::error!(guild_id = guild.id, error = %handler_err, "platform action failed");
                    Some("The platform rejected that action.".to_string())
                }
            },
        };

        if let Some(text) = reply {
            self.say(guild, channel_id, &text).await;
        }
    }

    /// Expire due cases and emit their reversal actions. Called from the
    /// periodic timer in the composition root; shares the CAS mutation path
    /// with `revoke`, so racing the command path is safe.
    pub async fn run_expiry_cycle(&self, now: DateTime<Utc>) -> usize {
        let expired = match self.env.cases.expire_due_cases(now).await {
            Ok(expired) => expired,
            Err(err) => {
                tracing::error!(error = %err, "expiry cycle failed");
                return 0;
            }
        };

        let count = expired.len();
        for case in expired {
            self.reverse_expired_case(&case).await;
        }
        count
    }

    async fn reverse_expired_case(&self, case: &ModerationCase) {
        let guild = match self.env.store.load_guild(case.guild_id).await {
            Ok(Some(guild)) => guild,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(guild_id = case.guild_id, case_id = case.case_id, error = %err, "could not load guild for expiry reversal");
                return;
            }
        };

        match case.kind {
            CaseKind::Mute => {
                if let Some(role_id) = guild.mute_role_id {
                    if let Err(err) = self
                        .env
                        .sink
                        .apply_role_change(guild.id, case.target_id, role_id, RoleChange::Remove)
                        .await
                    {
                        tracing::warn!(guild_id = guild.id, case_id = case.case_id, error = %err, "expired mute could not be lifted");
                    }
                }
            }
            // The sink has no unban operation; expired bans are only
            // reported so moderators can lift them with platform tooling.
            CaseKind::Ban | CaseKind::Warn | CaseKind::Kick => {}
        }

        if let Some(channel_id) = guild.log_channel_id {
            let note = format!(
                "Case #{} ({} against <@{}>) expired.",
                case.case_id, case.kind, case.target_id
            );
            self.say(&guild, channel_id, &note).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::{AuditRecord, AuditSink};
    use crate::core::commands::build_registry;
    use crate::core::guild::Role;
    use crate::core::outbound::SinkError;
    use crate::core::permissions::{Actor, CapabilityTag};
    use crate::infra::storage::memory_store::InMemoryGuildStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<(u64, u64, String)>>,
        role_changes: Mutex<Vec<(u64, u64, u64, RoleChange)>>,
    }

    #[async_trait]
    impl ActionSink for RecordingSink {
        async fn send_message(
            &self,
            guild_id: u64,
            channel_id: u64,
            text: &str,
        ) -> Result<(), SinkError> {
            self.messages
                .lock()
                .unwrap()
                .push((guild_id, channel_id, text.to_string()));
            Ok(())
        }

        async fn apply_role_change(
            &self,
            guild_id: u64,
            user_id: u64,
            role_id: u64,
            change: RoleChange,
        ) -> Result<(), SinkError> {
            self.role_changes
                .lock()
                .unwrap()
                .push((guild_id, user_id, role_id, change));
            Ok(())
        }

        async fn remove_member(&self, _: u64, _: u64) -> Result<(), SinkError> {
            Ok(())
        }
    }

    struct NullAudit;

    impl AuditSink for NullAudit {
        fn record(&self, _: AuditRecord) {}
    }

    struct Fixture {
        engine: Engine<InMemoryGuildStore, RecordingSink>,
        store: Arc<InMemoryGuildStore>,
        sink: Arc<RecordingSink>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryGuildStore::new());
        let sink = Arc::new(RecordingSink::default());

        let mut guild = Guild::with_defaults(1);
        guild.mute_role_id = Some(777);
        guild.roles = vec![Role {
            id: 10,
            name: "Mod".to_string(),
            capabilities: [CapabilityTag::ModerateMembers].into_iter().collect(),
            rank: 50,
        }];
        store.save_guild(&guild).await.unwrap();

        let router = CommandRouter::new(build_registry().unwrap(), Arc::new(NullAudit));
        let engine = Engine::new(router, store.clone(), sink.clone());

        Fixture {
            engine,
            store,
            sink,
        }
    }

    fn message(actor: Actor, content: &str) -> Event {
        Event {
            guild_id: 1,
            actor,
            kind: EventKind::Message {
                channel_id: 42,
                content: content.to_string(),
                mentioned: Vec::new(),
            },
        }
    }

    fn sent(fx: &Fixture) -> Vec<String> {
        fx.sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, text)| text.clone())
            .collect()
    }

    #[tokio::test]
    async fn mute_without_capability_is_denied_and_creates_no_case() {
        let fx = fixture().await;
        fx.engine
            .handle(message(Actor::new(5, vec![]), "!mute <@50> 10m spam"))
            .await;

        let messages = sent(&fx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("capability"));

        let history = fx
            .store
            .cases_for_target(1, 50, DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn unknown_command_is_silently_dropped() {
        let fx = fixture().await;
        fx.engine
            .handle(message(Actor::new(5, vec![]), "!bogus stuff"))
            .await;
        assert!(sent(&fx).is_empty());
    }

    #[tokio::test]
    async fn argument_error_replies_with_usage() {
        let fx = fixture().await;
        fx.engine
            .handle(message(Actor::new(9, vec![10]), "!warn notauser hi"))
            .await;

        let messages = sent(&fx);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("Invalid `user`"));
        assert!(messages[0].contains("Usage: `!warn <user> <reason>`"));
    }

    #[tokio::test]
    async fn three_warns_escalate_to_exactly_one_active_mute() {
        let fx = fixture().await;
        let moderator = Actor::new(9, vec![10]);

        for i in 0..3 {
            fx.engine
                .handle(message(moderator.clone(), &format!("!warn <@50> strike {i}")))
                .await;
        }

        let history = fx
            .store
            .cases_for_target(1, 50, DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(history.len(), 4); // 3 warns + 1 escalation mute

        let active_mutes: Vec<_> = history
            .iter()
            .filter(|c| c.kind == CaseKind::Mute && c.is_active())
            .collect();
        assert_eq!(active_mutes.len(), 1);

        // The escalation enforced the mute role.
        let changes = fx.sink.role_changes.lock().unwrap();
        assert_eq!(changes.last().unwrap(), &(1, 50, 777, RoleChange::Grant));
    }

    #[tokio::test]
    async fn first_event_bootstraps_an_unknown_guild() {
        let fx = fixture().await;
        let event = Event {
            guild_id: 999,
            actor: Actor::new(5, vec![]),
            kind: EventKind::MemberJoin,
        };
        fx.engine.handle(event).await;

        let guild = fx.store.load_guild(999).await.unwrap().unwrap();
        assert_eq!(guild.prefix, "!");
    }

    #[tokio::test]
    async fn expiry_cycle_lifts_mute_roles_and_is_idempotent() {
        let fx = fixture().await;
        let moderator = Actor::new(9, vec![10]);
        fx.engine
            .handle(message(moderator, "!mute <@50> 10m quiet time"))
            .await;

        let now = Utc::now() + Duration::minutes(11);
        assert_eq!(fx.engine.run_expiry_cycle(now).await, 1);
        assert_eq!(fx.engine.run_expiry_cycle(now).await, 0);

        let changes = fx.sink.role_changes.lock().unwrap();
        assert_eq!(changes.last().unwrap(), &(1, 50, 777, RoleChange::Remove));
    }
}
