// Command registry and router.
//
// The registry is filled once at process start and immutable afterwards.
// Dispatch applies the guard chain in a fixed, documented order:
//
//   parse -> unknown? -> disabled? -> rate limit -> permission -> arguments
//         -> handler (under the execution budget)
//
// Rate limiting runs before the permission lookup so floods are shed with
// one bucket probe instead of a role-table walk. Every successful dispatch
// emits one audit record; emission never blocks or fails dispatch.

use super::command_models::{
    coerce_args, parse_invocation, Args, CommandSpec, DispatchError, DuplicateCommandError,
    HandlerError,
};
use crate::core::audit::{AuditRecord, AuditSink};
use crate::core::guild::Guild;
use crate::core::moderation::CaseService;
use crate::core::outbound::ActionSink;
use crate::core::permissions::{capabilities_of, Actor};
use crate::core::ratelimit::RateLimiter;
use crate::core::storage::GuildStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// How long a handler (including its storage calls) may run before the
/// router aborts it.
pub const DEFAULT_EXECUTION_BUDGET: std::time::Duration = std::time::Duration::from_secs(10);

/// Long-lived collaborators handlers work against.
pub struct HandlerEnv<S: GuildStore, A: ActionSink> {
    pub store: Arc<S>,
    pub cases: CaseService<S>,
    pub sink: Arc<A>,
}

/// Per-dispatch view a handler receives.
pub struct HandlerContext<'a, S: GuildStore, A: ActionSink> {
    pub guild: &'a Guild,
    pub actor: &'a Actor,
    /// Actors mentioned in the triggering message, with their held roles.
    pub mentioned: &'a [Actor],
    pub channel_id: u64,
    pub now: DateTime<Utc>,
    pub env: &'a HandlerEnv<S, A>,
    pub registry: &'a CommandRegistry<S, A>,
}

impl<'a, S: GuildStore, A: ActionSink> HandlerContext<'a, S, A> {
    pub fn cases(&self) -> &CaseService<S> {
        &self.env.cases
    }

    pub fn store(&self) -> &S {
        &self.env.store
    }

    pub fn sink(&self) -> &A {
        &self.env.sink
    }
}

/// A command implementation. Returns the reply text for the invoking
/// channel, or None for silent success.
#[async_trait]
pub trait CommandHandler<S: GuildStore, A: ActionSink>: Send + Sync {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError>;
}

pub struct RegisteredCommand<S: GuildStore, A: ActionSink> {
    pub spec: CommandSpec,
    handler: Box<dyn CommandHandler<S, A>>,
}

pub struct CommandRegistry<S: GuildStore, A: ActionSink> {
    commands: HashMap<&'static str, RegisteredCommand<S, A>>,
}

impl<S: GuildStore, A: ActionSink> CommandRegistry<S, A> {
    pub fn new() -> Self {
        Self {
            commands: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        spec: CommandSpec,
        handler: Box<dyn CommandHandler<S, A>>,
    ) -> Result<(), DuplicateCommandError> {
        if self.commands.contains_key(spec.name) {
            return Err(DuplicateCommandError(spec.name.to_string()));
        }
        self.commands
            .insert(spec.name, RegisteredCommand { spec, handler });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredCommand<S, A>> {
        self.commands.get(name)
    }

    /// Specs of every registered command, for the help surface.
    pub fn specs(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values().map(|c| &c.spec)
    }
}

impl<S: GuildStore, A: ActionSink> Default for CommandRegistry<S, A> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommandRouter<S: GuildStore, A: ActionSink> {
    registry: CommandRegistry<S, A>,
    limiter: RateLimiter,
    audit: Arc<dyn AuditSink>,
    budget: std::time::Duration,
}

impl<S: GuildStore, A: ActionSink> CommandRouter<S, A> {
    pub fn new(registry: CommandRegistry<S, A>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            registry,
            limiter: RateLimiter::new(),
            audit,
            budget: DEFAULT_EXECUTION_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: std::time::Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Route one message through the guard chain to its handler.
    ///
    /// Ok(None) means "nothing to say": the message was not a command, or
    /// the handler succeeded silently.
    pub async fn dispatch(
        &self,
        env: &HandlerEnv<S, A>,
        guild: &Guild,
        actor: &Actor,
        mentioned: &[Actor],
        channel_id: u64,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, DispatchError> {
        let Some((name, tokens)) = parse_invocation(content, &guild.prefix) else {
            return Ok(None);
        };

        let command = self
            .registry
            .get(&name)
            .ok_or(DispatchError::UnknownCommand(name))?;
        let spec = &command.spec;

        if !guild.command_enabled(spec.name) {
            return Err(DispatchError::CommandDisabled(spec.name));
        }

        if !self
            .limiter
            .try_acquire(guild.id, actor.user_id, spec.name, spec.rate_limit, now)
        {
            return Err(DispatchError::RateLimited(spec.name));
        }

        let capabilities = capabilities_of(actor, guild);
        if !capabilities.contains(&spec.required_capability) {
            return Err(DispatchError::PermissionDenied {
                command: spec.name,
                required: spec.required_capability,
            });
        }

        let args = coerce_args(spec, &tokens)?;

        let ctx = HandlerContext {
            guild,
            actor,
            mentioned,
            channel_id,
            now,
            env,
            registry: &self.registry,
        };

        let reply = match tokio::time::timeout(self.budget, command.handler.run(&ctx, &args)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(DispatchError::HandlerTimeout(spec.name)),
        };

        self.audit.record(AuditRecord {
            command: spec.name,
            guild_id: guild.id,
            actor_id: actor.user_id,
            timestamp: now,
        });

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::commands::command_models::{ArgKind, ArgSpec};
    use crate::core::outbound::{RoleChange, SinkError};
    use crate::core::permissions::CapabilityTag;
    use crate::core::ratelimit::RateLimitPolicy;
    use crate::infra::storage::memory_store::InMemoryGuildStore;
    use std::sync::Mutex;

    struct NullSink;

    #[async_trait]
    impl ActionSink for NullSink {
        async fn send_message(&self, _: u64, _: u64, _: &str) -> Result<(), SinkError> {
            Ok(())
        }

        async fn apply_role_change(
            &self,
            _: u64,
            _: u64,
            _: u64,
            _: RoleChange,
        ) -> Result<(), SinkError> {
            Ok(())
        }

        async fn remove_member(&self, _: u64, _: u64) -> Result<(), SinkError> {
            Ok(())
        }
    }

    struct CollectingAudit {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl AuditSink for CollectingAudit {
        fn record(&self, record: AuditRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler<InMemoryGuildStore, NullSink> for EchoHandler {
        async fn run(
            &self,
            _ctx: &HandlerContext<'_, InMemoryGuildStore, NullSink>,
            args: &Args,
        ) -> Result<Option<String>, HandlerError> {
            Ok(Some(format!("pong {}", args.text("rest").unwrap_or(""))))
        }
    }

    struct SleepyHandler;

    #[async_trait]
    impl CommandHandler<InMemoryGuildStore, NullSink> for SleepyHandler {
        async fn run(
            &self,
            _ctx: &HandlerContext<'_, InMemoryGuildStore, NullSink>,
            _args: &Args,
        ) -> Result<Option<String>, HandlerError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    fn ping_spec() -> CommandSpec {
        CommandSpec {
            name: "ping",
            summary: "liveness check",
            usage: "ping [rest]",
            args: vec![ArgSpec::optional("rest", ArgKind::Text)],
            required_capability: CapabilityTag::Everyone,
            rate_limit: RateLimitPolicy::new(3, 1.0),
        }
    }

    fn guarded_spec() -> CommandSpec {
        CommandSpec {
            name: "guarded",
            summary: "needs moderation rights",
            usage: "guarded",
            args: vec![],
            required_capability: CapabilityTag::ModerateMembers,
            rate_limit: RateLimitPolicy::new(2, 1.0),
        }
    }

    type TestHandler = Box<dyn CommandHandler<InMemoryGuildStore, NullSink>>;

    fn env() -> HandlerEnv<InMemoryGuildStore, NullSink> {
        let store = Arc::new(InMemoryGuildStore::new());
        HandlerEnv {
            cases: CaseService::new(store.clone()),
            store,
            sink: Arc::new(NullSink),
        }
    }

    fn router_with(
        specs: Vec<(CommandSpec, TestHandler)>,
        audit: Arc<dyn AuditSink>,
    ) -> CommandRouter<InMemoryGuildStore, NullSink> {
        let mut registry = CommandRegistry::new();
        for (spec, handler) in specs {
            registry.register(spec, handler).unwrap();
        }
        CommandRouter::new(registry, audit)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry: CommandRegistry<InMemoryGuildStore, NullSink> = CommandRegistry::new();
        registry
            .register(ping_spec(), Box::new(EchoHandler))
            .unwrap();
        let err = registry
            .register(ping_spec(), Box::new(EchoHandler))
            .unwrap_err();
        assert_eq!(err.0, "ping");
    }

    #[tokio::test]
    async fn non_command_chatter_is_ignored() {
        let router = router_with(
            vec![(ping_spec(), Box::new(EchoHandler) as TestHandler)],
            Arc::new(CollectingAudit {
                records: Mutex::new(Vec::new()),
            }),
        );
        let env = env();
        let guild = Guild::with_defaults(1);
        let actor = Actor::new(5, vec![]);

        let reply = router
            .dispatch(&env, &guild, &actor, &[], 10, "just chatting", Utc::now())
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn unknown_command_is_an_unknown_error() {
        let router = router_with(
            vec![(ping_spec(), Box::new(EchoHandler) as TestHandler)],
            Arc::new(CollectingAudit {
                records: Mutex::new(Vec::new()),
            }),
        );
        let env = env();
        let guild = Guild::with_defaults(1);
        let actor = Actor::new(5, vec![]);

        let err = router
            .dispatch(&env, &guild, &actor, &[], 10, "!nosuch", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownCommand(name) if name == "nosuch"));
    }

    #[tokio::test]
    async fn disabled_commands_are_dropped() {
        let router = router_with(
            vec![(ping_spec(), Box::new(EchoHandler) as TestHandler)],
            Arc::new(CollectingAudit {
                records: Mutex::new(Vec::new()),
            }),
        );
        let env = env();
        let mut guild = Guild::with_defaults(1);
        guild.command_toggles.insert("ping".to_string(), false);
        let actor = Actor::new(5, vec![]);

        let err = router
            .dispatch(&env, &guild, &actor, &[], 10, "!ping", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CommandDisabled("ping")));
    }

    #[tokio::test]
    async fn rate_limit_is_checked_before_permissions() {
        // An actor without the capability: the first probes spend bucket
        // tokens and fail on permissions; once the bucket is dry the router
        // answers RateLimited without ever reaching the permission check.
        let router = router_with(
            vec![(guarded_spec(), Box::new(EchoHandler) as TestHandler)],
            Arc::new(CollectingAudit {
                records: Mutex::new(Vec::new()),
            }),
        );
        let env = env();
        let guild = Guild::with_defaults(1);
        let actor = Actor::new(5, vec![]);
        let now = Utc::now();

        for _ in 0..2 {
            let err = router
                .dispatch(&env, &guild, &actor, &[], 10, "!guarded", now)
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::PermissionDenied { .. }));
        }

        let err = router
            .dispatch(&env, &guild, &actor, &[], 10, "!guarded", now)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::RateLimited("guarded")));
    }

    #[tokio::test]
    async fn successful_dispatch_replies_and_audits() {
        let audit = Arc::new(CollectingAudit {
            records: Mutex::new(Vec::new()),
        });
        let router = router_with(vec![(ping_spec(), Box::new(EchoHandler) as TestHandler)], audit.clone());
        let env = env();
        let guild = Guild::with_defaults(1);
        let actor = Actor::new(5, vec![]);

        let reply = router
            .dispatch(&env, &guild, &actor, &[], 10, "!ping hello", Utc::now())
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("pong hello"));

        let records = audit.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, "ping");
        assert_eq!(records[0].actor_id, 5);
    }

    #[tokio::test]
    async fn denied_dispatch_emits_no_audit_record() {
        let audit = Arc::new(CollectingAudit {
            records: Mutex::new(Vec::new()),
        });
        let router = router_with(vec![(guarded_spec(), Box::new(EchoHandler) as TestHandler)], audit.clone());
        let env = env();
        let guild = Guild::with_defaults(1);
        let actor = Actor::new(5, vec![]);

        let _ = router
            .dispatch(&env, &guild, &actor, &[], 10, "!guarded", Utc::now())
            .await;
        assert!(audit.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_handler_is_aborted_at_the_budget() {
        let router = router_with(
            vec![(ping_spec(), Box::new(SleepyHandler) as TestHandler)],
            Arc::new(CollectingAudit {
                records: Mutex::new(Vec::new()),
            }),
        )
        .with_budget(std::time::Duration::from_millis(20));
        let env = env();
        let guild = Guild::with_defaults(1);
        let actor = Actor::new(5, vec![]);

        let err = router
            .dispatch(&env, &guild, &actor, &[], 10, "!ping", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::HandlerTimeout("ping")));
    }
}
