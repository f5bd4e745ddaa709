// Command implementations.
//
// Ordering rule for sanction handlers: platform enforcement first, the
// persistence call last, so an aborted handler never leaves a partial
// write. If persistence fails after enforcement, the platform action is
// reversed best-effort. Reversal handlers (unmute, revoke) go the other
// way, matching the expiry cycle: transition the case first, then emit the
// reversal action.

use super::command_models::{
    ArgKind, ArgSpec, Args, CommandSpec, DuplicateCommandError, HandlerError,
};
use super::command_router::{CommandHandler, CommandRegistry, HandlerContext};
use crate::core::moderation::{CaseKind, ModerationCase, SanctionOutcome};
use crate::core::outbound::{ActionSink, RoleChange};
use crate::core::permissions::{best_rank, capabilities_of, CapabilityTag};
use crate::core::ratelimit::RateLimitPolicy;
use crate::core::storage::GuildStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

const NO_REASON: &str = "no reason given";

fn mention(user_id: u64) -> String {
    format!("<@{user_id}>")
}

fn humanize(duration: Duration) -> String {
    let secs = duration.num_seconds();
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Self-sanction and rank hierarchy guard, shared by every sanction handler.
///
/// Target roles are only known when the target was mentioned in the message;
/// a target referenced by raw id is treated as unranked.
fn sanction_guard<S: GuildStore, A: ActionSink>(
    ctx: &HandlerContext<'_, S, A>,
    target_id: u64,
) -> Result<(), HandlerError> {
    if target_id == ctx.actor.user_id {
        return Err(HandlerError::Denied(
            "you cannot issue a sanction against yourself".to_string(),
        ));
    }

    let moderator_rank = best_rank(ctx.actor, ctx.guild);
    if let Some(target) = ctx.mentioned.iter().find(|a| a.user_id == target_id) {
        let target_rank = best_rank(target, ctx.guild);
        if target_rank > 0 && target_rank >= moderator_rank {
            return Err(HandlerError::Denied(
                "you cannot sanction a member of equal or higher rank".to_string(),
            ));
        }
    }

    Ok(())
}

async fn set_mute_role<S: GuildStore, A: ActionSink>(
    ctx: &HandlerContext<'_, S, A>,
    target_id: u64,
    change: RoleChange,
) -> Result<bool, HandlerError> {
    match ctx.guild.mute_role_id {
        Some(role_id) => {
            ctx.sink()
                .apply_role_change(ctx.guild.id, target_id, role_id, change)
                .await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Best-effort variant for cleanup paths where the case transition already
/// happened; a sink failure is logged, not surfaced.
async fn set_mute_role_quiet<S: GuildStore, A: ActionSink>(
    ctx: &HandlerContext<'_, S, A>,
    target_id: u64,
    change: RoleChange,
) {
    if let Some(role_id) = ctx.guild.mute_role_id {
        if let Err(err) = ctx
            .sink()
            .apply_role_change(ctx.guild.id, target_id, role_id, change)
            .await
        {
            tracing::warn!(
                guild_id = ctx.guild.id,
                target_id,
                error = %err,
                "mute role change failed"
            );
        }
    }
}

fn escalation_note(outcome: &SanctionOutcome) -> String {
    match &outcome.escalation {
        Some(esc) => format!(
            " Warning threshold reached: automatically muted (case #{}).",
            esc.case_id
        ),
        None => String::new(),
    }
}

// ============================================================================
// HELP
// ============================================================================

pub struct HelpCommand;

impl HelpCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "help",
            summary: "list available commands, or show usage for one",
            usage: "help [command]",
            args: vec![ArgSpec::optional("command", ArgKind::Word)],
            required_capability: CapabilityTag::Everyone,
            rate_limit: RateLimitPolicy::new(2, 0.2),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for HelpCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        if let Some(name) = args.word("command") {
            let spec = ctx
                .registry
                .get(&name.to_ascii_lowercase())
                .map(|c| &c.spec)
                .ok_or_else(|| HandlerError::Invalid(format!("no command named `{name}`")))?;
            return Ok(Some(format!(
                "{}{} - {}",
                ctx.guild.prefix, spec.usage, spec.summary
            )));
        }

        let capabilities = capabilities_of(ctx.actor, ctx.guild);
        let mut lines: Vec<String> = ctx
            .registry
            .specs()
            .filter(|s| capabilities.contains(&s.required_capability))
            .filter(|s| ctx.guild.command_enabled(s.name))
            .map(|s| format!("{}{} - {}", ctx.guild.prefix, s.name, s.summary))
            .collect();
        lines.sort();

        Ok(Some(lines.join("\n")))
    }
}

// ============================================================================
// SANCTIONS
// ============================================================================

pub struct WarnCommand;

impl WarnCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "warn",
            summary: "warn a member; repeated warnings escalate",
            usage: "warn <user> <reason>",
            args: vec![
                ArgSpec::required("user", ArgKind::User),
                ArgSpec::required("reason", ArgKind::Text),
            ],
            required_capability: CapabilityTag::ModerateMembers,
            rate_limit: RateLimitPolicy::new(5, 1.0),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for WarnCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let target = args
            .user("user")
            .ok_or_else(|| HandlerError::Invalid("missing user".to_string()))?;
        let reason = args.text("reason").unwrap_or(NO_REASON);
        sanction_guard(ctx, target)?;

        let outcome = ctx
            .cases()
            .issue_sanction(
                ctx.guild,
                target,
                ctx.actor.user_id,
                CaseKind::Warn,
                reason,
                None,
                ctx.now,
            )
            .await?;

        // The escalation mute was persisted inside the same operation; the
        // role grant is its outbound reversal-direction action.
        if outcome.escalation.is_some() {
            set_mute_role_quiet(ctx, target, RoleChange::Grant).await;
        }

        Ok(Some(format!(
            "Warned {} (case #{}).{}",
            mention(target),
            outcome.case.case_id,
            escalation_note(&outcome)
        )))
    }
}

pub struct MuteCommand;

impl MuteCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "mute",
            summary: "mute a member, superseding any active mute",
            usage: "mute <user> [duration] [reason]",
            args: vec![
                ArgSpec::required("user", ArgKind::User),
                ArgSpec::optional("duration", ArgKind::Duration),
                ArgSpec::optional("reason", ArgKind::Text),
            ],
            required_capability: CapabilityTag::ModerateMembers,
            rate_limit: RateLimitPolicy::new(5, 1.0),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for MuteCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let target = args
            .user("user")
            .ok_or_else(|| HandlerError::Invalid("missing user".to_string()))?;
        let duration = args.duration("duration");
        let reason = args.text("reason").unwrap_or(NO_REASON);
        sanction_guard(ctx, target)?;

        let enforced = set_mute_role(ctx, target, RoleChange::Grant).await?;

        let outcome = match ctx
            .cases()
            .issue_sanction(
                ctx.guild,
                target,
                ctx.actor.user_id,
                CaseKind::Mute,
                reason,
                duration,
                ctx.now,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                if enforced {
                    set_mute_role_quiet(ctx, target, RoleChange::Remove).await;
                }
                return Err(err.into());
            }
        };

        let until = match outcome.case.expires_at {
            Some(at) => format!("for {}", humanize(at - ctx.now)),
            None => "indefinitely".to_string(),
        };
        let superseded = match &outcome.superseded {
            Some(prior) => format!(" Replaced active mute case #{}.", prior.case_id),
            None => String::new(),
        };

        Ok(Some(format!(
            "Muted {} {} (case #{}).{}",
            mention(target),
            until,
            outcome.case.case_id,
            superseded
        )))
    }
}

pub struct UnmuteCommand;

impl UnmuteCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "unmute",
            summary: "lift a member's active mute",
            usage: "unmute <user>",
            args: vec![ArgSpec::required("user", ArgKind::User)],
            required_capability: CapabilityTag::ModerateMembers,
            rate_limit: RateLimitPolicy::new(5, 1.0),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for UnmuteCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let target = args
            .user("user")
            .ok_or_else(|| HandlerError::Invalid("missing user".to_string()))?;

        match ctx
            .cases()
            .revoke_active_mute(ctx.guild.id, target, ctx.actor.user_id)
            .await?
        {
            Some(case) => {
                set_mute_role_quiet(ctx, target, RoleChange::Remove).await;
                Ok(Some(format!(
                    "Unmuted {} (case #{} revoked).",
                    mention(target),
                    case.case_id
                )))
            }
            None => Ok(Some(format!("{} has no active mute.", mention(target)))),
        }
    }
}

pub struct KickCommand;

impl KickCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "kick",
            summary: "remove a member from the guild",
            usage: "kick <user> [reason]",
            args: vec![
                ArgSpec::required("user", ArgKind::User),
                ArgSpec::optional("reason", ArgKind::Text),
            ],
            required_capability: CapabilityTag::KickMembers,
            rate_limit: RateLimitPolicy::new(3, 0.5),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for KickCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let target = args
            .user("user")
            .ok_or_else(|| HandlerError::Invalid("missing user".to_string()))?;
        let reason = args.text("reason").unwrap_or(NO_REASON);
        sanction_guard(ctx, target)?;

        ctx.sink().remove_member(ctx.guild.id, target).await?;

        let outcome = match ctx
            .cases()
            .issue_sanction(
                ctx.guild,
                target,
                ctx.actor.user_id,
                CaseKind::Kick,
                reason,
                None,
                ctx.now,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                // The member is already gone; all we can do is make noise.
                tracing::error!(
                    guild_id = ctx.guild.id,
                    target_id = target,
                    "member kicked but case record could not be written"
                );
                return Err(err.into());
            }
        };

        Ok(Some(format!(
            "Kicked {} (case #{}).",
            mention(target),
            outcome.case.case_id
        )))
    }
}

pub struct BanCommand;

impl BanCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "ban",
            summary: "ban a member, permanently or for a duration",
            usage: "ban <user> [duration] [reason]",
            args: vec![
                ArgSpec::required("user", ArgKind::User),
                ArgSpec::optional("duration", ArgKind::Duration),
                ArgSpec::optional("reason", ArgKind::Text),
            ],
            required_capability: CapabilityTag::BanMembers,
            rate_limit: RateLimitPolicy::new(3, 0.5),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for BanCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let target = args
            .user("user")
            .ok_or_else(|| HandlerError::Invalid("missing user".to_string()))?;
        let duration = args.duration("duration");
        let reason = args.text("reason").unwrap_or(NO_REASON);
        sanction_guard(ctx, target)?;

        ctx.sink().remove_member(ctx.guild.id, target).await?;

        let outcome = match ctx
            .cases()
            .issue_sanction(
                ctx.guild,
                target,
                ctx.actor.user_id,
                CaseKind::Ban,
                reason,
                duration,
                ctx.now,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    guild_id = ctx.guild.id,
                    target_id = target,
                    "member banned but case record could not be written"
                );
                return Err(err.into());
            }
        };

        let until = match outcome.case.expires_at {
            Some(at) => format!("for {}", humanize(at - ctx.now)),
            None => "permanently".to_string(),
        };

        Ok(Some(format!(
            "Banned {} {} (case #{}).",
            mention(target),
            until,
            outcome.case.case_id
        )))
    }
}

// ============================================================================
// CASE MANAGEMENT
// ============================================================================

pub struct RevokeCommand;

impl RevokeCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "revoke",
            summary: "revoke an active case by id",
            usage: "revoke <case id> [reason]",
            args: vec![
                ArgSpec::required("case", ArgKind::Integer),
                ArgSpec::optional("reason", ArgKind::Text),
            ],
            required_capability: CapabilityTag::ModerateMembers,
            rate_limit: RateLimitPolicy::new(5, 1.0),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for RevokeCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let case_id = args
            .integer("case")
            .filter(|id| *id > 0)
            .ok_or_else(|| HandlerError::Invalid("case id must be positive".to_string()))?
            as u64;
        let reason = args.text("reason").unwrap_or("");

        let case = ctx
            .cases()
            .revoke(ctx.guild.id, case_id, ctx.actor.user_id, reason)
            .await?;

        if case.kind == CaseKind::Mute {
            set_mute_role_quiet(ctx, case.target_id, RoleChange::Remove).await;
        }

        Ok(Some(format!(
            "Case #{} ({} against {}) revoked.",
            case.case_id,
            case.kind,
            mention(case.target_id)
        )))
    }
}

pub struct CasesCommand;

impl CasesCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "cases",
            summary: "show a member's moderation history",
            usage: "cases <user>",
            args: vec![ArgSpec::required("user", ArgKind::User)],
            required_capability: CapabilityTag::ModerateMembers,
            rate_limit: RateLimitPolicy::new(2, 0.2),
        }
    }
}

fn case_line(case: &ModerationCase) -> String {
    format!(
        "#{} [{}] {} - {} (by {}, {})",
        case.case_id,
        case.kind,
        case.status,
        case.reason,
        if case.moderator_id == crate::core::moderation::SYSTEM_MODERATOR {
            "system".to_string()
        } else {
            mention(case.moderator_id)
        },
        case.created_at.format("%Y-%m-%d")
    )
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for CasesCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let target = args
            .user("user")
            .ok_or_else(|| HandlerError::Invalid("missing user".to_string()))?;

        let history = ctx
            .cases()
            .history(ctx.guild.id, target, DateTime::<Utc>::MIN_UTC)
            .await?;

        if history.is_empty() {
            return Ok(Some(format!("{} has no cases.", mention(target))));
        }

        let mut lines = vec![format!(
            "Cases for {} ({} total):",
            mention(target),
            history.len()
        )];
        lines.extend(history.iter().take(10).map(case_line));

        Ok(Some(lines.join("\n")))
    }
}

// ============================================================================
// GUILD CONFIGURATION
// ============================================================================

pub struct ModPolicyCommand;

impl ModPolicyCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "modpolicy",
            summary: "show or adjust the escalation policy",
            usage: "modpolicy [warn threshold] [lookback days] [mute minutes]",
            args: vec![
                ArgSpec::optional("threshold", ArgKind::Integer),
                ArgSpec::optional("lookback", ArgKind::Integer),
                ArgSpec::optional("mute_minutes", ArgKind::Integer),
            ],
            required_capability: CapabilityTag::ManageGuild,
            rate_limit: RateLimitPolicy::new(2, 0.2),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for ModPolicyCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let mut guild = ctx.guild.clone();
        let mut changed = false;

        if let Some(threshold) = args.integer("threshold") {
            if threshold < 0 {
                return Err(HandlerError::Invalid(
                    "warn threshold cannot be negative".to_string(),
                ));
            }
            guild.policy.warn_threshold = threshold as u32;
            changed = true;
        }
        if let Some(lookback) = args.integer("lookback") {
            if lookback <= 0 {
                return Err(HandlerError::Invalid(
                    "lookback must be at least one day".to_string(),
                ));
            }
            guild.policy.lookback_days = lookback;
            changed = true;
        }
        if let Some(minutes) = args.integer("mute_minutes") {
            if minutes <= 0 {
                return Err(HandlerError::Invalid(
                    "mute duration must be positive".to_string(),
                ));
            }
            guild.policy.default_mute_minutes = minutes;
            changed = true;
        }

        if changed {
            ctx.store().save_guild(&guild).await?;
        }

        let policy = &guild.policy;
        Ok(Some(format!(
            "Policy: {} warns within {} days escalate to a {}m mute; default mute {}m.",
            policy.warn_threshold,
            policy.lookback_days,
            policy.escalation_mute_minutes,
            policy.default_mute_minutes
        )))
    }
}

pub struct RoleCapCommand;

impl RoleCapCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "rolecap",
            summary: "grant or remove a capability on a role",
            usage: "rolecap <role id> <capability> <grant|remove> [rank]",
            args: vec![
                ArgSpec::required("role", ArgKind::Integer),
                ArgSpec::required("capability", ArgKind::Word),
                ArgSpec::required("action", ArgKind::Word),
                ArgSpec::optional("rank", ArgKind::Integer),
            ],
            required_capability: CapabilityTag::ManageGuild,
            rate_limit: RateLimitPolicy::new(5, 1.0),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for RoleCapCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let role_id = args
            .integer("role")
            .filter(|id| *id > 0)
            .ok_or_else(|| HandlerError::Invalid("role id must be positive".to_string()))?
            as u64;
        let capability = args
            .word("capability")
            .and_then(CapabilityTag::parse)
            .ok_or_else(|| {
                HandlerError::Invalid(
                    "capability must be one of: moderate_members, kick_members, ban_members, manage_guild"
                        .to_string(),
                )
            })?;
        let grant = match args.word("action") {
            Some("grant") => true,
            Some("remove") => false,
            _ => {
                return Err(HandlerError::Invalid(
                    "action must be `grant` or `remove`".to_string(),
                ))
            }
        };
        let rank = args.integer("rank");

        let mut guild = ctx.guild.clone();
        let pos = match guild.roles.iter().position(|r| r.id == role_id) {
            Some(pos) => pos,
            None => {
                guild.roles.push(crate::core::guild::Role {
                    id: role_id,
                    name: format!("role-{role_id}"),
                    capabilities: Default::default(),
                    rank: 0,
                });
                guild.roles.len() - 1
            }
        };
        let role = &mut guild.roles[pos];
        if grant {
            role.capabilities.insert(capability);
        } else {
            role.capabilities.remove(&capability);
        }
        if let Some(rank) = rank {
            if rank < 0 {
                return Err(HandlerError::Invalid("rank cannot be negative".to_string()));
            }
            role.rank = rank as u32;
        }

        ctx.store().save_guild(&guild).await?;

        Ok(Some(format!(
            "Role {} now {} `{}`.",
            role_id,
            if grant { "has" } else { "lacks" },
            capability
        )))
    }
}

pub struct CommandToggleCommand;

impl CommandToggleCommand {
    pub fn spec() -> CommandSpec {
        CommandSpec {
            name: "command",
            summary: "enable or disable a command in this guild",
            usage: "command <name> <on|off>",
            args: vec![
                ArgSpec::required("name", ArgKind::Word),
                ArgSpec::required("state", ArgKind::Word),
            ],
            required_capability: CapabilityTag::ManageGuild,
            rate_limit: RateLimitPolicy::new(5, 1.0),
        }
    }
}

#[async_trait]
impl<S: GuildStore, A: ActionSink> CommandHandler<S, A> for CommandToggleCommand {
    async fn run(
        &self,
        ctx: &HandlerContext<'_, S, A>,
        args: &Args,
    ) -> Result<Option<String>, HandlerError> {
        let name = args
            .word("name")
            .map(|n| n.to_ascii_lowercase())
            .ok_or_else(|| HandlerError::Invalid("missing command name".to_string()))?;
        let enabled = match args.word("state") {
            Some("on") => true,
            Some("off") => false,
            _ => {
                return Err(HandlerError::Invalid(
                    "state must be `on` or `off`".to_string(),
                ))
            }
        };

        if ctx.registry.get(&name).is_none() {
            return Err(HandlerError::Invalid(format!("no command named `{name}`")));
        }
        // Leaving no way to turn commands back on would lock the guild out.
        if name == "command" && !enabled {
            return Err(HandlerError::Invalid(
                "the `command` command cannot be disabled".to_string(),
            ));
        }

        let mut guild = ctx.guild.clone();
        guild.command_toggles.insert(name.clone(), enabled);
        ctx.store().save_guild(&guild).await?;

        Ok(Some(format!(
            "Command `{}` is now {}.",
            name,
            if enabled { "enabled" } else { "disabled" }
        )))
    }
}

/// Register the full command table. Called once from the composition root;
/// a duplicate name is a programming error and aborts startup.
pub fn build_registry<S, A>() -> Result<CommandRegistry<S, A>, DuplicateCommandError>
where
    S: GuildStore + 'static,
    A: ActionSink + 'static,
{
    let mut registry = CommandRegistry::new();
    registry.register(HelpCommand::spec(), Box::new(HelpCommand))?;
    registry.register(WarnCommand::spec(), Box::new(WarnCommand))?;
    registry.register(MuteCommand::spec(), Box::new(MuteCommand))?;
    registry.register(UnmuteCommand::spec(), Box::new(UnmuteCommand))?;
    registry.register(KickCommand::spec(), Box::new(KickCommand))?;
    registry.register(BanCommand::spec(), Box::new(BanCommand))?;
    registry.register(RevokeCommand::spec(), Box::new(RevokeCommand))?;
    registry.register(CasesCommand::spec(), Box::new(CasesCommand))?;
    registry.register(ModPolicyCommand::spec(), Box::new(ModPolicyCommand))?;
    registry.register(RoleCapCommand::spec(), Box::new(RoleCapCommand))?;
    registry.register(CommandToggleCommand::spec(), Box::new(CommandToggleCommand))?;
    Ok(registry)
}
