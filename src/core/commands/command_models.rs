// Command table types: argument schemas, parsed argument values, and the
// dispatch error taxonomy.

use crate::core::moderation::CaseError;
use crate::core::outbound::SinkError;
use crate::core::permissions::CapabilityTag;
use crate::core::ratelimit::RateLimitPolicy;
use crate::core::storage::StorageError;
use chrono::Duration;
use std::collections::HashMap;
use thiserror::Error;

/// Parameter types a command schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A user mention (`<@id>`, `<@!id>`) or raw id.
    User,
    Integer,
    /// Compact duration: `30s`, `10m`, `2h`, `7d`.
    Duration,
    /// A single bare token.
    Word,
    /// Everything left on the line. Must be the final parameter.
    Text,
}

#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
}

impl ArgSpec {
    pub const fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// An immutable command definition, registered once at process start.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    pub summary: &'static str,
    pub usage: &'static str,
    pub args: Vec<ArgSpec>,
    pub required_capability: CapabilityTag,
    pub rate_limit: RateLimitPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    User(u64),
    Integer(i64),
    Duration(Duration),
    Word(String),
    Text(String),
}

/// Validated arguments, keyed by parameter name. Optional parameters that
/// were absent (or skipped by coercion) have no entry.
#[derive(Debug, Default)]
pub struct Args {
    values: HashMap<&'static str, ArgValue>,
}

impl Args {
    pub fn insert(&mut self, name: &'static str, value: ArgValue) {
        self.values.insert(name, value);
    }

    pub fn user(&self, name: &str) -> Option<u64> {
        match self.values.get(name) {
            Some(ArgValue::User(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ArgValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn duration(&self, name: &str) -> Option<Duration> {
        match self.values.get(name) {
            Some(ArgValue::Duration(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn word(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Word(w)) => Some(w.as_str()),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Text(t)) => Some(t.as_str()),
            _ => None,
        }
    }
}

/// Two commands registered under one name. The only fatal, start-time-only
/// error in the system.
#[derive(Debug, Error)]
#[error("duplicate command registration: {0}")]
pub struct DuplicateCommandError(pub String);

/// Failures produced by a running handler, after all router guards passed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Case(#[from] CaseError),

    /// Handler-level refusal (rank hierarchy, self-sanction). User-visible.
    #[error("{0}")]
    Denied(String),

    /// Semantic argument problem the schema could not catch. User-visible.
    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Everything dispatch can fail with. The engine decides which of these are
/// surfaced to the invoking user and which are silent drops.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No registered command under this name. Dropped silently.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The guild disabled this command. Dropped silently.
    #[error("command disabled in this guild: {0}")]
    CommandDisabled(&'static str),

    /// Token bucket empty. Dropped silently; replying would feed the flood.
    #[error("rate limited: {0}")]
    RateLimited(&'static str),

    #[error("missing capability {required} for command {command}")]
    PermissionDenied {
        command: &'static str,
        required: CapabilityTag,
    },

    #[error("bad argument `{param}`: {message}")]
    Argument {
        param: &'static str,
        message: String,
        usage: &'static str,
    },

    /// Handler exceeded the execution budget and was aborted.
    #[error("handler for {0} exceeded its execution budget")]
    HandlerTimeout(&'static str),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Split a raw message into (command name, argument tokens) if it carries
/// the guild's prefix. Non-command chatter returns None.
pub fn parse_invocation<'a>(content: &'a str, prefix: &str) -> Option<(String, Vec<&'a str>)> {
    let trimmed = content.trim();
    let rest = trimmed.strip_prefix(prefix)?;
    let mut tokens = rest.split_whitespace();
    let name = tokens.next()?.to_ascii_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, tokens.collect()))
}

/// `<@id>` / `<@!id>` mention or raw id.
fn parse_user_token(token: &str) -> Option<u64> {
    let inner = token
        .strip_prefix("<@!")
        .or_else(|| token.strip_prefix("<@"))
        .map(|s| s.strip_suffix('>').unwrap_or(s))
        .unwrap_or(token);
    inner.parse().ok()
}

/// Compact duration: integer followed by s/m/h/d.
pub fn parse_duration_token(token: &str) -> Option<Duration> {
    if token.len() < 2 {
        return None;
    }
    let (amount, unit) = token.split_at(token.len() - 1);
    let amount: i64 = amount.parse().ok()?;
    if amount <= 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::seconds(amount)),
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        _ => None,
    }
}

fn coerce_token(kind: ArgKind, token: &str) -> Result<ArgValue, String> {
    match kind {
        ArgKind::User => parse_user_token(token)
            .map(ArgValue::User)
            .ok_or_else(|| format!("`{token}` is not a user mention or id")),
        ArgKind::Integer => token
            .parse()
            .map(ArgValue::Integer)
            .map_err(|_| format!("`{token}` is not a number")),
        ArgKind::Duration => parse_duration_token(token)
            .map(ArgValue::Duration)
            .ok_or_else(|| format!("`{token}` is not a duration like 10m or 2h")),
        ArgKind::Word => Ok(ArgValue::Word(token.to_string())),
        ArgKind::Text => Ok(ArgValue::Text(token.to_string())),
    }
}

/// Validate tokens against the schema.
///
/// Walks parameters in order. A token that fails coercion against an
/// optional parameter skips that parameter and is retried against the next
/// one; against a required parameter it is an ArgumentError naming the
/// parameter. A trailing Text parameter swallows the remainder of the line.
pub fn coerce_args(spec: &CommandSpec, tokens: &[&str]) -> Result<Args, DispatchError> {
    let mut args = Args::default();
    let mut ti = 0;

    for param in &spec.args {
        if param.kind == ArgKind::Text {
            let rest = tokens[ti..].join(" ");
            if rest.is_empty() {
                if param.required {
                    return Err(DispatchError::Argument {
                        param: param.name,
                        message: "missing".to_string(),
                        usage: spec.usage,
                    });
                }
            } else {
                args.insert(param.name, ArgValue::Text(rest));
                ti = tokens.len();
            }
            continue;
        }

        match tokens.get(ti) {
            None => {
                if param.required {
                    return Err(DispatchError::Argument {
                        param: param.name,
                        message: "missing".to_string(),
                        usage: spec.usage,
                    });
                }
            }
            Some(token) => match coerce_token(param.kind, token) {
                Ok(value) => {
                    args.insert(param.name, value);
                    ti += 1;
                }
                Err(message) => {
                    if param.required {
                        return Err(DispatchError::Argument {
                            param: param.name,
                            message,
                            usage: spec.usage,
                        });
                    }
                    // Optional parameter: leave the token for the next one.
                }
            },
        }
    }

    if ti < tokens.len() {
        return Err(DispatchError::Argument {
            param: spec.args.last().map(|a| a.name).unwrap_or("arguments"),
            message: format!("unexpected `{}`", tokens[ti]),
            usage: spec.usage,
        });
    }

    Ok(args)
}
