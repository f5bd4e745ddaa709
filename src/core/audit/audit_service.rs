// Dispatch audit trail.
//
// Every successful command dispatch emits one structured record to an
// external observability collaborator. Emission is fire-and-forget: it can
// never block or fail dispatch, so the port is synchronous and infallible.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub command: &'static str,
    pub guild_id: u64,
    pub actor_id: u64,
    pub timestamp: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Production sink: structured tracing events, picked up by whatever
/// subscriber the process installed.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            target: "warden_bot::audit",
            command = record.command,
            guild_id = record.guild_id,
            actor_id = record.actor_id,
            timestamp = %record.timestamp,
            "command dispatched"
        );
    }
}
