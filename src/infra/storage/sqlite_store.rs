// SQLite-backed implementation of the persistence gateway.
//
// Tables:
// - guilds: one JSON document per guild (the gateway is a document store)
// - cases: moderation cases, (guild_id, case_id) primary key
// - active_mutes: per-target active mute pointer, CAS via conditional writes
//
// Case ids are allocated inside the INSERT itself (MAX + 1 subquery), so
// allocation and insert are one atomic statement. Status updates carry the
// expected status in the WHERE clause and report a lost race through
// rows_affected.

use crate::core::guild::Guild;
use crate::core::moderation::{CaseKind, CaseStatus, ModerationCase, NewCase};
use crate::core::storage::{CasOutcome, GuildStore, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Pool, Row, Sqlite};

pub struct SqliteGuildStore {
    pool: Pool<Sqlite>,
}

fn map_sqlx_err(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db) if db.message().contains("locked") => {
            StorageError::Unavailable(err.to_string())
        }
        _ => StorageError::Backend(err.to_string()),
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp `{raw}`: {e}")))
}

fn row_to_case(row: &sqlx::sqlite::SqliteRow) -> Result<ModerationCase, StorageError> {
    let kind_raw: String = row.get("kind");
    let status_raw: String = row.get("status");
    let expires_raw: Option<String> = row.get("expires_at");
    let created_raw: String = row.get("created_at");

    Ok(ModerationCase {
        case_id: row.get::<i64, _>("case_id") as u64,
        guild_id: row.get::<i64, _>("guild_id") as u64,
        target_id: row.get::<i64, _>("target_id") as u64,
        moderator_id: row.get::<i64, _>("moderator_id") as u64,
        kind: CaseKind::parse(&kind_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("bad case kind `{kind_raw}`")))?,
        reason: row.get("reason"),
        created_at: parse_ts(&created_raw)?,
        expires_at: expires_raw.as_deref().map(parse_ts).transpose()?,
        status: CaseStatus::parse(&status_raw)
            .ok_or_else(|| StorageError::Corrupt(format!("bad case status `{status_raw}`")))?,
        resolution: row.get("resolution"),
    })
}

impl SqliteGuildStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn connect(path: &str) -> Result<Self, StorageError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect(&format!("sqlite://{}?mode=rwc", path))
            .await
            .map_err(map_sqlx_err)?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the required tables.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guilds (
                guild_id INTEGER PRIMARY KEY,
                doc TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cases (
                guild_id INTEGER NOT NULL,
                case_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                moderator_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                status TEXT NOT NULL,
                resolution TEXT,
                PRIMARY KEY (guild_id, case_id)
            );
            CREATE INDEX IF NOT EXISTS idx_cases_target
                ON cases(guild_id, target_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_cases_due
                ON cases(status, expires_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS active_mutes (
                guild_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                case_id INTEGER NOT NULL,
                PRIMARY KEY (guild_id, target_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }
}

#[async_trait]
impl GuildStore for SqliteGuildStore {
    async fn load_guild(&self, guild_id: u64) -> Result<Option<Guild>, StorageError> {
        let row = sqlx::query("SELECT doc FROM guilds WHERE guild_id = ?")
            .bind(guild_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        match row {
            Some(row) => {
                let doc: String = row.get("doc");
                let guild = serde_json::from_str(&doc)
                    .map_err(|e| StorageError::Corrupt(format!("guild {guild_id}: {e}")))?;
                Ok(Some(guild))
            }
            None => Ok(None),
        }
    }

    async fn save_guild(&self, guild: &Guild) -> Result<(), StorageError> {
        let doc = serde_json::to_string(guild)
            .map_err(|e| StorageError::Corrupt(format!("guild {}: {e}", guild.id)))?;

        sqlx::query(
            r#"
            INSERT INTO guilds (guild_id, doc) VALUES (?, ?)
            ON CONFLICT(guild_id) DO UPDATE SET doc = excluded.doc
            "#,
        )
        .bind(guild.id as i64)
        .bind(doc)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn create_case(&self, case: NewCase) -> Result<ModerationCase, StorageError> {
        let row = sqlx::query(
            r#"
            INSERT INTO cases (
                guild_id, case_id, target_id, moderator_id, kind,
                reason, created_at, expires_at, status, resolution
            )
            VALUES (
                ?,
                (SELECT COALESCE(MAX(case_id), 0) + 1 FROM cases WHERE guild_id = ?),
                ?, ?, ?, ?, ?, ?, 'active', NULL
            )
            RETURNING case_id
            "#,
        )
        .bind(case.guild_id as i64)
        .bind(case.guild_id as i64)
        .bind(case.target_id as i64)
        .bind(case.moderator_id as i64)
        .bind(case.kind.to_string())
        .bind(&case.reason)
        .bind(ts(case.created_at))
        .bind(case.expires_at.map(ts))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(ModerationCase {
            case_id: row.get::<i64, _>("case_id") as u64,
            guild_id: case.guild_id,
            target_id: case.target_id,
            moderator_id: case.moderator_id,
            kind: case.kind,
            reason: case.reason,
            created_at: case.created_at,
            expires_at: case.expires_at,
            status: CaseStatus::Active,
            resolution: None,
        })
    }

    async fn fetch_case(
        &self,
        guild_id: u64,
        case_id: u64,
    ) -> Result<Option<ModerationCase>, StorageError> {
        let row = sqlx::query("SELECT * FROM cases WHERE guild_id = ? AND case_id = ?")
            .bind(guild_id as i64)
            .bind(case_id as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(row_to_case).transpose()
    }

    async fn update_case_status(
        &self,
        guild_id: u64,
        case_id: u64,
        expected: CaseStatus,
        new: CaseStatus,
        resolution: Option<String>,
    ) -> Result<CasOutcome, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE cases
            SET status = ?, resolution = COALESCE(?, resolution)
            WHERE guild_id = ? AND case_id = ? AND status = ?
            "#,
        )
        .bind(new.to_string())
        .bind(resolution)
        .bind(guild_id as i64)
        .bind(case_id as i64)
        .bind(expected.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Ok(CasOutcome::Lost);
        }

        match self.fetch_case(guild_id, case_id).await? {
            Some(case) => Ok(CasOutcome::Applied(case)),
            None => Err(StorageError::Backend(format!(
                "case {guild_id}/{case_id} vanished after update"
            ))),
        }
    }

    async fn cases_for_target(
        &self,
        guild_id: u64,
        target_id: u64,
        since: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM cases
            WHERE guild_id = ? AND target_id = ? AND created_at >= ?
            ORDER BY case_id DESC
            "#,
        )
        .bind(guild_id as i64)
        .bind(target_id as i64)
        .bind(ts(since))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_case).collect()
    }

    async fn list_active_cases_due_before(
        &self,
        ts_before: DateTime<Utc>,
    ) -> Result<Vec<ModerationCase>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM cases
            WHERE status = 'active' AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(ts(ts_before))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(row_to_case).collect()
    }

    async fn swap_active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
        expected: Option<u64>,
        new: Option<u64>,
    ) -> Result<bool, StorageError> {
        let affected = match (expected, new) {
            (None, Some(case_id)) => sqlx::query(
                "INSERT OR IGNORE INTO active_mutes (guild_id, target_id, case_id) VALUES (?, ?, ?)",
            )
            .bind(guild_id as i64)
            .bind(target_id as i64)
            .bind(case_id as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .rows_affected(),
            (Some(old), Some(case_id)) => sqlx::query(
                "UPDATE active_mutes SET case_id = ? WHERE guild_id = ? AND target_id = ? AND case_id = ?",
            )
            .bind(case_id as i64)
            .bind(guild_id as i64)
            .bind(target_id as i64)
            .bind(old as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .rows_affected(),
            (Some(old), None) => sqlx::query(
                "DELETE FROM active_mutes WHERE guild_id = ? AND target_id = ? AND case_id = ?",
            )
            .bind(guild_id as i64)
            .bind(target_id as i64)
            .bind(old as i64)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?
            .rows_affected(),
            (None, None) => {
                // Trivial swap: succeeds only if no pointer exists.
                let row = sqlx::query(
                    "SELECT case_id FROM active_mutes WHERE guild_id = ? AND target_id = ?",
                )
                .bind(guild_id as i64)
                .bind(target_id as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
                return Ok(row.is_none());
            }
        };

        Ok(affected == 1)
    }

    async fn active_mute(
        &self,
        guild_id: u64,
        target_id: u64,
    ) -> Result<Option<u64>, StorageError> {
        let row =
            sqlx::query("SELECT case_id FROM active_mutes WHERE guild_id = ? AND target_id = ?")
                .bind(guild_id as i64)
                .bind(target_id as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        Ok(row.map(|r| r.get::<i64, _>("case_id") as u64))
    }
}
