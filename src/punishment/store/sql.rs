//! Shared pieces of the SQL backends
//!
//! All three databases store instants as epoch milliseconds and identifiers
//! as text, so a single row type decodes on every backend. Statements are
//! written with `?` placeholders and rewritten for PostgreSQL.

use crate::punishment::store::{StoreError, StoreResult};
use crate::punishment::{Actor, Expiry, LogAction, LogEntry, Punishment, PunishmentError};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Dialect {
    Sqlite,
    Postgres,
    MySql,
}

impl Dialect {
    /// Rewrite `?` placeholders into the backend's syntax
    pub(super) fn rewrite(self, sql: &'static str) -> Cow<'static, str> {
        match self {
            Self::Sqlite | Self::MySql => Cow::Borrowed(sql),
            Self::Postgres => {
                let mut out = String::with_capacity(sql.len() + 16);
                let mut index = 0;
                for c in sql.chars() {
                    if c == '?' {
                        index += 1;
                        out.push('$');
                        out.push_str(&index.to_string());
                    } else {
                        out.push(c);
                    }
                }
                Cow::Owned(out)
            }
        }
    }

    /// Statements creating the schema, run one at a time
    pub(super) fn schema(self) -> &'static [&'static str] {
        match self {
            Self::Sqlite => SQLITE_SCHEMA,
            Self::Postgres => POSTGRES_SCHEMA,
            Self::MySql => MYSQL_SCHEMA,
        }
    }
}

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS punishments (
        id TEXT PRIMARY KEY NOT NULL,
        target TEXT NOT NULL,
        kind TEXT NOT NULL,
        reason TEXT NOT NULL,
        issuer TEXT NOT NULL,
        issued_at INTEGER NOT NULL,
        expires_at INTEGER,
        state TEXT NOT NULL,
        ended_at INTEGER,
        ended_by TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS punishments_one_active
        ON punishments (target, kind) WHERE state = 'ACTIVE'",
    "CREATE INDEX IF NOT EXISTS punishments_target_kind_state
        ON punishments (target, kind, state)",
    "CREATE INDEX IF NOT EXISTS punishments_expiry ON punishments (state, expires_at)",
    "CREATE TABLE IF NOT EXISTS punishment_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        punishment_id TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS punishment_log_punishment ON punishment_log (punishment_id)",
];

const POSTGRES_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS punishments (
        id TEXT PRIMARY KEY,
        target TEXT NOT NULL,
        kind TEXT NOT NULL,
        reason TEXT NOT NULL,
        issuer TEXT NOT NULL,
        issued_at BIGINT NOT NULL,
        expires_at BIGINT,
        state TEXT NOT NULL,
        ended_at BIGINT,
        ended_by TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS punishments_one_active
        ON punishments (target, kind) WHERE state = 'ACTIVE'",
    "CREATE INDEX IF NOT EXISTS punishments_target_kind_state
        ON punishments (target, kind, state)",
    "CREATE INDEX IF NOT EXISTS punishments_expiry ON punishments (state, expires_at)",
    "CREATE TABLE IF NOT EXISTS punishment_log (
        seq BIGSERIAL PRIMARY KEY,
        punishment_id TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS punishment_log_punishment ON punishment_log (punishment_id)",
];

// MySQL has no partial indexes; the generated key is NULL for terminal rows
// and NULLs never collide in a UNIQUE key.
const MYSQL_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS punishments (
        id VARCHAR(36) NOT NULL PRIMARY KEY,
        target VARCHAR(36) NOT NULL,
        kind VARCHAR(8) NOT NULL,
        reason TEXT NOT NULL,
        issuer VARCHAR(64) NOT NULL,
        issued_at BIGINT NOT NULL,
        expires_at BIGINT NULL,
        state VARCHAR(8) NOT NULL,
        ended_at BIGINT NULL,
        ended_by VARCHAR(64) NULL,
        active_key VARCHAR(48) GENERATED ALWAYS AS
            (CASE WHEN state = 'ACTIVE' THEN CONCAT(target, ':', kind) END) STORED,
        UNIQUE KEY punishments_one_active (active_key),
        KEY punishments_target_kind_state (target, kind, state),
        KEY punishments_expiry (state, expires_at)
    )",
    "CREATE TABLE IF NOT EXISTS punishment_log (
        seq BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        punishment_id VARCHAR(36) NOT NULL,
        action VARCHAR(16) NOT NULL,
        actor VARCHAR(64) NOT NULL,
        message TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        KEY punishment_log_punishment (punishment_id)
    )",
];

pub(super) const INSERT_PUNISHMENT: &str = "INSERT INTO punishments
    (id, target, kind, reason, issuer, issued_at, expires_at, state, ended_at, ended_by)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub(super) const INSERT_LOG: &str = "INSERT INTO punishment_log
    (punishment_id, action, actor, message, created_at)
    VALUES (?, ?, ?, ?, ?)";

pub(super) const SELECT_BY_ID: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments WHERE id = ?";

const SELECT_FOR_TARGET: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments WHERE target = ?
    ORDER BY issued_at";

const SELECT_FOR_TARGET_KIND: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments WHERE target = ? AND kind = ?
    ORDER BY issued_at";

const SELECT_FOR_TARGET_STATE: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments WHERE target = ? AND state = ?
    ORDER BY issued_at";

const SELECT_FOR_TARGET_KIND_STATE: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments
    WHERE target = ? AND kind = ? AND state = ?
    ORDER BY issued_at";

/// Query for a target's punishments; binds the target, then the kind and
/// the state when filtered on
pub(super) const fn select_for_target(by_kind: bool, by_state: bool) -> &'static str {
    match (by_kind, by_state) {
        (false, false) => SELECT_FOR_TARGET,
        (true, false) => SELECT_FOR_TARGET_KIND,
        (false, true) => SELECT_FOR_TARGET_STATE,
        (true, true) => SELECT_FOR_TARGET_KIND_STATE,
    }
}

pub(super) const SELECT_ACTIVE: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments
    WHERE target = ? AND kind = ? AND state = 'ACTIVE'";

pub(super) const SELECT_EXPIRING: &str = "SELECT id, target, kind, reason, issuer, issued_at,
    expires_at, state, ended_at, ended_by FROM punishments
    WHERE state = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= ?
    ORDER BY expires_at";

pub(super) const UPDATE_STATE: &str = "UPDATE punishments SET state = ?, ended_at = ?, ended_by = ?
    WHERE id = ? AND state = 'ACTIVE'";

pub(super) const UPDATE_REASON: &str = "UPDATE punishments SET reason = ?
    WHERE id = ? AND state = 'ACTIVE'";

pub(super) const UPDATE_EXPIRY: &str = "UPDATE punishments SET expires_at = ?
    WHERE id = ? AND state = 'ACTIVE'";

pub(super) const SELECT_LOG: &str = "SELECT punishment_id, action, actor, message, created_at
    FROM punishment_log WHERE punishment_id = ? ORDER BY seq";

/// Stored form of a [`Punishment`]
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct PunishmentRow {
    pub id: String,
    pub target: String,
    pub kind: String,
    pub reason: String,
    pub issuer: String,
    pub issued_at: i64,
    pub expires_at: Option<i64>,
    pub state: String,
    pub ended_at: Option<i64>,
    pub ended_by: Option<String>,
}

impl From<&Punishment> for PunishmentRow {
    fn from(record: &Punishment) -> Self {
        Self {
            id: record.id.to_string(),
            target: record.target.to_string(),
            kind: record.kind.as_str().to_string(),
            reason: record.reason.clone(),
            issuer: record.issuer.to_string(),
            issued_at: record.issued_at.timestamp_millis(),
            expires_at: record.expiry.instant().map(|at| at.timestamp_millis()),
            state: record.state.as_str().to_string(),
            ended_at: record.ended_at.map(|at| at.timestamp_millis()),
            ended_by: record.ended_by.as_ref().map(ToString::to_string),
        }
    }
}

impl TryFrom<PunishmentRow> for Punishment {
    type Error = StoreError;

    fn try_from(row: PunishmentRow) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };

        let ended_by = row
            .ended_by
            .as_deref()
            .map(str::parse::<Actor>)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Self {
            id: Uuid::parse_str(&row.id).map_err(|e| corrupt(e.to_string()))?,
            target: row.target.parse().map_err(|_| corrupt(format!("bad target {}", row.target)))?,
            kind: row.kind.parse().map_err(|e: PunishmentError| corrupt(e.to_string()))?,
            issuer: row.issuer.parse().map_err(|e: PunishmentError| corrupt(e.to_string()))?,
            issued_at: from_millis(row.issued_at).ok_or_else(|| corrupt("bad issued_at".to_string()))?,
            expiry: match row.expires_at {
                None => Expiry::Permanent,
                Some(ms) => Expiry::At(from_millis(ms).ok_or_else(|| corrupt("bad expires_at".to_string()))?),
            },
            state: row.state.parse().map_err(|e: PunishmentError| corrupt(e.to_string()))?,
            ended_at: row
                .ended_at
                .map(|ms| from_millis(ms).ok_or_else(|| corrupt("bad ended_at".to_string())))
                .transpose()?,
            ended_by,
            reason: row.reason,
        })
    }
}

/// Stored form of a [`LogEntry`]
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct LogRow {
    pub punishment_id: String,
    pub action: String,
    pub actor: String,
    pub message: String,
    pub created_at: i64,
}

impl From<&LogEntry> for LogRow {
    fn from(entry: &LogEntry) -> Self {
        Self {
            punishment_id: entry.punishment_id.to_string(),
            action: entry.action.to_string(),
            actor: entry.actor.to_string(),
            message: entry.message.clone(),
            created_at: entry.created_at.timestamp_millis(),
        }
    }
}

impl TryFrom<LogRow> for LogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> StoreResult<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.punishment_id.clone(),
            reason,
        };

        Ok(Self {
            punishment_id: Uuid::parse_str(&row.punishment_id).map_err(|e| corrupt(e.to_string()))?,
            action: row.action.parse::<LogAction>().map_err(|e| corrupt(e.to_string()))?,
            actor: row.actor.parse::<Actor>().map_err(|e| corrupt(e.to_string()))?,
            created_at: from_millis(row.created_at).ok_or_else(|| corrupt("bad created_at".to_string()))?,
            message: row.message,
        })
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Implements [`PunishmentStore`](crate::punishment::PunishmentStore) for a
/// struct holding a `pool` of the given sqlx database.
macro_rules! impl_sql_store {
    ($store:ty, $name:literal, $dialect:expr) => {
        impl $store {
            async fn fetch(
                &self,
                id: ::uuid::Uuid,
            ) -> $crate::punishment::StoreResult<$crate::punishment::Punishment> {
                let sql = $dialect.rewrite($crate::punishment::store::sql::SELECT_BY_ID);
                let row = ::sqlx::query_as::<_, $crate::punishment::store::sql::PunishmentRow>(&sql)
                    .bind(id.to_string())
                    .fetch_optional(&self.pool)
                    .await?
                    .ok_or($crate::punishment::StoreError::NotFound(id))?;
                row.try_into()
            }
        }

        #[::async_trait::async_trait]
        impl $crate::punishment::PunishmentStore for $store {
            fn backend(&self) -> &'static str {
                $name
            }

            async fn migrate(&self) -> $crate::punishment::StoreResult<()> {
                for statement in $dialect.schema() {
                    ::sqlx::query(*statement).execute(&self.pool).await?;
                }
                ::tracing::debug!(backend = $name, "Punishment schema migrated");
                Ok(())
            }

            async fn insert(
                &self,
                punishment: &$crate::punishment::Punishment,
            ) -> $crate::punishment::StoreResult<()> {
                use $crate::punishment::store::sql::{INSERT_LOG, INSERT_PUNISHMENT, LogRow, PunishmentRow};

                let row = PunishmentRow::from(punishment);
                let log = LogRow::from(&$crate::punishment::LogEntry::new(
                    punishment.id,
                    $crate::punishment::LogAction::Created,
                    punishment.issuer.clone(),
                    punishment.reason.clone(),
                    punishment.issued_at,
                ));

                let mut tx = self.pool.begin().await?;
                ::sqlx::query(&$dialect.rewrite(INSERT_PUNISHMENT))
                    .bind(row.id)
                    .bind(row.target)
                    .bind(row.kind)
                    .bind(row.reason)
                    .bind(row.issuer)
                    .bind(row.issued_at)
                    .bind(row.expires_at)
                    .bind(row.state)
                    .bind(row.ended_at)
                    .bind(row.ended_by)
                    .execute(&mut *tx)
                    .await?;
                ::sqlx::query(&$dialect.rewrite(INSERT_LOG))
                    .bind(log.punishment_id)
                    .bind(log.action)
                    .bind(log.actor)
                    .bind(log.message)
                    .bind(log.created_at)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(())
            }

            async fn get(
                &self,
                id: ::uuid::Uuid,
            ) -> $crate::punishment::StoreResult<$crate::punishment::Punishment> {
                self.fetch(id).await
            }

            async fn find_for_target(
                &self,
                target: $crate::punishment::PlayerId,
                kind: Option<$crate::punishment::PunishmentKind>,
                state: Option<$crate::punishment::PunishmentState>,
            ) -> $crate::punishment::StoreResult<Vec<$crate::punishment::Punishment>> {
                use $crate::punishment::store::sql::{PunishmentRow, select_for_target};

                let sql = $dialect.rewrite(select_for_target(kind.is_some(), state.is_some()));
                let mut query = ::sqlx::query_as::<_, PunishmentRow>(&sql).bind(target.to_string());
                if let Some(kind) = kind {
                    query = query.bind(kind.as_str());
                }
                if let Some(state) = state {
                    query = query.bind(state.as_str());
                }

                query
                    .fetch_all(&self.pool)
                    .await?
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect()
            }

            async fn find_active(
                &self,
                target: $crate::punishment::PlayerId,
                kind: $crate::punishment::PunishmentKind,
            ) -> $crate::punishment::StoreResult<Option<$crate::punishment::Punishment>> {
                use $crate::punishment::store::sql::{PunishmentRow, SELECT_ACTIVE};

                ::sqlx::query_as::<_, PunishmentRow>(&$dialect.rewrite(SELECT_ACTIVE))
                    .bind(target.to_string())
                    .bind(kind.as_str())
                    .fetch_optional(&self.pool)
                    .await?
                    .map(TryInto::try_into)
                    .transpose()
            }

            async fn find_expiring_before(
                &self,
                before: ::chrono::DateTime<::chrono::Utc>,
            ) -> $crate::punishment::StoreResult<Vec<$crate::punishment::Punishment>> {
                use $crate::punishment::store::sql::{PunishmentRow, SELECT_EXPIRING};

                ::sqlx::query_as::<_, PunishmentRow>(&$dialect.rewrite(SELECT_EXPIRING))
                    .bind(before.timestamp_millis())
                    .fetch_all(&self.pool)
                    .await?
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect()
            }

            async fn transition(
                &self,
                id: ::uuid::Uuid,
                to: $crate::punishment::PunishmentState,
                at: ::chrono::DateTime<::chrono::Utc>,
                actor: &$crate::punishment::Actor,
            ) -> $crate::punishment::StoreResult<$crate::punishment::WriteOutcome> {
                use $crate::punishment::store::sql::{INSERT_LOG, PunishmentRow, SELECT_BY_ID, UPDATE_STATE};
                use $crate::punishment::{LogAction, WriteOutcome};

                if !to.is_terminal() {
                    return Err($crate::punishment::StoreError::Conflict(format!(
                        "Punishment {id} cannot transition into {to}"
                    )));
                }

                let mut tx = self.pool.begin().await?;
                let updated = ::sqlx::query(&$dialect.rewrite(UPDATE_STATE))
                    .bind(to.as_str())
                    .bind(at.timestamp_millis())
                    .bind(actor.to_string())
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                if updated == 0 {
                    drop(tx);
                    // Lost the race, or the record does not exist
                    return self.fetch(id).await.map(WriteOutcome::AlreadyTerminal);
                }

                ::sqlx::query(&$dialect.rewrite(INSERT_LOG))
                    .bind(id.to_string())
                    .bind(LogAction::for_state(to).to_string())
                    .bind(actor.to_string())
                    .bind($crate::punishment::store::transition_message(to, actor))
                    .bind(at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
                let row = ::sqlx::query_as::<_, PunishmentRow>(&$dialect.rewrite(SELECT_BY_ID))
                    .bind(id.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(WriteOutcome::Applied(row.try_into()?))
            }

            async fn replace(
                &self,
                previous: ::uuid::Uuid,
                replacement: &$crate::punishment::Punishment,
            ) -> $crate::punishment::StoreResult<$crate::punishment::Punishment> {
                use $crate::punishment::store::sql::{
                    INSERT_LOG, INSERT_PUNISHMENT, PunishmentRow, SELECT_BY_ID, UPDATE_STATE,
                };
                use $crate::punishment::{LogAction, PunishmentState, StoreError};

                let at = replacement.issued_at.timestamp_millis();
                let issuer = replacement.issuer.to_string();
                let row = PunishmentRow::from(replacement);

                let mut tx = self.pool.begin().await?;
                let revoked = ::sqlx::query(&$dialect.rewrite(UPDATE_STATE))
                    .bind(PunishmentState::Revoked.as_str())
                    .bind(at)
                    .bind(&issuer)
                    .bind(previous.to_string())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if revoked == 0 {
                    return Err(StoreError::Conflict(format!(
                        "Punishment {previous} is no longer active"
                    )));
                }

                ::sqlx::query(&$dialect.rewrite(INSERT_PUNISHMENT))
                    .bind(row.id)
                    .bind(row.target)
                    .bind(row.kind)
                    .bind(row.reason)
                    .bind(row.issuer)
                    .bind(row.issued_at)
                    .bind(row.expires_at)
                    .bind(row.state)
                    .bind(row.ended_at)
                    .bind(row.ended_by)
                    .execute(&mut *tx)
                    .await?;

                for (punishment_id, action, message) in [
                    (
                        previous,
                        LogAction::Superseded,
                        format!("Superseded by {}", replacement.id),
                    ),
                    (replacement.id, LogAction::Created, replacement.reason.clone()),
                ] {
                    ::sqlx::query(&$dialect.rewrite(INSERT_LOG))
                        .bind(punishment_id.to_string())
                        .bind(action.to_string())
                        .bind(&issuer)
                        .bind(message)
                        .bind(at)
                        .execute(&mut *tx)
                        .await?;
                }

                let previous_row = ::sqlx::query_as::<_, PunishmentRow>(&$dialect.rewrite(SELECT_BY_ID))
                    .bind(previous.to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;

                previous_row.try_into()
            }

            async fn update_reason(
                &self,
                id: ::uuid::Uuid,
                reason: &str,
                at: ::chrono::DateTime<::chrono::Utc>,
                actor: &$crate::punishment::Actor,
            ) -> $crate::punishment::StoreResult<$crate::punishment::WriteOutcome> {
                use $crate::punishment::store::sql::{INSERT_LOG, PunishmentRow, SELECT_BY_ID, UPDATE_REASON};
                use $crate::punishment::{LogAction, Punishment, StoreError, WriteOutcome};

                let mut tx = self.pool.begin().await?;
                let current: Punishment = ::sqlx::query_as::<_, PunishmentRow>(&$dialect.rewrite(SELECT_BY_ID))
                    .bind(id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(StoreError::NotFound(id))?
                    .try_into()?;

                let updated = ::sqlx::query(&$dialect.rewrite(UPDATE_REASON))
                    .bind(reason)
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if updated == 0 {
                    drop(tx);
                    return self.fetch(id).await.map(WriteOutcome::AlreadyTerminal);
                }

                ::sqlx::query(&$dialect.rewrite(INSERT_LOG))
                    .bind(id.to_string())
                    .bind(LogAction::ReasonChanged.to_string())
                    .bind(actor.to_string())
                    .bind(format!("{} -> {reason}", current.reason))
                    .bind(at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(WriteOutcome::Applied(Punishment {
                    reason: reason.to_string(),
                    ..current
                }))
            }

            async fn update_expiry(
                &self,
                id: ::uuid::Uuid,
                expiry: $crate::punishment::Expiry,
                at: ::chrono::DateTime<::chrono::Utc>,
                actor: &$crate::punishment::Actor,
            ) -> $crate::punishment::StoreResult<$crate::punishment::WriteOutcome> {
                use $crate::punishment::store::sql::{INSERT_LOG, PunishmentRow, SELECT_BY_ID, UPDATE_EXPIRY};
                use $crate::punishment::{LogAction, Punishment, StoreError, WriteOutcome};

                let mut tx = self.pool.begin().await?;
                let current: Punishment = ::sqlx::query_as::<_, PunishmentRow>(&$dialect.rewrite(SELECT_BY_ID))
                    .bind(id.to_string())
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(StoreError::NotFound(id))?
                    .try_into()?;

                let updated = ::sqlx::query(&$dialect.rewrite(UPDATE_EXPIRY))
                    .bind(expiry.instant().map(|at| at.timestamp_millis()))
                    .bind(id.to_string())
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if updated == 0 {
                    drop(tx);
                    return self.fetch(id).await.map(WriteOutcome::AlreadyTerminal);
                }

                ::sqlx::query(&$dialect.rewrite(INSERT_LOG))
                    .bind(id.to_string())
                    .bind(LogAction::DurationChanged.to_string())
                    .bind(actor.to_string())
                    .bind(format!("{} -> {expiry}", current.expiry))
                    .bind(at.timestamp_millis())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;

                Ok(WriteOutcome::Applied(Punishment { expiry, ..current }))
            }

            async fn log_entries(
                &self,
                id: ::uuid::Uuid,
            ) -> $crate::punishment::StoreResult<Vec<$crate::punishment::LogEntry>> {
                use $crate::punishment::store::sql::{LogRow, SELECT_LOG};

                ::sqlx::query_as::<_, LogRow>(&$dialect.rewrite(SELECT_LOG))
                    .bind(id.to_string())
                    .fetch_all(&self.pool)
                    .await?
                    .into_iter()
                    .map(TryInto::try_into)
                    .collect()
            }
        }
    };
}

pub(super) use impl_sql_store;
