//! Punishment store
//!
//! The store is the single source of truth for punishment records. Every
//! backend implements [`PunishmentStore`]; which one runs is chosen from
//! configuration by [`connect`].

mod memory;
mod mysql;
mod postgres;
mod sql;
mod sqlite;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use crate::config::{Backend, DatabaseConfig};
use crate::punishment::{
    Actor, Expiry, LogEntry, PlayerId, Punishment, PunishmentKind, PunishmentState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Errors raised by store backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with this ID
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// A uniqueness rule rejected the write
    #[error("Write conflicts with an existing record: {0}")]
    Conflict(String),

    /// The backend could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed the statement
    #[error("Query failed: {0}")]
    Query(String),

    /// A stored row could not be decoded
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    /// Transient failures worth retrying
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Query(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(e) if e.is_unique_violation() => {
                Self::Conflict(e.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(error.to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a conditional write against an ACTIVE record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied; holds the updated record
    Applied(Punishment),
    /// The record was already terminal; holds it unchanged
    AlreadyTerminal(Punishment),
}

/// Durable storage for punishment records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PunishmentStore: Send + Sync {
    /// Backend name for diagnostics
    fn backend(&self) -> &'static str;

    /// Create tables and indices if they are missing
    async fn migrate(&self) -> StoreResult<()>;

    /// Persist a new ACTIVE punishment with its creation log entry.
    ///
    /// Fails with [`StoreError::Conflict`] if the target already has an ACTIVE
    /// punishment of the same kind.
    async fn insert(&self, punishment: &Punishment) -> StoreResult<()>;

    /// Fetch a punishment in any state
    async fn get(&self, id: Uuid) -> StoreResult<Punishment>;

    /// All punishments of a player, optionally filtered
    async fn find_for_target(
        &self,
        target: PlayerId,
        kind: Option<PunishmentKind>,
        state: Option<PunishmentState>,
    ) -> StoreResult<Vec<Punishment>>;

    /// The ACTIVE punishment of a kind for a player, if any
    async fn find_active(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
    ) -> StoreResult<Option<Punishment>>;

    /// ACTIVE temporary punishments expiring at or before `before`, soonest first
    async fn find_expiring_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<Punishment>>;

    /// Move an ACTIVE punishment into a terminal state.
    ///
    /// The write only applies if the record is still ACTIVE, which makes
    /// concurrent expire/revoke from several nodes resolve to exactly one winner.
    async fn transition(
        &self,
        id: Uuid,
        to: PunishmentState,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<WriteOutcome>;

    /// Revoke `previous` and insert `replacement` in one transaction.
    ///
    /// Returns the revoked previous record. Fails with
    /// [`StoreError::Conflict`] if `previous` is no longer ACTIVE.
    async fn replace(&self, previous: Uuid, replacement: &Punishment) -> StoreResult<Punishment>;

    /// Change the reason of an ACTIVE punishment
    async fn update_reason(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<WriteOutcome>;

    /// Change the expiry of an ACTIVE punishment
    async fn update_expiry(
        &self,
        id: Uuid,
        expiry: Expiry,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<WriteOutcome>;

    /// Audit log of a punishment, oldest first
    async fn log_entries(&self, id: Uuid) -> StoreResult<Vec<LogEntry>>;
}

/// Open the configured backend and run its migrations
///
/// # Errors
/// Returns an error if the backend cannot be reached or migrated
pub async fn connect(config: &DatabaseConfig) -> StoreResult<Arc<dyn PunishmentStore>> {
    let store: Arc<dyn PunishmentStore> = match config.backend {
        Backend::Sqlite => Arc::new(SqliteStore::open(&config.path, config.max_connections).await?),
        Backend::Postgres => Arc::new(PostgresStore::connect(config).await?),
        Backend::Mysql => Arc::new(MySqlStore::connect(config).await?),
        Backend::Memory => Arc::new(MemoryStore::new()),
    };

    store.migrate().await?;
    info!(
        backend = store.backend(),
        url = %config.connection_url(),
        "Punishment store ready"
    );
    Ok(store)
}

/// Message recorded in the log for a state transition
pub(crate) fn transition_message(to: PunishmentState, actor: &Actor) -> String {
    match to {
        PunishmentState::Expired => "Expired after its duration ran out".to_string(),
        PunishmentState::Revoked => format!("Revoked by {actor}"),
        PunishmentState::Active => "Created".to_string(),
    }
}
