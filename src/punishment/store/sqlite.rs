//! SQLite backend

use crate::punishment::store::sql::{Dialect, impl_sql_store};
use crate::punishment::{StoreError, StoreResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Punishment store backed by a SQLite file
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`
    ///
    /// # Errors
    /// Returns an error if the parent directory or the database cannot be created
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Connection(format!("{}: {e}", parent.display())))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened SQLite punishment store");
        Ok(Self { pool })
    }

    /// Private in-memory database, gone when the store is dropped
    ///
    /// # Errors
    /// Returns an error if SQLite cannot be initialised
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection would get its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }
}

impl_sql_store!(SqliteStore, "sqlite", Dialect::Sqlite);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::punishment::{
        Actor, Expiry, LogAction, PlayerId, Punishment, PunishmentKind, PunishmentState,
        PunishmentStore, WriteOutcome,
    };
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    fn now() -> DateTime<Utc> {
        crate::clock::truncate_millis(Utc::now())
    }

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
    }

    fn mute(target: PlayerId, at: DateTime<Utc>) -> Punishment {
        Punishment::new(
            target,
            PunishmentKind::Mute,
            Expiry::At(at + ChronoDuration::minutes(10)),
            "spam",
            Actor::Console,
            at,
        )
    }

    #[tokio::test]
    async fn test_insert_get_and_unique_active() {
        let store = store().await;
        let at = now();
        let target = PlayerId::new();

        let record = mute(target, at);
        store.insert(&record).await.unwrap();
        assert_eq!(store.get(record.id).await.unwrap(), record);

        let duplicate = mute(target, at);
        assert!(matches!(
            store.insert(&duplicate).await,
            Err(StoreError::Conflict(_))
        ));

        assert_eq!(
            store.find_active(target, PunishmentKind::Mute).await.unwrap(),
            Some(record.clone())
        );
        assert_eq!(store.find_active(target, PunishmentKind::Ban).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transition_and_log() {
        let store = store().await;
        let at = now();
        let target = PlayerId::new();
        let record = mute(target, at);
        store.insert(&record).await.unwrap();

        let expired_at = at + ChronoDuration::minutes(10);
        let outcome = store
            .transition(record.id, PunishmentState::Expired, expired_at, &Actor::System)
            .await
            .unwrap();
        let WriteOutcome::Applied(expired) = outcome else {
            panic!("expiry was not applied");
        };
        assert_eq!(expired.state, PunishmentState::Expired);
        assert_eq!(expired.ended_at, Some(expired_at));
        assert_eq!(expired.ended_by, Some(Actor::System));

        // Second writer observes the terminal state
        let outcome = store
            .transition(record.id, PunishmentState::Revoked, expired_at, &Actor::Console)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::AlreadyTerminal(ref p) if p.state == PunishmentState::Expired));

        // The slot is free again
        store.insert(&mute(target, expired_at)).await.unwrap();

        let log = store.log_entries(record.id).await.unwrap();
        let actions: Vec<_> = log.iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![LogAction::Created, LogAction::Expired]);
    }

    #[tokio::test]
    async fn test_replace_and_reason() {
        let store = store().await;
        let at = now();
        let target = PlayerId::new();
        let first = mute(target, at);
        store.insert(&first).await.unwrap();

        let second = Punishment::new(
            target,
            PunishmentKind::Mute,
            Expiry::Permanent,
            "repeat offence",
            Actor::Console,
            at + ChronoDuration::seconds(1),
        );
        let previous = store.replace(first.id, &second).await.unwrap();
        assert_eq!(previous.state, PunishmentState::Revoked);

        let outcome = store
            .update_reason(second.id, "repeat spam", at, &Actor::Console)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(ref p) if p.reason == "repeat spam"));
        assert_eq!(store.get(second.id).await.unwrap().reason, "repeat spam");

        let history = store.find_for_target(target, None, None).await.unwrap();
        assert_eq!(history.len(), 2);
        let active = store
            .find_for_target(target, Some(PunishmentKind::Mute), Some(PunishmentState::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        let revoked = store
            .find_for_target(target, None, Some(PunishmentState::Revoked))
            .await
            .unwrap();
        assert_eq!(revoked.iter().map(|p| p.id).collect::<Vec<_>>(), vec![first.id]);
        assert!(store
            .find_for_target(target, Some(PunishmentKind::Ban), None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_update_expiry() {
        let store = store().await;
        let at = now();
        let record = mute(PlayerId::new(), at);
        store.insert(&record).await.unwrap();

        let extended = Expiry::At(at + ChronoDuration::hours(2));
        let outcome = store
            .update_expiry(record.id, extended, at, &Actor::Console)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(ref p) if p.expiry == extended));
        assert_eq!(store.get(record.id).await.unwrap().expiry, extended);
        assert!(store
            .find_expiring_before(at + ChronoDuration::hours(1))
            .await
            .unwrap()
            .is_empty());

        store
            .update_expiry(record.id, Expiry::Permanent, at, &Actor::Console)
            .await
            .unwrap();
        assert_eq!(store.get(record.id).await.unwrap().expiry, Expiry::Permanent);

        let actions: Vec<_> = store
            .log_entries(record.id)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(
            actions,
            vec![LogAction::Created, LogAction::DurationChanged, LogAction::DurationChanged]
        );

        store
            .transition(record.id, PunishmentState::Revoked, at, &Actor::Console)
            .await
            .unwrap();
        assert!(matches!(
            store
                .update_expiry(record.id, extended, at, &Actor::Console)
                .await
                .unwrap(),
            WriteOutcome::AlreadyTerminal(_)
        ));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("punishments.db");
        let at = now();
        let record = mute(PlayerId::new(), at);

        {
            let store = SqliteStore::open(&path, 2).await.unwrap();
            store.migrate().await.unwrap();
            store.insert(&record).await.unwrap();
            store.pool.close().await;
        }

        let store = SqliteStore::open(&path, 2).await.unwrap();
        store.migrate().await.unwrap();
        let expiring = store
            .find_expiring_before(at + ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(expiring, vec![record]);
    }
}
