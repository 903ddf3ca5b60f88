//! In-memory punishment store
//!
//! Backs tests and single-node deployments that do not need durability. The
//! active index enforces one ACTIVE punishment per (target, kind) the same
//! way the unique index does for the SQL backends.

use crate::punishment::store::{
    PunishmentStore, StoreError, StoreResult, WriteOutcome, transition_message,
};
use crate::punishment::{
    Actor, Expiry, LogAction, LogEntry, PlayerId, Punishment, PunishmentError, PunishmentKind,
    PunishmentState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use uuid::Uuid;

type ActiveKey = (PlayerId, PunishmentKind);

/// Store for punishment records held in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<Uuid, Punishment>>,
    /// ACTIVE punishment per (target, kind)
    active: Arc<DashMap<ActiveKey, Uuid>>,
    logs: Arc<DashMap<Uuid, Vec<LogEntry>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn append_log(&self, entry: LogEntry) {
        self.logs.entry(entry.punishment_id).or_default().push(entry);
    }

    /// Whether the record an index entry points at is still ACTIVE.
    /// Takes the records lock while the caller holds the index entry.
    fn indexed_is_active(&self, id: &Uuid) -> bool {
        self.records.get(id).is_some_and(|record| record.is_active())
    }

    fn release_index(&self, record: &Punishment) {
        self.active
            .remove_if(&(record.target, record.kind), |_, id| *id == record.id);
    }
}

fn conflict(record: &Punishment) -> StoreError {
    StoreError::Conflict(format!(
        "{} already has an active {}",
        record.target, record.kind
    ))
}

/// Map a rejected in-memory state change onto a store outcome
fn rejected(record: &Punishment, error: PunishmentError) -> StoreResult<WriteOutcome> {
    match error {
        PunishmentError::AlreadyTerminal { .. } => {
            Ok(WriteOutcome::AlreadyTerminal(record.clone()))
        }
        other => Err(StoreError::Conflict(other.to_string())),
    }
}

#[async_trait]
impl PunishmentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn migrate(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn insert(&self, punishment: &Punishment) -> StoreResult<()> {
        if self.records.contains_key(&punishment.id) {
            return Err(StoreError::Conflict(format!(
                "Punishment {} already exists",
                punishment.id
            )));
        }

        match self.active.entry((punishment.target, punishment.kind)) {
            Entry::Occupied(mut entry) => {
                if self.indexed_is_active(entry.get()) {
                    return Err(conflict(punishment));
                }
                // Stale entry left by a transition that has not released it yet
                entry.insert(punishment.id);
            }
            Entry::Vacant(entry) => {
                entry.insert(punishment.id);
            }
        }

        self.records.insert(punishment.id, punishment.clone());
        self.append_log(LogEntry::new(
            punishment.id,
            LogAction::Created,
            punishment.issuer.clone(),
            punishment.reason.clone(),
            punishment.issued_at,
        ));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Punishment> {
        self.records
            .get(&id)
            .map(|record| record.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn find_for_target(
        &self,
        target: PlayerId,
        kind: Option<PunishmentKind>,
        state: Option<PunishmentState>,
    ) -> StoreResult<Vec<Punishment>> {
        let mut found: Vec<Punishment> = self
            .records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.target == target
                    && kind.is_none_or(|kind| record.kind == kind)
                    && state.is_none_or(|state| record.state == state)
            })
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|record| record.issued_at);
        Ok(found)
    }

    async fn find_active(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
    ) -> StoreResult<Option<Punishment>> {
        let Some(id) = self.active.get(&(target, kind)).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self
            .records
            .get(&id)
            .filter(|record| record.is_active())
            .map(|record| record.clone()))
    }

    async fn find_expiring_before(&self, before: DateTime<Utc>) -> StoreResult<Vec<Punishment>> {
        let mut found: Vec<Punishment> = self
            .records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.is_active() && record.expiry.instant().is_some_and(|at| at <= before)
            })
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|record| record.expiry.instant());
        Ok(found)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: PunishmentState,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<WriteOutcome> {
        let updated = {
            let mut record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if let Err(error) = record.transition(to, at, actor) {
                return rejected(&record, error);
            }
            record.clone()
        };

        self.release_index(&updated);
        self.append_log(LogEntry::new(
            id,
            LogAction::for_state(to),
            actor.clone(),
            transition_message(to, actor),
            at,
        ));
        Ok(WriteOutcome::Applied(updated))
    }

    async fn replace(&self, previous: Uuid, replacement: &Punishment) -> StoreResult<Punishment> {
        let key = (replacement.target, replacement.kind);
        let Entry::Occupied(mut slot) = self.active.entry(key) else {
            return Err(StoreError::Conflict(format!(
                "Punishment {previous} is no longer active"
            )));
        };
        if *slot.get() != previous {
            return Err(StoreError::Conflict(format!(
                "Punishment {previous} is not the active {} of {}",
                replacement.kind, replacement.target
            )));
        }

        let revoked = {
            let mut record = self
                .records
                .get_mut(&previous)
                .ok_or(StoreError::NotFound(previous))?;
            record
                .revoke(replacement.issued_at, replacement.issuer.clone())
                .map_err(|e| StoreError::Conflict(e.to_string()))?;
            record.clone()
        };

        self.records.insert(replacement.id, replacement.clone());
        slot.insert(replacement.id);
        drop(slot);

        self.append_log(LogEntry::new(
            previous,
            LogAction::Superseded,
            replacement.issuer.clone(),
            format!("Superseded by {}", replacement.id),
            replacement.issued_at,
        ));
        self.append_log(LogEntry::new(
            replacement.id,
            LogAction::Created,
            replacement.issuer.clone(),
            replacement.reason.clone(),
            replacement.issued_at,
        ));
        Ok(revoked)
    }

    async fn update_reason(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<WriteOutcome> {
        let (updated, previous_reason) = {
            let mut record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let previous_reason = record.reason.clone();
            if let Err(error) = record.change_reason(reason) {
                return rejected(&record, error);
            }
            (record.clone(), previous_reason)
        };

        self.append_log(LogEntry::new(
            id,
            LogAction::ReasonChanged,
            actor.clone(),
            format!("{previous_reason} -> {reason}"),
            at,
        ));
        Ok(WriteOutcome::Applied(updated))
    }

    async fn update_expiry(
        &self,
        id: Uuid,
        expiry: Expiry,
        at: DateTime<Utc>,
        actor: &Actor,
    ) -> StoreResult<WriteOutcome> {
        let (updated, previous_expiry) = {
            let mut record = self.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            let previous_expiry = record.expiry;
            if let Err(error) = record.change_expiry(expiry) {
                return rejected(&record, error);
            }
            (record.clone(), previous_expiry)
        };

        self.append_log(LogEntry::new(
            id,
            LogAction::DurationChanged,
            actor.clone(),
            format!("{previous_expiry} -> {expiry}"),
            at,
        ));
        Ok(WriteOutcome::Applied(updated))
    }

    async fn log_entries(&self, id: Uuid) -> StoreResult<Vec<LogEntry>> {
        Ok(self
            .logs
            .get(&id)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ban(target: PlayerId, now: DateTime<Utc>) -> Punishment {
        Punishment::new(
            target,
            PunishmentKind::Ban,
            Expiry::At(now + Duration::minutes(10)),
            "griefing",
            Actor::Console,
            now,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = ban(PlayerId::new(), now);

        store.insert(&record).await.unwrap();

        assert_eq!(store.get(record.id).await.unwrap(), record);
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));

        let log = store.log_entries(record.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, LogAction::Created);
    }

    #[tokio::test]
    async fn test_one_active_per_target_and_kind() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let target = PlayerId::new();

        let first = ban(target, now);
        store.insert(&first).await.unwrap();

        let second = ban(target, now);
        assert!(matches!(
            store.insert(&second).await,
            Err(StoreError::Conflict(_))
        ));

        // A mute for the same player is independent
        let mut mute = ban(target, now);
        mute.kind = PunishmentKind::Mute;
        store.insert(&mute).await.unwrap();

        // Once the ban ends a new one may be imposed
        store
            .transition(first.id, PunishmentState::Revoked, now, &Actor::Console)
            .await
            .unwrap();
        store.insert(&second).await.unwrap();
        assert_eq!(
            store
                .find_active(target, PunishmentKind::Ban)
                .await
                .unwrap()
                .map(|p| p.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = ban(PlayerId::new(), now);
        store.insert(&record).await.unwrap();

        let outcome = store
            .transition(record.id, PunishmentState::Revoked, now, &Actor::Console)
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied(ref p) if p.state == PunishmentState::Revoked));

        // A late expiry loses to the revocation
        let outcome = store
            .transition(
                record.id,
                PunishmentState::Expired,
                now + Duration::minutes(11),
                &Actor::System,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::AlreadyTerminal(ref p) if p.state == PunishmentState::Revoked));

        let log = store.log_entries(record.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].action, LogAction::Revoked);
    }

    #[tokio::test]
    async fn test_find_expiring_before() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let soon = ban(PlayerId::new(), now);
        let mut later = ban(PlayerId::new(), now);
        later.expiry = Expiry::At(now + Duration::hours(2));
        let mut permanent = ban(PlayerId::new(), now);
        permanent.expiry = Expiry::Permanent;

        for record in [&later, &soon, &permanent] {
            store.insert(record).await.unwrap();
        }

        let due = store
            .find_expiring_before(now + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(due.iter().map(|p| p.id).collect::<Vec<_>>(), vec![soon.id]);

        let due = store
            .find_expiring_before(now + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(
            due.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![soon.id, later.id]
        );
    }

    #[tokio::test]
    async fn test_replace_revokes_previous() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let target = PlayerId::new();

        let first = ban(target, now);
        store.insert(&first).await.unwrap();

        let second = ban(target, now + Duration::seconds(1));
        let revoked = store.replace(first.id, &second).await.unwrap();
        assert_eq!(revoked.id, first.id);
        assert_eq!(revoked.state, PunishmentState::Revoked);

        let active = store.find_for_target(target, None, Some(PunishmentState::Active)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);

        // Replacing a record that is no longer active fails
        let third = ban(target, now + Duration::seconds(2));
        assert!(matches!(
            store.replace(first.id, &third).await,
            Err(StoreError::Conflict(_))
        ));

        let log = store.log_entries(first.id).await.unwrap();
        assert_eq!(log.last().map(|e| e.action), Some(LogAction::Superseded));
    }

    #[tokio::test]
    async fn test_update_reason() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = ban(PlayerId::new(), now);
        store.insert(&record).await.unwrap();

        let outcome = store
            .update_reason(record.id, "x-ray", now, &Actor::Console)
            .await
            .unwrap();
        let WriteOutcome::Applied(updated) = outcome else {
            panic!("reason change was not applied");
        };
        assert_eq!(updated.reason, "x-ray");
        assert_eq!(updated.id, record.id);

        store
            .transition(record.id, PunishmentState::Revoked, now, &Actor::Console)
            .await
            .unwrap();
        assert!(matches!(
            store.update_reason(record.id, "late", now, &Actor::Console).await.unwrap(),
            WriteOutcome::AlreadyTerminal(_)
        ));
    }

    #[tokio::test]
    async fn test_update_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = ban(PlayerId::new(), now);
        store.insert(&record).await.unwrap();

        let WriteOutcome::Applied(updated) = store
            .update_expiry(record.id, Expiry::Permanent, now, &Actor::Console)
            .await
            .unwrap()
        else {
            panic!("expiry change was not applied");
        };
        assert_eq!(updated.expiry, Expiry::Permanent);
        assert!(store.find_expiring_before(now + Duration::days(1)).await.unwrap().is_empty());

        let log = store.log_entries(record.id).await.unwrap();
        assert_eq!(log.last().map(|e| e.action), Some(LogAction::DurationChanged));

        assert!(matches!(
            store
                .update_expiry(Uuid::new_v4(), Expiry::Permanent, now, &Actor::Console)
                .await,
            Err(StoreError::NotFound(_))
        ));
    }
}
