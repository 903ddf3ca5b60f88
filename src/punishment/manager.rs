//! Punishment manager
//!
//! The only mutation path for punishments. Every mutating operation for a
//! player runs under that player's lock, writes to the store first, then
//! updates the cache, the scheduler and the event bus in commit order.

use crate::clock::Clock;
use crate::punishment::{
    Actor, EventBus, Expiry, Kick, LogEntry, Notification, PlayerId, Punishment, PunishmentCache,
    PunishmentDuration, PunishmentError, PunishmentEvent, PunishmentKind, PunishmentResult,
    PunishmentState, PunishmentStore, SchedulerHandle, StoreError, WriteOutcome,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, info};
use uuid::Uuid;

/// Result of [`PunishmentManager::supersede`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersedeOutcome {
    /// The punishment that was revoked to make room, if any
    pub previous: Option<Punishment>,
    pub current: Punishment,
}

/// Held for the duration of a mutation on one player
struct PlayerGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    player: PlayerId,
    locks: &'a DashMap<PlayerId, Arc<Mutex<()>>>,
}

impl Drop for PlayerGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so the map only holds its own reference when idle
        drop(self.guard.take());
        self.locks
            .remove_if(&self.player, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Public API for imposing, revoking and querying punishments
pub struct PunishmentManager {
    store: Arc<dyn PunishmentStore>,
    cache: Arc<PunishmentCache>,
    bus: Arc<EventBus>,
    scheduler: SchedulerHandle,
    clock: Arc<dyn Clock>,
    locks: DashMap<PlayerId, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for PunishmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PunishmentManager")
            .field("backend", &self.store.backend())
            .field("cached", &self.cache.len())
            .field("locked_players", &self.locks.len())
            .finish_non_exhaustive()
    }
}

fn validate_reason(reason: &str) -> PunishmentResult<()> {
    if reason.trim().is_empty() {
        return Err(PunishmentError::validation("Reason must not be empty"));
    }
    Ok(())
}

fn validate_standing(kind: PunishmentKind) -> PunishmentResult<()> {
    if !kind.is_standing() {
        return Err(PunishmentError::validation(format!(
            "{kind} is not a standing punishment"
        )));
    }
    Ok(())
}

impl PunishmentManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn PunishmentStore>,
        cache: Arc<PunishmentCache>,
        bus: Arc<EventBus>,
        scheduler: SchedulerHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            scheduler,
            clock,
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PunishmentCache> {
        &self.cache
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Receive lifecycle events and kicks committed from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    async fn lock_player(&self, player: PlayerId) -> PlayerGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(player).or_default());
        let guard = lock.lock_owned().await;
        PlayerGuard {
            guard: Some(guard),
            player,
            locks: &self.locks,
        }
    }

    /// Cached record, or the stored one. Target, kind and issue time never
    /// change, so either is good enough to find the lock.
    async fn load(&self, id: Uuid) -> PunishmentResult<Punishment> {
        if let Some(record) = self.cache.get(id) {
            return Ok(record);
        }
        let record = self.store.get(id).await?;
        self.cache.fill(&record);
        Ok(record)
    }

    fn schedule(&self, record: &Punishment) {
        if let Expiry::At(at) = record.expiry {
            self.scheduler.schedule(record.id, at);
        }
    }

    /// Apply a committed terminal transition; caller holds the player lock
    async fn commit_ended(&self, record: &Punishment, at: DateTime<Utc>) {
        self.cache.put(record);
        self.scheduler.cancel(record.id);
        self.bus
            .publish(Notification::Lifecycle(PunishmentEvent::ended(record, at)))
            .await;
    }

    async fn commit_created(&self, record: &Punishment) {
        self.cache.put(record);
        self.schedule(record);
        self.bus
            .publish(Notification::Lifecycle(PunishmentEvent::created(record)))
            .await;
    }

    /// Expire `record` if it is ACTIVE but past due; caller holds the player lock.
    ///
    /// Returns whether it is out of the way.
    async fn expire_overdue(&self, record: &Punishment, now: DateTime<Utc>) -> PunishmentResult<bool> {
        if !record.is_due_for_expiry(now) {
            return Ok(false);
        }
        match self
            .store
            .transition(record.id, PunishmentState::Expired, now, &Actor::System)
            .await?
        {
            WriteOutcome::Applied(expired) => self.commit_ended(&expired, now).await,
            WriteOutcome::AlreadyTerminal(current) => self.cache.put(&current),
        }
        Ok(true)
    }

    /// Impose a new ban or mute.
    ///
    /// # Errors
    /// - [`PunishmentError::Validation`] for kicks, an empty reason, or a
    ///   duration that does not end in the future
    /// - [`PunishmentError::Conflict`] if the target already has an active
    ///   punishment of this kind
    /// - [`PunishmentError::Storage`] if the store write fails
    pub async fn impose(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
        duration: PunishmentDuration,
        reason: impl Into<String>,
        issuer: Actor,
    ) -> PunishmentResult<Punishment> {
        let reason = reason.into();
        validate_standing(kind)?;
        validate_reason(&reason)?;

        let _guard = self.lock_player(target).await;
        let now = self.clock.now();
        let expiry = duration.resolve(now)?;

        if let Some(existing) = self.store.find_active(target, kind).await? {
            if !self.expire_overdue(&existing, now).await? {
                self.cache.put(&existing);
                return Err(PunishmentError::Conflict { target, kind });
            }
        }

        let record = Punishment::new(target, kind, expiry, reason, issuer, now);
        match self.store.insert(&record).await {
            Ok(()) => {}
            // Another node won the race for the active slot
            Err(StoreError::Conflict(_)) => {
                self.cache.invalidate_active(target, kind);
                return Err(PunishmentError::Conflict { target, kind });
            }
            Err(e) => return Err(e.into()),
        }

        self.commit_created(&record).await;
        Ok(record)
    }

    /// Replace the target's active punishment of this kind, if any, with a
    /// new one in a single store transaction.
    ///
    /// # Errors
    /// Same validation as [`impose`](Self::impose); [`PunishmentError::Conflict`]
    /// if another node changed the active punishment concurrently
    pub async fn supersede(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
        duration: PunishmentDuration,
        reason: impl Into<String>,
        issuer: Actor,
    ) -> PunishmentResult<SupersedeOutcome> {
        let reason = reason.into();
        validate_standing(kind)?;
        validate_reason(&reason)?;

        let _guard = self.lock_player(target).await;
        let now = self.clock.now();
        let expiry = duration.resolve(now)?;
        let record = Punishment::new(target, kind, expiry, reason, issuer, now);

        let mut existing = self.store.find_active(target, kind).await?;
        if let Some(record) = &existing {
            if self.expire_overdue(record, now).await? {
                existing = None;
            }
        }

        let Some(existing) = existing else {
            match self.store.insert(&record).await {
                Ok(()) => {}
                Err(StoreError::Conflict(_)) => {
                    self.cache.invalidate_active(target, kind);
                    return Err(PunishmentError::Conflict { target, kind });
                }
                Err(e) => return Err(e.into()),
            }
            self.commit_created(&record).await;
            return Ok(SupersedeOutcome {
                previous: None,
                current: record,
            });
        };

        let previous = match self.store.replace(existing.id, &record).await {
            Ok(previous) => previous,
            Err(StoreError::Conflict(_)) => {
                self.cache.invalidate(existing.id);
                self.cache.invalidate_active(target, kind);
                return Err(PunishmentError::Conflict { target, kind });
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            punishment_id = %record.id,
            previous_id = %previous.id,
            target_player = %target,
            kind = %kind,
            "Punishment superseded"
        );
        self.commit_ended(&previous, now).await;
        self.commit_created(&record).await;

        Ok(SupersedeOutcome {
            previous: Some(previous),
            current: record,
        })
    }

    /// Revoke an active punishment.
    ///
    /// # Errors
    /// [`PunishmentError::NotFound`] for an unknown ID,
    /// [`PunishmentError::AlreadyTerminal`] if it already ended
    pub async fn revoke(&self, id: Uuid, revoked_by: Actor) -> PunishmentResult<Punishment> {
        let record = self.load(id).await?;
        let _guard = self.lock_player(record.target).await;
        let now = self.clock.now();

        match self
            .store
            .transition(id, PunishmentState::Revoked, now, &revoked_by)
            .await?
        {
            WriteOutcome::Applied(revoked) => {
                self.commit_ended(&revoked, now).await;
                Ok(revoked)
            }
            WriteOutcome::AlreadyTerminal(current) => {
                self.cache.put(&current);
                Err(PunishmentError::AlreadyTerminal {
                    id,
                    state: current.state,
                })
            }
        }
    }

    /// Expire a punishment whose expiry instant has been reached.
    ///
    /// # Errors
    /// [`PunishmentError::Validation`] if it is permanent or not yet due,
    /// [`PunishmentError::AlreadyTerminal`] if it already ended
    pub async fn expire(&self, id: Uuid) -> PunishmentResult<Punishment> {
        let record = self.load(id).await?;
        if record.state.is_terminal() {
            return Err(PunishmentError::AlreadyTerminal {
                id,
                state: record.state,
            });
        }

        let _guard = self.lock_player(record.target).await;
        // The expiry may have been changed since the timer was set
        let record = self.store.get(id).await?;
        if record.state.is_terminal() {
            self.cache.put(&record);
            return Err(PunishmentError::AlreadyTerminal {
                id,
                state: record.state,
            });
        }

        let now = self.clock.now();
        match record.expiry {
            Expiry::Permanent => {
                return Err(PunishmentError::validation(format!(
                    "Punishment {id} is permanent"
                )));
            }
            Expiry::At(at) if at > now => {
                return Err(PunishmentError::validation(format!(
                    "Punishment {id} is not due until {}",
                    at.to_rfc3339()
                )));
            }
            Expiry::At(_) => {}
        }

        match self
            .store
            .transition(id, PunishmentState::Expired, now, &Actor::System)
            .await?
        {
            WriteOutcome::Applied(expired) => {
                self.commit_ended(&expired, now).await;
                Ok(expired)
            }
            WriteOutcome::AlreadyTerminal(current) => {
                self.cache.put(&current);
                Err(PunishmentError::AlreadyTerminal {
                    id,
                    state: current.state,
                })
            }
        }
    }

    /// Replace the reason of an active punishment, keeping its identity and timing
    ///
    /// # Errors
    /// [`PunishmentError::Validation`] for an empty reason,
    /// [`PunishmentError::AlreadyTerminal`] if the punishment already ended
    pub async fn change_reason(
        &self,
        id: Uuid,
        reason: impl Into<String>,
        actor: Actor,
    ) -> PunishmentResult<Punishment> {
        let reason = reason.into();
        validate_reason(&reason)?;

        let record = self.load(id).await?;
        let _guard = self.lock_player(record.target).await;
        let now = self.clock.now();

        match self.store.update_reason(id, &reason, now, &actor).await? {
            WriteOutcome::Applied(updated) => {
                self.cache.put(&updated);
                self.bus
                    .publish(Notification::Lifecycle(PunishmentEvent::reason_changed(
                        &updated, now,
                    )))
                    .await;
                Ok(updated)
            }
            WriteOutcome::AlreadyTerminal(current) => {
                self.cache.put(&current);
                Err(PunishmentError::AlreadyTerminal {
                    id,
                    state: current.state,
                })
            }
        }
    }

    /// Replace the expiry of an active punishment.
    ///
    /// A relative duration counts from when the punishment was issued, so
    /// `30m` on a mute issued an hour ago is rejected as already over.
    ///
    /// # Errors
    /// [`PunishmentError::Validation`] if the new expiry is not in the future,
    /// [`PunishmentError::AlreadyTerminal`] if the punishment already ended
    pub async fn change_duration(
        &self,
        id: Uuid,
        duration: PunishmentDuration,
        actor: Actor,
    ) -> PunishmentResult<Punishment> {
        let record = self.load(id).await?;
        let _guard = self.lock_player(record.target).await;
        let now = self.clock.now();

        let expiry = duration.resolve(record.issued_at)?;
        if expiry.is_due(now) {
            return Err(PunishmentError::validation(format!(
                "Expiry {expiry} is not in the future"
            )));
        }

        match self.store.update_expiry(id, expiry, now, &actor).await? {
            WriteOutcome::Applied(updated) => {
                self.cache.put(&updated);
                match updated.expiry {
                    Expiry::At(at) => self.scheduler.schedule(id, at),
                    Expiry::Permanent => self.scheduler.cancel(id),
                };
                self.bus
                    .publish(Notification::Lifecycle(PunishmentEvent::duration_changed(
                        &updated, now,
                    )))
                    .await;
                Ok(updated)
            }
            WriteOutcome::AlreadyTerminal(current) => {
                self.cache.put(&current);
                Err(PunishmentError::AlreadyTerminal {
                    id,
                    state: current.state,
                })
            }
        }
    }

    /// Publish a one-shot kick; nothing is persisted
    ///
    /// # Errors
    /// [`PunishmentError::Validation`] for an empty reason
    pub async fn kick(
        &self,
        target: PlayerId,
        reason: impl Into<String>,
        issuer: Actor,
    ) -> PunishmentResult<Kick> {
        let reason = reason.into();
        validate_reason(&reason)?;

        let _guard = self.lock_player(target).await;
        let kick = Kick {
            id: Uuid::new_v4(),
            target,
            reason,
            issuer,
            issued_at: self.clock.now(),
        };
        info!(
            kick_id = %kick.id,
            target_player = %target,
            issuer = %kick.issuer,
            "Player kicked"
        );
        self.bus.publish(Notification::Kick(kick.clone())).await;
        Ok(kick)
    }

    /// The punishment currently in effect, read from the store.
    ///
    /// The cached lookup is refreshed with the result, which picks up changes
    /// committed by other nodes. A punishment past its expiry that the
    /// scheduler has not reached yet is not in effect.
    ///
    /// # Errors
    /// [`PunishmentError::Storage`] if the store cannot be read
    pub async fn query_active(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
    ) -> PunishmentResult<Option<Punishment>> {
        let found = {
            let _guard = self.lock_player(target).await;
            let found = self.store.find_active(target, kind).await?;
            self.cache.refresh_active(target, kind, found.as_ref());
            found
        };

        let now = self.clock.now();
        Ok(found.filter(|record| {
            if record.is_due_for_expiry(now) {
                debug!(punishment_id = %record.id, "Active punishment is overdue for expiry");
                self.schedule(record);
                return false;
            }
            true
        }))
    }

    /// Cache-backed variant of [`query_active`](Self::query_active) for
    /// enforcement hot paths; may lag the store by up to the cache TTL
    ///
    /// # Errors
    /// [`PunishmentError::Storage`] on a cache miss the store cannot serve
    pub async fn query_active_cached(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
    ) -> PunishmentResult<Option<Punishment>> {
        match self.cache.get_active_for(target, kind) {
            Some(cached) => {
                let now = self.clock.now();
                Ok(cached.filter(|record| record.is_in_effect(now)))
            }
            None => self.query_active(target, kind).await,
        }
    }

    /// Any punishment by ID, regardless of state
    ///
    /// # Errors
    /// [`PunishmentError::NotFound`] for an unknown ID
    pub async fn query(&self, id: Uuid) -> PunishmentResult<Punishment> {
        let record = self.store.get(id).await?;
        self.cache.fill(&record);
        Ok(record)
    }

    /// Every punishment of a player, newest first
    ///
    /// # Errors
    /// [`PunishmentError::Storage`] if the store cannot be read
    pub async fn history(&self, target: PlayerId) -> PunishmentResult<Vec<Punishment>> {
        let mut records = self.store.find_for_target(target, None, None).await?;
        records.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(records)
    }

    /// Audit log of a punishment, oldest first
    ///
    /// # Errors
    /// [`PunishmentError::NotFound`] for an unknown ID
    pub async fn log(&self, id: Uuid) -> PunishmentResult<Vec<LogEntry>> {
        let entries = self.store.log_entries(id).await?;
        if entries.is_empty() {
            // Distinguish "no entries" from "no such punishment"
            self.store.get(id).await?;
        }
        Ok(entries)
    }

    /// ACTIVE temporary punishments expiring at or before `before`
    ///
    /// # Errors
    /// [`PunishmentError::Storage`] if the store cannot be read
    pub async fn find_expiring_before(
        &self,
        before: DateTime<Utc>,
    ) -> PunishmentResult<Vec<Punishment>> {
        Ok(self.store.find_expiring_before(before).await?)
    }
}
