//! Expiration scheduler
//!
//! Holds an ordered timer queue of temporary punishments expiring within the
//! lookahead window and expires each through the [`PunishmentManager`] once
//! due. The queue is rebuilt from the store on startup and re-scanned
//! periodically, so losing it never leaves a punishment ACTIVE indefinitely.

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::logging::log_storage_failure;
use crate::punishment::{
    Expiry, PunishmentError, PunishmentManager, PunishmentResult, SchedulerRequest,
};
use crate::SCHEDULER_TARGET;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of firing one timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The punishment transitioned to EXPIRED
    Expired,
    /// Someone else ended it first
    AlreadyTerminal,
    /// The store disagrees about the expiry instant; re-queued for it
    Rescheduled(DateTime<Utc>),
    /// Given up until the next re-scan
    Dropped,
}

/// Sending side of the scheduler's request channel
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    sender: UnboundedSender<SchedulerRequest>,
}

impl SchedulerHandle {
    /// Create a handle and the receiver the scheduler task consumes.
    ///
    /// Sends never block, so callers holding a per-player lock cannot stall
    /// behind a scheduler that is itself waiting for that lock.
    #[must_use]
    pub fn channel() -> (Self, UnboundedReceiver<SchedulerRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, request: SchedulerRequest) -> bool {
        if self.sender.send(request).is_err() {
            debug!(target: SCHEDULER_TARGET, "Scheduler is not running; request dropped");
            return false;
        }
        true
    }

    /// Track a punishment's expiry
    pub fn schedule(&self, punishment_id: Uuid, expires_at: DateTime<Utc>) -> bool {
        self.send(SchedulerRequest::Schedule {
            punishment_id,
            expires_at,
        })
    }

    pub fn cancel(&self, punishment_id: Uuid) -> bool {
        self.send(SchedulerRequest::Cancel { punishment_id })
    }

    pub fn rescan(&self) -> bool {
        self.send(SchedulerRequest::Rescan)
    }

    pub fn shutdown(&self) -> bool {
        self.send(SchedulerRequest::Shutdown)
    }
}

/// Background expirer of temporary punishments
pub struct ExpirationScheduler {
    manager: Arc<PunishmentManager>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    receiver: Option<UnboundedReceiver<SchedulerRequest>>,
    /// Timers ordered by expiry instant
    queue: BTreeSet<(DateTime<Utc>, Uuid)>,
    /// Expiry instant of every queued punishment
    timers: HashMap<Uuid, DateTime<Utc>>,
}

impl ExpirationScheduler {
    #[must_use]
    pub fn new(
        manager: Arc<PunishmentManager>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        receiver: UnboundedReceiver<SchedulerRequest>,
    ) -> Self {
        Self {
            manager,
            clock,
            config,
            receiver: Some(receiver),
            queue: BTreeSet::new(),
            timers: HashMap::new(),
        }
    }

    /// Number of queued timers
    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, punishment_id: Uuid) -> bool {
        self.timers.contains_key(&punishment_id)
    }

    /// Earliest queued expiry
    #[must_use]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }

    /// End of the lookahead window
    fn horizon(&self) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_add_signed(self.config.lookahead())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Queue a timer if it falls inside the lookahead window, replacing any
    /// earlier timer for the same punishment.
    ///
    /// Returns whether the timer is now queued. Later expiries are picked up
    /// by a re-scan once they come within the window.
    pub fn schedule(&mut self, punishment_id: Uuid, expires_at: DateTime<Utc>) -> bool {
        if expires_at > self.horizon() {
            debug!(
                target: SCHEDULER_TARGET,
                punishment_id = %punishment_id,
                expires_at = %expires_at,
                "Expiry beyond lookahead, deferred to re-scan"
            );
            self.cancel(punishment_id);
            return false;
        }

        if let Some(previous) = self.timers.insert(punishment_id, expires_at) {
            self.queue.remove(&(previous, punishment_id));
        }
        self.queue.insert((expires_at, punishment_id));
        true
    }

    /// Forget a timer
    pub fn cancel(&mut self, punishment_id: Uuid) -> bool {
        match self.timers.remove(&punishment_id) {
            Some(at) => {
                self.queue.remove(&(at, punishment_id));
                true
            }
            None => false,
        }
    }

    /// Load every ACTIVE punishment expiring within the lookahead window
    ///
    /// # Errors
    /// Returns an error if the store cannot be read
    pub async fn rescan(&mut self) -> PunishmentResult<usize> {
        let due = self.manager.find_expiring_before(self.horizon()).await?;

        let mut loaded = 0;
        for record in &due {
            if let Expiry::At(at) = record.expiry {
                if self.schedule(record.id, at) {
                    loaded += 1;
                }
            }
        }
        debug!(
            target: SCHEDULER_TARGET,
            loaded,
            queued = self.len(),
            "Re-scanned store for expiring punishments"
        );
        Ok(loaded)
    }

    /// Fire every timer whose instant has been reached
    pub async fn fire_due(&mut self) -> Vec<(Uuid, ExpiryOutcome)> {
        let now = self.clock.now();
        let mut due = Vec::new();
        while let Some(&(at, id)) = self.queue.first() {
            if at > now {
                break;
            }
            self.queue.pop_first();
            self.timers.remove(&id);
            due.push(id);
        }

        let mut outcomes = Vec::with_capacity(due.len());
        for id in due {
            let outcome = self.expire_with_retry(id).await;
            outcomes.push((id, outcome));
        }
        outcomes
    }

    async fn expire_with_retry(&mut self, punishment_id: Uuid) -> ExpiryOutcome {
        let mut attempt: u32 = 0;
        loop {
            let error = match self.manager.expire(punishment_id).await {
                Ok(_) => return ExpiryOutcome::Expired,
                Err(PunishmentError::AlreadyTerminal { .. }) => {
                    return ExpiryOutcome::AlreadyTerminal;
                }
                Err(e) => e,
            };

            if error.is_retryable() && attempt < self.config.max_retries {
                let delay = self.backoff(attempt);
                warn!(
                    target: SCHEDULER_TARGET,
                    punishment_id = %punishment_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Expiry failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return match error {
                PunishmentError::Validation(_) => self.reschedule_from_store(punishment_id).await,
                PunishmentError::NotFound(_) => {
                    warn!(
                        target: SCHEDULER_TARGET,
                        punishment_id = %punishment_id,
                        "Scheduled punishment no longer exists"
                    );
                    ExpiryOutcome::Dropped
                }
                other => {
                    log_storage_failure("expire", &punishment_id.to_string(), &other);
                    ExpiryOutcome::Dropped
                }
            };
        }
    }

    /// The timer fired early relative to the stored expiry; trust the store
    async fn reschedule_from_store(&mut self, punishment_id: Uuid) -> ExpiryOutcome {
        match self.manager.query(punishment_id).await {
            Ok(record) if record.is_active() => match record.expiry {
                Expiry::At(at) if self.schedule(punishment_id, at) => ExpiryOutcome::Rescheduled(at),
                _ => ExpiryOutcome::Dropped,
            },
            Ok(_) => ExpiryOutcome::AlreadyTerminal,
            Err(e) => {
                log_storage_failure("expire", &punishment_id.to_string(), &e);
                ExpiryOutcome::Dropped
            }
        }
    }

    /// Exponential backoff with up to one base step of jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base();
        let exponential = base.saturating_mul(2u32.saturating_pow(attempt));
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=base_ms));
        exponential.saturating_add(jitter)
    }

    /// How long the loop may sleep before the next timer is due
    fn sleep_duration(&self) -> Duration {
        let max_sleep = self.config.max_sleep();
        match self.next_due() {
            Some(at) => (at - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(max_sleep),
            None => max_sleep,
        }
    }

    fn handle(&mut self, request: SchedulerRequest) -> bool {
        match request {
            SchedulerRequest::Schedule {
                punishment_id,
                expires_at,
            } => {
                self.schedule(punishment_id, expires_at);
            }
            SchedulerRequest::Cancel { punishment_id } => {
                self.cancel(punishment_id);
            }
            SchedulerRequest::Rescan => return false,
            SchedulerRequest::Shutdown => {
                info!(target: SCHEDULER_TARGET, "Received shutdown request for expiration scheduler");
                return true;
            }
        }
        false
    }

    /// Run until a shutdown request arrives or every handle is dropped
    pub async fn run(mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            error!(target: SCHEDULER_TARGET, "Expiration scheduler started twice");
            return;
        };

        let rescan_every = self.config.rescan_interval();
        info!(
            target: SCHEDULER_TARGET,
            rescan_secs = rescan_every.as_secs(),
            lookahead_secs = self.config.lookahead_secs,
            "Starting expiration scheduler"
        );

        if let Err(e) = self.rescan().await {
            error!(target: SCHEDULER_TARGET, error = %e, "Initial re-scan failed");
        }

        let mut rescan = tokio::time::interval_at(Instant::now() + rescan_every, rescan_every);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let sleep_for = self.sleep_duration();
            tokio::select! {
                request = receiver.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    let rescan_now = matches!(request, SchedulerRequest::Rescan);
                    if self.handle(request) {
                        break;
                    }
                    if rescan_now {
                        if let Err(e) = self.rescan().await {
                            error!(target: SCHEDULER_TARGET, error = %e, "Requested re-scan failed");
                        }
                    }
                },

                _ = rescan.tick() => {
                    if let Err(e) = self.rescan().await {
                        error!(target: SCHEDULER_TARGET, error = %e, "Periodic re-scan failed");
                    }
                },

                () = tokio::time::sleep(sleep_for) => {
                    for (punishment_id, outcome) in self.fire_due().await {
                        debug!(
                            target: SCHEDULER_TARGET,
                            punishment_id = %punishment_id,
                            outcome = ?outcome,
                            "Timer fired"
                        );
                    }
                }
            }
        }

        info!(target: SCHEDULER_TARGET, "Expiration scheduler shut down");
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::punishment::store::{MemoryStore, MockPunishmentStore};
    use crate::punishment::{
        Actor, EventBus, Notification, PlayerId, Punishment, PunishmentCache, PunishmentDuration,
        PunishmentKind, PunishmentState, PunishmentStore, StoreError, Transition,
    };
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        manager: Arc<PunishmentManager>,
        clock: Arc<ManualClock>,
        scheduler: ExpirationScheduler,
    }

    fn fixture(store: Arc<dyn PunishmentStore>) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let (handle, receiver) = SchedulerHandle::channel();
        let manager = Arc::new(PunishmentManager::new(
            store,
            Arc::new(PunishmentCache::new(&CacheConfig::default())),
            Arc::new(EventBus::local_only(64)),
            handle,
            clock.clone(),
        ));
        let config = SchedulerConfig {
            retry_base_ms: 10,
            ..SchedulerConfig::default()
        };
        let scheduler =
            ExpirationScheduler::new(Arc::clone(&manager), clock.clone(), config, receiver);
        Fixture {
            manager,
            clock,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_queue_respects_lookahead() {
        let Fixture {
            clock, mut scheduler, ..
        } = fixture(Arc::new(MemoryStore::new()));
        let now = clock.now();
        let soon = Uuid::new_v4();
        let far = Uuid::new_v4();

        assert!(scheduler.schedule(soon, now + ChronoDuration::minutes(5)));
        assert!(!scheduler.schedule(far, now + ChronoDuration::hours(5)));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_due(), Some(now + ChronoDuration::minutes(5)));

        // Rescheduling replaces the old instant
        assert!(scheduler.schedule(soon, now + ChronoDuration::minutes(1)));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next_due(), Some(now + ChronoDuration::minutes(1)));

        assert!(scheduler.cancel(soon));
        assert!(!scheduler.cancel(soon));
        assert!(scheduler.is_empty());

        // Moving a queued expiry past the window drops its timer
        assert!(scheduler.schedule(soon, now + ChronoDuration::minutes(1)));
        assert!(!scheduler.schedule(soon, now + ChronoDuration::hours(5)));
        assert!(!scheduler.contains(soon));
    }

    #[tokio::test]
    async fn test_oversized_lookahead_saturates() {
        let Fixture { manager, clock, .. } = fixture(Arc::new(MemoryStore::new()));
        let (_, receiver) = SchedulerHandle::channel();
        let config = SchedulerConfig {
            lookahead_secs: 10_000_000_000_000,
            ..SchedulerConfig::default()
        };
        let mut scheduler = ExpirationScheduler::new(manager, clock.clone(), config, receiver);

        let id = Uuid::new_v4();
        assert!(scheduler.schedule(id, clock.now() + ChronoDuration::days(36_500)));
        assert_eq!(scheduler.rescan().await.unwrap(), 0);
        assert!(scheduler.contains(id));
    }

    #[tokio::test]
    async fn test_mute_expires_after_ten_minutes() {
        let Fixture {
            manager,
            clock,
            mut scheduler,
        } = fixture(Arc::new(MemoryStore::new()));
        let mut events = manager.subscribe();
        let target = PlayerId::new();

        let mute = manager
            .impose(
                target,
                PunishmentKind::Mute,
                PunishmentDuration::parse("10m").unwrap(),
                "spam",
                Actor::Console,
            )
            .await
            .unwrap();
        assert_eq!(scheduler.rescan().await.unwrap(), 1);

        // Never before the expiry instant
        clock.advance(ChronoDuration::minutes(9));
        assert!(scheduler.fire_due().await.is_empty());
        assert!(manager.query_active(target, PunishmentKind::Mute).await.unwrap().is_some());

        clock.advance(ChronoDuration::minutes(1));
        assert_eq!(
            scheduler.fire_due().await,
            vec![(mute.id, ExpiryOutcome::Expired)]
        );
        assert!(manager.query_active(target, PunishmentKind::Mute).await.unwrap().is_none());
        assert_eq!(
            manager.query(mute.id).await.unwrap().state,
            PunishmentState::Expired
        );

        let _created = events.recv().await.unwrap();
        let Notification::Lifecycle(expired) = events.recv().await.unwrap() else {
            panic!("expected a lifecycle event");
        };
        assert_eq!(expired.transition, Transition::Expired);
        assert_eq!(expired.punishment_id, mute.id);

        // A second fire of the same timer is a no-op
        scheduler.schedule(mute.id, clock.now());
        assert_eq!(
            scheduler.fire_due().await,
            vec![(mute.id, ExpiryOutcome::AlreadyTerminal)]
        );
    }

    #[tokio::test]
    async fn test_revoked_punishment_never_expires() {
        let Fixture {
            manager,
            clock,
            mut scheduler,
        } = fixture(Arc::new(MemoryStore::new()));
        let ban = manager
            .impose(
                PlayerId::new(),
                PunishmentKind::Ban,
                PunishmentDuration::parse("10m").unwrap(),
                "alt account",
                Actor::Console,
            )
            .await
            .unwrap();
        scheduler.rescan().await.unwrap();

        manager.revoke(ban.id, Actor::Console).await.unwrap();
        clock.advance(ChronoDuration::minutes(11));

        // The queued timer fires late and loses to the revocation
        assert_eq!(
            scheduler.fire_due().await,
            vec![(ban.id, ExpiryOutcome::AlreadyTerminal)]
        );
        assert_eq!(
            manager.query(ban.id).await.unwrap().state,
            PunishmentState::Revoked
        );

        // Nothing is reloaded for it
        assert_eq!(scheduler.rescan().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_early_fire_is_rescheduled() {
        let Fixture {
            manager,
            clock,
            mut scheduler,
        } = fixture(Arc::new(MemoryStore::new()));
        let mute = manager
            .impose(
                PlayerId::new(),
                PunishmentKind::Mute,
                PunishmentDuration::parse("5m").unwrap(),
                "caps",
                Actor::Console,
            )
            .await
            .unwrap();
        let expires_at = mute.expiry.instant().unwrap();

        scheduler.schedule(mute.id, clock.now());
        assert_eq!(
            scheduler.fire_due().await,
            vec![(mute.id, ExpiryOutcome::Rescheduled(expires_at))]
        );
        assert_eq!(scheduler.next_due(), Some(expires_at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_is_retried_then_dropped() {
        let clock = ManualClock::default();
        let now = clock.now();
        let record = Punishment::new(
            PlayerId::new(),
            PunishmentKind::Mute,
            Expiry::At(now),
            "spam",
            Actor::Console,
            now - ChronoDuration::minutes(10),
        );

        let mut store = MockPunishmentStore::new();
        let stored = record.clone();
        store.expect_get().returning(move |_| Ok(stored.clone()));
        store
            .expect_transition()
            .times(4)
            .returning(|_, _, _, _| Err(StoreError::Connection("database is locked".to_string())));

        let Fixture {
            clock: fixture_clock,
            mut scheduler,
            ..
        } = fixture(Arc::new(store));
        fixture_clock.set(now);

        scheduler.schedule(record.id, now);
        assert_eq!(
            scheduler.fire_due().await,
            vec![(record.id, ExpiryOutcome::Dropped)]
        );
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_run_loop_expires_and_shuts_down() {
        let store: Arc<dyn PunishmentStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let (handle, receiver) = SchedulerHandle::channel();
        let manager = Arc::new(PunishmentManager::new(
            store,
            Arc::new(PunishmentCache::new(&CacheConfig::default())),
            Arc::new(EventBus::local_only(64)),
            handle.clone(),
            Arc::clone(&clock),
        ));
        let config = SchedulerConfig {
            max_sleep_secs: 1,
            ..SchedulerConfig::default()
        };
        let task = ExpirationScheduler::new(Arc::clone(&manager), clock, config, receiver).spawn();

        let mut events = manager.subscribe();
        let mute = manager
            .impose(
                PlayerId::new(),
                PunishmentKind::Mute,
                PunishmentDuration::Relative(ChronoDuration::milliseconds(300)),
                "flood",
                Actor::System,
            )
            .await
            .unwrap();

        let expired = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Notification::Lifecycle(event)) = events.recv().await {
                    if event.transition == Transition::Expired {
                        return event;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(expired.punishment_id, mute.id);

        assert!(handle.shutdown());
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
