//! Punishment cache
//!
//! A time-bounded, non-owning copy of store state in front of the
//! [`PunishmentStore`](crate::punishment::PunishmentStore). Two maps are kept:
//! records by ID, and the ACTIVE punishment (or its absence) per player and
//! kind.
//!
//! Write-through updates from the manager always overwrite, as do refreshes
//! of the per-player lookup, which the manager performs under the player's
//! lock. Record fills by ID only populate empty or stale slots, so a fill
//! carrying data read before a concurrent commit can never undo that commit.

use crate::config::CacheConfig;
use crate::punishment::{PlayerId, Punishment, PunishmentKind};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CachedRecord {
    record: Punishment,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct CachedLookup {
    /// `None` caches "nothing active"
    active: Option<Uuid>,
    inserted_at: Instant,
}

/// In-memory cache of punishment records
#[derive(Debug)]
pub struct PunishmentCache {
    records: DashMap<Uuid, CachedRecord>,
    active: DashMap<(PlayerId, PunishmentKind), CachedLookup>,
    active_ttl: Duration,
    terminal_ttl: Duration,
    max_entries: usize,
}

impl PunishmentCache {
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            records: DashMap::new(),
            active: DashMap::new(),
            active_ttl: config.active_ttl(),
            terminal_ttl: config.terminal_ttl(),
            max_entries: config.max_entries.max(1),
        }
    }

    fn record_is_fresh(&self, cached: &CachedRecord, now: Instant) -> bool {
        let ttl = if cached.record.is_active() {
            self.active_ttl
        } else {
            self.terminal_ttl
        };
        now.duration_since(cached.inserted_at) < ttl
    }

    fn lookup_is_fresh(&self, cached: &CachedLookup, now: Instant) -> bool {
        now.duration_since(cached.inserted_at) < self.active_ttl
    }

    /// Cached record by ID
    pub fn get(&self, id: Uuid) -> Option<Punishment> {
        let now = Instant::now();
        let cached = self.records.get(&id).map(|entry| entry.clone())?;
        if self.record_is_fresh(&cached, now) {
            return Some(cached.record);
        }
        self.records
            .remove_if(&id, |_, entry| entry.inserted_at == cached.inserted_at);
        None
    }

    /// Cached ACTIVE punishment for a player.
    ///
    /// `None` is a miss; `Some(None)` is a cached "nothing active".
    pub fn get_active_for(&self, target: PlayerId, kind: PunishmentKind) -> Option<Option<Punishment>> {
        let key = (target, kind);
        let lookup = *self.active.get(&key)?;
        if !self.lookup_is_fresh(&lookup, Instant::now()) {
            self.active
                .remove_if(&key, |_, entry| entry.inserted_at == lookup.inserted_at);
            return None;
        }

        let Some(id) = lookup.active else {
            return Some(None);
        };
        match self.get(id) {
            Some(record) if record.is_active() => Some(Some(record)),
            // The record left the cache or the index lags behind it
            _ => {
                self.active.remove_if(&key, |_, entry| entry.active == Some(id));
                None
            }
        }
    }

    /// Write-through after a committed store write
    pub fn put(&self, record: &Punishment) {
        let now = Instant::now();
        let key = (record.target, record.kind);

        if record.is_active() {
            self.active.insert(
                key,
                CachedLookup {
                    active: Some(record.id),
                    inserted_at: now,
                },
            );
        } else {
            let cleared = CachedLookup {
                active: None,
                inserted_at: now,
            };
            match self.active.entry(key) {
                Entry::Occupied(mut entry) => {
                    if entry.get().active == Some(record.id) {
                        entry.insert(cleared);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(cleared);
                }
            }
        }

        self.records.insert(
            record.id,
            CachedRecord {
                record: record.clone(),
                inserted_at: now,
            },
        );
        self.evict_if_full();
    }

    /// Read-through fill after a store read
    pub fn fill(&self, record: &Punishment) {
        let now = Instant::now();
        match self.records.entry(record.id) {
            Entry::Occupied(mut entry) => {
                let cached = entry.get();
                let keep = self.record_is_fresh(cached, now)
                    || (cached.record.state.is_terminal() && record.is_active());
                if !keep {
                    entry.insert(CachedRecord {
                        record: record.clone(),
                        inserted_at: now,
                    });
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(CachedRecord {
                    record: record.clone(),
                    inserted_at: now,
                });
            }
        }
        self.evict_if_full();
    }

    /// Replace the per-player lookup with the result of a store read.
    ///
    /// The caller must hold the player's lock so no local commit is newer
    /// than the read.
    pub fn refresh_active(
        &self,
        target: PlayerId,
        kind: PunishmentKind,
        active: Option<&Punishment>,
    ) {
        match active {
            Some(record) => self.put(record),
            None => {
                self.active.insert(
                    (target, kind),
                    CachedLookup {
                        active: None,
                        inserted_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// Drop a record and any lookup pointing at it
    pub fn invalidate(&self, id: Uuid) {
        if let Some((_, cached)) = self.records.remove(&id) {
            let key = (cached.record.target, cached.record.kind);
            self.active.remove_if(&key, |_, entry| entry.active == Some(id));
        }
    }

    /// Drop the per-player lookup
    pub fn invalidate_active(&self, target: PlayerId, kind: PunishmentKind) {
        self.active.remove(&(target, kind));
    }

    pub fn clear(&self) {
        self.records.clear();
        self.active.clear();
    }

    /// Number of cached records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict down to 90% of capacity, terminal records first, then the oldest
    fn evict_if_full(&self) {
        if self.records.len() <= self.max_entries {
            return;
        }

        let target_len = self.max_entries - self.max_entries / 10;
        let mut candidates: Vec<(bool, Instant, Uuid)> = self
            .records
            .iter()
            .map(|entry| {
                let cached = entry.value();
                (cached.record.is_active(), cached.inserted_at, *entry.key())
            })
            .collect();
        // false sorts first: terminal records go before active ones
        candidates.sort();

        let excess = self.records.len().saturating_sub(target_len);
        for (_, _, id) in candidates.into_iter().take(excess) {
            self.invalidate(id);
        }
        debug!(evicted = excess, remaining = self.records.len(), "Punishment cache evicted");
    }
}
