//! Punishment lifecycle core
//!
//! Bans and mutes are standing punishments with an ACTIVE → EXPIRED | REVOKED
//! lifecycle; kicks are one-shot notices. The [`PunishmentManager`] is the only
//! mutation path, writing through the [`PunishmentCache`] into a
//! [`PunishmentStore`], scheduling expiry and publishing every committed change
//! on the [`EventBus`].

mod cache;
mod error;
mod events;
mod kind;
mod manager;
mod record;
mod scheduler;
pub mod store;

pub use cache::PunishmentCache;
pub use error::{PunishmentError, PunishmentResult};
pub use events::{
    EventBus, LoopbackTransport, Notification, PunishmentEvent, SYNC_PROTOCOL_VERSION,
    SyncEnvelope, SyncError, SyncTransport, Transition, spawn_sync_listener,
};
pub use kind::{Expiry, PunishmentDuration, PunishmentKind};
pub use manager::{PunishmentManager, SupersedeOutcome};
pub use record::{Actor, Kick, LogAction, LogEntry, PlayerId, Punishment, PunishmentState};
pub use scheduler::{ExpirationScheduler, ExpiryOutcome, SchedulerHandle};
pub use store::{PunishmentStore, StoreError, StoreResult, WriteOutcome};

/// Requests accepted by the expiration scheduler task
#[derive(Debug, Clone)]
pub enum SchedulerRequest {
    /// Track a temporary punishment's expiry
    Schedule {
        punishment_id: uuid::Uuid,
        expires_at: chrono::DateTime<chrono::Utc>,
    },
    /// Forget a punishment that reached a terminal state
    Cancel { punishment_id: uuid::Uuid },
    /// Reload due punishments from the store now
    Rescan,
    /// Stop the scheduler task
    Shutdown,
}
