//! Lifecycle events and cross-node sync
//!
//! Committed changes fan out to local subscribers over a broadcast channel and,
//! when a [`SyncTransport`] is attached, to the other nodes of the deployment.
//! Remote events only invalidate cache state; receivers re-query the store
//! before acting on them.

use crate::logging::log_transition;
use crate::punishment::{Kick, PlayerId, Punishment, PunishmentCache, PunishmentKind, PunishmentState};
use crate::SYNC_TARGET;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Version carried by every [`SyncEnvelope`]
pub const SYNC_PROTOCOL_VERSION: u32 = 1;

/// What happened to a punishment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Created,
    Expired,
    Revoked,
    ReasonChanged,
    DurationChanged,
}

/// A committed punishment change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentEvent {
    pub punishment_id: Uuid,
    pub target: PlayerId,
    pub kind: PunishmentKind,
    /// `None` on creation
    pub old_state: Option<PunishmentState>,
    pub new_state: PunishmentState,
    pub transition: Transition,
    pub timestamp: DateTime<Utc>,
    /// Received from another node
    #[serde(default)]
    pub remote: bool,
}

impl PunishmentEvent {
    fn from_record(
        record: &Punishment,
        old_state: Option<PunishmentState>,
        transition: Transition,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            punishment_id: record.id,
            target: record.target,
            kind: record.kind,
            old_state,
            new_state: record.state,
            transition,
            timestamp,
            remote: false,
        }
    }

    #[must_use]
    pub fn created(record: &Punishment) -> Self {
        Self::from_record(record, None, Transition::Created, record.issued_at)
    }

    /// Event for a record that just left ACTIVE
    #[must_use]
    pub fn ended(record: &Punishment, at: DateTime<Utc>) -> Self {
        let transition = match record.state {
            PunishmentState::Expired => Transition::Expired,
            _ => Transition::Revoked,
        };
        Self::from_record(record, Some(PunishmentState::Active), transition, at)
    }

    #[must_use]
    pub fn reason_changed(record: &Punishment, at: DateTime<Utc>) -> Self {
        Self::from_record(record, Some(record.state), Transition::ReasonChanged, at)
    }

    #[must_use]
    pub fn duration_changed(record: &Punishment, at: DateTime<Utc>) -> Self {
        Self::from_record(record, Some(record.state), Transition::DurationChanged, at)
    }
}

/// Everything published on the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    Lifecycle(PunishmentEvent),
    Kick(Kick),
}

impl Notification {
    #[must_use]
    pub fn target(&self) -> PlayerId {
        match self {
            Self::Lifecycle(event) => event.target,
            Self::Kick(kick) => kick.target,
        }
    }

    fn into_remote(self) -> Self {
        match self {
            Self::Lifecycle(event) => Self::Lifecycle(PunishmentEvent {
                remote: true,
                ..event
            }),
            kick @ Self::Kick(_) => kick,
        }
    }
}

/// Errors on the cross-node channel
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unsupported sync protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Wire form of a notification sent between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub version: u32,
    /// Node that committed the change
    pub origin: String,
    pub payload: Notification,
}

impl SyncEnvelope {
    #[must_use]
    pub fn new(origin: impl Into<String>, payload: Notification) -> Self {
        Self {
            version: SYNC_PROTOCOL_VERSION,
            origin: origin.into(),
            payload,
        }
    }

    /// # Errors
    /// Returns an error if the payload cannot be serialized
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::Encode)
    }

    /// # Errors
    /// Returns an error for malformed input or a protocol version this node
    /// does not speak
    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        let envelope: Self = serde_json::from_slice(bytes).map_err(SyncError::Decode)?;
        if envelope.version != SYNC_PROTOCOL_VERSION {
            return Err(SyncError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}

/// Publish/subscribe channel connecting the nodes of a deployment.
///
/// Delivery is best-effort; a node that misses a message converges through
/// cache TTLs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send an encoded envelope to every subscribed node
    async fn publish(&self, payload: Vec<u8>) -> Result<(), SyncError>;

    /// Receive encoded envelopes from all nodes, including this one
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// In-process transport; every clone shares one channel
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    sender: broadcast::Sender<Vec<u8>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl SyncTransport for LoopbackTransport {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), SyncError> {
        // No subscribers is not an error for a best-effort channel
        let _ = self.sender.send(payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }
}

/// Local fan-out plus optional cross-node publishing
pub struct EventBus {
    node_id: String,
    local: broadcast::Sender<Notification>,
    transport: Option<Arc<dyn SyncTransport>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("node_id", &self.node_id)
            .field("subscribers", &self.local.receiver_count())
            .field("synced", &self.transport.is_some())
            .finish()
    }
}

impl EventBus {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        capacity: usize,
        transport: Option<Arc<dyn SyncTransport>>,
    ) -> Self {
        let (local, _) = broadcast::channel(capacity.max(1));
        Self {
            node_id: node_id.into(),
            local,
            transport,
        }
    }

    /// Bus without a cross-node transport
    #[must_use]
    pub fn local_only(capacity: usize) -> Self {
        Self::new(Uuid::new_v4().to_string(), capacity, None)
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Receive notifications committed from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.local.subscribe()
    }

    /// Publish a committed change locally and to the other nodes.
    ///
    /// Never fails: the change is already durable, and peers converge through
    /// cache TTLs if the sync message is lost.
    pub async fn publish(&self, notification: Notification) {
        self.emit_local(notification.clone());

        let Some(transport) = &self.transport else {
            return;
        };
        let result = match SyncEnvelope::new(self.node_id.clone(), notification).encode() {
            Ok(bytes) => transport.publish(bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(target: SYNC_TARGET, error = %e, "Failed to publish sync envelope");
        }
    }

    fn emit_local(&self, notification: Notification) {
        if let Notification::Lifecycle(event) = &notification {
            log_transition(event);
        }
        // Having no local subscribers is fine
        let _ = self.local.send(notification);
    }
}

/// Apply envelopes from other nodes: invalidate cached state and re-emit
/// locally with `remote` set.
///
/// Returns `None` when the bus has no transport.
pub fn spawn_sync_listener(
    bus: Arc<EventBus>,
    cache: Arc<PunishmentCache>,
) -> Option<JoinHandle<()>> {
    let mut receiver = bus.transport.as_ref()?.subscribe();

    Some(tokio::spawn(async move {
        loop {
            let bytes = match receiver.recv().await {
                Ok(bytes) => bytes,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed invalidations; nothing cached can be trusted
                    warn!(target: SYNC_TARGET, skipped, "Sync listener lagged, clearing cache");
                    cache.clear();
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let envelope = match SyncEnvelope::decode(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(target: SYNC_TARGET, error = %e, "Dropping sync envelope");
                    continue;
                }
            };
            if envelope.origin == bus.node_id {
                continue;
            }

            if let Notification::Lifecycle(event) = &envelope.payload {
                cache.invalidate(event.punishment_id);
                cache.invalidate_active(event.target, event.kind);
            }
            debug!(
                target: SYNC_TARGET,
                origin = %envelope.origin,
                target_player = %envelope.payload.target(),
                "Applied remote notification"
            );
            bus.emit_local(envelope.payload.into_remote());
        }
        debug!(target: SYNC_TARGET, "Sync listener stopped");
    }))
}
