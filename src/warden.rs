//! Runtime wiring
//!
//! [`Warden`] owns the background tasks around a [`PunishmentManager`]: the
//! expiration scheduler and, when a sync transport is configured, the listener
//! applying changes made on other nodes.

use crate::clock::Clock;
use crate::config::Config;
use crate::punishment::{
    EventBus, ExpirationScheduler, PunishmentCache, PunishmentManager, PunishmentStore,
    SchedulerHandle, SyncTransport, spawn_sync_listener,
};
use crate::SCHEDULER_TARGET;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the local notification channel
pub const EVENT_CAPACITY: usize = 1024;

/// A running punishment service
#[derive(Debug)]
pub struct Warden {
    manager: Arc<PunishmentManager>,
    scheduler: SchedulerHandle,
    scheduler_task: JoinHandle<()>,
    sync_task: Option<JoinHandle<()>>,
}

impl Warden {
    /// Wire the manager to `store` and spawn the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(
        config: &Config,
        store: Arc<dyn PunishmentStore>,
        transport: Option<Arc<dyn SyncTransport>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(PunishmentCache::new(&config.cache));
        let bus = Arc::new(EventBus::new(
            config.node_id.clone(),
            EVENT_CAPACITY,
            transport,
        ));
        let (scheduler, requests) = SchedulerHandle::channel();

        let manager = Arc::new(PunishmentManager::new(
            store,
            Arc::clone(&cache),
            Arc::clone(&bus),
            scheduler.clone(),
            Arc::clone(&clock),
        ));

        let scheduler_task = ExpirationScheduler::new(
            Arc::clone(&manager),
            clock,
            config.scheduler.clone(),
            requests,
        )
        .spawn();
        let sync_task = spawn_sync_listener(Arc::clone(&bus), cache);

        info!(
            node_id = %config.node_id,
            synced = sync_task.is_some(),
            "Punishment warden started"
        );

        Self {
            manager,
            scheduler,
            scheduler_task,
            sync_task,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<PunishmentManager> {
        &self.manager
    }

    /// Ask the scheduler to reload due punishments from the store now
    pub fn rescan(&self) {
        self.scheduler.rescan();
    }

    /// Stop the background tasks and wait for the scheduler to finish
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        if let Err(e) = self.scheduler_task.await {
            warn!(target: SCHEDULER_TARGET, error = %e, "Expiration scheduler ended abnormally");
        }
        if let Some(sync_task) = self.sync_task {
            sync_task.abort();
        }
        info!("Punishment warden stopped");
    }
}
