//! Lease reaper
//!
//! A periodic sweep over running items whose lease expired: requeue
//! while retry budget remains, otherwise route through the failure
//! path. Sweeps are transactional select-and-update, so any number of
//! instances can run them concurrently.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use stratus_core::{Config, Result};
use stratus_storage::Store;

use crate::progress::ProgressEngine;

pub struct LeaseReaper {
    store: Arc<dyn Store>,
    engine: Arc<ProgressEngine>,
    config: Config,
    shutdown_rx: watch::Receiver<bool>,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<ProgressEngine>,
        config: Config,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            shutdown_rx,
        }
    }

    /// Run sweeps until shutdown is signalled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.reaper_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("lease reaper sweep failed: {}", e);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("lease reaper shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep. Public so deployments can also trigger it on demand.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<()> {
        let expired = self
            .store
            .expire_leases(Utc::now(), self.config.work_item_retry_limit)
            .await?;

        if !expired.requeued.is_empty() {
            info!(count = expired.requeued.len(), "requeued expired leases");
        }

        for item_id in expired.exhausted {
            // Each failure is its own transaction; one bad item must not
            // stall the rest of the sweep.
            if let Err(e) = self
                .engine
                .fail_item(item_id, "work item exceeded its lease and has no retries left")
                .await
            {
                error!(item_id, "failed to expire work item: {}", e);
            }
        }
        Ok(())
    }
}
