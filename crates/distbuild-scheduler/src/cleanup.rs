//! Expired-lease sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use distbuild_core::Result;
use distbuild_db::{RequeueGuard, TaskStore};
use tokio::sync::watch;
use tracing::{info, warn};

/// Periodically returns tasks whose lease ran out without a report to
/// pending.
pub struct LeaseSweeper {
    store: Arc<dyn TaskStore>,
    interval: Duration,
}

impl LeaseSweeper {
    pub fn new(store: Arc<dyn TaskStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run one pass. Each requeue is gated on the epoch observed when the
    /// lease was listed, so a task completed or re-assigned in between is
    /// left alone. Returns how many tasks this pass requeued.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.store.expired_leases(now).await?;
        let mut requeued = 0;

        for lease in expired {
            let guard = RequeueGuard::Expired {
                task_id: lease.task_id,
                epoch: lease.epoch,
            };
            match self.store.requeue(&guard, now).await {
                Ok(true) => {
                    info!(
                        task_id = %lease.task_id,
                        worker_id = %lease.worker_id,
                        epoch = lease.epoch,
                        "Requeued task with expired lease"
                    );
                    requeued += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(task_id = %lease.task_id, error = %e, "Failed to requeue task"),
            }
        }

        Ok(requeued)
    }

    /// Sweep every interval until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting lease sweeper");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!(error = %e, "Lease sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Lease sweeper stopped");
    }
}
