//! Assignment coordinator.
//!
//! Matches polling workers to pending tasks. Exclusivity is enforced by
//! the store's conditional hand-out; no lock is held here.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use distbuild_config::SchedulerConfig;
use distbuild_core::task::{CapabilitySet, Task, TaskKind};
use distbuild_core::{Error, ResourceId, Result};
use distbuild_db::{ClaimRequest, RequeueGuard, TaskStore};
use serde::Serialize;
use tracing::{debug, info};

use crate::offset;

/// What a worker ping changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PingOutcome {
    /// Listed tasks whose lease was pushed out.
    pub extended: Vec<ResourceId>,
    /// Tasks held by the worker but no longer listed, returned to pending.
    pub reclaimed: Vec<ResourceId>,
    /// Listed ids the worker does not (or no longer) hold.
    pub unknown: Vec<ResourceId>,
}

pub struct AssignmentCoordinator {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
}

impl AssignmentCoordinator {
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Hand the oldest eligible task of `kind` to the worker, or `None`
    /// when there is nothing it can take right now.
    pub async fn get_available_task(
        &self,
        kind: TaskKind,
        worker_id: &str,
        capabilities: &CapabilitySet,
    ) -> Result<Option<Task>> {
        if worker_id.trim().is_empty() {
            return Err(Error::Validation("worker id must not be empty".to_string()));
        }

        let now = Utc::now();
        let claim = ClaimRequest {
            kind,
            worker_id: worker_id.to_string(),
            capabilities: capabilities.clone(),
            now,
            lease_expiry: now + offset(self.config.lease_ttl),
        };

        let task = self.store.claim_next(&claim).await?;
        match &task {
            Some(task) => info!(
                task_id = %task.id,
                kind = %kind,
                worker_id,
                epoch = task.epoch,
                "Assigned task"
            ),
            None => debug!(kind = %kind, worker_id, "No eligible task"),
        }
        Ok(task)
    }

    /// Push the lease of a task the worker holds under `epoch`.
    pub async fn extend_lease(
        &self,
        task_id: ResourceId,
        epoch: i64,
        worker_id: &str,
    ) -> Result<Task> {
        let now = Utc::now();
        let task = self
            .store
            .extend_lease(
                task_id,
                epoch,
                worker_id,
                now + offset(self.config.lease_ttl),
                now,
            )
            .await?;
        debug!(%task_id, worker_id, epoch, "Extended lease");
        Ok(task)
    }

    /// Reconcile the tasks a worker says it is running with the tasks the
    /// store has assigned to it.
    ///
    /// Listed tasks get a fresh lease. Tasks assigned to the worker that it
    /// no longer lists are reclaimed, but only once they have been held for
    /// longer than the reclaim grace so a hand-out racing the ping is left
    /// alone.
    pub async fn ping(&self, worker_id: &str, active: &[ResourceId]) -> Result<PingOutcome> {
        let now = Utc::now();
        let listed: HashSet<ResourceId> = active.iter().copied().collect();
        let held = self.store.leases_for_worker(worker_id).await?;
        let mut outcome = PingOutcome::default();

        for lease in &held {
            if listed.contains(&lease.task_id) {
                match self
                    .store
                    .extend_lease(
                        lease.task_id,
                        lease.epoch,
                        worker_id,
                        now + offset(self.config.lease_ttl),
                        now,
                    )
                    .await
                {
                    Ok(_) => outcome.extended.push(lease.task_id),
                    Err(distbuild_db::DbError::LeaseExpired(_)) => {
                        outcome.unknown.push(lease.task_id)
                    }
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            let guard = RequeueGuard::Abandoned {
                task_id: lease.task_id,
                epoch: lease.epoch,
                worker_id: worker_id.to_string(),
                assigned_before: now - offset(self.config.reclaim_grace),
            };
            if self.store.requeue(&guard, now).await? {
                info!(task_id = %lease.task_id, worker_id, epoch = lease.epoch, "Reclaimed task missing from worker ping");
                outcome.reclaimed.push(lease.task_id);
            }
        }

        let held_ids: HashSet<ResourceId> = held.iter().map(|l| l.task_id).collect();
        outcome
            .unknown
            .extend(active.iter().filter(|id| !held_ids.contains(id)).copied());

        Ok(outcome)
    }
}
