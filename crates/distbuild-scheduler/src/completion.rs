//! Completion handling.
//!
//! A worker's report is validated, checked against the task's current
//! status and epoch, and applied together with the dependent effects of
//! its task kind in one unit of work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use distbuild_config::SchedulerConfig;
use distbuild_core::report::CompletionReport;
use distbuild_core::task::{Task, TaskKind, TaskParent, TaskResult};
use distbuild_core::{Error, ResourceId, Result};
use distbuild_db::{CompletionEffect, TaskStore};
use tracing::{info, warn};

use crate::offset;

/// Effects to apply alongside the terminal transition of `task` to
/// `result`.
pub fn effects_for(
    task: &Task,
    result: &TaskResult,
    now: DateTime<Utc>,
    sign_grace: chrono::Duration,
) -> Result<Vec<CompletionEffect>> {
    let build_id = || {
        task.parent.build_id().ok_or_else(|| {
            Error::Internal(format!("{} task {} has no parent build", task.kind(), task.id))
        })
    };

    let effects = match (task.kind(), result) {
        (TaskKind::Build, TaskResult::Succeeded { .. }) => {
            vec![CompletionEffect::SettleBuild(build_id()?)]
        }
        (TaskKind::Build, TaskResult::Failed { .. }) => vec![
            CompletionEffect::FailDependents {
                reason: format!("dependency {} failed", task.id),
            },
            CompletionEffect::SettleBuild(build_id()?),
        ],
        (TaskKind::Sign, TaskResult::Succeeded { .. }) => vec![
            CompletionEffect::ArmGracePeriod {
                until: now + sign_grace,
            },
            CompletionEffect::MarkBuildSigned(build_id()?),
        ],
        (TaskKind::Sign, TaskResult::Failed { .. }) => vec![CompletionEffect::ArmGracePeriod {
            until: now + sign_grace,
        }],
        (TaskKind::GenKey, TaskResult::Succeeded { sign_key, .. }) => {
            let TaskParent::Product(product_id) = task.parent else {
                return Err(Error::Internal(format!(
                    "gen_key task {} has no parent product",
                    task.id
                )));
            };
            let key = sign_key.clone().ok_or_else(|| {
                Error::Validation("key generation result is missing the key".to_string())
            })?;
            vec![CompletionEffect::AttachSignKey { product_id, key }]
        }
        (TaskKind::GenKey, TaskResult::Failed { .. }) => Vec::new(),
        (_, TaskResult::Cancelled { .. }) => Vec::new(),
    };
    Ok(effects)
}

pub struct CompletionHandler {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
}

impl CompletionHandler {
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Check that a report is well formed for the task it targets, without
    /// applying it.
    pub async fn validate(&self, task_id: ResourceId, report: &CompletionReport) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        report.validate(task.kind())?;
        Ok(task)
    }

    /// Apply a worker's report.
    ///
    /// Fails with `AlreadyTerminal` or `StaleCompletion` when the report
    /// lost a race; callers treat those as a no-op.
    pub async fn complete_task(
        &self,
        task_id: ResourceId,
        report: &CompletionReport,
    ) -> Result<Task> {
        let task = self.store.get_task(task_id).await?;
        let result = report.validate(task.kind())?;

        let now = Utc::now();
        let effects = effects_for(&task, &result, now, offset(self.config.sign_grace_period))?;

        match self
            .store
            .finish_task(task_id, report.epoch, &result, &effects, now)
            .await
        {
            Ok(finished) => {
                info!(
                    %task_id,
                    kind = %finished.kind(),
                    status = %finished.status,
                    epoch = report.epoch,
                    "Completed task"
                );
                Ok(finished)
            }
            Err(e) => {
                let e = Error::from(e);
                if e.is_race() {
                    info!(%task_id, epoch = report.epoch, reason = %e, "Ignoring completion report");
                } else {
                    warn!(%task_id, error = %e, "Failed to apply completion report");
                }
                Err(e)
            }
        }
    }
}
