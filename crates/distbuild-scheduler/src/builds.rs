//! Build lifecycle: submission, lookup, cancellation and removal.

use std::sync::Arc;

use chrono::Utc;
use distbuild_core::build::{BuildDetails, NewBuild};
use distbuild_core::task::CANCELLED_BY_USER;
use distbuild_core::{ResourceId, Result};
use distbuild_db::TaskStore;
use tracing::info;

pub struct BuildService {
    store: Arc<dyn TaskStore>,
}

impl BuildService {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub async fn create_build(&self, build: &NewBuild) -> Result<BuildDetails> {
        build.validate()?;
        let details = self.store.create_build(build, Utc::now()).await?;
        info!(build_id = %details.build.id, tasks = details.tasks.len(), "Created build");
        Ok(details)
    }

    pub async fn get_build(&self, id: ResourceId) -> Result<BuildDetails> {
        Ok(self.store.get_build(id).await?)
    }

    /// Cancel every non-terminal task of the build. Workers still running a
    /// cancelled task are not interrupted; their eventual report is a
    /// no-op. Cancelling again changes nothing.
    pub async fn cancel_build(&self, id: ResourceId) -> Result<Vec<ResourceId>> {
        let cancelled = self
            .store
            .cancel_build(id, CANCELLED_BY_USER, Utc::now())
            .await?;
        info!(build_id = %id, cancelled = cancelled.len(), "Cancelled build");
        Ok(cancelled)
    }

    /// Delete the build and all of its tasks. Refused while any task is
    /// held by a worker.
    pub async fn remove_build(&self, id: ResourceId) -> Result<()> {
        self.store.remove_build(id).await?;
        info!(build_id = %id, "Removed build");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionHandler;
    use distbuild_config::SchedulerConfig;
    use distbuild_core::Error;
    use distbuild_core::build::NewBuildTask;
    use distbuild_core::report::CompletionReport;
    use distbuild_core::task::{CapabilitySet, PackageRef, TaskKind, TaskResult, TaskStatus};
    use distbuild_db::{ClaimRequest, MemoryStore};

    fn claim(worker: &str) -> ClaimRequest {
        let now = Utc::now();
        ClaimRequest {
            kind: TaskKind::Build,
            worker_id: worker.to_string(),
            capabilities: CapabilitySet::from_strings(["arch:x86_64"]).unwrap(),
            now,
            lease_expiry: now + chrono::Duration::seconds(300),
        }
    }

    fn three_tasks() -> NewBuild {
        NewBuild {
            tasks: (0..3)
                .map(|n| NewBuildTask {
                    arch: "x86_64".to_string(),
                    source_ref: format!("https://git.example.org/rpms/pkg{}.git", n),
                    depends_on: vec![],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_submission() {
        let service = BuildService::new(Arc::new(MemoryStore::new()));
        let err = service
            .create_build(&NewBuild { tasks: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_leaves_done_tasks_alone() {
        let store = Arc::new(MemoryStore::new());
        let service = BuildService::new(store.clone());
        let handler = CompletionHandler::new(store.clone(), SchedulerConfig::default());
        let details = service.create_build(&three_tasks()).await.unwrap();

        let done = store.claim_next(&claim("node-1")).await.unwrap().unwrap();
        let report = CompletionReport::succeeded(
            done.epoch,
            vec![PackageRef {
                name: "pkg0".to_string(),
                href: "/pulp/api/v3/content/rpm/packages/pkg0/".to_string(),
            }],
        );
        handler.complete_task(done.id, &report).await.unwrap();
        let assigned = store.claim_next(&claim("node-2")).await.unwrap().unwrap();

        let cancelled = service.cancel_build(details.build.id).await.unwrap();
        assert_eq!(cancelled.len(), 2);

        let after = service.get_build(details.build.id).await.unwrap();
        assert!(after.build.cancelled);
        for task in &after.tasks {
            if task.id == done.id {
                assert_eq!(task.status, TaskStatus::Done);
                assert!(matches!(task.result, Some(TaskResult::Succeeded { .. })));
            } else {
                assert_eq!(task.status, TaskStatus::Cancelled);
                assert_eq!(task.result.as_ref().and_then(|r| r.error_message()), Some("cancelled by user"));
                assert!(task.assignment.is_none());
            }
        }

        // Cancelling again is a no-op.
        assert!(service.cancel_build(details.build.id).await.unwrap().is_empty());
        let again = service.get_build(details.build.id).await.unwrap();
        assert_eq!(again.tasks, after.tasks);

        // The worker still running the cancelled task reports late.
        let late = CompletionReport::failed(assigned.epoch, "interrupted");
        let err = handler.complete_task(assigned.id, &late).await.unwrap_err();
        assert!(err.is_race());
    }

    #[tokio::test]
    async fn test_remove_waits_for_in_flight_tasks() {
        let store = Arc::new(MemoryStore::new());
        let service = BuildService::new(store.clone());
        let details = service.create_build(&three_tasks()).await.unwrap();
        store.claim_next(&claim("node-1")).await.unwrap().unwrap();

        let err = service.remove_build(details.build.id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        service.cancel_build(details.build.id).await.unwrap();
        service.remove_build(details.build.id).await.unwrap();
        assert!(matches!(
            service.get_build(details.build.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_build_is_not_found() {
        let service = BuildService::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            service.cancel_build(ResourceId::new()).await,
            Err(Error::NotFound(_))
        ));
    }
}
