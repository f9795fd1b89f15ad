//! Sign task creation and out-of-band completion.

use std::sync::Arc;

use chrono::Utc;
use distbuild_core::report::CompletionReport;
use distbuild_core::task::{
    NewTask, PackageRef, Task, TaskKind, TaskParent, TaskPayload, TaskResult, TaskStatus,
};
use distbuild_core::{Error, ResourceId, Result};
use distbuild_db::{TaskFilter, TaskStore};
use tracing::info;

use crate::background::{BackgroundJob, BackgroundQueue};
use crate::completion::CompletionHandler;

pub struct SignTaskService {
    store: Arc<dyn TaskStore>,
    completion: Arc<CompletionHandler>,
    queue: BackgroundQueue,
}

impl SignTaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        completion: Arc<CompletionHandler>,
        queue: BackgroundQueue,
    ) -> Self {
        Self {
            store,
            completion,
            queue,
        }
    }

    /// Create a sign task over the packages the build has produced so far.
    pub async fn create_sign_task(&self, build_id: ResourceId, key_id: &str) -> Result<Task> {
        if key_id.trim().is_empty() {
            return Err(Error::Validation("key id must not be empty".to_string()));
        }

        let details = self.store.get_build(build_id).await?;
        if details.build.cancelled {
            return Err(Error::Conflict(format!("build {} is cancelled", build_id)));
        }

        let packages: Vec<PackageRef> = details
            .tasks
            .iter()
            .filter(|t| t.kind() == TaskKind::Build && t.status == TaskStatus::Done)
            .filter_map(|t| match &t.result {
                Some(TaskResult::Succeeded { artifacts, .. }) => Some(artifacts.iter().cloned()),
                _ => None,
            })
            .flatten()
            .collect();
        if packages.is_empty() {
            return Err(Error::Validation(format!(
                "build {} has no built packages to sign",
                build_id
            )));
        }

        let task = self
            .store
            .create_task(
                NewTask::new(
                    TaskParent::Build(build_id),
                    TaskPayload::Sign {
                        key_id: key_id.to_string(),
                        packages,
                    },
                ),
                Utc::now(),
            )
            .await?;
        info!(task_id = %task.id, %build_id, key_id, "Created sign task");
        Ok(task)
    }

    pub async fn list_sign_tasks(&self, build_id: Option<ResourceId>) -> Result<Vec<Task>> {
        let filter = TaskFilter {
            parent: build_id,
            kind: Some(TaskKind::Sign),
            status: None,
        };
        Ok(self.store.list_tasks(&filter).await?)
    }

    /// Validate a sign report and hand it to the background worker. The
    /// report is applied later; races are resolved there.
    pub async fn complete_sign_task(
        &self,
        task_id: ResourceId,
        report: CompletionReport,
    ) -> Result<()> {
        let task = self.completion.validate(task_id, &report).await?;
        if task.kind() != TaskKind::Sign {
            return Err(Error::Validation(format!(
                "task {} is a {} task, not a sign task",
                task_id,
                task.kind()
            )));
        }
        self.queue
            .enqueue(BackgroundJob::CompleteTask { task_id, report })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distbuild_config::SchedulerConfig;
    use distbuild_core::build::{NewBuild, NewBuildTask};
    use distbuild_core::task::CapabilitySet;
    use distbuild_db::{ClaimRequest, MemoryStore};

    fn service(store: Arc<MemoryStore>) -> (SignTaskService, tokio::sync::mpsc::Receiver<BackgroundJob>) {
        let completion = Arc::new(CompletionHandler::new(
            store.clone(),
            SchedulerConfig::default(),
        ));
        let (queue, jobs) = BackgroundQueue::new(8);
        (SignTaskService::new(store, completion, queue), jobs)
    }

    fn claim(kind: TaskKind, caps: &[&str]) -> ClaimRequest {
        let now = Utc::now();
        ClaimRequest {
            kind,
            worker_id: "node-1".to_string(),
            capabilities: CapabilitySet::from_strings(caps).unwrap(),
            now,
            lease_expiry: now + chrono::Duration::seconds(300),
        }
    }

    fn package(name: &str) -> PackageRef {
        PackageRef {
            name: name.to_string(),
            href: format!("/pulp/api/v3/content/rpm/packages/{}/", name),
        }
    }

    async fn built(store: &Arc<MemoryStore>) -> ResourceId {
        let details = store
            .create_build(
                &NewBuild {
                    tasks: vec![
                        NewBuildTask {
                            arch: "x86_64".to_string(),
                            source_ref: "https://git.example.org/rpms/nginx.git".to_string(),
                            depends_on: vec![],
                        },
                        NewBuildTask {
                            arch: "aarch64".to_string(),
                            source_ref: "https://git.example.org/rpms/nginx.git".to_string(),
                            depends_on: vec![],
                        },
                    ],
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let task = store
            .claim_next(&claim(TaskKind::Build, &["arch:x86_64"]))
            .await
            .unwrap()
            .unwrap();
        let result = TaskResult::Succeeded {
            artifacts: vec![package("nginx"), package("nginx-core")],
            sign_key: None,
        };
        store
            .finish_task(task.id, task.epoch, &result, &[], Utc::now())
            .await
            .unwrap();
        details.build.id
    }

    #[tokio::test]
    async fn test_sign_task_snapshots_done_packages() {
        let store = Arc::new(MemoryStore::new());
        let build_id = built(&store).await;
        let (service, _jobs) = service(store.clone());

        let task = service.create_sign_task(build_id, "ABCD1234").await.unwrap();
        match &task.payload {
            TaskPayload::Sign { key_id, packages } => {
                assert_eq!(key_id, "ABCD1234");
                assert_eq!(packages, &vec![package("nginx"), package("nginx-core")]);
            }
            other => panic!("unexpected payload: {:?}", other),
        }

        let listed = service.list_sign_tasks(Some(build_id)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(service.list_sign_tasks(Some(ResourceId::new())).await.unwrap().is_empty());

        let for_other_key = store
            .claim_next(&claim(TaskKind::Sign, &["key:FFFF0000"]))
            .await
            .unwrap();
        assert!(for_other_key.is_none());
        let claimed = store
            .claim_next(&claim(TaskKind::Sign, &["key:ABCD1234"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, task.id);
    }

    #[tokio::test]
    async fn test_sign_task_needs_packages_and_live_build() {
        let store = Arc::new(MemoryStore::new());
        let (service, _jobs) = service(store.clone());
        let details = store
            .create_build(
                &NewBuild {
                    tasks: vec![NewBuildTask {
                        arch: "x86_64".to_string(),
                        source_ref: "https://git.example.org/rpms/nginx.git".to_string(),
                        depends_on: vec![],
                    }],
                },
                Utc::now(),
            )
            .await
            .unwrap();

        let err = service
            .create_sign_task(details.build.id, "ABCD1234")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        store
            .cancel_build(details.build.id, "cancelled by user", Utc::now())
            .await
            .unwrap();
        let err = service
            .create_sign_task(details.build.id, "ABCD1234")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_completion_is_validated_then_queued() {
        let store = Arc::new(MemoryStore::new());
        let build_id = built(&store).await;
        let (service, mut jobs) = service(store.clone());
        let task = service.create_sign_task(build_id, "ABCD1234").await.unwrap();
        let task = store
            .claim_next(&claim(TaskKind::Sign, &["key:ABCD1234"]))
            .await
            .unwrap()
            .unwrap();

        let empty = CompletionReport::succeeded(task.epoch, vec![]);
        let err = service.complete_sign_task(task.id, empty).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(jobs.try_recv().is_err());

        let report = CompletionReport::succeeded(task.epoch, vec![package("nginx")]);
        service.complete_sign_task(task.id, report).await.unwrap();
        assert!(matches!(
            jobs.recv().await.unwrap(),
            BackgroundJob::CompleteTask { task_id, .. } if task_id == task.id
        ));
        // Nothing is applied until the worker runs.
        assert_eq!(
            store.get_task(task.id).await.unwrap().status,
            TaskStatus::Assigned
        );
    }
}
