//! Background job queue.
//!
//! Work that should not hold up a request (applying sign-task completions,
//! publishing errata, product assembly) is handed to a single worker over a bounded channel.
//! Job failures are logged; the worker keeps going.

use std::sync::Arc;

use distbuild_core::product::ProductChange;
use distbuild_core::report::CompletionReport;
use distbuild_core::{Error, ResourceId, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::completion::CompletionHandler;
use crate::errata::ErrataReleaser;
use crate::products::ProductAssembler;

#[derive(Debug, Clone)]
pub enum BackgroundJob {
    CompleteTask {
        task_id: ResourceId,
        report: CompletionReport,
    },
    ReleaseErrata {
        record_id: String,
        force: bool,
    },
    BulkRelease {
        record_ids: Vec<String>,
    },
    ModifyProduct {
        product_id: ResourceId,
        build_id: ResourceId,
        change: ProductChange,
    },
}

impl BackgroundJob {
    fn name(&self) -> &'static str {
        match self {
            BackgroundJob::CompleteTask { .. } => "complete_task",
            BackgroundJob::ReleaseErrata { .. } => "release_errata",
            BackgroundJob::BulkRelease { .. } => "bulk_release",
            BackgroundJob::ModifyProduct { .. } => "modify_product",
        }
    }
}

/// Sending half of the job queue.
#[derive(Debug, Clone)]
pub struct BackgroundQueue {
    tx: mpsc::Sender<BackgroundJob>,
}

impl BackgroundQueue {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<BackgroundJob>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, job: BackgroundJob) -> Result<()> {
        let name = job.name();
        self.tx
            .send(job)
            .await
            .map_err(|_| Error::Unavailable("background worker is not running".to_string()))?;
        debug!(job = name, "Enqueued background job");
        Ok(())
    }
}

pub struct BackgroundWorker {
    completion: Arc<CompletionHandler>,
    releaser: Arc<ErrataReleaser>,
    assembler: Arc<ProductAssembler>,
}

impl BackgroundWorker {
    pub fn new(
        completion: Arc<CompletionHandler>,
        releaser: Arc<ErrataReleaser>,
        assembler: Arc<ProductAssembler>,
    ) -> Self {
        Self {
            completion,
            releaser,
            assembler,
        }
    }

    /// Process jobs until every queue handle is dropped.
    pub async fn run(&self, mut jobs: mpsc::Receiver<BackgroundJob>) {
        info!("Starting background worker");
        while let Some(job) = jobs.recv().await {
            self.process(job).await;
        }
        info!("Background worker stopped");
    }

    pub async fn process(&self, job: BackgroundJob) {
        let name = job.name();
        let outcome = match job {
            BackgroundJob::CompleteTask { task_id, report } => {
                match self.completion.complete_task(task_id, &report).await {
                    Err(e) if e.is_race() => Ok(()),
                    other => other.map(|_| ()),
                }
            }
            BackgroundJob::ReleaseErrata { record_id, force } => {
                self.releaser.release(&record_id, force).await.map(|_| ())
            }
            BackgroundJob::BulkRelease { record_ids } => {
                let outcomes = self.releaser.release_many(&record_ids).await;
                info!(requested = record_ids.len(), released = outcomes.len(), "Bulk release finished");
                Ok(())
            }
            BackgroundJob::ModifyProduct {
                product_id,
                build_id,
                change,
            } => self
                .assembler
                .apply(product_id, build_id, change)
                .await
                .map(|_| ()),
        };

        if let Err(e) = outcome {
            error!(job = name, error = %e, "Background job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use chrono::Utc;
    use distbuild_config::SchedulerConfig;
    use distbuild_core::build::{NewBuild, NewBuildTask};
    use distbuild_core::errata::{NewErrataRecord, ReleaseStatus};
    use distbuild_core::product::{NewProduct, ProductOwner};
    use distbuild_core::task::{CapabilitySet, PackageRef, TaskKind, TaskStatus};
    use distbuild_db::{ClaimRequest, ErrataRepo, MemoryStore, ProductRepo, TaskStore};

    fn worker(store: Arc<MemoryStore>) -> BackgroundWorker {
        let completion = Arc::new(CompletionHandler::new(
            store.clone(),
            SchedulerConfig::default(),
        ));
        let releaser = Arc::new(ErrataReleaser::new(
            store.clone(),
            Arc::new(MemoryArtifactStore::new()),
        ));
        let assembler = Arc::new(ProductAssembler::new(store));
        BackgroundWorker::new(completion, releaser, assembler)
    }

    #[tokio::test]
    async fn test_worker_applies_queued_jobs() {
        let store = Arc::new(MemoryStore::new());
        let build = store
            .create_build(
                &NewBuild {
                    tasks: vec![NewBuildTask {
                        arch: "x86_64".to_string(),
                        source_ref: "https://git.example.org/rpms/curl.git".to_string(),
                        depends_on: vec![],
                    }],
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let now = Utc::now();
        let task = store
            .claim_next(&ClaimRequest {
                kind: TaskKind::Build,
                worker_id: "node-1".to_string(),
                capabilities: CapabilitySet::from_strings(["arch:x86_64"]).unwrap(),
                now,
                lease_expiry: now + chrono::Duration::seconds(300),
            })
            .await
            .unwrap()
            .unwrap();
        ErrataRepo::create(
            store.as_ref(),
            &NewErrataRecord {
                id: "ALSA-2024:0200".to_string(),
                platform: "AlmaLinux-9".to_string(),
                title: "Low: tzdata enhancement update".to_string(),
                packages: vec!["tzdata".to_string()],
            },
            Utc::now(),
        )
        .await
        .unwrap();
        let (product, _) = ProductRepo::create(
            store.as_ref(),
            &NewProduct {
                name: "curl-extras".to_string(),
                owner: ProductOwner {
                    username: "carol".to_string(),
                    email: "carol@example.org".to_string(),
                },
                is_community: false,
            },
            Utc::now(),
        )
        .await
        .unwrap();

        let (queue, jobs) = BackgroundQueue::new(8);
        let report = CompletionReport::succeeded(
            task.epoch,
            vec![PackageRef {
                name: "curl".to_string(),
                href: "/pulp/api/v3/content/rpm/packages/curl/".to_string(),
            }],
        );
        queue
            .enqueue(BackgroundJob::CompleteTask {
                task_id: task.id,
                report: report.clone(),
            })
            .await
            .unwrap();
        // A duplicate delivery is a lost race, not a failure.
        queue
            .enqueue(BackgroundJob::CompleteTask {
                task_id: task.id,
                report,
            })
            .await
            .unwrap();
        queue
            .enqueue(BackgroundJob::BulkRelease {
                record_ids: vec!["ALSA-2024:0200".to_string()],
            })
            .await
            .unwrap();
        queue
            .enqueue(BackgroundJob::ModifyProduct {
                product_id: product.id,
                build_id: build.build.id,
                change: ProductChange::Add,
            })
            .await
            .unwrap();
        drop(queue);

        worker(store.clone()).run(jobs).await;

        assert_eq!(
            store.get_task(task.id).await.unwrap().status,
            TaskStatus::Done
        );
        assert_eq!(
            ErrataRepo::get(store.as_ref(), "ALSA-2024:0200")
                .await
                .unwrap()
                .release_status,
            ReleaseStatus::Released
        );
        assert_eq!(
            ProductRepo::get(store.as_ref(), product.id)
                .await
                .unwrap()
                .builds,
            vec![build.build.id]
        );
    }

    #[tokio::test]
    async fn test_enqueue_fails_without_worker() {
        let (queue, jobs) = BackgroundQueue::new(1);
        drop(jobs);
        let err = queue
            .enqueue(BackgroundJob::ReleaseErrata {
                record_id: "ALSA-2024:0001".to_string(),
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
