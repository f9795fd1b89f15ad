//! Errata record release.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use distbuild_core::artifact::ArtifactStore;
use distbuild_core::errata::{ErrataRecord, NewErrataRecord, ReleaseStart, ReleaseStatus};
use distbuild_core::{Error, Result};
use distbuild_db::ErrataRepo;
use serde_json::json;
use tracing::{info, warn};

use crate::background::{BackgroundJob, BackgroundQueue};

/// Request-side errata operations.
pub struct ErrataService {
    repo: Arc<dyn ErrataRepo>,
    queue: BackgroundQueue,
}

impl ErrataService {
    pub fn new(repo: Arc<dyn ErrataRepo>, queue: BackgroundQueue) -> Self {
        Self { repo, queue }
    }

    pub async fn create_record(&self, record: &NewErrataRecord) -> Result<ErrataRecord> {
        record.validate()?;
        let created = self.repo.create(record, Utc::now()).await?;
        info!(record_id = %created.id, platform = %created.platform, "Created errata record");
        Ok(created)
    }

    pub async fn get_record(&self, id: &str) -> Result<ErrataRecord> {
        Ok(self.repo.get(id).await?)
    }

    pub async fn list_records(&self, status: Option<ReleaseStatus>) -> Result<Vec<ErrataRecord>> {
        Ok(self.repo.list(status).await?)
    }

    /// Mark the record in progress and schedule its release. A record
    /// already being released is left alone.
    pub async fn release_record(&self, id: &str, force: bool) -> Result<ReleaseStart> {
        let start = self.repo.begin_release(id, Utc::now()).await?;
        if start != ReleaseStart::Started {
            return Ok(start);
        }

        let job = BackgroundJob::ReleaseErrata {
            record_id: id.to_string(),
            force,
        };
        if let Err(e) = self.queue.enqueue(job).await {
            self.repo
                .finish_release(
                    id,
                    ReleaseStatus::Failed,
                    &format!("could not schedule release: {}", e),
                    Utc::now(),
                )
                .await?;
            return Err(e);
        }
        Ok(start)
    }

    /// Schedule a release of every listed record. An empty list schedules
    /// a job that does nothing.
    pub async fn bulk_release(&self, ids: Vec<String>) -> Result<String> {
        let message = format!(
            "Following records scheduled for release: {}",
            ids.join(", ")
        );
        self.queue
            .enqueue(BackgroundJob::BulkRelease { record_ids: ids })
            .await?;
        Ok(message)
    }
}

/// Publishes errata records to the artifact repository. Runs on the
/// background worker.
pub struct ErrataReleaser {
    repo: Arc<dyn ErrataRepo>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl ErrataReleaser {
    pub fn new(repo: Arc<dyn ErrataRepo>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { repo, artifacts }
    }

    /// Release a record that was moved to in progress. Publishing
    /// failures end the release as failed with the error in its log.
    ///
    /// Records without packages are only released when `force` is set.
    pub async fn release(&self, id: &str, force: bool) -> Result<ErrataRecord> {
        let record = self.repo.get(id).await?;

        let (status, log) = if record.packages.is_empty() && !force {
            (
                ReleaseStatus::Failed,
                format!("Record {} has no packages; release with force to publish it anyway", id),
            )
        } else {
            match self.publish(&record).await {
                Ok(log) => (ReleaseStatus::Released, log),
                Err(e) => (ReleaseStatus::Failed, format!("Release failed: {}", e)),
            }
        };

        let finished = self.repo.finish_release(id, status, &log, Utc::now()).await?;
        match status {
            ReleaseStatus::Released => info!(record_id = %id, "Released errata record"),
            _ => warn!(record_id = %id, %log, "Errata release failed"),
        }
        Ok(finished)
    }

    /// Start and run a release for each record, skipping ones that do not
    /// exist or are already being released.
    pub async fn release_many(&self, ids: &[String]) -> Vec<(String, ReleaseStatus)> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            match self.repo.begin_release(id, Utc::now()).await {
                Ok(ReleaseStart::Started) => match self.release(id, false).await {
                    Ok(record) => outcomes.push((id.clone(), record.release_status)),
                    Err(e) => warn!(record_id = %id, error = %e, "Bulk release of record failed"),
                },
                Ok(other) => info!(record_id = %id, "{}", other.message(id)),
                Err(e) => warn!(record_id = %id, error = %e, "Could not start release"),
            }
        }
        outcomes
    }

    async fn publish(&self, record: &ErrataRecord) -> Result<String> {
        let key = format!("errata/{}/{}.json", record.platform, record.id);
        let document = json!({
            "id": record.id,
            "platform": record.platform,
            "title": record.title,
            "packages": record.packages,
            "released_at": Utc::now(),
        });
        let body = serde_json::to_vec(&document)
            .map_err(|e| Error::Internal(format!("encode errata document: {}", e)))?;
        let artifact = self.artifacts.put(&key, Bytes::from(body)).await?;
        Ok(format!(
            "Published {} ({} bytes) to {}",
            record.id, artifact.size, artifact.location
        ))
    }
}
