//! Artifact repository port.
//!
//! The artifact repository is an opaque remote store; the orchestration
//! layer only needs to put, get and list objects by key.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    /// Storage location (backend-specific).
    pub location: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact, replacing any previous object under `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<ArtifactRef>;

    /// Retrieve an artifact.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// List artifacts whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactRef>>;
}
