//! Artifact store backends.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use distbuild_core::artifact::{ArtifactRef, ArtifactStore};
use distbuild_core::{Error, Result};
use reqwest::StatusCode;

/// Keeps artifacts in process memory.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<BTreeMap<String, (ArtifactRef, Bytes)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, (ArtifactRef, Bytes)>>> {
        self.objects
            .lock()
            .map_err(|_| Error::Unavailable("artifact store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<ArtifactRef> {
        let artifact = ArtifactRef {
            key: key.to_string(),
            location: format!("memory://{}", key),
            size: data.len() as u64,
            created_at: Utc::now(),
        };
        self.objects()?
            .insert(key.to_string(), (artifact.clone(), data));
        Ok(artifact)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects()?
            .get(key)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| Error::NotFound(format!("artifact {}", key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactRef>> {
        Ok(self
            .objects()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, (artifact, _))| artifact.clone())
            .collect())
    }
}

/// Talks to a remote artifact repository over HTTP.
///
/// Objects live at `{base_url}/{key}`; `GET {base_url}/?prefix=` lists
/// them as a JSON array of artifact references.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

fn request_error(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_timeout() {
        Error::Unavailable(format!("artifact repository unreachable: {}", e))
    } else {
        Error::Internal(format!("artifact repository request failed: {}", e))
    }
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(what.to_string()),
        s if s.is_server_error() => {
            Error::Unavailable(format!("{} failed with {}: {}", what, s, text))
        }
        s => Error::Internal(format!("{} failed with {}: {}", what, s, text)),
    })
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<ArtifactRef> {
        let url = self.url(key);
        let size = data.len() as u64;
        let response = self
            .client
            .put(&url)
            .body(data)
            .send()
            .await
            .map_err(request_error)?;
        check_status(response, &format!("artifact {}", key)).await?;

        Ok(ArtifactRef {
            key: key.to_string(),
            location: url,
            size,
            created_at: Utc::now(),
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(self.url(key))
            .send()
            .await
            .map_err(request_error)?;
        check_status(response, &format!("artifact {}", key))
            .await?
            .bytes()
            .await
            .map_err(request_error)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactRef>> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .map_err(request_error)?;
        check_status(response, &format!("artifact listing {}", prefix))
            .await?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("malformed artifact listing: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_lists_by_prefix() {
        let store = MemoryArtifactStore::new();
        store
            .put("errata/AlmaLinux-9/ALSA-2024:0001.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .put("errata/AlmaLinux-8/ALSA-2024:0002.json", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        store
            .put("logs/build-1.log", Bytes::from_static(b"ok"))
            .await
            .unwrap();

        let listed = store.list("errata/AlmaLinux-9/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 2);
        assert_eq!(store.list("errata/").await.unwrap().len(), 2);
        assert_eq!(
            store.get("logs/build-1.log").await.unwrap(),
            Bytes::from_static(b"ok")
        );
        assert!(matches!(
            store.get("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_http_store_joins_urls() {
        let store = HttpArtifactStore::new("http://pulp.local/artifacts/");
        assert_eq!(
            store.url("/errata/x.json"),
            "http://pulp.local/artifacts/errata/x.json"
        );
    }
}
