use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum StorageError {
    /// Transient; callers retry within their own budget.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Non-transient; the write is rejected and retrying will not help.
    #[error("storage conflict: {0}")]
    Conflict(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        StorageError::Unavailable(e.to_string())
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `path` (overwrite allowed) and return the public URL.
    async fn put(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<String, StorageError>;

    /// Object paths under `prefix`, lexicographically ordered.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Public URL for an object path; does not check existence.
    fn public_url(&self, path: &str) -> String;
}

/// Bucket store speaking the storage service's REST surface.
pub struct HttpBucketStore {
    http: Client,
    endpoint: String,
    bucket: String,
    service_key: String,
}

impl HttpBucketStore {
    pub fn new(
        endpoint: String,
        bucket: String,
        service_key: String,
    ) -> Result<Self, StorageError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
            service_key,
        })
    }

    fn classify(status: StatusCode, body: String) -> StorageError {
        if status == StatusCode::CONFLICT {
            StorageError::Conflict(body)
        } else if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            StorageError::Conflict(format!("{status}: {body}"))
        } else {
            StorageError::Unavailable(format!("{status}: {body}"))
        }
    }
}

#[derive(Deserialize)]
struct ListedObject {
    name: String,
}

#[async_trait]
impl ObjectStore for HttpBucketStore {
    #[instrument(skip(self, bytes), fields(path = %path, size = bytes.len()), level = "debug")]
    async fn put(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<String, StorageError> {
        let url = format!("{}/object/{}/{}", self.endpoint, self.bucket, path);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("content-type", mime)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        debug!(path, "object stored");
        Ok(self.public_url(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // The service lists by folder; filter down to the full prefix here.
        let (folder, _) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        let url = format!("{}/object/list/{}", self.endpoint, self.bucket);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.service_key)
            .json(&serde_json::json!({ "prefix": folder, "limit": 1000 }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify(status, body));
        }

        let objects: Vec<ListedObject> = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let mut paths: Vec<String> = objects
            .into_iter()
            .map(|o| {
                if folder.is_empty() {
                    o.name
                } else {
                    format!("{folder}/{}", o.name)
                }
            })
            .filter(|p| p.starts_with(prefix))
            .collect();
        paths.sort();

        Ok(paths)
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/object/public/{}/{}", self.endpoint, self.bucket, path)
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: parking_lot::RwLock<BTreeMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().get(path).map(|(b, _)| b.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, mime: &str) -> Result<String, StorageError> {
        self.objects
            .write()
            .insert(path.to_string(), (bytes, mime.to_string()));
        Ok(self.public_url(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let guard = self.objects.read();
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://objects/{path}")
    }
}
