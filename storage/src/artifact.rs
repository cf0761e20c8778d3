use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::object_store::{ObjectStore, StorageError};
use common::clock::now_ms;

/// A stored artifact: the public URL clients see and the bucket path the
/// system keeps for bookkeeping.
#[derive(Clone, Debug)]
pub struct StoredArtifact {
    pub url: String,
    pub storage_path: String,
}

/// Path discipline over a raw object store.
///
/// Result objects live under `workflow-results/{execution_id}/{batch_index}-{ts}.{ext}`.
/// The `{execution_id}/{batch_index}-` prefix is deterministic, which is what
/// makes redelivered jobs idempotent: a retry finds the object written by the
/// previous attempt and returns the same URL instead of minting a new one.
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, bytes), fields(execution_id = %execution_id, batch_index), level = "debug")]
    pub async fn put_result(
        &self,
        execution_id: Uuid,
        batch_index: u32,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Result<StoredArtifact, StorageError> {
        let prefix = format!("workflow-results/{execution_id}/{batch_index}-");

        if let Some(existing) = self.store.list(&prefix).await?.into_iter().next() {
            debug!(path = %existing, "reusing artifact from earlier attempt");
            return Ok(StoredArtifact {
                url: self.store.public_url(&existing),
                storage_path: existing,
            });
        }

        let path = format!("{prefix}{}.{}", now_ms(), extension_for(mime));
        let url = self.store.put(&path, bytes, mime).await?;

        Ok(StoredArtifact {
            url,
            storage_path: path,
        })
    }

    pub async fn put_reference(
        &self,
        client_id: Uuid,
        bytes: Vec<u8>,
        mime: &str,
    ) -> Result<StoredArtifact, StorageError> {
        let path = format!(
            "reference-images/{client_id}/{}.{}",
            Uuid::new_v4(),
            extension_for(mime)
        );
        let url = self.store.put(&path, bytes, mime).await?;

        Ok(StoredArtifact {
            url,
            storage_path: path,
        })
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        _ => "bin",
    }
}
