use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::executions::ExecutionRepo;
use generator::{ApiKey, GeneratorError, KeyCipher};

pub const GENERATION_PROVIDER: &str = "gemini";

/// Per-client generation credential resolution.
///
/// Order: the client's encrypted credential (decrypted with the process-wide
/// key), then the process-wide fallback key, then a hard auth failure. Every
/// decrypt anomaly collapses to `AuthFailure`; the cipher never says why.
pub struct CredentialResolver {
    repo: Arc<dyn ExecutionRepo>,
    cipher: Option<KeyCipher>,
    fallback: Option<ApiKey>,
}

impl CredentialResolver {
    pub fn new(
        repo: Arc<dyn ExecutionRepo>,
        cipher: Option<KeyCipher>,
        fallback: Option<ApiKey>,
    ) -> Self {
        Self {
            repo,
            cipher,
            fallback,
        }
    }

    pub async fn resolve(&self, client_id: Uuid) -> Result<ApiKey, GeneratorError> {
        if let Some(cipher) = &self.cipher {
            match self
                .repo
                .client_credential(client_id, GENERATION_PROVIDER)
                .await
            {
                Ok(Some(ciphertext)) => {
                    return cipher
                        .decrypt(&ciphertext)
                        .map_err(|_| GeneratorError::AuthFailure);
                }
                Ok(None) => {
                    debug!(client_id = %client_id, "no per-client credential; using fallback");
                }
                Err(e) => {
                    // Lookup failure is infrastructure, not a missing key.
                    return Err(GeneratorError::Transient(format!(
                        "credential lookup failed: {e}"
                    )));
                }
            }
        }

        self.fallback.clone().ok_or(GeneratorError::AuthFailure)
    }
}
