use std::time::Duration;

use thiserror::Error;

/// Normalized upstream failure kinds.
///
/// The worker dispatches its retry policy on these: `Transient` and
/// `QuotaExhausted` are retried inside the task budget, `InvalidInput` and
/// `AuthFailure` fail the batch immediately without aborting the execution.
#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("prompt rejected by model: {0}")]
    InvalidInput(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("model quota exhausted")]
    QuotaExhausted { retry_after: Option<Duration> },

    #[error("upstream authentication failed")]
    AuthFailure,
}

impl GeneratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GeneratorError::Transient(_) | GeneratorError::QuotaExhausted { .. }
        )
    }
}
