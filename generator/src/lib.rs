//! Upstream image generation capability.
//!
//! The trait intentionally hides transport, request shaping, and response
//! parsing; errors are normalized into the four kinds the worker's retry
//! policy dispatches on. Rate limiting is the caller's job — implementations
//! never throttle themselves.

pub mod credentials;
pub mod error;
pub mod gemini;
pub mod types;

pub use credentials::{ApiKey, CipherError, KeyCipher};
pub use error::GeneratorError;
pub use gemini::GeminiImageClient;
pub use types::{GenerateParams, GeneratedImage, ModelVariant, OutputSize};

use async_trait::async_trait;

#[async_trait]
pub trait ImageGenerator: Send + Sync + 'static {
    async fn generate(
        &self,
        params: &GenerateParams,
        key: &ApiKey,
    ) -> Result<GeneratedImage, GeneratorError>;
}
