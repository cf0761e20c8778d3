use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Upstream model tier. Each variant has its own rate-limit bucket, fan-out
/// cap, and per-image cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Flash,
    Pro,
}

impl ModelVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Flash => "flash",
            ModelVariant::Pro => "pro",
        }
    }

    /// Upstream model identifier used on the wire.
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelVariant::Flash => "gemini-2.5-flash-image",
            ModelVariant::Pro => "gemini-2.5-pro-image",
        }
    }

    /// USD per generated image, used for execution cost aggregation.
    pub fn cost_per_image(&self) -> f64 {
        match self {
            ModelVariant::Flash => 0.039,
            ModelVariant::Pro => 0.12,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flash" => Ok(ModelVariant::Flash),
            "pro" => Ok(ModelVariant::Pro),
            other => Err(format!("invalid model variant: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSize {
    #[serde(rename = "1K")]
    K1,
    #[serde(rename = "2K")]
    K2,
    #[serde(rename = "4K")]
    K4,
}

impl OutputSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputSize::K1 => "1K",
            OutputSize::K2 => "2K",
            OutputSize::K4 => "4K",
        }
    }
}

impl Default for OutputSize {
    fn default() -> Self {
        OutputSize::K1
    }
}

#[derive(Debug, Clone)]
pub struct GenerateParams {
    pub prompt: String,
    pub variant: ModelVariant,
    pub aspect_ratio: String,
    pub size: OutputSize,
    /// Public URLs of reference images; fetched and inlined by the client.
    pub reference_image_urls: Vec<String>,
}

impl GenerateParams {
    pub fn new(prompt: impl Into<String>, variant: ModelVariant) -> Self {
        Self {
            prompt: prompt.into(),
            variant,
            aspect_ratio: "1:1".to_string(),
            size: OutputSize::default(),
            reference_image_urls: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub processing_ms: u64,
    pub cost: f64,
}

impl fmt::Debug for GeneratedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedImage")
            .field("bytes", &self.bytes.len())
            .field("mime", &self.mime)
            .field("processing_ms", &self.processing_ms)
            .field("cost", &self.cost)
            .finish()
    }
}
