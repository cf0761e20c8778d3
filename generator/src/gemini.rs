use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use crate::ImageGenerator;
use crate::credentials::ApiKey;
use crate::error::GeneratorError;
use crate::types::{GenerateParams, GeneratedImage};

/// Gemini REST client serving both the `flash` and `pro` variants; the
/// variant in the params picks the upstream model id.
pub struct GeminiImageClient {
    http: Client,
    base_url: String,
}

impl GeminiImageClient {
    pub fn new(base_url: String) -> Result<Self, GeneratorError> {
        let http = Client::builder()
            // Generation regularly takes tens of seconds; the worker also
            // bounds each call, this is the hard transport ceiling.
            .timeout(Duration::from_secs(120))
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| GeneratorError::Transient(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_reference(&self, url: &str) -> Result<(Vec<u8>, String), GeneratorError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GeneratorError::Transient(e.to_string()))?
            .error_for_status()
            .map_err(|e| GeneratorError::Transient(e.to_string()))?;

        let mime = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GeneratorError::Transient(e.to_string()))?;

        Ok((bytes.to_vec(), mime))
    }
}

#[async_trait]
impl ImageGenerator for GeminiImageClient {
    #[instrument(
        skip(self, params, key),
        fields(model = %params.variant, prompt_len = params.prompt.len()),
        level = "debug"
    )]
    async fn generate(
        &self,
        params: &GenerateParams,
        key: &ApiKey,
    ) -> Result<GeneratedImage, GeneratorError> {
        let started = Instant::now();

        let mut parts = vec![json!({ "text": params.prompt })];
        for url in &params.reference_image_urls {
            let (bytes, mime) = self.fetch_reference(url).await?;
            parts.push(json!({
                "inline_data": { "mime_type": mime, "data": BASE64.encode(&bytes) }
            }));
        }

        let body = json!({
            "contents": [{ "parts": parts }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
                "imageConfig": {
                    "aspectRatio": params.aspect_ratio,
                    "imageSize": params.size.as_str(),
                }
            }
        });

        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url,
            params.variant.model_id()
        );

        let resp = self
            .http
            .post(&endpoint)
            .header("x-goog-api-key", key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| GeneratorError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&resp);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &text));
        }

        let parsed: GenerateContentResponse = resp
            .json()
            .await
            .map_err(|e| GeneratorError::Transient(format!("malformed response: {e}")))?;

        let (bytes, mime) = extract_image(parsed)?;

        debug!(
            size = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "image generated"
        );

        Ok(GeneratedImage {
            bytes,
            mime,
            processing_ms: started.elapsed().as_millis() as u64,
            cost: params.variant.cost_per_image(),
        })
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default, alias = "inlineData")]
    inline_data: Option<InlineData>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct InlineData {
    #[serde(alias = "mimeType")]
    mime_type: String,
    data: String,
}

fn parse_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> GeneratorError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            GeneratorError::InvalidInput(truncate(body))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GeneratorError::AuthFailure,
        StatusCode::TOO_MANY_REQUESTS => GeneratorError::QuotaExhausted { retry_after },
        _ => GeneratorError::Transient(format!("{status}: {}", truncate(body))),
    }
}

/// First inline image part wins. A response with only text is the model
/// declining the prompt, which is an input problem, not a transport one.
fn extract_image(resp: GenerateContentResponse) -> Result<(Vec<u8>, String), GeneratorError> {
    let mut refusal = None;

    for candidate in resp.candidates {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(inline) = part.inline_data {
                let bytes = BASE64
                    .decode(inline.data.as_bytes())
                    .map_err(|e| GeneratorError::Transient(format!("invalid image data: {e}")))?;
                return Ok((bytes, inline.mime_type));
            }
            if refusal.is_none() {
                refusal = part.text;
            }
        }
    }

    Err(GeneratorError::InvalidInput(
        refusal.unwrap_or_else(|| "model returned no image".to_string()),
    ))
}

/// Normalizes upstream error bodies into bounded strings.
fn truncate(s: &str) -> String {
    const MAX: usize = 200;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_camel_case_inline_image() {
        let resp: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": { "parts": [
                        { "text": "here you go" },
                        { "inlineData": { "mimeType": "image/png", "data": "AQID" } }
                    ]}
                }]
            }"#,
        )
        .unwrap();

        let (bytes, mime) = extract_image(resp).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn text_only_response_is_invalid_input() {
        let resp: GenerateContentResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": { "parts": [{ "text": "I cannot generate that." }] }
                }]
            }"#,
        )
        .unwrap();

        match extract_image(resp) {
            Err(GeneratorError::InvalidInput(msg)) => {
                assert!(msg.contains("cannot generate"))
            }
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "policy"),
            GeneratorError::InvalidInput(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            GeneratorError::AuthFailure
        ));
        assert!(matches!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(5)),
                ""
            ),
            GeneratorError::QuotaExhausted {
                retry_after: Some(_)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            GeneratorError::Transient(_)
        ));
    }
}
