//! Gemini-backed evidence providers
//!
//! One shared HTTP client implements all three capabilities: multimodal
//! vision analysis and single-shot completions via `generateContent`, and
//! description embeddings via `embedContent`. In-flight requests are capped
//! by a semaphore sized from `PROVIDER_MAX_CONCURRENCY`.
//!
//! Images are fetched from their URL, transcoded to RGB JPEG within
//! 1024x1024 at quality 85, and submitted inline as base64.

use crate::analyzer::evidence::VisionEvidence;
use crate::analyzer::{parsing, prompts};
use crate::config::ProviderConfig;
use crate::models::NftInput;
use crate::providers::{
    EmbeddingProvider, ProviderError, ProviderResult, TextProvider, VisionProvider,
};
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// Maximum image edge submitted to the multimodal endpoint
const MAX_IMAGE_EDGE: u32 = 1024;

/// JPEG quality for the transcoded upload
const JPEG_QUALITY: u8 = 85;

/// Generation settings shared by vision and text calls; low temperature
/// keeps the analysis consistent across retries.
const TEMPERATURE: f32 = 0.1;
const MAX_OUTPUT_TOKENS: u32 = 1000;

/// Shared Gemini client behind all three provider capabilities
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    embedding_model: String,
    base_url: String,
    dimension: usize,
    image_timeout: Duration,
    permits: Semaphore,
}

impl GeminiClient {
    /// Returns `None` when no API key is configured
    pub fn from_config(config: &ProviderConfig, dimension: usize) -> Option<Self> {
        let api_key = config.google_api_key.clone()?;

        let http = reqwest::Client::builder()
            .timeout(config.llm_timeout)
            .build()
            .ok()?;

        Some(Self {
            http,
            api_key,
            model: config.gemini_model.clone(),
            embedding_model: config.gemini_embedding_model.clone(),
            base_url: config.gemini_base_url.trim_end_matches('/').to_string(),
            dimension,
            image_timeout: config.image_timeout,
            permits: Semaphore::new(config.max_concurrency),
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        // Embedding model names already carry the "models/" prefix
        let path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        format!(
            "{}/{}:{}?key={}",
            self.base_url, path, method, self.api_key
        )
    }

    async fn acquire(&self) -> ProviderResult<tokio::sync::SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("provider client shut down".to_string()))
    }

    /// Download an image and transcode it to base64 RGB JPEG within limits
    #[instrument(skip(self))]
    async fn download_and_transcode(&self, image_url: &str) -> ProviderResult<String> {
        let response = self
            .http
            .get(image_url)
            .timeout(self.image_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("image download failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "image download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("image body read failed: {}", e)))?;

        debug!("Downloaded image: {} bytes from {}", bytes.len(), image_url);

        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| ProviderError::Parse(format!("image decode failed: {}", e)))?;

        let decoded = if decoded.width() > MAX_IMAGE_EDGE || decoded.height() > MAX_IMAGE_EDGE {
            decoded.thumbnail(MAX_IMAGE_EDGE, MAX_IMAGE_EDGE)
        } else {
            decoded
        };
        let rgb = decoded.to_rgb8();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut jpeg), JPEG_QUALITY)
            .encode_image(&rgb)
            .map_err(|e| ProviderError::Parse(format!("jpeg encode failed: {}", e)))?;

        Ok(base64::engine::general_purpose::STANDARD.encode(&jpeg))
    }

    /// Submit a generateContent request and return the first candidate text
    async fn generate(&self, parts: Vec<Part>) -> ProviderResult<String> {
        let request = GenerateRequest {
            contents: vec![Content { parts }],
            generation_config: GenerationConfig {
                temperature: TEMPERATURE,
                max_output_tokens: MAX_OUTPUT_TOKENS,
            },
        };

        let response = self
            .http
            .post(self.model_url(&self.model, "generateContent"))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "generateContent returned {}",
                status
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("response body unreadable: {}", e)))?;

        body.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .and_then(|p| p.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ProviderError::Parse("response carried no candidate text".to_string()))
    }
}

#[async_trait::async_trait]
impl VisionProvider for GeminiClient {
    #[instrument(skip(self, input), fields(title = %input.title))]
    async fn analyze(&self, input: &NftInput) -> ProviderResult<VisionEvidence> {
        let _permit = self.acquire().await?;

        let image_data = self.download_and_transcode(&input.image_url).await?;
        let prompt = prompts::vision_prompt(input);

        let text = self
            .generate(vec![
                Part::text(prompt),
                Part::inline_image("image/jpeg", image_data),
            ])
            .await?;

        let value = parsing::extract_json(&text).ok_or_else(|| {
            warn!("Vision response carried no JSON: {:.200}", text);
            ProviderError::Parse("no JSON object in vision response".to_string())
        })?;

        Ok(parsing::vision_from_value(&value))
    }
}

#[async_trait::async_trait]
impl TextProvider for GeminiClient {
    async fn complete(&self, prompt: &str) -> ProviderResult<String> {
        let _permit = self.acquire().await?;
        self.generate(vec![Part::text(prompt.to_string())]).await
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for GeminiClient {
    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>> {
        let _permit = self.acquire().await?;

        let request = EmbedRequest {
            model: self.embedding_model.clone(),
            content: Content {
                parts: vec![Part::text(text.to_string())],
            },
        };

        let response = self
            .http
            .post(self.model_url(&self.embedding_model, "embedContent"))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "embedContent returned {}",
                status
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(format!("response body unreadable: {}", e)))?;

        let values = body.embedding.values;
        if values.len() != self.dimension {
            return Err(ProviderError::Parse(format!(
                "embedding has {} components, expected {}",
                values.len(),
                self.dimension
            )));
        }

        Ok(values)
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "inline_data", skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: String) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }

    fn inline_image(mime_type: &str, data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}
