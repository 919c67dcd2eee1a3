//! Evidence provider capabilities
//!
//! The analyzer depends on these interfaces, never on concrete providers.
//! Every provider is optional: the capability record carries `None` for any
//! provider whose credentials are absent, and the pipeline substitutes
//! neutral evidence for that stage. The record is built once at startup and
//! threaded through application state, so there are no module-level
//! singletons and tests can substitute stubs freely.

pub mod gemini;

use crate::config::{FraudConfig, ProviderConfig};
use crate::models::NftInput;
use crate::similarity::{PgSimilarityIndex, SimilarityIndex};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::analyzer::evidence::VisionEvidence;

/// Provider failure classes. Both are absorbed at pipeline stage boundaries
/// and recorded as error notes in the evidence; neither reaches HTTP clients.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider response unparseable: {0}")]
    Parse(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Multimodal image analysis
#[async_trait::async_trait]
pub trait VisionProvider: Send + Sync {
    /// Download the image, submit it with the fraud-analysis prompt, and
    /// return structured evidence.
    async fn analyze(&self, input: &NftInput) -> ProviderResult<VisionEvidence>;
}

/// Single-shot text completion, used by the metadata and decision stages
#[async_trait::async_trait]
pub trait TextProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> ProviderResult<String>;
}

/// Text embedding into a fixed-dimension vector
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> ProviderResult<Vec<f32>>;
}

/// The capability record handed to the analyzer and scheduler
#[derive(Clone)]
pub struct ProviderSet {
    pub vision: Option<Arc<dyn VisionProvider>>,
    pub text: Option<Arc<dyn TextProvider>>,
    pub embedding: Option<Arc<dyn EmbeddingProvider>>,
    pub index: Arc<dyn SimilarityIndex>,
}

impl ProviderSet {
    /// Build the production capability record. Gemini providers are only
    /// constructed when an API key is configured.
    pub fn from_config(providers: &ProviderConfig, fraud: &FraudConfig, pool: PgPool) -> Self {
        let index: Arc<dyn SimilarityIndex> =
            Arc::new(PgSimilarityIndex::new(pool, fraud.embedding_dimension));

        let Some(client) = gemini::GeminiClient::from_config(providers, fraud.embedding_dimension)
        else {
            info!("Gemini providers disabled; pipeline will use neutral evidence");
            return Self {
                vision: None,
                text: None,
                embedding: None,
                index,
            };
        };

        let client = Arc::new(client);
        Self {
            vision: Some(client.clone()),
            text: Some(client.clone()),
            embedding: Some(client),
            index,
        }
    }

    /// A record with no LLM providers, for tests and degraded operation
    pub fn disabled(index: Arc<dyn SimilarityIndex>) -> Self {
        Self {
            vision: None,
            text: None,
            embedding: None,
            index,
        }
    }
}
