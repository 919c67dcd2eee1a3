//! Job scheduling for the analysis pipeline
//!
//! Foreground: the create path runs the analyzer synchronously under a
//! deadline, behind an admission gate (a slot semaphore plus a bounded wait
//! queue). Queue overflow sheds load with `Overloaded`; deadline expiry
//! still yields a persistable fallback verdict.
//!
//! Background: side-effect tasks (embedding persistence, re-analysis) are
//! spawned after the response and retried with bounded exponential backoff.
//! Terminal failures are logged with the NFT id; they never invalidate a
//! stored verdict.

use crate::analyzer::{AnalysisOutcome, FraudAnalyzer};
use crate::error::{Error, Result};
use crate::models::{Nft, NftInput};
use crate::providers::ProviderSet;
use crate::similarity::{decode_vector, encode_vector, IndexMetadata};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Exponential backoff schedule for background tasks
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_FACTOR: u32 = 2;
const MAX_ATTEMPTS: u32 = 5;

/// Suggested client retry delay when the queue is full
const RETRY_AFTER_SECS: u64 = 5;

/// Runs analyses with admission control and owns background side effects
pub struct Scheduler {
    analyzer: FraudAnalyzer,
    providers: Arc<ProviderSet>,
    pool: PgPool,
    /// Concurrent foreground analyses
    slots: Arc<Semaphore>,
    /// Slots plus the bounded wait queue; try-acquired for load shedding
    queue: Arc<Semaphore>,
    deadline: Duration,
}

impl Scheduler {
    pub fn new(
        analyzer: FraudAnalyzer,
        providers: Arc<ProviderSet>,
        pool: PgPool,
        max_concurrency: usize,
        queue_depth: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            analyzer,
            providers,
            pool,
            slots: Arc::new(Semaphore::new(max_concurrency)),
            queue: Arc::new(Semaphore::new(max_concurrency + queue_depth)),
            deadline,
        }
    }

    // ========================================================================
    // Foreground
    // ========================================================================

    /// Run the analyzer under admission control and the request deadline.
    /// On deadline expiry the deterministic fallback verdict is returned so
    /// the create path can still persist.
    #[instrument(skip(self, input), fields(title = %input.title))]
    pub async fn analyze(&self, input: &NftInput) -> Result<AnalysisOutcome> {
        let Ok(_queued) = self.queue.try_acquire() else {
            metrics::counter!("analyses_shed_total").increment(1);
            return Err(Error::Overloaded {
                retry_after_secs: RETRY_AFTER_SECS,
            });
        };

        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| Error::Internal { source: None })?;

        match tokio::time::timeout(self.deadline, self.analyzer.analyze(input)).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                warn!(
                    "Analysis deadline of {:?} exceeded, returning fallback verdict",
                    self.deadline
                );
                metrics::counter!("analyses_deadline_expired_total").increment(1);
                Ok(self.analyzer.fallback_outcome(input))
            }
        }
    }

    // ========================================================================
    // Background
    // ========================================================================

    /// Persist an embedding into the similarity index without blocking the
    /// caller. Retries transient failures with exponential backoff.
    pub fn spawn_embedding_upsert(
        self: &Arc<Self>,
        nft_id: Uuid,
        embedding: Vec<f32>,
        meta: IndexMetadata,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let index = scheduler.providers.index.clone();
            run_with_backoff("embedding_upsert", nft_id, || {
                let index = index.clone();
                let embedding = embedding.clone();
                let meta = meta.clone();
                async move { index.upsert(nft_id, &embedding, meta).await }
            })
            .await;
        });
    }

    /// Re-run the analyzer over an existing NFT and overwrite its verdict.
    /// This is the only path that may mutate verdict fields after creation.
    pub fn spawn_reanalysis(self: &Arc<Self>, nft_id: Uuid) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            run_with_backoff("reanalysis", nft_id, || {
                let scheduler = scheduler.clone();
                async move { scheduler.reanalyze(nft_id).await }
            })
            .await;
        });
    }

    async fn reanalyze(&self, nft_id: Uuid) -> Result<()> {
        let nft: Option<Nft> = sqlx::query_as("SELECT * FROM nfts WHERE id = $1")
            .bind(nft_id)
            .fetch_optional(&self.pool)
            .await?;
        let nft = nft.ok_or_else(|| Error::not_found("nft", nft_id.to_string()))?;

        let input = NftInput {
            title: nft.title.clone(),
            description: nft.description.clone().unwrap_or_default(),
            category: nft.category.clone(),
            price: nft.price.to_f64().unwrap_or(0.0),
            image_url: nft.image_url.clone(),
        };

        let outcome = self.analyzer.analyze(&input).await;
        let verdict = &outcome.verdict;
        let details = serde_json::to_value(&verdict.details)?;

        sqlx::query(
            r#"
            UPDATE nfts SET
                is_fraud = $2,
                confidence_score = $3,
                flag_type = $4,
                reason = $5,
                evidence_urls = $6,
                analysis_details = $7,
                embedding_vector = COALESCE($8, embedding_vector)
            WHERE id = $1
            "#,
        )
        .bind(nft_id)
        .bind(verdict.is_fraud)
        .bind(f64::from(verdict.confidence_score))
        .bind(verdict.flag_type)
        .bind(&verdict.reason)
        .bind(sqlx::types::Json(&verdict.evidence_urls))
        .bind(sqlx::types::Json(&details))
        .bind(outcome.embedding.as_deref().map(encode_vector))
        .execute(&self.pool)
        .await?;

        if let Some(embedding) = &outcome.embedding {
            self.providers
                .index
                .upsert(
                    nft_id,
                    embedding,
                    IndexMetadata {
                        title: nft.title.clone(),
                        creator: nft.wallet_address.clone(),
                        image_url: nft.image_url.clone(),
                    },
                )
                .await?;
        }

        info!(
            "Re-analysis of NFT {} complete: is_fraud={}",
            nft_id, verdict.is_fraud
        );
        Ok(())
    }

    /// Decode the stored embedding blob of an NFT, if any
    pub fn stored_embedding(nft: &Nft) -> Option<Vec<f32>> {
        nft.embedding_vector
            .as_deref()
            .and_then(|blob| decode_vector(blob).ok())
    }
}

/// Retry a background task with bounded exponential backoff and jitter.
/// Terminal failures are logged and swallowed; the stored verdict stands.
async fn run_with_backoff<F, Fut>(task: &'static str, nft_id: Uuid, mut operation: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut delay = RETRY_BASE;

    for attempt in 1..=MAX_ATTEMPTS {
        match operation().await {
            Ok(()) => {
                if attempt > 1 {
                    info!(
                        "Background task '{}' for NFT {} succeeded on attempt {}",
                        task, nft_id, attempt
                    );
                }
                return;
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    "Background task '{}' for NFT {} failed (attempt {}/{}): {:?}",
                    task, nft_id, attempt, MAX_ATTEMPTS, e
                );
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250u64));
                tokio::time::sleep(delay + jitter).await;
                delay *= RETRY_FACTOR;
            }
            Err(e) => {
                metrics::counter!("background_task_failures_total", "task" => task).increment(1);
                error!(
                    "Background task '{}' for NFT {} failed terminally after {} attempts: {:?}",
                    task, nft_id, MAX_ATTEMPTS, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FraudConfig;
    use crate::providers::{ProviderResult, TextProvider};
    use crate::similarity::MemoryIndex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fraud_config() -> FraudConfig {
        FraudConfig {
            confidence_threshold: 0.7,
            similarity_threshold: 0.85,
            embedding_dimension: 4,
            max_concurrency: 1,
            queue_depth: 0,
        }
    }

    /// Text provider that never answers within any test deadline
    struct StalledText;

    #[async_trait::async_trait]
    impl TextProvider for StalledText {
        async fn complete(&self, _prompt: &str) -> ProviderResult<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }

    fn input() -> NftInput {
        NftInput {
            title: "Queued".to_string(),
            description: "admission control test".to_string(),
            category: "art".to_string(),
            price: 1.0,
            image_url: "https://img/q.jpg".to_string(),
        }
    }

    fn stalled_scheduler(pool: PgPool, deadline: Duration) -> Arc<Scheduler> {
        let providers = Arc::new(ProviderSet {
            vision: None,
            text: Some(Arc::new(StalledText)),
            embedding: None,
            index: Arc::new(MemoryIndex::new(4)),
        });
        let analyzer = FraudAnalyzer::new(providers.clone(), fraud_config());
        Arc::new(Scheduler::new(analyzer, providers, pool, 1, 0, deadline))
    }

    fn lazy_pool() -> PgPool {
        // Never actually connected in these tests
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/fraudguard_test")
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_overflow_sheds_load() {
        let scheduler = stalled_scheduler(lazy_pool(), Duration::from_secs(60));

        let busy = scheduler.clone();
        let first = tokio::spawn(async move { busy.analyze(&input()).await });
        tokio::task::yield_now().await;

        // One slot, zero queue depth: the second request is shed immediately
        let err = scheduler.analyze(&input()).await.unwrap_err();
        assert!(matches!(err, Error::Overloaded { .. }));

        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_returns_fallback_verdict() {
        let scheduler = stalled_scheduler(lazy_pool(), Duration::from_secs(1));

        let outcome = scheduler.analyze(&input()).await.unwrap();
        assert!(outcome.verdict.details.llm_decision.fallback_used);
        assert!(outcome.verdict.confidence_score <= 0.8);
        assert!(outcome.embedding.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        run_with_backoff("test_task", Uuid::new_v4(), || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(Error::database("still down"))
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_on_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();

        run_with_backoff("test_task", Uuid::new_v4(), || {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::database("transient"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
