//! The four-stage fraud analysis pipeline
//!
//! Stages run in declared order, each a pure function of the input plus prior
//! stage outputs: vision, similarity, metadata, decision. Any provider
//! failure is caught at its stage boundary and replaced with neutral
//! evidence; the pipeline always produces a verdict. When the decision
//! provider itself is unavailable or unparseable, a deterministic weighted
//! formula decides instead, capped so the fallback is never maximally
//! confident.

use crate::analyzer::evidence::{
    AnalysisDetails, LlmDecision, MetadataEvidence, Recommendation, SimilarNft,
    SimilarityEvidence, Verdict, VisionEvidence,
};
use crate::analyzer::{parsing, prompts};
use crate::config::FraudConfig;
use crate::models::{FlagKind, NftInput};
use crate::providers::ProviderSet;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// How many index entries the similarity stage asks for
const SIMILARITY_LIMIT: usize = 10;

/// Rule-based screen applied inside the fallback decision. Keywords are
/// matched case-insensitively against title + description.
const FRAUD_KEYWORDS: &[&str] = &["fake", "copy", "stolen", "counterfeit"];

/// Prices below this are treated as a listing anomaly by the fallback screen
const SUSPICIOUS_PRICE_FLOOR: f64 = 0.001;

/// Everything the pipeline produces for one NFT: the verdict plus the
/// description embedding, carried separately so it never enters the
/// persisted analysis document.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub verdict: Verdict,
    pub embedding: Option<Vec<f32>>,
}

/// The fraud analysis engine
#[derive(Clone)]
pub struct FraudAnalyzer {
    providers: Arc<ProviderSet>,
    config: FraudConfig,
}

impl FraudAnalyzer {
    pub fn new(providers: Arc<ProviderSet>, config: FraudConfig) -> Self {
        Self { providers, config }
    }

    /// Run the full pipeline. Never fails: degraded stages substitute
    /// neutral evidence and the decision falls back to the weighted formula.
    #[instrument(skip(self, input), fields(title = %input.title))]
    pub async fn analyze(&self, input: &NftInput) -> AnalysisOutcome {
        let started = Instant::now();

        let (vision, embedding) = self.vision_stage(input).await;
        let similarity = self.similarity_stage(embedding.as_deref()).await;
        let metadata = self.metadata_stage(input).await;
        let decision = self
            .decision_stage(input, &vision, &similarity, &metadata)
            .await;

        let outcome = AnalysisOutcome {
            verdict: fuse(vision, similarity, metadata, decision),
            embedding,
        };

        metrics::counter!("fraud_analyses_total").increment(1);
        metrics::histogram!("fraud_analysis_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        info!(
            "Fraud analysis complete: is_fraud={}, confidence={:.2}",
            outcome.verdict.is_fraud, outcome.verdict.confidence_score
        );
        outcome
    }

    /// Verdict for the deadline-expiry path: in-flight evidence is discarded
    /// and the deterministic fallback decides over neutral evidence.
    pub fn fallback_outcome(&self, input: &NftInput) -> AnalysisOutcome {
        let vision = VisionEvidence::neutral("analysis deadline exceeded");
        let similarity = SimilarityEvidence::neutral("analysis deadline exceeded");
        let metadata = MetadataEvidence::neutral("analysis deadline exceeded");
        let decision = self.fallback_decision(input, &vision, &similarity, &metadata);

        AnalysisOutcome {
            verdict: fuse(vision, similarity, metadata, decision),
            embedding: None,
        }
    }

    // ========================================================================
    // Stage 1: vision
    // ========================================================================

    async fn vision_stage(&self, input: &NftInput) -> (VisionEvidence, Option<Vec<f32>>) {
        let Some(vision) = &self.providers.vision else {
            return (VisionEvidence::neutral("vision provider not configured"), None);
        };

        let evidence = match vision.analyze(input).await {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!("Vision stage degraded: {}", e);
                metrics::counter!("provider_failures_total", "stage" => "vision").increment(1);
                return (VisionEvidence::neutral(e.to_string()), None);
            }
        };

        let embedding = self.embed_description(&evidence.description).await;
        (evidence, embedding)
    }

    async fn embed_description(&self, description: &str) -> Option<Vec<f32>> {
        let embedder = self.providers.embedding.as_ref()?;
        if description.trim().is_empty() {
            return None;
        }

        match embedder.embed(description).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("Description embedding degraded: {}", e);
                metrics::counter!("provider_failures_total", "stage" => "embedding").increment(1);
                None
            }
        }
    }

    // ========================================================================
    // Stage 2: similarity
    // ========================================================================

    async fn similarity_stage(&self, embedding: Option<&[f32]>) -> SimilarityEvidence {
        let Some(vector) = embedding else {
            return SimilarityEvidence::empty();
        };

        match self
            .providers
            .index
            .query(vector, self.config.similarity_threshold, SIMILARITY_LIMIT)
            .await
        {
            Ok(matches) => SimilarityEvidence::from_matches(
                matches
                    .into_iter()
                    .map(|m| SimilarNft {
                        nft_id: m.nft_id,
                        similarity: m.similarity,
                        image_url: m.metadata.image_url,
                    })
                    .collect(),
            ),
            Err(e) => {
                warn!("Similarity stage degraded: {}", e);
                metrics::counter!("provider_failures_total", "stage" => "similarity").increment(1);
                SimilarityEvidence::neutral(e.to_string())
            }
        }
    }

    // ========================================================================
    // Stage 3: metadata
    // ========================================================================

    async fn metadata_stage(&self, input: &NftInput) -> MetadataEvidence {
        let Some(text) = &self.providers.text else {
            return MetadataEvidence::neutral("text provider not configured");
        };

        let response = match text.complete(&prompts::metadata_prompt(input)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Metadata stage degraded: {}", e);
                metrics::counter!("provider_failures_total", "stage" => "metadata").increment(1);
                return MetadataEvidence::neutral(e.to_string());
            }
        };

        match parsing::extract_json(&response) {
            Some(value) => parsing::metadata_from_value(&value),
            None => {
                warn!("Metadata response unparseable: {:.200}", response);
                MetadataEvidence::parse_failure()
            }
        }
    }

    // ========================================================================
    // Stage 4: decision
    // ========================================================================

    async fn decision_stage(
        &self,
        input: &NftInput,
        vision: &VisionEvidence,
        similarity: &SimilarityEvidence,
        metadata: &MetadataEvidence,
    ) -> LlmDecision {
        let Some(text) = &self.providers.text else {
            return self.fallback_decision(input, vision, similarity, metadata);
        };

        let prompt = prompts::decision_prompt(input, vision, similarity, metadata);
        let response = match text.complete(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Decision stage degraded: {}", e);
                metrics::counter!("provider_failures_total", "stage" => "decision").increment(1);
                return self.fallback_decision(input, vision, similarity, metadata);
            }
        };

        match parsing::extract_json(&response) {
            Some(value) => parsing::decision_from_value(&value),
            None => {
                warn!("Decision response unparseable: {:.200}", response);
                self.fallback_decision(input, vision, similarity, metadata)
            }
        }
    }

    /// Deterministic weighted decision used when the LLM cannot decide.
    ///
    /// Confidence is capped at 0.8: the fallback is never maximally
    /// confident. A rule-based keyword and price screen runs on top so that
    /// blatant listings are still flagged when every provider is down.
    fn fallback_decision(
        &self,
        input: &NftInput,
        vision: &VisionEvidence,
        similarity: &SimilarityEvidence,
        metadata: &MetadataEvidence,
    ) -> LlmDecision {
        let combined = 0.5 * vision.overall_fraud_score
            + 0.3 * similarity.max_similarity
            + 0.2 * metadata.metadata_risk;

        let mut is_fraud = combined > self.config.confidence_threshold;
        let mut confidence_score = combined.min(0.8);
        let mut flag_type = if combined > 0.8 {
            Some(FlagKind::Plagiarism)
        } else if combined > 0.6 {
            Some(FlagKind::SuspiciousActivity)
        } else {
            None
        };
        let mut recommendation = if combined > 0.5 {
            Recommendation::ManualReview
        } else {
            Recommendation::Allow
        };

        let mut reason = format!(
            "Fallback analysis (LLM unavailable) - Combined risk: {:.2}",
            combined
        );
        if similarity.is_duplicate {
            reason.push_str(" - Potential duplicate detected");
        }

        let mut primary_concerns = Vec::new();

        let haystack = format!("{} {}", input.title, input.description).to_lowercase();
        if let Some(keyword) = FRAUD_KEYWORDS.iter().find(|k| haystack.contains(*(*k))) {
            is_fraud = true;
            confidence_score = confidence_score.max(0.6);
            flag_type = flag_type.or(Some(FlagKind::Plagiarism));
            recommendation = Recommendation::ManualReview;
            reason.push_str(&format!(" - Suspicious keyword detected: '{}'", keyword));
            primary_concerns.push(format!("keyword '{}' in title or description", keyword));
        }

        if input.price < SUSPICIOUS_PRICE_FLOOR {
            confidence_score = confidence_score.max(0.4);
            reason.push_str(" - Suspiciously low price");
            primary_concerns.push("suspiciously low price".to_string());
        }

        LlmDecision {
            is_fraud,
            confidence_score,
            flag_type,
            reason,
            primary_concerns,
            recommendation: Some(recommendation),
            fallback_used: true,
            error: None,
        }
    }
}

/// Fuse per-stage evidence into the final verdict
fn fuse(
    vision: VisionEvidence,
    similarity: SimilarityEvidence,
    metadata: MetadataEvidence,
    decision: LlmDecision,
) -> Verdict {
    Verdict {
        is_fraud: decision.is_fraud,
        confidence_score: decision.confidence_score.clamp(0.0, 1.0),
        flag_type: decision.flag_type,
        reason: decision.reason.clone(),
        evidence_urls: similarity.evidence_urls.clone(),
        details: AnalysisDetails {
            image_analysis: vision,
            similarity_results: similarity,
            metadata_analysis: metadata,
            llm_decision: decision,
            analysis_timestamp: Utc::now(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::evidence::{FraudIndicator, IndicatorKind};
    use crate::config::{
        DEFAULT_EMBEDDING_DIMENSION, DEFAULT_FRAUD_CONFIDENCE_THRESHOLD,
        DEFAULT_SIMILARITY_THRESHOLD,
    };
    use crate::providers::{
        EmbeddingProvider, ProviderError, ProviderResult, TextProvider, VisionProvider,
    };
    use crate::similarity::{IndexMetadata, MemoryIndex, SimilarityIndex};
    use std::sync::Mutex;
    use uuid::Uuid;

    fn fraud_config() -> FraudConfig {
        FraudConfig {
            confidence_threshold: DEFAULT_FRAUD_CONFIDENCE_THRESHOLD,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            embedding_dimension: 4,
            max_concurrency: 8,
            queue_depth: 32,
        }
    }

    fn input(title: &str, description: &str, price: f64) -> NftInput {
        NftInput {
            title: title.to_string(),
            description: description.to_string(),
            category: "art".to_string(),
            price,
            image_url: "https://img/test.jpg".to_string(),
        }
    }

    struct StubVision {
        score: f32,
        description: String,
    }

    #[async_trait::async_trait]
    impl VisionProvider for StubVision {
        async fn analyze(&self, _input: &NftInput) -> ProviderResult<VisionEvidence> {
            let mut evidence = VisionEvidence::neutral("stub");
            evidence.error = None;
            evidence.description = self.description.clone();
            if self.score > 0.0 {
                evidence.fraud_indicators.insert(
                    IndicatorKind::StolenArtwork,
                    FraudIndicator {
                        detected: true,
                        confidence: self.score,
                        evidence: "stub".to_string(),
                    },
                );
            }
            evidence.recompute_overall_score();
            Ok(evidence)
        }
    }

    /// Pops scripted responses in call order (metadata stage first, then
    /// decision stage).
    struct ScriptedText {
        responses: Mutex<Vec<ProviderResult<String>>>,
    }

    impl ScriptedText {
        fn new(responses: Vec<ProviderResult<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait::async_trait]
    impl TextProvider for ScriptedText {
        async fn complete(&self, _prompt: &str) -> ProviderResult<String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Err(ProviderError::Unavailable("script exhausted".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    struct StubEmbedding {
        vector: Vec<f32>,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for StubEmbedding {
        async fn embed(&self, _text: &str) -> ProviderResult<Vec<f32>> {
            Ok(self.vector.clone())
        }
    }

    fn analyzer_with(
        vision: Option<Arc<dyn VisionProvider>>,
        text: Option<Arc<dyn TextProvider>>,
        embedding: Option<Arc<dyn EmbeddingProvider>>,
        index: Arc<dyn SimilarityIndex>,
    ) -> FraudAnalyzer {
        FraudAnalyzer::new(
            Arc::new(ProviderSet {
                vision,
                text,
                embedding,
                index,
            }),
            fraud_config(),
        )
    }

    fn offline_analyzer() -> FraudAnalyzer {
        analyzer_with(None, None, None, Arc::new(MemoryIndex::new(4)))
    }

    #[tokio::test]
    async fn test_all_providers_offline_yields_neutral_verdict() {
        let analyzer = offline_analyzer();
        let outcome = analyzer
            .analyze(&input("Sunset #1", "Original painting", 1.5))
            .await;

        let verdict = &outcome.verdict;
        assert!(!verdict.is_fraud);
        assert_eq!(verdict.confidence_score, 0.0);
        assert_eq!(verdict.flag_type, None);
        assert!(verdict.details.llm_decision.fallback_used);
        assert_eq!(
            verdict.details.llm_decision.recommendation,
            Some(Recommendation::Allow)
        );
        assert!(outcome.embedding.is_none());
        assert!(verdict.details.image_analysis.error.is_some());
    }

    #[tokio::test]
    async fn test_keyword_screen_flags_blatant_fraud_offline() {
        let analyzer = offline_analyzer();
        let outcome = analyzer
            .analyze(&input("COPY OF FAMOUS ART", "this is a copy", 0.001))
            .await;

        let verdict = &outcome.verdict;
        assert!(verdict.is_fraud);
        assert!(verdict.confidence_score >= 0.4 && verdict.confidence_score <= 0.8);
        assert_eq!(verdict.flag_type, Some(FlagKind::Plagiarism));
        assert_eq!(
            verdict.details.llm_decision.recommendation,
            Some(Recommendation::ManualReview)
        );
        assert!(verdict.reason.contains("copy"));
    }

    #[tokio::test]
    async fn test_fallback_formula_weights() {
        let analyzer = offline_analyzer();
        let mut vision = VisionEvidence::neutral("n/a");
        vision.overall_fraud_score = 0.9;
        let mut similarity = SimilarityEvidence::empty();
        similarity.max_similarity = 0.9;
        let mut metadata = MetadataEvidence::neutral("n/a");
        metadata.metadata_risk = 0.9;

        // combined = 0.5*0.9 + 0.3*0.9 + 0.2*0.9 = 0.9
        let decision = analyzer.fallback_decision(
            &input("Clean Title", "clean description", 1.0),
            &vision,
            &similarity,
            &metadata,
        );
        assert!(decision.is_fraud);
        assert_eq!(decision.confidence_score, 0.8); // capped
        assert_eq!(decision.flag_type, Some(FlagKind::Plagiarism));
        assert_eq!(decision.recommendation, Some(Recommendation::ManualReview));
        assert!(decision.fallback_used);
    }

    #[tokio::test]
    async fn test_fallback_mid_band_suspicious_flag() {
        let analyzer = offline_analyzer();
        let mut vision = VisionEvidence::neutral("n/a");
        vision.overall_fraud_score = 0.9;
        let mut metadata = MetadataEvidence::neutral("n/a");
        metadata.metadata_risk = 1.0;

        // combined = 0.45 + 0 + 0.2 = 0.65
        let decision = analyzer.fallback_decision(
            &input("Clean Title", "clean description", 1.0),
            &vision,
            &SimilarityEvidence::empty(),
            &metadata,
        );
        assert!(!decision.is_fraud); // 0.65 <= 0.7
        assert_eq!(decision.flag_type, Some(FlagKind::SuspiciousActivity));
        assert_eq!(decision.recommendation, Some(Recommendation::ManualReview));
    }

    #[tokio::test]
    async fn test_parse_failure_degradation() {
        // Text provider answers, but with a refusal: metadata stage records
        // the parse failure and the decision stage falls back to the formula.
        let text = ScriptedText::new(vec![
            Ok("sorry I cannot comply".to_string()),
            Ok("sorry I cannot comply".to_string()),
        ]);
        let analyzer = analyzer_with(
            None,
            Some(Arc::new(text)),
            None,
            Arc::new(MemoryIndex::new(4)),
        );

        let outcome = analyzer.analyze(&input("Sunset", "a painting", 1.0)).await;
        let details = &outcome.verdict.details;

        assert_eq!(details.metadata_analysis.quality_score, 0.5);
        assert_eq!(details.metadata_analysis.metadata_risk, 0.2);
        assert_eq!(
            details.metadata_analysis.suspicious_indicators,
            vec!["LLM response parsing failed".to_string()]
        );
        assert!(details.llm_decision.fallback_used);
    }

    #[tokio::test]
    async fn test_duplicate_detection_flow() {
        let index = Arc::new(MemoryIndex::new(4));
        let existing = Uuid::new_v4();
        index
            .upsert(
                existing,
                &[1.0, 0.0, 0.0, 0.0],
                IndexMetadata {
                    title: "Original".to_string(),
                    creator: "0xAAA".to_string(),
                    image_url: "https://img/original.jpg".to_string(),
                },
            )
            .await
            .unwrap();

        // cos([1, 0.25, 0, 0], [1, 0, 0, 0]) ~= 0.970
        let embedding = StubEmbedding {
            vector: vec![1.0, 0.25, 0.0, 0.0],
        };
        let vision = StubVision {
            score: 0.3,
            description: "A familiar-looking artwork".to_string(),
        };
        let decision_json = r#"{
            "is_fraud": true,
            "confidence_score": 0.92,
            "flag_type": 1,
            "reason": "Near-exact duplicate of an indexed NFT",
            "recommendation": "BLOCK"
        }"#;
        let text = ScriptedText::new(vec![
            Ok(r#"{"quality_score": 0.8, "metadata_risk": 0.1, "suspicious_indicators": [], "analysis": "fine"}"#.to_string()),
            Ok(decision_json.to_string()),
        ]);

        let analyzer = analyzer_with(
            Some(Arc::new(vision)),
            Some(Arc::new(text)),
            Some(Arc::new(embedding)),
            index,
        );

        let outcome = analyzer.analyze(&input("Copy Cat", "looks familiar", 2.0)).await;
        let verdict = &outcome.verdict;

        let similarity = &verdict.details.similarity_results;
        assert!(similarity.is_duplicate);
        assert!((similarity.max_similarity - 0.970).abs() < 0.005);
        assert_eq!(similarity.similar_nfts[0].nft_id, existing);
        assert_eq!(verdict.evidence_urls, vec!["https://img/original.jpg"]);
        assert!(verdict.is_fraud);
        assert_eq!(verdict.flag_type, Some(FlagKind::Plagiarism));
        assert!(outcome.embedding.is_some());
    }

    #[tokio::test]
    async fn test_analyzer_is_idempotent_modulo_timestamp() {
        let mk = || {
            ScriptedText::new(vec![
                Ok(r#"{"quality_score": 0.9, "metadata_risk": 0.05, "suspicious_indicators": [], "analysis": "clean"}"#.to_string()),
                Ok(r#"{"is_fraud": false, "confidence_score": 0.1, "flag_type": null, "reason": "legitimate", "recommendation": "ALLOW"}"#.to_string()),
            ])
        };
        let nft = input("Sunset #1", "Original digital painting, hand-drawn", 1.5);

        let run = |text: ScriptedText| {
            let analyzer = analyzer_with(
                Some(Arc::new(StubVision {
                    score: 0.0,
                    description: "A serene sunset".to_string(),
                })),
                Some(Arc::new(text)),
                None,
                Arc::new(MemoryIndex::new(4)),
            );
            let nft = nft.clone();
            async move { analyzer.analyze(&nft).await }
        };

        let first = run(mk()).await.verdict;
        let second = run(mk()).await.verdict;

        assert_eq!(first.is_fraud, second.is_fraud);
        assert_eq!(first.confidence_score, second.confidence_score);
        assert_eq!(first.flag_type, second.flag_type);
        assert_eq!(first.reason, second.reason);
        assert_eq!(first.evidence_urls, second.evidence_urls);
        assert!(!first.is_fraud);
        assert!(first.confidence_score <= 0.3);
    }

    #[tokio::test]
    async fn test_fallback_outcome_for_deadline_expiry() {
        let analyzer = offline_analyzer();
        let outcome = analyzer.fallback_outcome(&input("Sunset", "painting", 1.0));

        assert!(outcome.verdict.details.llm_decision.fallback_used);
        assert!(outcome.verdict.confidence_score <= 0.8);
        assert!(outcome.embedding.is_none());
        assert_eq!(
            outcome.verdict.details.image_analysis.error.as_deref(),
            Some("analysis deadline exceeded")
        );
    }
}
