//! End-to-end fraud pipeline scenarios with substituted providers
//!
//! These exercise the analyzer exactly as the create path drives it, with
//! stub capabilities standing in for the Gemini providers and an in-memory
//! similarity index. No database or network required.

use std::sync::{Arc, Mutex};

use fraudguard::analyzer::evidence::{FraudIndicator, IndicatorKind, Recommendation, VisionEvidence};
use fraudguard::analyzer::FraudAnalyzer;
use fraudguard::config::FraudConfig;
use fraudguard::models::{FlagKind, NftInput};
use fraudguard::providers::{
    EmbeddingProvider, ProviderError, ProviderResult, ProviderSet, TextProvider, VisionProvider,
};
use fraudguard::similarity::{IndexMetadata, MemoryIndex, SimilarityIndex};
use uuid::Uuid;

const DIMENSION: usize = 8;

fn fraud_config() -> FraudConfig {
    FraudConfig {
        confidence_threshold: 0.7,
        similarity_threshold: 0.85,
        embedding_dimension: DIMENSION,
        max_concurrency: 8,
        queue_depth: 32,
    }
}

struct StubVision {
    description: String,
    detected: Vec<(IndicatorKind, f32)>,
}

#[async_trait::async_trait]
impl VisionProvider for StubVision {
    async fn analyze(&self, _input: &NftInput) -> ProviderResult<VisionEvidence> {
        let mut evidence = VisionEvidence::neutral("stub");
        evidence.error = None;
        evidence.description = self.description.clone();
        for (kind, confidence) in &self.detected {
            evidence.fraud_indicators.insert(
                *kind,
                FraudIndicator {
                    detected: true,
                    confidence: *confidence,
                    evidence: "stubbed indicator".to_string(),
                },
            );
        }
        evidence.recompute_overall_score();
        Ok(evidence)
    }
}

/// Returns scripted responses in call order: metadata stage, then decision
struct ScriptedText {
    responses: Mutex<Vec<String>>,
}

impl ScriptedText {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
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
            Ok(responses.remove(0))
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

fn analyzer(
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

/// Scenario: clean mint. All providers healthy, no similar vectors in the
/// index. The verdict clears the NFT with low confidence.
#[tokio::test]
async fn clean_mint_analysis() {
    let vision = StubVision {
        description: "A hand-painted sunset over calm water with visible brush texture".to_string(),
        detected: Vec::new(),
    };
    let text = ScriptedText::new(&[
        r#"{"quality_score": 0.9, "metadata_risk": 0.05, "suspicious_indicators": [], "analysis": "coherent, original metadata"}"#,
        r#"{"is_fraud": false, "confidence_score": 0.1, "flag_type": null, "reason": "No fraud indicators across image, similarity, or metadata analysis", "primary_concerns": [], "recommendation": "ALLOW"}"#,
    ]);
    let embedding = StubEmbedding {
        vector: vec![0.5; DIMENSION],
    };

    let analyzer = analyzer(
        Some(Arc::new(vision)),
        Some(Arc::new(text)),
        Some(Arc::new(embedding)),
        Arc::new(MemoryIndex::new(DIMENSION)),
    );

    let input = NftInput {
        title: "Sunset #1".to_string(),
        description: "Original digital painting, hand-drawn".to_string(),
        category: "art".to_string(),
        price: 1.5,
        image_url: "https://img/ok.jpg".to_string(),
    };

    let outcome = analyzer.analyze(&input).await;
    let verdict = &outcome.verdict;

    assert!(!verdict.is_fraud);
    assert!(verdict.confidence_score <= 0.3);
    assert_eq!(verdict.flag_type, None);
    assert!(verdict.evidence_urls.is_empty());
    assert!(!verdict.details.llm_decision.fallback_used);
    assert_eq!(
        verdict.details.llm_decision.recommendation,
        Some(Recommendation::Allow)
    );
    // The embedding is produced for background persistence but never enters
    // the analysis document.
    assert!(outcome.embedding.is_some());
    let details = serde_json::to_string(&verdict.details).unwrap();
    assert!(!details.contains("\"embedding\""));
}

/// Scenario: keyword-obvious fraud with the text provider offline. The
/// deterministic fallback flags it for manual review.
#[tokio::test]
async fn keyword_fraud_with_text_provider_offline() {
    let analyzer = analyzer(None, None, None, Arc::new(MemoryIndex::new(DIMENSION)));

    let input = NftInput {
        title: "COPY OF FAMOUS ART".to_string(),
        description: "this is a copy".to_string(),
        category: "art".to_string(),
        price: 0.001,
        image_url: String::new(),
    };

    let outcome = analyzer.analyze(&input).await;
    let verdict = &outcome.verdict;

    assert!(verdict.is_fraud);
    assert!(verdict.confidence_score >= 0.4 && verdict.confidence_score <= 0.8);
    assert!(matches!(
        verdict.flag_type,
        Some(FlagKind::Plagiarism) | Some(FlagKind::SuspiciousActivity)
    ));
    assert_eq!(
        verdict.details.llm_decision.recommendation,
        Some(Recommendation::ManualReview)
    );
    assert!(verdict.details.llm_decision.fallback_used);
}

/// Scenario: duplicate detection. The index already holds a near-identical
/// vector; the decision stage sees the duplicate and flags plagiarism.
#[tokio::test]
async fn duplicate_detection() {
    let index = Arc::new(MemoryIndex::new(DIMENSION));
    let original = Uuid::new_v4();
    let mut stored = vec![0.0; DIMENSION];
    stored[0] = 1.0;
    index
        .upsert(
            original,
            &stored,
            IndexMetadata {
                title: "The Original".to_string(),
                creator: "0xAAA".to_string(),
                image_url: "https://img/original.jpg".to_string(),
            },
        )
        .await
        .unwrap();

    // cos(query, stored) ~= 0.970
    let mut query = vec![0.0; DIMENSION];
    query[0] = 1.0;
    query[1] = 0.25;

    let vision = StubVision {
        description: "An artwork that closely resembles a known piece".to_string(),
        detected: vec![(IndicatorKind::StolenArtwork, 0.7)],
    };
    let text = ScriptedText::new(&[
        r#"{"quality_score": 0.6, "metadata_risk": 0.2, "suspicious_indicators": [], "analysis": "plausible"}"#,
        r#"{"is_fraud": true, "confidence_score": 0.93, "flag_type": 1, "reason": "Near-duplicate of an existing NFT", "primary_concerns": ["duplicate"], "recommendation": "BLOCK"}"#,
    ]);

    let analyzer = analyzer(
        Some(Arc::new(vision)),
        Some(Arc::new(text)),
        Some(Arc::new(StubEmbedding { vector: query })),
        index,
    );

    let input = NftInput {
        title: "Totally New Art".to_string(),
        description: "never seen before".to_string(),
        category: "art".to_string(),
        price: 3.0,
        image_url: "https://img/suspect.jpg".to_string(),
    };

    let outcome = analyzer.analyze(&input).await;
    let verdict = &outcome.verdict;
    let similarity = &verdict.details.similarity_results;

    assert!(similarity.is_duplicate);
    assert!((similarity.max_similarity - 0.970).abs() < 0.005);
    assert_eq!(similarity.similar_nfts[0].nft_id, original);
    assert_eq!(verdict.flag_type, Some(FlagKind::Plagiarism));
    assert!(verdict.is_fraud);
    assert_eq!(verdict.evidence_urls, vec!["https://img/original.jpg"]);
}

/// Scenario: the text provider answers with a refusal. The metadata stage
/// records the parse failure, the decision stage falls back to the weighted
/// formula, and a verdict is still emitted.
#[tokio::test]
async fn provider_parse_failure_degradation() {
    let vision = StubVision {
        description: "A generic render".to_string(),
        detected: Vec::new(),
    };
    let text = ScriptedText::new(&["sorry I cannot comply", "sorry I cannot comply"]);

    let analyzer = analyzer(
        Some(Arc::new(vision)),
        Some(Arc::new(text)),
        None,
        Arc::new(MemoryIndex::new(DIMENSION)),
    );

    let input = NftInput {
        title: "Render".to_string(),
        description: "a render".to_string(),
        category: "art".to_string(),
        price: 1.0,
        image_url: "https://img/render.jpg".to_string(),
    };

    let outcome = analyzer.analyze(&input).await;
    let details = &outcome.verdict.details;

    assert_eq!(details.metadata_analysis.quality_score, 0.5);
    assert_eq!(details.metadata_analysis.metadata_risk, 0.2);
    assert_eq!(
        details.metadata_analysis.suspicious_indicators,
        vec!["LLM response parsing failed".to_string()]
    );
    assert!(details.llm_decision.fallback_used);
    assert!(outcome.verdict.confidence_score <= 0.8);
}

/// Fallback verdicts are never maximally confident, even under extreme
/// evidence.
#[tokio::test]
async fn fallback_confidence_is_capped() {
    let vision = StubVision {
        description: "blatant".to_string(),
        detected: vec![
            (IndicatorKind::StolenArtwork, 1.0),
            (IndicatorKind::CopyrightViolation, 1.0),
        ],
    };
    // Metadata parses, decision does not: forces the fallback with maximal
    // vision, similarity, and metadata risk in play.
    let text = ScriptedText::new(&[
        r#"{"quality_score": 0.1, "metadata_risk": 1.0, "suspicious_indicators": ["stolen"], "analysis": "bad"}"#,
        "no json here",
    ]);

    let index = Arc::new(MemoryIndex::new(DIMENSION));
    let duplicate_of = Uuid::new_v4();
    index
        .upsert(
            duplicate_of,
            &vec![0.7; DIMENSION],
            IndexMetadata {
                title: "Identical".to_string(),
                creator: "0xAAA".to_string(),
                image_url: "https://img/identical.jpg".to_string(),
            },
        )
        .await
        .unwrap();

    let analyzer = analyzer(
        Some(Arc::new(vision)),
        Some(Arc::new(text)),
        Some(Arc::new(StubEmbedding {
            vector: vec![0.7; DIMENSION],
        })),
        index,
    );

    let input = NftInput {
        title: "Art".to_string(),
        description: "art".to_string(),
        category: "art".to_string(),
        price: 1.0,
        image_url: "https://img/a.jpg".to_string(),
    };

    let outcome = analyzer.analyze(&input).await;
    let verdict = &outcome.verdict;

    // combined = 0.5*1.0 + 0.3*1.0 + 0.2*1.0 = 1.0, capped to 0.8
    assert!(verdict.details.llm_decision.fallback_used);
    assert!(verdict.is_fraud);
    assert!((verdict.confidence_score - 0.8).abs() < 1e-6);
    assert_eq!(verdict.flag_type, Some(FlagKind::Plagiarism));
    assert!(verdict.reason.contains("duplicate"));
}
