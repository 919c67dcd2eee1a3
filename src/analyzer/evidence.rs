//! Typed evidence produced by each pipeline stage
//!
//! The persisted form of a verdict is a single JSONB document, but in memory
//! every stage output is a validated struct. Provider failures are recorded
//! in the `error` note of the affected stage rather than propagated.
//! Embedding vectors are deliberately kept out of these types: the pipeline
//! carries them separately so they can never leak into `analysis_details`.

use crate::models::FlagKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Vision stage
// ============================================================================

/// Risk classification reported by the vision stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
    Unknown,
}

/// The fraud indicators the vision prompt asks about
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    LowEffortGeneration,
    StolenArtwork,
    AiGenerated,
    TemplateUsage,
    MetadataMismatch,
    CopyrightViolation,
    InappropriateContent,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 7] = [
        IndicatorKind::LowEffortGeneration,
        IndicatorKind::StolenArtwork,
        IndicatorKind::AiGenerated,
        IndicatorKind::TemplateUsage,
        IndicatorKind::MetadataMismatch,
        IndicatorKind::CopyrightViolation,
        IndicatorKind::InappropriateContent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::LowEffortGeneration => "low_effort_generation",
            IndicatorKind::StolenArtwork => "stolen_artwork",
            IndicatorKind::AiGenerated => "ai_generated",
            IndicatorKind::TemplateUsage => "template_usage",
            IndicatorKind::MetadataMismatch => "metadata_mismatch",
            IndicatorKind::CopyrightViolation => "copyright_violation",
            IndicatorKind::InappropriateContent => "inappropriate_content",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == key)
    }
}

/// A single detected-or-not indicator with its supporting evidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudIndicator {
    pub detected: bool,
    pub confidence: f32,
    pub evidence: String,
}

/// Output of the vision stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionEvidence {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artistic_style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_assessment: Option<String>,
    pub fraud_indicators: BTreeMap<IndicatorKind, FraudIndicator>,
    /// max confidence over detected indicators, 0 when none detected
    pub overall_fraud_score: f32,
    pub risk_level: RiskLevel,
    pub uniqueness_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VisionEvidence {
    /// Neutral evidence used when the vision provider is unavailable or its
    /// output unusable. Scores are zero so the fallback formula stays inert.
    pub fn neutral(note: impl Into<String>) -> Self {
        Self {
            description: String::new(),
            artistic_style: None,
            quality_assessment: None,
            fraud_indicators: BTreeMap::new(),
            overall_fraud_score: 0.0,
            risk_level: RiskLevel::Unknown,
            uniqueness_score: 0.0,
            recommendation: None,
            error: Some(note.into()),
        }
    }

    /// Recompute the overall score from the indicator map
    pub fn recompute_overall_score(&mut self) {
        self.overall_fraud_score = self
            .fraud_indicators
            .values()
            .filter(|i| i.detected)
            .map(|i| i.confidence)
            .fold(0.0_f32, f32::max);
    }
}

// ============================================================================
// Similarity stage
// ============================================================================

/// A single close match from the similarity index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarNft {
    pub nft_id: Uuid,
    pub similarity: f32,
    pub image_url: String,
}

/// Threshold above which a match counts as an outright duplicate
pub const DUPLICATE_THRESHOLD: f32 = 0.95;

/// How many match image URLs are kept as evidence
pub const MAX_EVIDENCE_URLS: usize = 3;

/// Output of the similarity stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityEvidence {
    pub similar_nfts: Vec<SimilarNft>,
    pub max_similarity: f32,
    pub is_duplicate: bool,
    pub similarity_count: usize,
    pub evidence_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SimilarityEvidence {
    pub fn neutral(note: impl Into<String>) -> Self {
        Self {
            similar_nfts: Vec::new(),
            max_similarity: 0.0,
            is_duplicate: false,
            similarity_count: 0,
            evidence_urls: Vec::new(),
            error: Some(note.into()),
        }
    }

    /// Empty evidence for the no-embedding case; not an error
    pub fn empty() -> Self {
        Self {
            similar_nfts: Vec::new(),
            max_similarity: 0.0,
            is_duplicate: false,
            similarity_count: 0,
            evidence_urls: Vec::new(),
            error: None,
        }
    }

    /// Build evidence from index matches, already sorted by similarity desc
    pub fn from_matches(matches: Vec<SimilarNft>) -> Self {
        let max_similarity = matches
            .iter()
            .map(|m| m.similarity)
            .fold(0.0_f32, f32::max);
        let evidence_urls = matches
            .iter()
            .take(MAX_EVIDENCE_URLS)
            .map(|m| m.image_url.clone())
            .collect();

        Self {
            similarity_count: matches.len(),
            max_similarity,
            is_duplicate: max_similarity > DUPLICATE_THRESHOLD,
            evidence_urls,
            similar_nfts: matches,
            error: None,
        }
    }
}

// ============================================================================
// Metadata stage
// ============================================================================

/// Output of the metadata critique stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEvidence {
    pub quality_score: f32,
    pub metadata_risk: f32,
    pub suspicious_indicators: Vec<String>,
    pub analysis: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetadataEvidence {
    pub fn neutral(note: impl Into<String>) -> Self {
        Self {
            quality_score: 0.0,
            metadata_risk: 0.0,
            suspicious_indicators: Vec::new(),
            analysis: String::new(),
            error: Some(note.into()),
        }
    }

    /// Fallback evidence when the text provider answered but the answer
    /// could not be coerced into the schema.
    pub fn parse_failure() -> Self {
        Self {
            quality_score: 0.5,
            metadata_risk: 0.2,
            suspicious_indicators: vec!["LLM response parsing failed".to_string()],
            analysis: "Fallback analysis used due to parsing error".to_string(),
            error: None,
        }
    }
}

// ============================================================================
// Decision stage
// ============================================================================

/// Actionable recommendation from the decision stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Allow,
    Flag,
    Block,
    ManualReview,
}

/// Final decision, either LLM-produced or the deterministic fallback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmDecision {
    pub is_fraud: bool,
    pub confidence_score: f32,
    pub flag_type: Option<FlagKind>,
    pub reason: String,
    pub primary_concerns: Vec<String>,
    pub recommendation: Option<Recommendation>,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Fused verdict
// ============================================================================

/// The structured per-stage record persisted as `analysis_details`.
/// No embedding vectors appear anywhere in this document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDetails {
    pub image_analysis: VisionEvidence,
    pub similarity_results: SimilarityEvidence,
    pub metadata_analysis: MetadataEvidence,
    pub llm_decision: LlmDecision,
    pub analysis_timestamp: DateTime<Utc>,
}

/// The analyzer's decision record for one NFT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub is_fraud: bool,
    pub confidence_score: f32,
    pub flag_type: Option<FlagKind>,
    pub reason: String,
    pub evidence_urls: Vec<String>,
    pub details: AnalysisDetails,
}
