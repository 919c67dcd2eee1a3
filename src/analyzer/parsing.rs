//! LLM response parsing
//!
//! Model output is unstructured text that usually, but not always, contains a
//! JSON object. Extraction order: a ```json fenced block, then any fenced
//! block, then the outermost brace span. Field coercion never fails; every
//! expected field falls back to a safe default on type mismatch so a sloppy
//! response degrades instead of erroring.

use crate::analyzer::evidence::{
    FraudIndicator, IndicatorKind, LlmDecision, MetadataEvidence, Recommendation, RiskLevel,
    VisionEvidence,
};
use crate::models::FlagKind;
use serde_json::Value;
use std::collections::BTreeMap;

/// Extract the JSON payload from a raw LLM response.
///
/// Returns `None` when no candidate object can be located at all.
pub fn extract_json(raw: &str) -> Option<Value> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let candidate = if let Some(body) = fenced_block(text, "```json") {
        body
    } else if let Some(body) = fenced_block(text, "```") {
        body
    } else {
        brace_span(text)?
    };

    serde_json::from_str(candidate.trim()).ok().or_else(|| {
        // A fenced block can itself carry prose around the object
        brace_span(candidate).and_then(|span| serde_json::from_str(span).ok())
    })
}

/// Body of the first fenced code block opened by `fence`
fn fenced_block<'a>(text: &'a str, fence: &str) -> Option<&'a str> {
    let start = text.find(fence)? + fence.len();
    let end = text[start..].find("```")?;
    Some(&text[start..start + end])
}

/// The span from the first `{` to the last `}`
fn brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

// ============================================================================
// Field coercion helpers
// ============================================================================

pub fn as_f32_or(value: &Value, key: &str, default: f32) -> f32 {
    value
        .get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .unwrap_or(default)
}

/// Like `as_f32_or` but clamped into [0, 1]
pub fn as_unit_f32_or(value: &Value, key: &str, default: f32) -> f32 {
    as_f32_or(value, key, default).clamp(0.0, 1.0)
}

pub fn as_bool_or(value: &Value, key: &str, default: bool) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn as_string_or(value: &Value, key: &str, default: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

pub fn as_opt_string(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn as_string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Stage-specific parsers
// ============================================================================

/// Build vision evidence from an extracted response object
pub fn vision_from_value(value: &Value) -> VisionEvidence {
    let mut fraud_indicators = BTreeMap::new();
    if let Some(map) = value.get("fraud_indicators").and_then(Value::as_object) {
        for (key, details) in map {
            let Some(kind) = IndicatorKind::from_key(key) else {
                continue;
            };
            fraud_indicators.insert(
                kind,
                FraudIndicator {
                    detected: as_bool_or(details, "detected", false),
                    confidence: as_unit_f32_or(details, "confidence", 0.0),
                    evidence: as_string_or(details, "evidence", ""),
                },
            );
        }
    }

    let risk_level = match value.get("risk_level").and_then(Value::as_str) {
        Some("low") => RiskLevel::Low,
        Some("medium") => RiskLevel::Medium,
        Some("high") => RiskLevel::High,
        Some("critical") => RiskLevel::Critical,
        _ => RiskLevel::Unknown,
    };

    let mut evidence = VisionEvidence {
        description: as_string_or(value, "description", "Could not extract detailed description"),
        artistic_style: as_opt_string(value, "artistic_style"),
        quality_assessment: as_opt_string(value, "quality_assessment"),
        fraud_indicators,
        overall_fraud_score: 0.0,
        risk_level,
        uniqueness_score: as_unit_f32_or(value, "uniqueness_score", 0.0),
        recommendation: as_opt_string(value, "recommendation"),
        error: None,
    };

    // The model's own overall score is ignored; it is derived from the
    // indicator confidences so the two can never disagree.
    evidence.recompute_overall_score();
    evidence
}

/// Build metadata evidence from an extracted response object
pub fn metadata_from_value(value: &Value) -> MetadataEvidence {
    MetadataEvidence {
        quality_score: as_unit_f32_or(value, "quality_score", 0.5),
        metadata_risk: as_unit_f32_or(value, "metadata_risk", 0.1),
        suspicious_indicators: as_string_list(value, "suspicious_indicators"),
        analysis: as_string_or(value, "analysis", ""),
        error: None,
    }
}

/// Build the decision record from an extracted response object and apply the
/// consistency fix between confidence, recommendation, and the fraud bit.
pub fn decision_from_value(value: &Value) -> LlmDecision {
    let recommendation = match value
        .get("recommendation")
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("ALLOW") => Some(Recommendation::Allow),
        Some("FLAG") => Some(Recommendation::Flag),
        Some("BLOCK") => Some(Recommendation::Block),
        Some("MANUAL_REVIEW") => Some(Recommendation::ManualReview),
        _ => None,
    };

    let flag_type = value
        .get("flag_type")
        .and_then(Value::as_i64)
        .and_then(|raw| FlagKind::try_from(raw as i32).ok());

    let mut decision = LlmDecision {
        is_fraud: as_bool_or(value, "is_fraud", false),
        confidence_score: as_unit_f32_or(value, "confidence_score", 0.0),
        flag_type,
        reason: as_string_or(value, "reason", "Analysis completed"),
        primary_concerns: as_string_list(value, "primary_concerns"),
        recommendation,
        fallback_used: false,
        error: None,
    };

    apply_consistency_fix(&mut decision);
    decision
}

/// High confidence with a FLAG/BLOCK recommendation must mean fraud; low
/// confidence with ALLOW must not.
pub fn apply_consistency_fix(decision: &mut LlmDecision) {
    match decision.recommendation {
        Some(Recommendation::Flag) | Some(Recommendation::Block)
            if decision.confidence_score >= 0.7 =>
        {
            decision.is_fraud = true;
        }
        Some(Recommendation::Allow) if decision.confidence_score < 0.3 => {
            decision.is_fraud = false;
        }
        _ => {}
    }
}
