//! Prompt builders for the three LLM-backed stages
//!
//! Each prompt pins the response to a JSON schema; the parser in
//! `analyzer::parsing` tolerates fenced blocks and surrounding prose anyway.

use crate::analyzer::evidence::{MetadataEvidence, SimilarityEvidence, VisionEvidence};
use crate::models::NftInput;

/// Multimodal prompt for the vision stage. The image is attached separately.
pub fn vision_prompt(input: &NftInput) -> String {
    format!(
        r#"You are an expert NFT fraud detection analyst with deep expertise in digital art, blockchain technology, and fraud detection. Analyze this NFT image for potential fraud indicators with extreme attention to detail.

NFT Metadata:
- Title: {title}
- Description: {description}
- Category: {category}

Respond with a JSON object in the following format:

{{
    "description": "Extremely detailed visual description of the image (minimum 100 words). Include all visual elements, colors, composition, style, and any text or symbols visible.",
    "artistic_style": "Art style classification (e.g., pixel art, 3D render, photography, digital art, oil painting)",
    "quality_assessment": "Image quality rating with technical analysis",
    "fraud_indicators": {{
        "low_effort_generation": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "analysis of effort level and originality"}},
        "stolen_artwork": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "watermarks, signatures, style inconsistencies, plagiarism signs"}},
        "ai_generated": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "AI generation artifacts and unnatural patterns"}},
        "template_usage": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "generic templates and mass-produced elements"}},
        "metadata_mismatch": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "whether the image matches the claimed title, description, and category"}},
        "copyright_violation": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "copyrighted characters, logos, brands"}},
        "inappropriate_content": {{"detected": true/false, "confidence": 0.0-1.0, "evidence": "NSFW content, violence, or other inappropriate material"}}
    }},
    "overall_fraud_score": 0.0-1.0,
    "risk_level": "low/medium/high/critical",
    "uniqueness_score": 0.0-1.0,
    "recommendation": "Clear, actionable recommendation"
}}

Be thorough and provide specific evidence for each fraud indicator."#,
        title = input.title,
        description = input.description,
        category = input.category,
    )
}

/// Schema-constrained prompt for the metadata critique stage
pub fn metadata_prompt(input: &NftInput) -> String {
    format!(
        r#"Analyze this NFT metadata for fraud indicators:

Name: {title}
Description: {description}
Category: {category}
Price: {price}

Look for:
1. Low-quality or generic descriptions
2. Suspicious keywords indicating fraud
3. Price anomalies
4. Inconsistencies in naming and description

Respond in JSON format:
{{
    "quality_score": 0.0-1.0,
    "suspicious_indicators": ["list of concerns"],
    "metadata_risk": 0.0-1.0,
    "analysis": "brief explanation"
}}"#,
        title = input.title,
        description = input.description,
        category = input.category,
        price = input.price,
    )
}

/// Schema-constrained prompt for the final decision stage
pub fn decision_prompt(
    input: &NftInput,
    vision: &VisionEvidence,
    similarity: &SimilarityEvidence,
    metadata: &MetadataEvidence,
) -> String {
    format!(
        r#"You are an expert NFT fraud detection AI. Based on comprehensive analysis, determine if this NFT is fraudulent.

NFT Information:
Name: {title}
Description: {description}
Category: {category}
Price: {price}

Analysis Results:

Image Analysis:
- Fraud Score: {image_score}
- Risk Level: {risk_level:?}
- Detected Indicators: {indicators:?}

Similarity Analysis:
- Max Similarity: {max_similarity}
- Similar NFTs Found: {similar_count}
- Is Duplicate: {is_duplicate}

Metadata Analysis:
- Quality Score: {quality_score}
- Suspicious Indicators: {suspicious:?}
- Metadata Risk: {metadata_risk}

Based on this comprehensive analysis, make a final fraud determination.

Respond in JSON format:
{{
    "is_fraud": true/false,
    "confidence_score": 0.0-1.0,
    "flag_type": 1-4 (1=plagiarism, 2=suspicious_activity, 3=fake_metadata, 4=ai_generated) or null,
    "reason": "clear explanation of decision",
    "primary_concerns": ["list of main issues"],
    "recommendation": "ALLOW/FLAG/BLOCK/MANUAL_REVIEW"
}}"#,
        title = input.title,
        description = input.description,
        category = input.category,
        price = input.price,
        image_score = vision.overall_fraud_score,
        risk_level = vision.risk_level,
        indicators = vision
            .fraud_indicators
            .iter()
            .filter(|(_, v)| v.detected)
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>(),
        max_similarity = similarity.max_similarity,
        similar_count = similarity.similarity_count,
        is_duplicate = similarity.is_duplicate,
        quality_score = metadata.quality_score,
        suspicious = metadata.suspicious_indicators,
        metadata_risk = metadata.metadata_risk,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> NftInput {
        NftInput {
            title: "Sunset #1".to_string(),
            description: "Original digital painting".to_string(),
            category: "art".to_string(),
            price: 1.5,
            image_url: "https://img/ok.jpg".to_string(),
        }
    }

    #[test]
    fn test_prompts_embed_metadata() {
        let input = sample_input();
        for prompt in [vision_prompt(&input), metadata_prompt(&input)] {
            assert!(prompt.contains("Sunset #1"));
            assert!(prompt.contains("art"));
        }
        assert!(metadata_prompt(&input).contains("1.5"));
    }

    #[test]
    fn test_decision_prompt_carries_evidence() {
        let input = sample_input();
        let vision = VisionEvidence::neutral("n/a");
        let mut similarity = SimilarityEvidence::empty();
        similarity.max_similarity = 0.97;
        similarity.is_duplicate = true;
        let metadata = MetadataEvidence::parse_failure();

        let prompt = decision_prompt(&input, &vision, &similarity, &metadata);
        assert!(prompt.contains("0.97"));
        assert!(prompt.contains("Is Duplicate: true"));
        assert!(prompt.contains("LLM response parsing failed"));
        assert!(prompt.contains("MANUAL_REVIEW"));
    }
}
