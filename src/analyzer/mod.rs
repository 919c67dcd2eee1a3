//! Fraud Analysis Module
//!
//! Produces a structured fraud verdict for each newly created NFT.
//!
//! ## Architecture
//!
//! 1. **Evidence** - Typed per-stage records (vision, similarity, metadata, decision)
//! 2. **Parsing** - Tolerant JSON extraction and field coercion for LLM output
//! 3. **Prompts** - Schema-constrained prompt builders for the LLM-backed stages
//! 4. **Pipeline** - The four-stage orchestrator with per-stage degradation
//!
//! ## Pipeline Overview
//!
//! Stages execute in order, feeding outputs forward:
//! - Vision: multimodal image analysis producing fraud indicators and a description
//! - Similarity: cosine k-NN over previously indexed description embeddings
//! - Metadata: text-provider critique of title/description/category/price
//! - Decision: text-provider verdict, or the deterministic weighted fallback
//!   (0.5 image + 0.3 similarity + 0.2 metadata risk, confidence capped at 0.8)
//!
//! A provider failure never fails the pipeline: the affected stage degrades to
//! neutral evidence with an error note, and the verdict is still emitted.

pub mod evidence;
pub mod parsing;
pub mod prompts;
pub mod pipeline;

// Re-export the types that are actually used externally
pub use evidence::{AnalysisDetails, Verdict};
pub use pipeline::{AnalysisOutcome, FraudAnalyzer};
