//! Similarity index over NFT description embeddings
//!
//! Maps NFT ids to D-dimensional vectors plus a small metadata blob and
//! answers cosine k-NN queries. Vectors persist in Postgres as a
//! length-prefixed binary blob (u32 LE component count, then f32 LE
//! components); candidates are scored in process. Results are consumed only
//! as evidence, never as ground truth.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

// ============================================================================
// Vector math and codec
// ============================================================================

/// Cosine similarity, clamped into [-1, 1]. Zero-norm inputs score 0.
pub fn cosine_similarity(u: &[f32], v: &[f32]) -> f32 {
    if u.len() != v.len() || u.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0_f64;
    let mut norm_u = 0.0_f64;
    let mut norm_v = 0.0_f64;
    for (a, b) in u.iter().zip(v.iter()) {
        dot += f64::from(*a) * f64::from(*b);
        norm_u += f64::from(*a) * f64::from(*a);
        norm_v += f64::from(*b) * f64::from(*b);
    }

    if norm_u == 0.0 || norm_v == 0.0 {
        return 0.0;
    }

    ((dot / (norm_u.sqrt() * norm_v.sqrt())) as f32).clamp(-1.0, 1.0)
}

/// Encode a vector as a length-prefixed little-endian blob
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + vector.len() * 4);
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for component in vector {
        bytes.extend_from_slice(&component.to_le_bytes());
    }
    bytes
}

/// Decode a length-prefixed vector blob
pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() < 4 {
        return Err(Error::InvalidFormat {
            message: "vector blob shorter than its length prefix".into(),
        });
    }

    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let body = &bytes[4..];
    if body.len() != len * 4 {
        return Err(Error::InvalidFormat {
            message: format!(
                "vector blob length mismatch: prefix says {} components, body has {} bytes",
                len,
                body.len()
            )
            .into(),
        });
    }

    let mut vector = Vec::with_capacity(len);
    for chunk in body.chunks_exact(4) {
        vector.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(vector)
}

// ============================================================================
// Index contract
// ============================================================================

/// Display metadata stored alongside each vector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub title: String,
    pub creator: String,
    pub image_url: String,
}

/// One k-NN result
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub nft_id: Uuid,
    pub similarity: f32,
    pub metadata: IndexMetadata,
}

/// The similarity index capability
#[async_trait::async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Idempotent write; overwrites any prior entry for the same NFT id.
    /// Empty, zero, and wrong-dimension vectors are rejected.
    async fn upsert(&self, nft_id: Uuid, vector: &[f32], meta: IndexMetadata) -> Result<()>;

    /// Up to `limit` entries with cosine similarity >= `threshold`, sorted by
    /// similarity descending, ties broken by newer entry first.
    async fn query(&self, vector: &[f32], threshold: f32, limit: usize)
        -> Result<Vec<IndexMatch>>;

    /// Debugging retrieval
    async fn get(&self, nft_id: Uuid) -> Result<Option<(Vec<f32>, IndexMetadata)>>;
}

fn validate_vector(vector: &[f32], dimension: usize) -> Result<()> {
    if vector.is_empty() {
        return Err(Error::input("embedding vector is empty"));
    }
    if vector.len() != dimension {
        return Err(Error::input(format!(
            "embedding vector has {} components, expected {}",
            vector.len(),
            dimension
        )));
    }
    if vector.iter().all(|c| *c == 0.0) {
        return Err(Error::input("embedding vector is all zeros"));
    }
    Ok(())
}

/// Sort scored candidates: similarity descending, newer entries first on ties
fn rank(mut scored: Vec<(IndexMatch, DateTime<Utc>)>, limit: usize) -> Vec<IndexMatch> {
    scored.sort_by(|(a, a_at), (b, b_at)| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b_at.cmp(a_at))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(m, _)| m).collect()
}

// ============================================================================
// Postgres-backed index
// ============================================================================

#[derive(sqlx::FromRow)]
struct IndexRow {
    nft_id: Uuid,
    embedding: Vec<u8>,
    metadata: sqlx::types::Json<IndexMetadata>,
    updated_at: DateTime<Utc>,
}

/// Production index over the `similarity_index` table
#[derive(Clone)]
pub struct PgSimilarityIndex {
    pool: PgPool,
    dimension: usize,
}

impl PgSimilarityIndex {
    pub fn new(pool: PgPool, dimension: usize) -> Self {
        Self { pool, dimension }
    }
}

#[async_trait::async_trait]
impl SimilarityIndex for PgSimilarityIndex {
    #[instrument(skip(self, vector, meta))]
    async fn upsert(&self, nft_id: Uuid, vector: &[f32], meta: IndexMetadata) -> Result<()> {
        validate_vector(vector, self.dimension)?;

        sqlx::query(
            r#"
            INSERT INTO similarity_index (nft_id, embedding, metadata, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (nft_id) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                metadata = EXCLUDED.metadata,
                updated_at = now()
            "#,
        )
        .bind(nft_id)
        .bind(encode_vector(vector))
        .bind(sqlx::types::Json(&meta))
        .execute(&self.pool)
        .await?;

        debug!("Upserted similarity index entry for NFT {}", nft_id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<IndexMatch>> {
        let rows: Vec<IndexRow> =
            sqlx::query_as("SELECT nft_id, embedding, metadata, updated_at FROM similarity_index")
                .fetch_all(&self.pool)
                .await?;

        let mut scored = Vec::new();
        for row in rows {
            // Undecodable blobs are skipped rather than failing the query
            let Ok(candidate) = decode_vector(&row.embedding) else {
                continue;
            };
            let similarity = cosine_similarity(vector, &candidate);
            if similarity >= threshold {
                scored.push((
                    IndexMatch {
                        nft_id: row.nft_id,
                        similarity,
                        metadata: row.metadata.0,
                    },
                    row.updated_at,
                ));
            }
        }

        Ok(rank(scored, limit))
    }

    async fn get(&self, nft_id: Uuid) -> Result<Option<(Vec<f32>, IndexMetadata)>> {
        let row: Option<IndexRow> = sqlx::query_as(
            "SELECT nft_id, embedding, metadata, updated_at FROM similarity_index WHERE nft_id = $1",
        )
        .bind(nft_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some((decode_vector(&row.embedding)?, row.metadata.0))),
            None => Ok(None),
        }
    }
}

// ============================================================================
// In-memory index
// ============================================================================

/// In-process index used by tests and local development
pub struct MemoryIndex {
    dimension: usize,
    entries: RwLock<HashMap<Uuid, (Vec<f32>, IndexMetadata, DateTime<Utc>)>>,
    clock: RwLock<i64>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(HashMap::new()),
            clock: RwLock::new(0),
        }
    }
}

#[async_trait::async_trait]
impl SimilarityIndex for MemoryIndex {
    async fn upsert(&self, nft_id: Uuid, vector: &[f32], meta: IndexMetadata) -> Result<()> {
        validate_vector(vector, self.dimension)?;
        // Logical clock keeps insertion order deterministic for tie-breaks
        let mut clock = self.clock.write().await;
        *clock += 1;
        let at = Utc::now() + chrono::Duration::milliseconds(*clock);
        self.entries
            .write()
            .await
            .insert(nft_id, (vector.to_vec(), meta, at));
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<IndexMatch>> {
        let entries = self.entries.read().await;
        let mut scored = Vec::new();
        for (nft_id, (candidate, meta, at)) in entries.iter() {
            let similarity = cosine_similarity(vector, candidate);
            if similarity >= threshold {
                scored.push((
                    IndexMatch {
                        nft_id: *nft_id,
                        similarity,
                        metadata: meta.clone(),
                    },
                    *at,
                ));
            }
        }
        Ok(rank(scored, limit))
    }

    async fn get(&self, nft_id: Uuid) -> Result<Option<(Vec<f32>, IndexMetadata)>> {
        Ok(self
            .entries
            .read()
            .await
            .get(&nft_id)
            .map(|(v, m, _)| (v.clone(), m.clone())))
    }
}
