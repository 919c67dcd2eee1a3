//! Canonical persisted entities for the FraudGuard marketplace
//!
//! One schema per entity: NFT, Listing, ListingHistory, User. Status fields
//! are typed enums stored as text; `flag_type` is stored as its integer wire
//! mapping (1-4). Embedding vectors live in a BYTEA column using the
//! length-prefixed codec from `similarity` and are never serialized into API
//! responses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

// ============================================================================
// Enumerations
// ============================================================================

/// NFT lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NftStatus {
    Pending,
    Minted,
    Deleted,
}

impl NftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NftStatus::Pending => "pending",
            NftStatus::Minted => "minted",
            NftStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for NftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Inactive,
    Sold,
    Deleted,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Inactive => "inactive",
            ListingStatus::Sold => "sold",
            ListingStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger action recorded for every listing state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Created,
    Updated,
    Deleted,
    Expired,
    Sold,
}

impl std::fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HistoryAction::Created => "created",
            HistoryAction::Updated => "updated",
            HistoryAction::Deleted => "deleted",
            HistoryAction::Expired => "expired",
            HistoryAction::Sold => "sold",
        };
        f.write_str(s)
    }
}

/// Fraud flag kind. Absent means not flagged.
///
/// Stored and serialized as the integer wire mapping for compatibility with
/// the on-chain fraud flag objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(into = "i32", try_from = "i32")]
pub enum FlagKind {
    Plagiarism = 1,
    SuspiciousActivity = 2,
    FakeMetadata = 3,
    AiGenerated = 4,
}

impl From<FlagKind> for i32 {
    fn from(kind: FlagKind) -> i32 {
        kind as i32
    }
}

impl TryFrom<i32> for FlagKind {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FlagKind::Plagiarism),
            2 => Ok(FlagKind::SuspiciousActivity),
            3 => Ok(FlagKind::FakeMetadata),
            4 => Ok(FlagKind::AiGenerated),
            other => Err(format!("unknown flag type: {}", other)),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A marketplace user, created on first reference by wallet address
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub wallet_address: String,
    pub username: String,
    pub email: Option<String>,
    pub reputation_score: Decimal,
    pub created_at: DateTime<Utc>,
}

/// The central marketplace entity
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Nft {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub wallet_address: String,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub price: Decimal,
    pub image_url: String,
    pub sui_object_id: Option<String>,
    pub status: NftStatus,

    // Verdict fields, written once at analysis completion
    pub is_fraud: bool,
    pub confidence_score: f64,
    pub flag_type: Option<FlagKind>,
    pub reason: Option<String>,
    pub evidence_urls: Json<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_details: Option<Json<serde_json::Value>>,

    // Raw vector blob; never exposed through the API
    #[serde(skip)]
    pub embedding_vector: Option<Vec<u8>>,

    // Listing projection
    pub is_listed: bool,
    pub listing_price: Option<Decimal>,
    pub listing_status: ListingStatus,
    pub last_listed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// A sale offer bound to a single NFT
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Listing {
    pub id: Uuid,
    pub nft_id: Uuid,
    pub seller_id: Uuid,
    pub price: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: ListingStatus,
    pub blockchain_tx_id: Option<String>,
    pub listing_metadata: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the append-only listing ledger
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ListingHistoryEntry {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub nft_id: Uuid,
    pub action: HistoryAction,
    pub old_price: Option<Decimal>,
    pub new_price: Option<Decimal>,
    pub seller_id: Uuid,
    pub blockchain_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Analyzer input
// ============================================================================

/// The slice of an NFT the fraud pipeline sees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftInput {
    pub title: String,
    pub description: String,
    pub category: String,
    pub price: f64,
    pub image_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_kind_wire_mapping() {
        assert_eq!(i32::from(FlagKind::Plagiarism), 1);
        assert_eq!(i32::from(FlagKind::SuspiciousActivity), 2);
        assert_eq!(i32::from(FlagKind::FakeMetadata), 3);
        assert_eq!(i32::from(FlagKind::AiGenerated), 4);
        assert_eq!(FlagKind::try_from(1).unwrap(), FlagKind::Plagiarism);
        assert!(FlagKind::try_from(5).is_err());
        assert!(FlagKind::try_from(0).is_err());
    }

    #[test]
    fn test_flag_kind_serializes_as_integer() {
        let json = serde_json::to_string(&FlagKind::Plagiarism).unwrap();
        assert_eq!(json, "1");
        let parsed: FlagKind = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, FlagKind::SuspiciousActivity);
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(NftStatus::Minted.as_str(), "minted");
        assert_eq!(ListingStatus::Active.to_string(), "active");
        assert_eq!(HistoryAction::Sold.to_string(), "sold");
    }
}
