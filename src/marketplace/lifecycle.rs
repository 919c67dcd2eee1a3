//! NFT lifecycle state machine
//!
//! Owns the NFT, Listing, and ListingHistory tables. Every state-changing
//! operation runs in one transaction, serializes on the NFT row with
//! `SELECT ... FOR UPDATE`, and appends exactly one ledger row, so observers
//! see the listing mutation and its history entry together or not at all.
//! Transient database failures (serialization, deadlock) are retried once.
//!
//! NFT states: pending --confirm_mint--> minted --(soft delete)--> deleted.
//! Listing states: active --update--> active, active --unlist/delete-->
//! inactive|deleted, active --purchase--> sold.

use crate::analyzer::Verdict;
use crate::database::with_transient_retry;
use crate::error::{Error, Result};
use crate::models::{
    HistoryAction, Listing, ListingHistoryEntry, ListingStatus, Nft, NftStatus, User,
};
use crate::similarity::encode_vector;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

/// Request to create and persist a new NFT
#[derive(Debug, Clone)]
pub struct CreateNft {
    pub wallet_address: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub price: Decimal,
    pub image_url: String,
}

/// Mutable listing fields for `update_listing`
#[derive(Debug, Clone, Default)]
pub struct ListingChanges {
    pub price: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// Outcome of a best-effort bulk listing
#[derive(Debug, Clone, serde::Serialize)]
pub struct BulkListOutcome {
    pub successful: Vec<Uuid>,
    pub failed: Vec<BulkListFailure>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BulkListFailure {
    pub nft_id: Uuid,
    pub reason: String,
}

/// The lifecycle manager over the marketplace tables
#[derive(Clone)]
pub struct LifecycleManager {
    pool: PgPool,
}

impl LifecycleManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Creation and minting
    // ========================================================================

    /// Insert a new NFT in `pending` state carrying the analyzer's verdict.
    /// The owning user is created on first reference.
    #[instrument(skip(self, request, verdict, embedding), fields(title = %request.title))]
    pub async fn create(
        &self,
        request: &CreateNft,
        verdict: &Verdict,
        embedding: Option<&[f32]>,
    ) -> Result<Nft> {
        if request.price < Decimal::ZERO {
            return Err(Error::input("price must be non-negative"));
        }
        if request.title.trim().is_empty() {
            return Err(Error::input("title must not be empty"));
        }
        if request.wallet_address.trim().is_empty() {
            return Err(Error::input("wallet address must not be empty"));
        }

        let details = serde_json::to_value(&verdict.details)?;
        let embedding_blob = embedding.map(encode_vector);

        let mut tx = self.pool.begin().await?;
        let user = get_or_create_user(&mut tx, &request.wallet_address).await?;

        let nft: Nft = sqlx::query_as(
            r#"
            INSERT INTO nfts
                (owner_id, wallet_address, title, description, category, price, image_url,
                 status, is_fraud, confidence_score, flag_type, reason, evidence_urls,
                 analysis_details, embedding_vector)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10, $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(user.id)
        .bind(&request.wallet_address)
        .bind(&request.title)
        .bind(&request.description)
        .bind(&request.category)
        .bind(request.price)
        .bind(&request.image_url)
        .bind(verdict.is_fraud)
        .bind(f64::from(verdict.confidence_score))
        .bind(verdict.flag_type)
        .bind(&verdict.reason)
        .bind(sqlx::types::Json(&verdict.evidence_urls))
        .bind(sqlx::types::Json(&details))
        .bind(embedding_blob)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        info!("NFT created: {} ({})", nft.id, nft.title);
        Ok(nft)
    }

    /// Transition pending -> minted once the on-chain mint is confirmed.
    /// Idempotent for the same object id; a different id is a conflict.
    /// Newly minted NFTs are always unlisted.
    pub async fn confirm_mint(&self, nft_id: Uuid, sui_object_id: &str) -> Result<Nft> {
        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let nft = lock_nft(&mut tx, nft_id).await?;

            let updated = match nft.status {
                NftStatus::Minted => {
                    if nft.sui_object_id.as_deref() == Some(sui_object_id) {
                        nft
                    } else {
                        return Err(Error::conflict(format!(
                            "NFT {} already minted with a different object id",
                            nft_id
                        )));
                    }
                }
                NftStatus::Deleted => {
                    return Err(Error::conflict(format!("NFT {} is deleted", nft_id)));
                }
                NftStatus::Pending => {
                    sqlx::query_as(
                        r#"
                        UPDATE nfts SET
                            sui_object_id = $2,
                            status = 'minted',
                            is_listed = FALSE,
                            listing_price = NULL,
                            listing_status = 'inactive',
                            last_listed_at = NULL
                        WHERE id = $1
                        RETURNING *
                        "#,
                    )
                    .bind(nft_id)
                    .bind(sui_object_id)
                    .fetch_one(&mut *tx)
                    .await?
                }
            };

            tx.commit().await?;
            Ok(updated)
        })
        .await
    }

    // ========================================================================
    // Listing operations
    // ========================================================================

    /// List a minted, unlisted NFT for sale
    pub async fn list(
        &self,
        nft_id: Uuid,
        price: Decimal,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Listing> {
        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let nft = lock_nft(&mut tx, nft_id).await?;
            let listing =
                insert_listing(&mut tx, &nft, price, expires_at, metadata.clone()).await?;
            tx.commit().await?;
            info!("NFT {} listed at {}", nft_id, price);
            Ok(listing)
        })
        .await
    }

    /// Remove the active listing without deleting its row
    pub async fn unlist(&self, nft_id: Uuid) -> Result<Nft> {
        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let nft = lock_nft(&mut tx, nft_id).await?;
            let listing = active_listing(&mut tx, nft_id)
                .await?
                .ok_or_else(|| Error::conflict(format!("NFT {} has no active listing", nft_id)))?;

            sqlx::query("UPDATE listings SET status = 'inactive', updated_at = now() WHERE id = $1")
                .bind(listing.id)
                .execute(&mut *tx)
                .await?;

            append_history(
                &mut tx,
                &listing,
                HistoryAction::Deleted,
                Some(listing.price),
                None,
            )
            .await?;

            let updated = clear_listing_projection(&mut tx, nft.id).await?;
            tx.commit().await?;
            info!("NFT {} unlisted", nft_id);
            Ok(updated)
        })
        .await
    }

    /// Mutate price/expiry/metadata of the active listing. An empty change
    /// set still appends a ledger row recording the (unchanged) price.
    pub async fn update_listing(&self, nft_id: Uuid, changes: &ListingChanges) -> Result<Listing> {
        if let Some(price) = changes.price {
            if price <= Decimal::ZERO {
                return Err(Error::input("listing price must be positive"));
            }
        }

        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let _nft = lock_nft(&mut tx, nft_id).await?;
            let listing = active_listing(&mut tx, nft_id)
                .await?
                .ok_or_else(|| Error::conflict(format!("NFT {} has no active listing", nft_id)))?;

            let old_price = listing.price;
            let new_price = changes.price.unwrap_or(old_price);
            let expires_at = changes.expires_at.or(listing.expires_at);
            let metadata = changes
                .metadata
                .clone()
                .or_else(|| listing.listing_metadata.as_ref().map(|m| m.0.clone()));

            let updated: Listing = sqlx::query_as(
                r#"
                UPDATE listings SET
                    price = $2,
                    expires_at = $3,
                    listing_metadata = $4,
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(listing.id)
            .bind(new_price)
            .bind(expires_at)
            .bind(metadata.map(sqlx::types::Json))
            .fetch_one(&mut *tx)
            .await?;

            append_history(
                &mut tx,
                &updated,
                HistoryAction::Updated,
                Some(old_price),
                Some(new_price),
            )
            .await?;

            sqlx::query("UPDATE nfts SET listing_price = $2 WHERE id = $1")
                .bind(nft_id)
                .bind(new_price)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(updated)
        })
        .await
    }

    /// Soft-delete a listing by its own id
    pub async fn delete_listing(&self, listing_id: Uuid) -> Result<Listing> {
        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;

            // Resolve the owning NFT first so locks are always taken in
            // nft-then-listing order.
            let preview: Option<Listing> =
                sqlx::query_as("SELECT * FROM listings WHERE id = $1")
                    .bind(listing_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let preview = preview
                .ok_or_else(|| Error::not_found("listing", listing_id.to_string()))?;

            let _nft = lock_nft(&mut tx, preview.nft_id).await?;

            let listing: Listing =
                sqlx::query_as("SELECT * FROM listings WHERE id = $1 FOR UPDATE")
                    .bind(listing_id)
                    .fetch_one(&mut *tx)
                    .await?;

            if listing.status == ListingStatus::Deleted {
                return Err(Error::conflict(format!(
                    "listing {} is already deleted",
                    listing_id
                )));
            }

            let was_active = listing.status == ListingStatus::Active;

            sqlx::query("UPDATE listings SET status = 'deleted', updated_at = now() WHERE id = $1")
                .bind(listing.id)
                .execute(&mut *tx)
                .await?;

            append_history(
                &mut tx,
                &listing,
                HistoryAction::Deleted,
                Some(listing.price),
                None,
            )
            .await?;

            if was_active {
                clear_listing_projection(&mut tx, listing.nft_id).await?;
            }

            tx.commit().await?;
            info!("Listing {} soft-deleted", listing_id);
            Ok(listing)
        })
        .await
    }

    /// Record a completed purchase: the active listing goes to its terminal
    /// `sold` state and ownership transfers to the buyer.
    pub async fn mark_sold(
        &self,
        nft_id: Uuid,
        buyer_wallet: &str,
        blockchain_tx_id: Option<&str>,
    ) -> Result<Listing> {
        if buyer_wallet.trim().is_empty() {
            return Err(Error::input("buyer wallet must not be empty"));
        }

        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let _nft = lock_nft(&mut tx, nft_id).await?;
            let listing = active_listing(&mut tx, nft_id)
                .await?
                .ok_or_else(|| Error::conflict(format!("NFT {} has no active listing", nft_id)))?;

            let buyer = get_or_create_user(&mut tx, buyer_wallet).await?;

            let sold: Listing = sqlx::query_as(
                r#"
                UPDATE listings SET
                    status = 'sold',
                    blockchain_tx_id = COALESCE($2, blockchain_tx_id),
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(listing.id)
            .bind(blockchain_tx_id)
            .fetch_one(&mut *tx)
            .await?;

            let mut entry = history_entry(&sold, HistoryAction::Sold, Some(listing.price), Some(listing.price));
            entry.blockchain_tx_id = sold.blockchain_tx_id.clone();
            insert_history(&mut tx, &entry).await?;

            sqlx::query(
                r#"
                UPDATE nfts SET
                    owner_id = $2,
                    wallet_address = $3,
                    is_listed = FALSE,
                    listing_price = NULL,
                    listing_status = 'inactive'
                WHERE id = $1
                "#,
            )
            .bind(nft_id)
            .bind(buyer.id)
            .bind(buyer_wallet)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            info!("NFT {} sold to {}", nft_id, buyer_wallet);
            Ok(sold)
        })
        .await
    }

    /// Best-effort bulk listing: successes persist even when siblings fail,
    /// and the caller receives the exact partition.
    pub async fn bulk_list(
        &self,
        nft_ids: &[Uuid],
        price: Decimal,
        expires_at: Option<DateTime<Utc>>,
    ) -> BulkListOutcome {
        let mut outcome = BulkListOutcome {
            successful: Vec::new(),
            failed: Vec::new(),
        };

        for nft_id in nft_ids {
            match self.list(*nft_id, price, expires_at, None).await {
                Ok(_) => outcome.successful.push(*nft_id),
                Err(e) => outcome.failed.push(BulkListFailure {
                    nft_id: *nft_id,
                    reason: e.to_string(),
                }),
            }
        }

        outcome
    }

    /// Relist an unlisted NFT; defaults to its base price
    pub async fn auto_relist(&self, nft_id: Uuid, price: Option<Decimal>) -> Result<Listing> {
        with_transient_retry(|| async {
            let mut tx = self.pool.begin().await?;
            let nft = lock_nft(&mut tx, nft_id).await?;

            if nft.is_listed {
                return Err(Error::conflict(format!("NFT {} is already listed", nft_id)));
            }

            let price = price.unwrap_or(nft.price);
            let listing = insert_listing(&mut tx, &nft, price, None, None).await?;
            tx.commit().await?;
            info!("NFT {} auto-relisted at {}", nft_id, price);
            Ok(listing)
        })
        .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn nft(&self, nft_id: Uuid) -> Result<Nft> {
        let nft: Option<Nft> = sqlx::query_as("SELECT * FROM nfts WHERE id = $1")
            .bind(nft_id)
            .fetch_optional(&self.pool)
            .await?;
        nft.ok_or_else(|| Error::not_found("nft", nft_id.to_string()))
    }

    pub async fn owner(&self, owner_id: Uuid) -> Result<Option<User>> {
        Ok(sqlx::query_as("SELECT * FROM users WHERE id = $1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn nfts_by_wallet(&self, wallet_address: &str) -> Result<Vec<Nft>> {
        Ok(sqlx::query_as(
            "SELECT * FROM nfts WHERE wallet_address = $1 ORDER BY created_at DESC",
        )
        .bind(wallet_address)
        .fetch_all(&self.pool)
        .await?)
    }

    /// The append-only ledger for one NFT, newest first
    pub async fn listing_history(&self, nft_id: Uuid) -> Result<Vec<ListingHistoryEntry>> {
        Ok(sqlx::query_as(
            "SELECT * FROM listing_history WHERE nft_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(nft_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Transaction helpers
// ============================================================================

/// Take the exclusive row lock that serializes lifecycle operations on one NFT
async fn lock_nft(tx: &mut Transaction<'_, Postgres>, nft_id: Uuid) -> Result<Nft> {
    let nft: Option<Nft> = sqlx::query_as("SELECT * FROM nfts WHERE id = $1 FOR UPDATE")
        .bind(nft_id)
        .fetch_optional(&mut **tx)
        .await?;
    nft.ok_or_else(|| Error::not_found("nft", nft_id.to_string()))
}

async fn active_listing(
    tx: &mut Transaction<'_, Postgres>,
    nft_id: Uuid,
) -> Result<Option<Listing>> {
    Ok(sqlx::query_as(
        "SELECT * FROM listings WHERE nft_id = $1 AND status = 'active' FOR UPDATE",
    )
    .bind(nft_id)
    .fetch_optional(&mut **tx)
    .await?)
}

async fn get_or_create_user(tx: &mut Transaction<'_, Postgres>, wallet: &str) -> Result<User> {
    let existing: Option<User> = sqlx::query_as("SELECT * FROM users WHERE wallet_address = $1")
        .bind(wallet)
        .fetch_optional(&mut **tx)
        .await?;
    if let Some(user) = existing {
        return Ok(user);
    }

    let short: String = wallet.chars().take(8).collect();
    let user: User = sqlx::query_as(
        r#"
        INSERT INTO users (wallet_address, username)
        VALUES ($1, $2)
        ON CONFLICT (wallet_address) DO UPDATE SET wallet_address = EXCLUDED.wallet_address
        RETURNING *
        "#,
    )
    .bind(wallet)
    .bind(format!("User{}", short))
    .fetch_one(&mut **tx)
    .await?;
    Ok(user)
}

/// Shared body of `list` and `auto_relist`: requires minted + no active
/// listing, inserts the listing and its ledger row, flips the projection.
async fn insert_listing(
    tx: &mut Transaction<'_, Postgres>,
    nft: &Nft,
    price: Decimal,
    expires_at: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
) -> Result<Listing> {
    if price <= Decimal::ZERO {
        return Err(Error::input("listing price must be positive"));
    }
    match nft.status {
        NftStatus::Minted => {}
        NftStatus::Pending => {
            return Err(Error::conflict(format!("NFT {} is not minted yet", nft.id)));
        }
        NftStatus::Deleted => {
            return Err(Error::conflict(format!("NFT {} is deleted", nft.id)));
        }
    }
    if active_listing(tx, nft.id).await?.is_some() {
        return Err(Error::conflict(format!(
            "NFT {} already has an active listing",
            nft.id
        )));
    }

    let listing: Listing = sqlx::query_as(
        r#"
        INSERT INTO listings (nft_id, seller_id, price, expires_at, status, listing_metadata)
        VALUES ($1, $2, $3, $4, 'active', $5)
        RETURNING *
        "#,
    )
    .bind(nft.id)
    .bind(nft.owner_id)
    .bind(price)
    .bind(expires_at)
    .bind(metadata.map(sqlx::types::Json))
    .fetch_one(&mut **tx)
    .await?;

    append_history(tx, &listing, HistoryAction::Created, None, Some(price)).await?;

    sqlx::query(
        r#"
        UPDATE nfts SET
            is_listed = TRUE,
            listing_price = $2,
            listing_status = 'active',
            last_listed_at = now()
        WHERE id = $1
        "#,
    )
    .bind(nft.id)
    .bind(price)
    .execute(&mut **tx)
    .await?;

    Ok(listing)
}

async fn clear_listing_projection(tx: &mut Transaction<'_, Postgres>, nft_id: Uuid) -> Result<Nft> {
    Ok(sqlx::query_as(
        r#"
        UPDATE nfts SET
            is_listed = FALSE,
            listing_price = NULL,
            listing_status = 'inactive'
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(nft_id)
    .fetch_one(&mut **tx)
    .await?)
}

fn history_entry(
    listing: &Listing,
    action: HistoryAction,
    old_price: Option<Decimal>,
    new_price: Option<Decimal>,
) -> ListingHistoryEntry {
    ListingHistoryEntry {
        id: Uuid::new_v4(),
        listing_id: listing.id,
        nft_id: listing.nft_id,
        action,
        old_price,
        new_price,
        seller_id: listing.seller_id,
        blockchain_tx_id: None,
        created_at: Utc::now(),
    }
}

async fn append_history(
    tx: &mut Transaction<'_, Postgres>,
    listing: &Listing,
    action: HistoryAction,
    old_price: Option<Decimal>,
    new_price: Option<Decimal>,
) -> Result<()> {
    let entry = history_entry(listing, action, old_price, new_price);
    insert_history(tx, &entry).await
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    entry: &ListingHistoryEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO listing_history
            (id, listing_id, nft_id, action, old_price, new_price, seller_id, blockchain_tx_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(entry.id)
    .bind(entry.listing_id)
    .bind(entry.nft_id)
    .bind(entry.action)
    .bind(entry.old_price)
    .bind(entry.new_price)
    .bind(entry.seller_id)
    .bind(&entry.blockchain_tx_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
