//! Per-NFT listing analytics
//!
//! Derived read-only statistics over all listings of one NFT. Soft-deleted
//! listings still count toward totals; the ledger keeps them visible.

use crate::error::{Error, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// Derived statistics for one NFT's listings
#[derive(Debug, Clone, Serialize)]
pub struct ListingAnalytics {
    pub nft_id: Uuid,
    pub total_listings: i64,
    pub active_listings: i64,
    pub sold_listings: i64,
    pub total_volume: Decimal,
    pub average_price: Option<Decimal>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    /// sold / total listings, 0 when the NFT was never listed
    pub success_rate: f64,
    /// mean hours a closed listing spent active
    pub average_active_hours: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct AnalyticsRow {
    total_listings: i64,
    active_listings: i64,
    sold_listings: i64,
    total_volume: Option<Decimal>,
    average_price: Option<Decimal>,
    min_price: Option<Decimal>,
    max_price: Option<Decimal>,
    average_active_hours: Option<f64>,
}

/// Compute listing analytics for one NFT. Fails with NotFound when the NFT
/// does not exist at all.
pub async fn listing_analytics(pool: &PgPool, nft_id: Uuid) -> Result<ListingAnalytics> {
    let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM nfts WHERE id = $1")
        .bind(nft_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Err(Error::not_found("nft", nft_id.to_string()));
    }

    let row: AnalyticsRow = sqlx::query_as(
        r#"
        SELECT
            COUNT(*)                                           AS total_listings,
            COUNT(*) FILTER (WHERE status = 'active')          AS active_listings,
            COUNT(*) FILTER (WHERE status = 'sold')            AS sold_listings,
            SUM(price) FILTER (WHERE status = 'sold')          AS total_volume,
            AVG(price)                                         AS average_price,
            MIN(price)                                         AS min_price,
            MAX(price)                                         AS max_price,
            CAST(AVG(EXTRACT(EPOCH FROM (updated_at - created_at)) / 3600.0)
                FILTER (WHERE status <> 'active') AS double precision)
                                                               AS average_active_hours
        FROM listings
        WHERE nft_id = $1
        "#,
    )
    .bind(nft_id)
    .fetch_one(pool)
    .await?;

    let success_rate = if row.total_listings > 0 {
        row.sold_listings as f64 / row.total_listings as f64
    } else {
        0.0
    };

    Ok(ListingAnalytics {
        nft_id,
        total_listings: row.total_listings,
        active_listings: row.active_listings,
        sold_listings: row.sold_listings,
        total_volume: row.total_volume.unwrap_or(Decimal::ZERO),
        average_price: row.average_price,
        min_price: row.min_price,
        max_price: row.max_price,
        success_rate,
        average_active_hours: row.average_active_hours,
    })
}
