//! Marketplace browse queries
//!
//! Filtered, paginated reads over the NFT table. Fraud-flagged NFTs are
//! excluded unless the caller explicitly opts in; pending NFTs likewise.

use crate::error::{Error, Result};
use crate::models::Nft;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, QueryBuilder};

/// Query parameters for `GET /api/marketplace/nfts`
#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceFilters {
    /// Case-insensitive substring over title + description
    pub search: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub category: Option<String>,
    /// Include NFTs with `is_fraud = true` (default: excluded)
    #[serde(default)]
    pub include_flagged: bool,
    /// Include NFTs still in `pending` state (default: minted only)
    #[serde(default)]
    pub include_pending: bool,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    20
}

/// One page of marketplace results
#[derive(Debug, Serialize)]
pub struct MarketplacePage {
    pub nfts: Vec<Nft>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: i64,
}

impl MarketplaceFilters {
    pub fn validate(&self) -> Result<()> {
        if self.page < 1 {
            return Err(Error::input("page must be >= 1"));
        }
        if !(1..=100).contains(&self.limit) {
            return Err(Error::input("limit must be between 1 and 100"));
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(Error::input("min_price must not exceed max_price"));
            }
        }
        Ok(())
    }

    /// Append the shared WHERE clause to a count or page query
    fn push_conditions(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if self.include_pending {
            builder.push(" WHERE status IN ('minted', 'pending')");
        } else {
            builder.push(" WHERE status = 'minted'");
        }

        if !self.include_flagged {
            builder.push(" AND is_fraud = FALSE");
        }

        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let pattern = format!("%{}%", search.trim());
            builder.push(" AND (title ILIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR description ILIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }

        if let Some(category) = self.category.as_deref().filter(|c| !c.is_empty()) {
            builder.push(" AND category = ");
            builder.push_bind(category.to_string());
        }

        if let Some(min_price) = self.min_price {
            builder.push(" AND price >= ");
            builder.push_bind(min_price);
        }

        if let Some(max_price) = self.max_price {
            builder.push(" AND price <= ");
            builder.push_bind(max_price);
        }
    }
}

/// Run a filtered, paginated marketplace browse, newest first
pub async fn browse(pool: &PgPool, filters: &MarketplaceFilters) -> Result<MarketplacePage> {
    filters.validate()?;

    let mut count_query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM nfts");
    filters.push_conditions(&mut count_query);
    let total: i64 = count_query.build_query_scalar().fetch_one(pool).await?;

    let offset = i64::from(filters.page - 1) * i64::from(filters.limit);
    let mut page_query = QueryBuilder::<Postgres>::new("SELECT * FROM nfts");
    filters.push_conditions(&mut page_query);
    page_query.push(" ORDER BY created_at DESC LIMIT ");
    page_query.push_bind(i64::from(filters.limit));
    page_query.push(" OFFSET ");
    page_query.push_bind(offset);

    let nfts: Vec<Nft> = page_query.build_query_as().fetch_all(pool).await?;

    let total_pages = if total > 0 {
        (total + i64::from(filters.limit) - 1) / i64::from(filters.limit)
    } else {
        0
    };

    Ok(MarketplacePage {
        nfts,
        total,
        page: filters.page,
        limit: filters.limit,
        total_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_filters() -> MarketplaceFilters {
        MarketplaceFilters {
            search: None,
            min_price: None,
            max_price: None,
            category: None,
            include_flagged: false,
            include_pending: false,
            page: 1,
            limit: 20,
        }
    }

    #[test]
    fn test_filters_validate_bounds() {
        let mut filters = default_filters();
        assert!(filters.validate().is_ok());

        filters.page = 0;
        assert!(filters.validate().is_err());

        filters.page = 1;
        filters.limit = 101;
        assert!(filters.validate().is_err());

        filters.limit = 20;
        filters.min_price = Some(Decimal::new(10, 0));
        filters.max_price = Some(Decimal::new(5, 0));
        assert!(filters.validate().is_err());
    }

    #[test]
    fn test_filters_deserialize_defaults() {
        let filters: MarketplaceFilters = serde_json::from_str("{}").unwrap();
        assert_eq!(filters.page, 1);
        assert_eq!(filters.limit, 20);
        assert!(!filters.include_flagged);
        assert!(!filters.include_pending);
    }
}
