//! HTTP API Server for the FraudGuard marketplace
//!
//! REST endpoints for NFT creation (with synchronous fraud analysis),
//! lifecycle transitions, marketplace browsing, and verdict retrieval.
//! Failures map to structured JSON error bodies via `error::Error`.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{delete, get, post, put};
use axum::Router;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::marketplace::analytics::{self, ListingAnalytics};
use crate::marketplace::browse::{self, MarketplaceFilters, MarketplacePage};
use crate::marketplace::{BulkListOutcome, CreateNft, LifecycleManager, ListingChanges};
use crate::models::{FlagKind, Listing, ListingHistoryEntry, Nft, NftInput, NftStatus};
use crate::providers::ProviderSet;
use crate::scheduler::Scheduler;
use crate::similarity::IndexMetadata;

/// Cosine threshold for the interactive similar-NFT browse; looser than the
/// pipeline's duplicate screen.
const SIMILAR_BROWSE_THRESHOLD: f32 = 0.7;

/// Shared application state
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub lifecycle: LifecycleManager,
    pub scheduler: Arc<Scheduler>,
    pub providers: Arc<ProviderSet>,
}

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct NftCreationRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub price: f64,
    pub image_url: String,
    pub wallet_address: String,
}

#[derive(Debug, Serialize)]
pub struct FraudAnalysisSummary {
    pub is_fraud: bool,
    pub confidence_score: f64,
    pub flag_type: Option<FlagKind>,
    pub reason: Option<String>,
}

impl FraudAnalysisSummary {
    fn from_nft(nft: &Nft) -> Self {
        Self {
            is_fraud: nft.is_fraud,
            confidence_score: nft.confidence_score,
            flag_type: nft.flag_type,
            reason: nft.reason.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NftCreationResponse {
    pub success: bool,
    pub message: String,
    pub nft_id: Uuid,
    pub fraud_analysis: FraudAnalysisSummary,
    pub status: NftStatus,
    pub next_step: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmMintQuery {
    pub sui_object_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmMintResponse {
    pub success: bool,
    pub message: String,
    pub nft_id: Uuid,
    pub sui_object_id: Option<String>,
    pub status: NftStatus,
    pub is_listed: bool,
    pub fraud_analysis: FraudAnalysisSummary,
}

#[derive(Debug, Deserialize)]
pub struct ListRequest {
    pub price: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateListingRequest {
    pub price: Option<Decimal>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct BulkListRequest {
    pub nft_ids: Vec<Uuid>,
    pub price: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AutoRelistRequest {
    pub price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub buyer_wallet: String,
    pub tx_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListingResponse {
    pub success: bool,
    pub listing: Listing,
}

#[derive(Debug, Serialize)]
pub struct OwnerSummary {
    pub wallet_address: String,
    pub username: String,
    pub reputation_score: f64,
}

#[derive(Debug, Serialize)]
pub struct NftDetailResponse {
    pub nft: Nft,
    pub owner: OwnerSummary,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub nft_id: Uuid,
    pub analysis_details: serde_json::Value,
    pub is_fraud: bool,
    pub confidence_score: f64,
    pub flag_type: Option<FlagKind>,
    pub reason: Option<String>,
    pub status: NftStatus,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    #[serde(default = "default_similar_limit")]
    pub limit: usize,
}

fn default_similar_limit() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct SimilarNftEntry {
    pub nft_id: Uuid,
    pub title: String,
    pub image_url: String,
    pub similarity: f32,
}

#[derive(Debug, Serialize)]
pub struct SimilarResponse {
    pub target_nft_id: Uuid,
    pub similar_nfts: Vec<SimilarNftEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub nft_id: Uuid,
    pub history: Vec<ListingHistoryEntry>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct UserNftsResponse {
    pub wallet_address: String,
    pub nfts: Vec<Nft>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct SimpleResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
    pub db_pool_size: u32,
    pub db_pool_idle: usize,
    pub vision_provider: bool,
    pub text_provider: bool,
    pub embedding_provider: bool,
}

// ============================================================================
// Server
// ============================================================================

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        // Creation and minting
        .route("/api/nft/create", post(create_nft))
        .route("/api/nft/:id/confirm-mint", put(confirm_mint))
        // Listing lifecycle
        .route("/api/nft/:id/list", put(list_nft))
        .route("/api/nft/:id/unlist", put(unlist_nft))
        .route("/api/nft/:id/update-listing", put(update_listing))
        .route("/api/nft/bulk-list", post(bulk_list))
        .route("/api/nft/:id/auto-relist", post(auto_relist))
        .route("/api/nft/:id/purchase", post(purchase))
        .route("/api/listings/:listing_id", delete(delete_listing))
        // Analysis
        .route("/api/nft/:id/reanalyze", post(reanalyze))
        .route("/api/nft/:id/analysis", get(nft_analysis))
        .route("/api/nft/:id/similar", get(similar_nfts))
        // Reads
        .route("/api/nft/user/:wallet", get(user_nfts))
        .route("/api/nft/:id", get(nft_detail))
        .route("/api/nft/:id/listing-analytics", get(nft_listing_analytics))
        .route("/api/nft/:id/listing-history", get(nft_listing_history))
        .route("/api/marketplace/nfts", get(marketplace_nfts))
        .layer(TraceLayer::new_for_http())
        // Slightly behind the analysis deadline so a fallback verdict can
        // still be persisted and returned before the connection is cut
        .layer(TimeoutLayer::new(
            state.config.api.request_deadline + std::time::Duration::from_secs(5),
        ));

    if state.config.api.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app.with_state(state)
}

/// Start the API server
pub async fn start_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
    let app = router(state);

    info!("🚀 Starting FraudGuard API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let pool = state.db.stats();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        database: state.db.health_check().await.is_ok(),
        db_pool_size: pool.size,
        db_pool_idle: pool.idle,
        vision_provider: state.providers.vision.is_some(),
        text_provider: state.providers.text.is_some(),
        embedding_provider: state.providers.embedding.is_some(),
    })
}

/// Create a new NFT: run the fraud pipeline synchronously, persist the
/// verdict with the pending NFT, then hand the embedding to a background
/// task for similarity-index persistence.
async fn create_nft(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NftCreationRequest>,
) -> Result<Json<NftCreationResponse>> {
    if request.title.trim().is_empty() {
        return Err(Error::input("title must not be empty"));
    }
    if request.wallet_address.trim().is_empty() {
        return Err(Error::input("wallet_address must not be empty"));
    }
    if !request.price.is_finite() || request.price < 0.0 {
        return Err(Error::input("price must be a non-negative number"));
    }
    let price = Decimal::try_from(request.price)
        .map_err(|_| Error::input("price is not representable as a decimal"))?;

    let input = NftInput {
        title: request.title.clone(),
        description: request.description.clone(),
        category: request.category.clone(),
        price: request.price,
        image_url: request.image_url.clone(),
    };

    let outcome = state.scheduler.analyze(&input).await?;

    let create = CreateNft {
        wallet_address: request.wallet_address.clone(),
        title: request.title,
        description: request.description,
        category: request.category,
        price,
        image_url: request.image_url,
    };
    let nft = state
        .lifecycle
        .create(&create, &outcome.verdict, outcome.embedding.as_deref())
        .await?;

    if let Some(embedding) = outcome.embedding {
        state.scheduler.spawn_embedding_upsert(
            nft.id,
            embedding,
            IndexMetadata {
                title: nft.title.clone(),
                creator: nft.wallet_address.clone(),
                image_url: nft.image_url.clone(),
            },
        );
    }

    Ok(Json(NftCreationResponse {
        success: true,
        message: "NFT created and analyzed successfully".to_string(),
        nft_id: nft.id,
        fraud_analysis: FraudAnalysisSummary::from_nft(&nft),
        status: nft.status,
        next_step: "mint_on_blockchain",
    }))
}

/// Confirm the on-chain mint; the NFT comes out minted and unlisted
async fn confirm_mint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ConfirmMintQuery>,
) -> Result<Json<ConfirmMintResponse>> {
    if query.sui_object_id.trim().is_empty() {
        return Err(Error::input("sui_object_id must not be empty"));
    }

    let nft = state.lifecycle.confirm_mint(id, &query.sui_object_id).await?;

    Ok(Json(ConfirmMintResponse {
        success: true,
        message: "NFT mint confirmed and set as unlisted by default".to_string(),
        nft_id: nft.id,
        sui_object_id: nft.sui_object_id.clone(),
        status: nft.status,
        is_listed: nft.is_listed,
        fraud_analysis: FraudAnalysisSummary::from_nft(&nft),
    }))
}

async fn list_nft(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ListRequest>,
) -> Result<Json<ListingResponse>> {
    let listing = state
        .lifecycle
        .list(id, request.price, request.expires_at, request.metadata)
        .await?;
    Ok(Json(ListingResponse {
        success: true,
        listing,
    }))
}

async fn unlist_nft(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SimpleResponse>> {
    state.lifecycle.unlist(id).await?;
    Ok(Json(SimpleResponse {
        success: true,
        message: format!("NFT {} unlisted", id),
    }))
}

async fn update_listing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateListingRequest>,
) -> Result<Json<ListingResponse>> {
    let changes = ListingChanges {
        price: request.price,
        expires_at: request.expires_at,
        metadata: request.metadata,
    };
    let listing = state.lifecycle.update_listing(id, &changes).await?;
    Ok(Json(ListingResponse {
        success: true,
        listing,
    }))
}

/// Best-effort bulk listing; partial failures do not roll back successes
async fn bulk_list(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkListRequest>,
) -> Result<Json<BulkListOutcome>> {
    if request.nft_ids.is_empty() {
        return Err(Error::input("nft_ids must not be empty"));
    }
    let outcome = state
        .lifecycle
        .bulk_list(&request.nft_ids, request.price, request.expires_at)
        .await;
    Ok(Json(outcome))
}

async fn auto_relist(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    request: Option<Json<AutoRelistRequest>>,
) -> Result<Json<ListingResponse>> {
    let price = request.and_then(|Json(r)| r.price);
    let listing = state.lifecycle.auto_relist(id, price).await?;
    Ok(Json(ListingResponse {
        success: true,
        listing,
    }))
}

async fn purchase(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<ListingResponse>> {
    let listing = state
        .lifecycle
        .mark_sold(id, &request.buyer_wallet, request.tx_id.as_deref())
        .await?;
    Ok(Json(ListingResponse {
        success: true,
        listing,
    }))
}

async fn delete_listing(
    State(state): State<Arc<AppState>>,
    Path(listing_id): Path<Uuid>,
) -> Result<Json<SimpleResponse>> {
    state.lifecycle.delete_listing(listing_id).await?;
    Ok(Json(SimpleResponse {
        success: true,
        message: format!("Listing {} deleted", listing_id),
    }))
}

/// Schedule a background re-analysis of an existing NFT
async fn reanalyze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SimpleResponse>> {
    // Verify existence before scheduling so the caller gets a 404 now
    state.lifecycle.nft(id).await?;
    state.scheduler.spawn_reanalysis(id);
    Ok(Json(SimpleResponse {
        success: true,
        message: format!("Fraud re-analysis started for NFT {}", id),
    }))
}

async fn nft_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<NftDetailResponse>> {
    let nft = state.lifecycle.nft(id).await?;
    let owner = state.lifecycle.owner(nft.owner_id).await?;

    let owner = match owner {
        Some(user) => OwnerSummary {
            wallet_address: user.wallet_address,
            username: user.username,
            reputation_score: decimal_to_f64(user.reputation_score),
        },
        None => OwnerSummary {
            wallet_address: nft.wallet_address.clone(),
            username: format!(
                "User{}",
                nft.wallet_address.chars().take(8).collect::<String>()
            ),
            reputation_score: 50.0,
        },
    };

    Ok(Json(NftDetailResponse { nft, owner }))
}

/// The verdict document, without embedding vectors
async fn nft_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AnalysisResponse>> {
    let nft = state.lifecycle.nft(id).await?;

    let mut details = nft
        .analysis_details
        .as_ref()
        .map(|json| json.0.clone())
        .unwrap_or_else(|| serde_json::json!({}));

    // The pipeline never writes vectors into the document; scrub anyway in
    // case older rows predate that guarantee.
    if let Some(object) = details.as_object_mut() {
        object.remove("embedding");
        object.remove("embedding_vector");
        object.remove("vector");
    }

    Ok(Json(AnalysisResponse {
        nft_id: nft.id,
        analysis_details: details,
        is_fraud: nft.is_fraud,
        confidence_score: nft.confidence_score,
        flag_type: nft.flag_type,
        reason: nft.reason.clone(),
        status: nft.status,
        analyzed_at: nft.created_at,
    }))
}

/// k-NN over the stored embedding of one NFT
async fn similar_nfts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<SimilarQuery>,
) -> Result<Json<SimilarResponse>> {
    let limit = query.limit.clamp(1, 50);
    let nft = state.lifecycle.nft(id).await?;

    let Some(embedding) = Scheduler::stored_embedding(&nft) else {
        return Ok(Json(SimilarResponse {
            target_nft_id: id,
            similar_nfts: Vec::new(),
            total: 0,
        }));
    };

    // Fetch one extra entry: the NFT's own index entry is excluded below
    let matches = state
        .providers
        .index
        .query(&embedding, SIMILAR_BROWSE_THRESHOLD, limit + 1)
        .await?;

    let similar_nfts: Vec<SimilarNftEntry> = matches
        .into_iter()
        .filter(|m| m.nft_id != id)
        .take(limit)
        .map(|m| SimilarNftEntry {
            nft_id: m.nft_id,
            title: m.metadata.title,
            image_url: m.metadata.image_url,
            similarity: m.similarity,
        })
        .collect();

    Ok(Json(SimilarResponse {
        target_nft_id: id,
        total: similar_nfts.len(),
        similar_nfts,
    }))
}

async fn nft_listing_analytics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListingAnalytics>> {
    let analytics = analytics::listing_analytics(state.lifecycle.pool(), id).await?;
    Ok(Json(analytics))
}

async fn nft_listing_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryResponse>> {
    // 404 for unknown NFTs rather than an empty ledger
    state.lifecycle.nft(id).await?;
    let history = state.lifecycle.listing_history(id).await?;
    Ok(Json(HistoryResponse {
        nft_id: id,
        total: history.len(),
        history,
    }))
}

async fn user_nfts(
    State(state): State<Arc<AppState>>,
    Path(wallet): Path<String>,
) -> Result<Json<UserNftsResponse>> {
    let nfts = state.lifecycle.nfts_by_wallet(&wallet).await?;
    Ok(Json(UserNftsResponse {
        wallet_address: wallet,
        total: nfts.len(),
        nfts,
    }))
}

async fn marketplace_nfts(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<MarketplaceFilters>,
) -> Result<Json<MarketplacePage>> {
    let page = browse::browse(state.lifecycle.pool(), &filters).await?;
    Ok(Json(page))
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}
