//! Marketplace Module
//!
//! Owns the NFT/Listing/ListingHistory tables and everything that reads or
//! mutates them.
//!
//! ## Architecture
//!
//! 1. **Lifecycle** - The state machine: create, confirm-mint, list, unlist,
//!    update, delete, purchase, bulk operations. One transaction and one
//!    ledger row per state change, serialized per NFT by a row lock.
//! 2. **Browse** - Filtered, paginated marketplace reads.
//! 3. **Analytics** - Derived per-NFT listing statistics.

pub mod analytics;
pub mod browse;
pub mod lifecycle;

pub use browse::{MarketplaceFilters, MarketplacePage};
pub use lifecycle::{BulkListOutcome, CreateNft, LifecycleManager, ListingChanges};
