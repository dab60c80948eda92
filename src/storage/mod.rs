// src/storage/mod.rs

//! Storage layer: collection state, collected reviews, entity catalog.
//!
//! The traits here are the seam between the pipeline and the database.
//! `PgStateStore` is the production backend; `MemoryStore` mirrors its
//! semantics for tests and dry runs.

mod connection;
mod guard;
mod memory;
mod postgres;

pub use connection::ConnectionManager;
pub use guard::{OutageGuard, is_unavailable};
pub use memory::MemoryStore;
pub use postgres::PgStateStore;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::models::{CatalogEntry, CollectionState, ErrorCode, Platform, ProbeResult};

/// Aggregated failure count for one (platform, reason) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureStat {
    pub platform: Platform,
    pub reason: String,
    pub count: i64,
}

/// One entity with a worrying failure streak.
#[derive(Debug, Clone)]
pub struct FailingEntity {
    pub entity_id: String,
    pub platform: Platform,
    pub consecutive_failures: i32,
    pub last_failure_reason: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Attempt counters over a trailing window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityStats {
    pub attempted: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Collection state and review persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create tables and indexes if they do not exist.
    async fn init_schema(&self) -> Result<()>;

    /// Load the sync cursor for one entity, if any attempt was ever recorded.
    async fn fetch_state(
        &self,
        entity_id: &str,
        platform: Platform,
    ) -> Result<Option<CollectionState>>;

    /// Record a successful collection run: clears the failure streak,
    /// advances the remote-count cursor, and recomputes the collected count
    /// from the stored reviews. Returns the recomputed count.
    async fn record_success(
        &self,
        entity_id: &str,
        platform: Platform,
        remote_count: i64,
        limited: bool,
        limited_reason: Option<&str>,
    ) -> Result<i64>;

    /// Record a failed collection attempt: bumps the failure streak
    /// atomically and leaves the remote-count cursor untouched so the next
    /// cycle sees the same change signal. Returns the new streak length.
    async fn record_failure(
        &self,
        entity_id: &str,
        platform: Platform,
        reason: ErrorCode,
        detail: Option<&str>,
    ) -> Result<i32>;

    /// Ids of every stored review for one entity.
    async fn review_ids(&self, entity_id: &str, platform: Platform) -> Result<HashSet<String>>;

    /// Insert reviews, ignoring ids already present. Returns how many were
    /// actually new.
    async fn insert_reviews(
        &self,
        entity_id: &str,
        platform: Platform,
        reviews: &[(String, Value)],
    ) -> Result<usize>;

    /// Ground-truth count of stored reviews for one entity.
    async fn count_reviews(&self, entity_id: &str, platform: Platform) -> Result<i64>;

    /// Persist egress probe outcomes for operator inspection.
    async fn save_probe_results(&self, results: &[ProbeResult]) -> Result<()>;

    /// Failure counts grouped by reason, worst first.
    async fn failure_stats(&self, platform: Option<Platform>) -> Result<Vec<FailureStat>>;

    /// Entities at or above a failure-streak threshold, worst first.
    async fn failing_entities(&self, min_failures: i32) -> Result<Vec<FailingEntity>>;

    /// Attempt counters over the last 24 hours.
    async fn recent_activity(&self) -> Result<ActivityStats>;
}

/// Read access to the entity catalog maintained by the metadata collector.
#[async_trait]
pub trait EntityCatalog: Send + Sync {
    /// Entities to evaluate for a platform, with their current remote counts.
    async fn list_entities(&self, platform: Platform) -> Result<Vec<CatalogEntry>>;

    /// Whether the entity is marked permanently failed (e.g. delisted).
    async fn is_permanently_failed(&self, entity_id: &str, platform: Platform) -> Result<bool>;
}
