// src/pipeline/decision.rs

//! Collect-or-skip decisions.
//!
//! Turns the provider-reported review count plus the stored cursor into a
//! decision and a collection mode. The rules form a strict cascade; order
//! matters, and in particular an entity with no recorded state is collected
//! even when the catalog marks it permanently failed, because an empty
//! cursor means we never actually tried.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    CollectionMode, CollectionState, Decision, ErrorCode, Platform, SkipReason,
};
use crate::storage::{EntityCatalog, StateStore};

/// Decide whether to collect one entity and in which mode.
///
/// The cascade:
/// 1. no recorded state -> collect INITIAL
/// 2. permanently failed -> skip
/// 3. observed count above the cursor -> collect INCREMENTAL
/// 4. store reports zero reviews -> skip
/// 5. otherwise -> skip, nothing changed
pub fn decide(
    state: Option<&CollectionState>,
    permanently_failed: bool,
    observed_remote_count: i64,
) -> Decision {
    let Some(state) = state else {
        return Decision::Collect(CollectionMode::Initial);
    };
    if permanently_failed {
        return Decision::Skip(SkipReason::PermanentlyFailed);
    }
    if observed_remote_count > state.last_known_remote_count.unwrap_or(0) {
        return Decision::Collect(CollectionMode::Incremental);
    }
    if observed_remote_count == 0 {
        return Decision::Skip(SkipReason::NoReviewsOnStore);
    }
    Decision::Skip(SkipReason::NoChange)
}

/// Stateful wrapper: loads the cursor, consults the catalog, and records
/// attempt outcomes back into the store.
pub struct DecisionEngine {
    store: Arc<dyn StateStore>,
    catalog: Arc<dyn EntityCatalog>,
}

impl DecisionEngine {
    pub fn new(store: Arc<dyn StateStore>, catalog: Arc<dyn EntityCatalog>) -> Self {
        Self { store, catalog }
    }

    /// Evaluate the decision cascade for one entity.
    pub async fn should_collect(
        &self,
        entity_id: &str,
        platform: Platform,
        observed_remote_count: i64,
    ) -> Result<Decision> {
        let state = self.store.fetch_state(entity_id, platform).await?;
        // The catalog lookup only matters once a cursor exists; rule 1 wins
        // over the permanent flag regardless.
        let permanently_failed = if state.is_some() {
            self.catalog.is_permanently_failed(entity_id, platform).await?
        } else {
            false
        };

        let decision = decide(state.as_ref(), permanently_failed, observed_remote_count);
        if let Decision::Skip(reason) = &decision {
            log::debug!("skip {entity_id} ({platform}): {reason}");
        }
        Ok(decision)
    }

    /// Record a successful run. Returns the recomputed collected count.
    pub async fn record_success(
        &self,
        entity_id: &str,
        platform: Platform,
        remote_count: i64,
        limited: bool,
        limited_reason: Option<&str>,
    ) -> Result<i64> {
        let collected = self
            .store
            .record_success(entity_id, platform, remote_count, limited, limited_reason)
            .await?;
        log::debug!(
            "{entity_id} ({platform}): success recorded, cursor={remote_count}, collected={collected}"
        );
        Ok(collected)
    }

    /// Record a failed run. Returns the new failure-streak length.
    pub async fn record_failure(
        &self,
        entity_id: &str,
        platform: Platform,
        code: ErrorCode,
        detail: Option<&str>,
    ) -> Result<i32> {
        let streak = self
            .store
            .record_failure(entity_id, platform, code, detail)
            .await?;
        log::debug!("{entity_id} ({platform}): failure recorded, {code}, streak={streak}");
        Ok(streak)
    }

    /// Current cursor for one entity, if any.
    pub async fn status(
        &self,
        entity_id: &str,
        platform: Platform,
    ) -> Result<Option<CollectionState>> {
        self.store.fetch_state(entity_id, platform).await
    }
}
