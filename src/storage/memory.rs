// src/storage/memory.rs

//! In-memory store for tests and dry runs.
//!
//! Implements the same state-transition semantics as the PostgreSQL backend,
//! including the monotonic remote-count cursor and the collected-count
//! recompute, so pipeline tests exercise real decision behavior. An outage
//! can be injected to test cycle-abort propagation.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{CollectError, Result};
use crate::models::{CatalogEntry, CollectionState, ErrorCode, Platform, ProbeResult};
use crate::storage::{
    ActivityStats, EntityCatalog, FailingEntity, FailureStat, StateStore,
};

type Key = (String, Platform);

#[derive(Default)]
struct Inner {
    states: HashMap<Key, CollectionState>,
    reviews: HashMap<Key, BTreeMap<String, Value>>,
    catalog: Vec<CatalogEntry>,
    permanently_failed: HashSet<Key>,
    probes: Vec<ProbeResult>,
    outage: bool,
}

/// Mirror of the PostgreSQL store, held in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one catalog entry.
    pub async fn add_entity(&self, entity_id: &str, platform: Platform, remote_count: i64) {
        self.inner.lock().await.catalog.push(CatalogEntry {
            entity_id: entity_id.to_string(),
            platform,
            remote_count,
        });
    }

    /// Update the remote count of a seeded entity.
    pub async fn set_remote_count(&self, entity_id: &str, platform: Platform, remote_count: i64) {
        let mut inner = self.inner.lock().await;
        for entry in inner.catalog.iter_mut() {
            if entry.entity_id == entity_id && entry.platform == platform {
                entry.remote_count = remote_count;
            }
        }
    }

    pub async fn mark_permanently_failed(&self, entity_id: &str, platform: Platform) {
        self.inner
            .lock()
            .await
            .permanently_failed
            .insert(key(entity_id, platform));
    }

    /// Make every following store call fail like a dead database.
    pub async fn set_outage(&self, outage: bool) {
        self.inner.lock().await.outage = outage;
    }

    /// Probe results persisted so far.
    pub async fn saved_probes(&self) -> Vec<ProbeResult> {
        self.inner.lock().await.probes.clone()
    }

    fn check(inner: &Inner) -> Result<()> {
        if inner.outage {
            return Err(CollectError::storage_unavailable(
                3,
                "connection refused (simulated)",
            ));
        }
        Ok(())
    }
}

fn key(entity_id: &str, platform: Platform) -> Key {
    (entity_id.to_string(), platform)
}

fn blank_state(entity_id: &str, platform: Platform) -> CollectionState {
    CollectionState {
        entity_id: entity_id.to_string(),
        platform,
        last_attempt_at: None,
        last_success_at: None,
        last_known_remote_count: None,
        collected_count: 0,
        last_failure_reason: None,
        last_failure_detail: None,
        consecutive_failures: 0,
        limited: false,
        limited_reason: None,
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn init_schema(&self) -> Result<()> {
        Self::check(&*self.inner.lock().await)
    }

    async fn fetch_state(
        &self,
        entity_id: &str,
        platform: Platform,
    ) -> Result<Option<CollectionState>> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        Ok(inner.states.get(&key(entity_id, platform)).cloned())
    }

    async fn record_success(
        &self,
        entity_id: &str,
        platform: Platform,
        remote_count: i64,
        limited: bool,
        limited_reason: Option<&str>,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        Self::check(&inner)?;

        let key = key(entity_id, platform);
        let collected = inner.reviews.get(&key).map_or(0, |m| m.len() as i64);
        let now = Utc::now();
        let state = inner
            .states
            .entry(key)
            .or_insert_with(|| blank_state(entity_id, platform));

        state.last_attempt_at = Some(now);
        state.last_success_at = Some(now);
        state.last_known_remote_count =
            Some(state.last_known_remote_count.unwrap_or(0).max(remote_count));
        state.collected_count = collected;
        state.last_failure_reason = None;
        state.last_failure_detail = None;
        state.consecutive_failures = 0;
        state.limited = limited;
        state.limited_reason = limited_reason.map(str::to_string);

        Ok(collected)
    }

    async fn record_failure(
        &self,
        entity_id: &str,
        platform: Platform,
        reason: ErrorCode,
        detail: Option<&str>,
    ) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        Self::check(&inner)?;

        let state = inner
            .states
            .entry(key(entity_id, platform))
            .or_insert_with(|| blank_state(entity_id, platform));

        state.last_attempt_at = Some(Utc::now());
        state.last_failure_reason = Some(reason.as_str().to_string());
        state.last_failure_detail = detail.map(str::to_string);
        state.consecutive_failures += 1;

        Ok(state.consecutive_failures)
    }

    async fn review_ids(&self, entity_id: &str, platform: Platform) -> Result<HashSet<String>> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        Ok(inner
            .reviews
            .get(&key(entity_id, platform))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_reviews(
        &self,
        entity_id: &str,
        platform: Platform,
        reviews: &[(String, Value)],
    ) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Self::check(&inner)?;

        let stored = inner.reviews.entry(key(entity_id, platform)).or_default();
        let mut inserted = 0;
        for (review_id, payload) in reviews {
            if !stored.contains_key(review_id) {
                stored.insert(review_id.clone(), payload.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_reviews(&self, entity_id: &str, platform: Platform) -> Result<i64> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        Ok(inner
            .reviews
            .get(&key(entity_id, platform))
            .map_or(0, |m| m.len() as i64))
    }

    async fn save_probe_results(&self, results: &[ProbeResult]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::check(&inner)?;
        for probe in results {
            inner
                .probes
                .retain(|p| !(p.address == probe.address && p.target == probe.target));
            inner.probes.push(probe.clone());
        }
        Ok(())
    }

    async fn failure_stats(&self, platform: Option<Platform>) -> Result<Vec<FailureStat>> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;

        let mut counts: HashMap<(Platform, String), i64> = HashMap::new();
        for state in inner.states.values() {
            if platform.is_some_and(|p| p != state.platform) {
                continue;
            }
            if let Some(reason) = &state.last_failure_reason {
                *counts.entry((state.platform, reason.clone())).or_default() += 1;
            }
        }

        let mut stats: Vec<FailureStat> = counts
            .into_iter()
            .map(|((platform, reason), count)| FailureStat {
                platform,
                reason,
                count,
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(stats)
    }

    async fn failing_entities(&self, min_failures: i32) -> Result<Vec<FailingEntity>> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;

        let mut failing: Vec<FailingEntity> = inner
            .states
            .values()
            .filter(|s| s.consecutive_failures >= min_failures)
            .map(|s| FailingEntity {
                entity_id: s.entity_id.clone(),
                platform: s.platform,
                consecutive_failures: s.consecutive_failures,
                last_failure_reason: s.last_failure_reason.clone(),
                last_attempt_at: s.last_attempt_at,
            })
            .collect();
        failing.sort_by(|a, b| b.consecutive_failures.cmp(&a.consecutive_failures));
        Ok(failing)
    }

    async fn recent_activity(&self) -> Result<ActivityStats> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let mut activity = ActivityStats::default();
        for state in inner.states.values() {
            if state.last_attempt_at.is_some_and(|at| at > cutoff) {
                activity.attempted += 1;
                if state.last_failure_reason.is_none() {
                    activity.succeeded += 1;
                } else {
                    activity.failed += 1;
                }
            }
        }
        Ok(activity)
    }
}

#[async_trait]
impl EntityCatalog for MemoryStore {
    async fn list_entities(&self, platform: Platform) -> Result<Vec<CatalogEntry>> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        let mut entities: Vec<CatalogEntry> = inner
            .catalog
            .iter()
            .filter(|e| e.platform == platform)
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(entities)
    }

    async fn is_permanently_failed(&self, entity_id: &str, platform: Platform) -> Result<bool> {
        let inner = self.inner.lock().await;
        Self::check(&inner)?;
        Ok(inner.permanently_failed.contains(&key(entity_id, platform)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_failure_streak_increments_and_success_resets() {
        let store = MemoryStore::new();

        assert_eq!(
            store
                .record_failure("a1", Platform::AppStore, ErrorCode::NetworkError, None)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .record_failure("a1", Platform::AppStore, ErrorCode::RateLimited, Some("x"))
                .await
                .unwrap(),
            2
        );

        store
            .record_success("a1", Platform::AppStore, 100, false, None)
            .await
            .unwrap();
        let state = store
            .fetch_state("a1", Platform::AppStore)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_failure_reason.is_none());
        assert!(state.last_failure_detail.is_none());
    }

    #[tokio::test]
    async fn test_failure_leaves_cursor_untouched() {
        let store = MemoryStore::new();
        store
            .record_success("a1", Platform::AppStore, 500, false, None)
            .await
            .unwrap();

        store
            .record_failure("a1", Platform::AppStore, ErrorCode::ServerError, None)
            .await
            .unwrap();

        let state = store
            .fetch_state("a1", Platform::AppStore)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_known_remote_count, Some(500));
        assert!(state.last_success_at.is_some());
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_remote_count_cursor_is_monotonic() {
        let store = MemoryStore::new();
        store
            .record_success("a1", Platform::AppStore, 500, false, None)
            .await
            .unwrap();
        // A lower report never moves the cursor backwards
        store
            .record_success("a1", Platform::AppStore, 400, false, None)
            .await
            .unwrap();

        let state = store
            .fetch_state("a1", Platform::AppStore)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_known_remote_count, Some(500));
    }

    #[tokio::test]
    async fn test_success_recomputes_collected_from_reviews() {
        let store = MemoryStore::new();
        store
            .insert_reviews(
                "a1",
                Platform::AppStore,
                &[
                    ("r1".into(), json!({"score": 5})),
                    ("r2".into(), json!({"score": 4})),
                ],
            )
            .await
            .unwrap();

        let collected = store
            .record_success("a1", Platform::AppStore, 100, false, None)
            .await
            .unwrap();
        assert_eq!(collected, 2);
    }

    #[tokio::test]
    async fn test_insert_reviews_is_idempotent() {
        let store = MemoryStore::new();
        let batch = vec![("r1".to_string(), json!({}))];
        assert_eq!(
            store
                .insert_reviews("a1", Platform::AppStore, &batch)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .insert_reviews("a1", Platform::AppStore, &batch)
                .await
                .unwrap(),
            0
        );
        assert_eq!(store.count_reviews("a1", Platform::AppStore).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_outage_injection_fails_every_call() {
        let store = MemoryStore::new();
        store.set_outage(true).await;
        let result = store.fetch_state("a1", Platform::AppStore).await;
        assert!(result.is_err_and(|e| e.is_fatal()));
    }

    #[tokio::test]
    async fn test_probe_results_upsert_by_address_and_target() {
        let store = MemoryStore::new();
        let address = "10.0.0.1".parse().unwrap();
        let blocked = ProbeResult {
            address,
            target: Platform::AppStore,
            working: false,
            error: Some("HTTP 403".into()),
            tested_at: Utc::now(),
        };
        store.save_probe_results(&[blocked.clone()]).await.unwrap();

        // A later probe of the same pair replaces the earlier row
        let recovered = ProbeResult {
            working: true,
            error: None,
            tested_at: Utc::now(),
            ..blocked
        };
        store.save_probe_results(&[recovered]).await.unwrap();

        let saved = store.saved_probes().await;
        assert_eq!(saved.len(), 1);
        assert!(saved[0].working);
        assert!(saved[0].error.is_none());
    }
}
