// src/pipeline/cycle.rs

//! One full collection cycle over the entity catalog.
//!
//! Per-entity problems are recorded into collection state and the cycle
//! moves on; only a storage-unavailable error aborts the whole cycle. That
//! contract is enforced here with explicit fatality checks on every storage
//! interaction, so a new error path cannot accidentally swallow an outage.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{CollectStatus, CycleStats, Decision, Platform};
use crate::pipeline::DecisionEngine;
use crate::services::ReviewCollector;
use crate::storage::EntityCatalog;

/// Sequences decisions and collections for every cataloged entity.
pub struct CycleRunner {
    engine: DecisionEngine,
    catalog: Arc<dyn EntityCatalog>,
    collector: Arc<dyn ReviewCollector>,
}

impl CycleRunner {
    pub fn new(
        engine: DecisionEngine,
        catalog: Arc<dyn EntityCatalog>,
        collector: Arc<dyn ReviewCollector>,
    ) -> Self {
        Self {
            engine,
            catalog,
            collector,
        }
    }

    /// Run one cycle over the given platforms.
    ///
    /// Returns `Err` only for cycle-fatal conditions (storage unavailable);
    /// everything else lands in the returned stats and in collection state.
    pub async fn run_cycle(&self, platforms: &[Platform]) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        for &platform in platforms {
            let entries = self.catalog.list_entities(platform).await?;
            log::info!("{platform}: {} catalog entries", entries.len());

            for entry in &entries {
                stats.checked += 1;

                let decision = match self
                    .engine
                    .should_collect(&entry.entity_id, entry.platform, entry.remote_count)
                    .await
                {
                    Ok(decision) => decision,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        log::error!("{}: decision failed: {e}", entry.label());
                        stats.failed += 1;
                        continue;
                    }
                };

                let mode = match decision {
                    Decision::Collect(mode) => mode,
                    Decision::Skip(_) => {
                        stats.skipped += 1;
                        continue;
                    }
                };

                log::info!("collecting {} in {mode} mode", entry.label());
                match self.collector.collect(entry, mode).await {
                    Ok(CollectStatus::Completed {
                        new_reviews,
                        limited,
                        limited_reason,
                    }) => {
                        let total = match self
                            .engine
                            .record_success(
                                &entry.entity_id,
                                entry.platform,
                                entry.remote_count,
                                limited,
                                limited_reason.as_deref(),
                            )
                            .await
                        {
                            Ok(total) => total,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                log::error!("{}: recording success failed: {e}", entry.label());
                                stats.failed += 1;
                                continue;
                            }
                        };
                        stats.collected += 1;
                        stats.reviews_collected += new_reviews;
                        log::info!(
                            "{}: +{new_reviews} reviews (total {total}){}",
                            entry.label(),
                            if limited { ", limited" } else { "" }
                        );
                    }
                    Ok(CollectStatus::Failed { code, detail }) => {
                        let streak = match self
                            .engine
                            .record_failure(&entry.entity_id, entry.platform, code, Some(&detail))
                            .await
                        {
                            Ok(streak) => streak,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                log::error!("{}: recording failure failed: {e}", entry.label());
                                stats.failed += 1;
                                continue;
                            }
                        };
                        stats.failed += 1;
                        log::warn!(
                            "{}: {code} ({detail}); {streak} consecutive failure(s)",
                            entry.label()
                        );
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        stats.failed += 1;
                        log::error!("{}: collector error: {e}", entry.label());
                    }
                }
            }
        }

        log::info!("cycle complete: {}", stats.summary());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::CollectError;
    use crate::models::{CatalogEntry, CollectionMode, ErrorCode};
    use crate::storage::{MemoryStore, StateStore};

    /// Collector driven by a queue of scripted results. `Completed` entries
    /// also insert that many synthetic reviews, so the store's recomputed
    /// counts behave like a real collection run.
    struct ScriptedCollector {
        store: Arc<MemoryStore>,
        script: Mutex<VecDeque<Result<CollectStatus>>>,
        calls: Mutex<Vec<(String, CollectionMode)>>,
        id_counter: AtomicUsize,
    }

    impl ScriptedCollector {
        fn new(store: Arc<MemoryStore>) -> Self {
            Self {
                store,
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                id_counter: AtomicUsize::new(0),
            }
        }

        fn push(&self, result: Result<CollectStatus>) {
            self.script.lock().unwrap().push_back(result);
        }

        fn push_completed(&self, new_reviews: usize) {
            self.push(Ok(CollectStatus::Completed {
                new_reviews,
                limited: false,
                limited_reason: None,
            }));
        }

        fn calls(&self) -> Vec<(String, CollectionMode)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReviewCollector for ScriptedCollector {
        async fn collect(
            &self,
            entry: &CatalogEntry,
            mode: CollectionMode,
        ) -> Result<CollectStatus> {
            self.calls
                .lock()
                .unwrap()
                .push((entry.entity_id.clone(), mode));
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");

            if let Ok(CollectStatus::Completed { new_reviews, .. }) = &next {
                let batch: Vec<(String, serde_json::Value)> = (0..*new_reviews)
                    .map(|_| {
                        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
                        (format!("r{id}"), json!({"synthetic": true}))
                    })
                    .collect();
                self.store
                    .insert_reviews(&entry.entity_id, entry.platform, &batch)
                    .await?;
            }
            next
        }
    }

    fn runner(
        store: &Arc<MemoryStore>,
        collector: &Arc<ScriptedCollector>,
    ) -> CycleRunner {
        let engine = DecisionEngine::new(store.clone(), store.clone());
        CycleRunner::new(engine, store.clone(), collector.clone())
    }

    #[tokio::test]
    async fn test_full_incremental_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        store.add_entity("app1", Platform::AppStore, 50000).await;
        store.add_entity("app2", Platform::AppStore, 2100).await;
        let collector = Arc::new(ScriptedCollector::new(store.clone()));
        let runner = runner(&store, &collector);

        // Cycle 1: no state, both collected in initial mode
        collector.push_completed(300);
        collector.push_completed(90);
        let stats = runner.run_cycle(&[Platform::AppStore]).await.unwrap();
        assert_eq!(stats.checked, 2);
        assert_eq!(stats.collected, 2);
        assert_eq!(stats.reviews_collected, 390);
        assert!(
            collector
                .calls()
                .iter()
                .all(|(_, mode)| *mode == CollectionMode::Initial)
        );

        // Cycle 2: counts unchanged, everything skips, collector untouched
        let stats = runner.run_cycle(&[Platform::AppStore]).await.unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.collected, 0);
        assert_eq!(collector.calls().len(), 2);

        // Cycle 3: both counts grew, incremental collection
        store.set_remote_count("app1", Platform::AppStore, 50300).await;
        store.set_remote_count("app2", Platform::AppStore, 2390).await;
        collector.push_completed(300);
        collector.push_completed(290);
        let stats = runner.run_cycle(&[Platform::AppStore]).await.unwrap();
        assert_eq!(stats.collected, 2);
        assert_eq!(stats.reviews_collected, 590);
        let modes: Vec<CollectionMode> =
            collector.calls()[2..].iter().map(|(_, m)| *m).collect();
        assert_eq!(
            modes,
            vec![CollectionMode::Incremental, CollectionMode::Incremental]
        );

        // Cursor and recomputed counts landed in state
        let state = store
            .fetch_state("app1", Platform::AppStore)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_known_remote_count, Some(50300));
        assert_eq!(state.collected_count, 600);
    }

    #[tokio::test]
    async fn test_classified_failure_is_recorded_not_propagated() {
        let store = Arc::new(MemoryStore::new());
        store.add_entity("app1", Platform::AppStore, 100).await;
        store.add_entity("app2", Platform::AppStore, 100).await;
        let collector = Arc::new(ScriptedCollector::new(store.clone()));
        let runner = runner(&store, &collector);

        collector.push(Ok(CollectStatus::Failed {
            code: ErrorCode::RateLimited,
            detail: "still rate limited after 3 retries".into(),
        }));
        collector.push_completed(5);

        let stats = runner.run_cycle(&[Platform::AppStore]).await.unwrap();
        // The failure did not stop app2 from being collected
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.collected, 1);

        let state = store
            .fetch_state("app1", Platform::AppStore)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.last_failure_reason.as_deref(), Some("RATE_LIMITED"));
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_storage_outage_aborts_cycle() {
        let store = Arc::new(MemoryStore::new());
        store.add_entity("app1", Platform::AppStore, 100).await;
        let collector = Arc::new(ScriptedCollector::new(store.clone()));
        let runner = runner(&store, &collector);

        store.set_outage(true).await;
        let result = runner.run_cycle(&[Platform::AppStore]).await;
        assert!(result.is_err_and(|e| e.is_fatal()));
        // Nothing was attempted against the collector
        assert!(collector.calls().is_empty());
    }

    #[tokio::test]
    async fn test_collector_storage_error_aborts_mid_cycle() {
        let store = Arc::new(MemoryStore::new());
        store.add_entity("app1", Platform::AppStore, 100).await;
        store.add_entity("app2", Platform::AppStore, 100).await;
        let collector = Arc::new(ScriptedCollector::new(store.clone()));
        let runner = runner(&store, &collector);

        // First entity hits a dead database inside the collector
        collector.push(Err(CollectError::storage_unavailable(3, "connection refused")));
        collector.push_completed(5);

        let result = runner.run_cycle(&[Platform::AppStore]).await;
        assert!(result.is_err_and(|e| e.is_fatal()));
        // The second entity was never reached
        assert_eq!(collector.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_zero_count_entities_skip_after_initial() {
        let store = Arc::new(MemoryStore::new());
        store.add_entity("app1", Platform::AppStore, 0).await;
        let collector = Arc::new(ScriptedCollector::new(store.clone()));
        let runner = runner(&store, &collector);

        // First pass: no state, so even a zero count collects once
        collector.push(Ok(CollectStatus::Failed {
            code: ErrorCode::NoReviews,
            detail: "feed returned no reviews".into(),
        }));
        let stats = runner.run_cycle(&[Platform::AppStore]).await.unwrap();
        assert_eq!(stats.failed, 1);

        // Second pass: state exists and the store still reports zero
        let stats = runner.run_cycle(&[Platform::AppStore]).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(collector.calls().len(), 1);
    }
}
