// src/models/state.rs

//! Per-entity collection state and the decisions derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Platform;

/// Persistent collection cursor for one (entity, platform) pair.
///
/// The row's existence is not meaningful by itself; it is created by the
/// first recorded attempt, successful or not, and mutated on every attempt
/// afterwards. Retention is an external concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionState {
    pub entity_id: String,
    pub platform: Platform,

    /// Last attempt of any kind, success or failure
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Last successful collection; failures never move this
    pub last_success_at: Option<DateTime<Utc>>,

    /// Provider-reported total as of the last success. `None` until the
    /// first success; failures never move this either.
    pub last_known_remote_count: Option<i64>,

    /// Reviews actually present in our store, recomputed on every success
    pub collected_count: i64,

    /// Taxonomy code of the last failure, cleared by success
    pub last_failure_reason: Option<String>,

    /// Human-readable detail of the last failure, cleared by success
    pub last_failure_detail: Option<String>,

    /// Failures since the last success; reset to 0 only by success
    pub consecutive_failures: i32,

    /// Provider-side collection ceiling was hit on the last success
    pub limited: bool,

    /// Why collection was limited (e.g. "API_LIMIT_REACHED")
    pub limited_reason: Option<String>,
}

/// How to collect when the decision engine says to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMode {
    /// Never-seen entity: pull as much as the provider allows
    Initial,
    /// Known entity with new reviews: newest-first, stop at a known review
    Incremental,
}

impl CollectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionMode::Initial => "initial",
            CollectionMode::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entity was skipped this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// External catalog marked the entity permanently failed
    PermanentlyFailed,
    /// Provider reports zero reviews
    NoReviewsOnStore,
    /// Remote count has not moved since the last success
    NoChange,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::PermanentlyFailed => "permanently_failed",
            SkipReason::NoReviewsOnStore => "no_reviews_on_store",
            SkipReason::NoChange => "no_change",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the should-collect evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Collect(CollectionMode),
    Skip(SkipReason),
}

impl Decision {
    pub fn should_collect(&self) -> bool {
        matches!(self, Decision::Collect(_))
    }
}
