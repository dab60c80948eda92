// src/models/outcome.rs

//! Structured outcomes: transport results, probe results, cycle statistics.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Platform;

/// Failure taxonomy recorded into collection state.
///
/// The code determines the retry strategy:
/// - `IpBlocked`: provider rejected this egress address, retried on another
///   address inside the transport
/// - `RateLimited`: throttled, retried with backoff inside the transport
/// - `NetworkError` / `ServerError` / `ParseError` / `NoAvailableAddress`:
///   surfaced immediately, retried on the next cycle
/// - `AppNotFound`: permanent, never retried
/// - `NoReviews`: retried only when the remote count changes
/// - `ApiLimitReached`: not a failure; recorded as the limited reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IpBlocked,
    RateLimited,
    NetworkError,
    ServerError,
    ParseError,
    NoAvailableAddress,
    AppNotFound,
    NoReviews,
    ApiLimitReached,
}

impl ErrorCode {
    /// Stable text form stored in `last_failure_reason`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IpBlocked => "IP_BLOCKED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::NoAvailableAddress => "NO_AVAILABLE_ADDRESS",
            ErrorCode::AppNotFound => "APP_NOT_FOUND",
            ErrorCode::NoReviews => "NO_REVIEWS",
            ErrorCode::ApiLimitReached => "API_LIMIT_REACHED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one logical transport request, address failover and rate-limit
/// retries included. Ephemeral; never persisted as-is.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub success: bool,

    /// Last HTTP status seen, if the request got that far
    pub status: Option<u16>,

    /// Raw response body on success
    pub body: Option<String>,

    /// Parsed body, when JSON parsing was requested
    pub json: Option<serde_json::Value>,

    pub error_code: Option<ErrorCode>,
    pub error_detail: Option<String>,

    /// Egress address the final attempt used
    pub address: Option<IpAddr>,

    /// Total send attempts, failovers and backoff retries included
    pub attempts: u32,
}

impl RequestOutcome {
    pub fn succeeded(
        status: u16,
        body: String,
        json: Option<serde_json::Value>,
        address: IpAddr,
        attempts: u32,
    ) -> Self {
        Self {
            success: true,
            status: Some(status),
            body: Some(body),
            json,
            error_code: None,
            error_detail: None,
            address: Some(address),
            attempts,
        }
    }

    pub fn failed(
        code: ErrorCode,
        detail: impl Into<String>,
        status: Option<u16>,
        address: Option<IpAddr>,
        attempts: u32,
    ) -> Self {
        Self {
            success: false,
            status,
            body: None,
            json: None,
            error_code: Some(code),
            error_detail: Some(detail.into()),
            address,
            attempts,
        }
    }
}

/// Result of probing one egress address against one target's canary.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub address: IpAddr,
    pub target: Platform,
    pub working: bool,
    pub error: Option<String>,
    pub tested_at: DateTime<Utc>,
}

/// What one collector invocation produced for one entity.
#[derive(Debug, Clone)]
pub enum CollectStatus {
    /// Collection ran to its stopping condition
    Completed {
        new_reviews: usize,
        limited: bool,
        limited_reason: Option<String>,
    },
    /// Collection failed in a classified way
    Failed { code: ErrorCode, detail: String },
}

/// Counters for one full cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Entities evaluated by the decision engine
    pub checked: usize,
    /// Entities collected successfully
    pub collected: usize,
    /// Entities skipped by decision
    pub skipped: usize,
    /// Entities that failed collection
    pub failed: usize,
    /// New reviews stored across all entities
    pub reviews_collected: usize,
}

impl CycleStats {
    pub fn summary(&self) -> String {
        format!(
            "checked={} collected={} skipped={} failed={} reviews={}",
            self.checked, self.collected, self.skipped, self.failed, self.reviews_collected
        )
    }
}
