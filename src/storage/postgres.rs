// src/storage/postgres.rs

//! PostgreSQL state store.
//!
//! Every operation runs through the outage guard, so a dead server turns
//! into bounded reconnect attempts and then a cycle-fatal error instead of a
//! hang or a swallowed per-entity failure. State transitions are single
//! upsert statements; the failure-streak increment and the collected-count
//! recompute happen inside the statement, so concurrent writers cannot skip
//! or double-count them.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::error::Result;
use crate::models::{
    CatalogEntry, CollectionState, ErrorCode, Platform, ProbeResult, StorageConfig,
};
use crate::storage::{
    ActivityStats, ConnectionManager, EntityCatalog, FailingEntity, FailureStat, OutageGuard,
    StateStore,
};

/// Table and index DDL, applied in order. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS collection_state (
    entity_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    last_attempt_at TIMESTAMPTZ,
    last_success_at TIMESTAMPTZ,
    last_known_remote_count BIGINT,
    collected_count BIGINT NOT NULL DEFAULT 0,
    last_failure_reason TEXT,
    last_failure_detail TEXT,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    limited BOOLEAN NOT NULL DEFAULT FALSE,
    limited_reason TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (entity_id, platform)
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_collection_state_failing
    ON collection_state (consecutive_failures DESC)
    WHERE consecutive_failures > 0
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_collection_state_failure_reason
    ON collection_state (platform, last_failure_reason)
    WHERE last_failure_reason IS NOT NULL
"#,
    r#"
CREATE INDEX IF NOT EXISTS idx_collection_state_last_attempt
    ON collection_state (last_attempt_at DESC)
"#,
    r#"
CREATE TABLE IF NOT EXISTS collected_reviews (
    entity_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    review_id TEXT NOT NULL,
    payload JSONB NOT NULL,
    collected_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (entity_id, platform, review_id)
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS egress_address_cache (
    address TEXT NOT NULL,
    target TEXT NOT NULL,
    working BOOLEAN NOT NULL,
    last_tested_at TIMESTAMPTZ NOT NULL,
    last_error TEXT,
    PRIMARY KEY (address, target)
)
"#,
    // The catalog is written by the metadata collector; created here too so
    // a fresh deployment can run before that service has populated anything.
    r#"
CREATE TABLE IF NOT EXISTS entity_catalog (
    entity_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    remote_review_count BIGINT NOT NULL DEFAULT 0,
    permanently_failed BOOLEAN NOT NULL DEFAULT FALSE,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (entity_id, platform)
)
"#,
];

const SELECT_STATE: &str = r#"
SELECT entity_id, platform, last_attempt_at, last_success_at,
       last_known_remote_count, collected_count,
       last_failure_reason, last_failure_detail, consecutive_failures,
       limited, limited_reason
FROM collection_state
WHERE entity_id = $1 AND platform = $2
"#;

// The collected count comes from the reviews table inside the statement, so
// the cursor self-heals after partially-applied runs. GREATEST keeps the
// remote-count cursor monotonic even if a caller reports a lower total.
const UPSERT_SUCCESS: &str = r#"
INSERT INTO collection_state (
    entity_id, platform, last_attempt_at, last_success_at,
    last_known_remote_count, collected_count,
    last_failure_reason, last_failure_detail, consecutive_failures,
    limited, limited_reason, updated_at
) VALUES (
    $1, $2, NOW(), NOW(),
    $3,
    (SELECT COUNT(*) FROM collected_reviews WHERE entity_id = $1 AND platform = $2),
    NULL, NULL, 0,
    $4, $5, NOW()
)
ON CONFLICT (entity_id, platform) DO UPDATE SET
    last_attempt_at = NOW(),
    last_success_at = NOW(),
    last_known_remote_count = GREATEST(
        COALESCE(collection_state.last_known_remote_count, 0),
        EXCLUDED.last_known_remote_count
    ),
    collected_count = EXCLUDED.collected_count,
    last_failure_reason = NULL,
    last_failure_detail = NULL,
    consecutive_failures = 0,
    limited = EXCLUDED.limited,
    limited_reason = EXCLUDED.limited_reason,
    updated_at = NOW()
RETURNING collected_count
"#;

// Failures never touch last_known_remote_count or the success fields; the
// next cycle must see the same change signal that triggered this attempt.
const UPSERT_FAILURE: &str = r#"
INSERT INTO collection_state (
    entity_id, platform, last_attempt_at,
    last_failure_reason, last_failure_detail, consecutive_failures, updated_at
) VALUES ($1, $2, NOW(), $3, $4, 1, NOW())
ON CONFLICT (entity_id, platform) DO UPDATE SET
    last_attempt_at = NOW(),
    last_failure_reason = EXCLUDED.last_failure_reason,
    last_failure_detail = EXCLUDED.last_failure_detail,
    consecutive_failures = collection_state.consecutive_failures + 1,
    updated_at = NOW()
RETURNING consecutive_failures
"#;

const INSERT_REVIEW: &str = r#"
INSERT INTO collected_reviews (entity_id, platform, review_id, payload)
VALUES ($1, $2, $3, $4)
ON CONFLICT DO NOTHING
"#;

const UPSERT_PROBE: &str = r#"
INSERT INTO egress_address_cache (address, target, working, last_tested_at, last_error)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (address, target) DO UPDATE SET
    working = EXCLUDED.working,
    last_tested_at = EXCLUDED.last_tested_at,
    last_error = EXCLUDED.last_error
"#;

pub struct PgStateStore {
    conn: ConnectionManager,
    guard: OutageGuard,
}

impl PgStateStore {
    pub fn new(conn: ConnectionManager, guard: OutageGuard) -> Self {
        Self { conn, guard }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            ConnectionManager::from_config(config),
            OutageGuard::from_config(config),
        )
    }

    /// Close the underlying connection at shutdown.
    pub async fn release(&self) {
        self.conn.release().await;
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn init_schema(&self) -> Result<()> {
        self.guard
            .execute(&self.conn, |pool| async move {
                for statement in SCHEMA {
                    sqlx::query(statement).execute(&pool).await?;
                }
                Ok(())
            })
            .await?;
        log::debug!("database schema ensured");
        Ok(())
    }

    async fn fetch_state(
        &self,
        entity_id: &str,
        platform: Platform,
    ) -> Result<Option<CollectionState>> {
        let entity_id = entity_id.to_string();
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                async move {
                    sqlx::query(SELECT_STATE)
                        .bind(entity_id)
                        .bind(platform.as_str())
                        .fetch_optional(&pool)
                        .await?
                        .map(|row| state_from_row(&row))
                        .transpose()
                }
            })
            .await
    }

    async fn record_success(
        &self,
        entity_id: &str,
        platform: Platform,
        remote_count: i64,
        limited: bool,
        limited_reason: Option<&str>,
    ) -> Result<i64> {
        let entity_id = entity_id.to_string();
        let limited_reason = limited_reason.map(str::to_string);
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                let limited_reason = limited_reason.clone();
                async move {
                    let row = sqlx::query(UPSERT_SUCCESS)
                        .bind(entity_id)
                        .bind(platform.as_str())
                        .bind(remote_count)
                        .bind(limited)
                        .bind(limited_reason)
                        .fetch_one(&pool)
                        .await?;
                    row.try_get::<i64, _>("collected_count")
                }
            })
            .await
    }

    async fn record_failure(
        &self,
        entity_id: &str,
        platform: Platform,
        reason: ErrorCode,
        detail: Option<&str>,
    ) -> Result<i32> {
        let entity_id = entity_id.to_string();
        let detail = detail.map(str::to_string);
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                let detail = detail.clone();
                async move {
                    let row = sqlx::query(UPSERT_FAILURE)
                        .bind(entity_id)
                        .bind(platform.as_str())
                        .bind(reason.as_str())
                        .bind(detail)
                        .fetch_one(&pool)
                        .await?;
                    row.try_get::<i32, _>("consecutive_failures")
                }
            })
            .await
    }

    async fn review_ids(&self, entity_id: &str, platform: Platform) -> Result<HashSet<String>> {
        let entity_id = entity_id.to_string();
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                async move {
                    let rows = sqlx::query(
                        "SELECT review_id FROM collected_reviews \
                         WHERE entity_id = $1 AND platform = $2",
                    )
                    .bind(entity_id)
                    .bind(platform.as_str())
                    .fetch_all(&pool)
                    .await?;
                    rows.iter()
                        .map(|row| row.try_get::<String, _>("review_id"))
                        .collect::<sqlx::Result<HashSet<_>>>()
                }
            })
            .await
    }

    async fn insert_reviews(
        &self,
        entity_id: &str,
        platform: Platform,
        reviews: &[(String, Value)],
    ) -> Result<usize> {
        if reviews.is_empty() {
            return Ok(0);
        }
        let entity_id = entity_id.to_string();
        let reviews = reviews.to_vec();
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                let reviews = reviews.clone();
                async move {
                    let mut inserted = 0usize;
                    for (review_id, payload) in &reviews {
                        let result = sqlx::query(INSERT_REVIEW)
                            .bind(&entity_id)
                            .bind(platform.as_str())
                            .bind(review_id)
                            .bind(sqlx::types::Json(payload))
                            .execute(&pool)
                            .await?;
                        inserted += result.rows_affected() as usize;
                    }
                    Ok(inserted)
                }
            })
            .await
    }

    async fn count_reviews(&self, entity_id: &str, platform: Platform) -> Result<i64> {
        let entity_id = entity_id.to_string();
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                async move {
                    let row = sqlx::query(
                        "SELECT COUNT(*) AS count FROM collected_reviews \
                         WHERE entity_id = $1 AND platform = $2",
                    )
                    .bind(entity_id)
                    .bind(platform.as_str())
                    .fetch_one(&pool)
                    .await?;
                    row.try_get::<i64, _>("count")
                }
            })
            .await
    }

    async fn save_probe_results(&self, results: &[ProbeResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let results = results.to_vec();
        self.guard
            .execute(&self.conn, move |pool| {
                let results = results.clone();
                async move {
                    for probe in &results {
                        sqlx::query(UPSERT_PROBE)
                            .bind(probe.address.to_string())
                            .bind(probe.target.as_str())
                            .bind(probe.working)
                            .bind(probe.tested_at)
                            .bind(probe.error.clone())
                            .execute(&pool)
                            .await?;
                    }
                    Ok(())
                }
            })
            .await
    }

    async fn failure_stats(&self, platform: Option<Platform>) -> Result<Vec<FailureStat>> {
        self.guard
            .execute(&self.conn, move |pool| async move {
                let rows = match platform {
                    Some(platform) => {
                        sqlx::query(
                            "SELECT platform, last_failure_reason AS reason, COUNT(*) AS count \
                             FROM collection_state \
                             WHERE last_failure_reason IS NOT NULL AND platform = $1 \
                             GROUP BY platform, last_failure_reason \
                             ORDER BY count DESC",
                        )
                        .bind(platform.as_str())
                        .fetch_all(&pool)
                        .await?
                    }
                    None => {
                        sqlx::query(
                            "SELECT platform, last_failure_reason AS reason, COUNT(*) AS count \
                             FROM collection_state \
                             WHERE last_failure_reason IS NOT NULL \
                             GROUP BY platform, last_failure_reason \
                             ORDER BY count DESC",
                        )
                        .fetch_all(&pool)
                        .await?
                    }
                };
                rows.iter()
                    .map(|row| {
                        Ok(FailureStat {
                            platform: platform_from_row(row, "platform")?,
                            reason: row.try_get("reason")?,
                            count: row.try_get("count")?,
                        })
                    })
                    .collect::<sqlx::Result<Vec<_>>>()
            })
            .await
    }

    async fn failing_entities(&self, min_failures: i32) -> Result<Vec<FailingEntity>> {
        self.guard
            .execute(&self.conn, move |pool| async move {
                let rows = sqlx::query(
                    "SELECT entity_id, platform, consecutive_failures, \
                            last_failure_reason, last_attempt_at \
                     FROM collection_state \
                     WHERE consecutive_failures >= $1 \
                     ORDER BY consecutive_failures DESC, last_attempt_at DESC",
                )
                .bind(min_failures)
                .fetch_all(&pool)
                .await?;
                rows.iter()
                    .map(|row| {
                        Ok(FailingEntity {
                            entity_id: row.try_get("entity_id")?,
                            platform: platform_from_row(row, "platform")?,
                            consecutive_failures: row.try_get("consecutive_failures")?,
                            last_failure_reason: row.try_get("last_failure_reason")?,
                            last_attempt_at: row.try_get("last_attempt_at")?,
                        })
                    })
                    .collect::<sqlx::Result<Vec<_>>>()
            })
            .await
    }

    async fn recent_activity(&self) -> Result<ActivityStats> {
        self.guard
            .execute(&self.conn, |pool| async move {
                let row = sqlx::query(
                    "SELECT COUNT(*) AS attempted, \
                            COUNT(*) FILTER (WHERE last_failure_reason IS NULL) AS succeeded, \
                            COUNT(*) FILTER (WHERE last_failure_reason IS NOT NULL) AS failed \
                     FROM collection_state \
                     WHERE last_attempt_at > NOW() - INTERVAL '24 hours'",
                )
                .fetch_one(&pool)
                .await?;
                Ok(ActivityStats {
                    attempted: row.try_get("attempted")?,
                    succeeded: row.try_get("succeeded")?,
                    failed: row.try_get("failed")?,
                })
            })
            .await
    }
}

#[async_trait]
impl EntityCatalog for PgStateStore {
    async fn list_entities(&self, platform: Platform) -> Result<Vec<CatalogEntry>> {
        self.guard
            .execute(&self.conn, move |pool| async move {
                let rows = sqlx::query(
                    "SELECT entity_id, remote_review_count FROM entity_catalog \
                     WHERE platform = $1 \
                     ORDER BY entity_id",
                )
                .bind(platform.as_str())
                .fetch_all(&pool)
                .await?;
                rows.iter()
                    .map(|row| {
                        Ok(CatalogEntry {
                            entity_id: row.try_get("entity_id")?,
                            platform,
                            remote_count: row.try_get("remote_review_count")?,
                        })
                    })
                    .collect::<sqlx::Result<Vec<_>>>()
            })
            .await
    }

    async fn is_permanently_failed(&self, entity_id: &str, platform: Platform) -> Result<bool> {
        let entity_id = entity_id.to_string();
        self.guard
            .execute(&self.conn, move |pool| {
                let entity_id = entity_id.clone();
                async move {
                    let row = sqlx::query(
                        "SELECT permanently_failed FROM entity_catalog \
                         WHERE entity_id = $1 AND platform = $2",
                    )
                    .bind(entity_id)
                    .bind(platform.as_str())
                    .fetch_optional(&pool)
                    .await?;
                    match row {
                        Some(row) => row.try_get("permanently_failed"),
                        None => Ok(false),
                    }
                }
            })
            .await
    }
}

fn state_from_row(row: &PgRow) -> sqlx::Result<CollectionState> {
    Ok(CollectionState {
        entity_id: row.try_get("entity_id")?,
        platform: platform_from_row(row, "platform")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_success_at: row.try_get("last_success_at")?,
        last_known_remote_count: row.try_get("last_known_remote_count")?,
        collected_count: row.try_get("collected_count")?,
        last_failure_reason: row.try_get("last_failure_reason")?,
        last_failure_detail: row.try_get("last_failure_detail")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        limited: row.try_get("limited")?,
        limited_reason: row.try_get("limited_reason")?,
    })
}

fn platform_from_row(row: &PgRow, column: &str) -> sqlx::Result<Platform> {
    let text: String = row.try_get(column)?;
    text.parse::<Platform>()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: e.to_string().into(),
        })
}
