// src/storage/guard.rs

//! Storage outage detection and bounded recovery.

use std::future::Future;
use std::time::Duration;

use sqlx::postgres::PgPool;

use crate::error::{CollectError, Result};
use crate::models::StorageConfig;
use crate::storage::ConnectionManager;

/// Whether a database error means the server is unreachable, as opposed to
/// the query being wrong.
pub fn is_unavailable(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // 08xxx connection exceptions, 57P0x server shutdown states, 53300
        // too_many_connections
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            let code = code.as_ref();
            code.starts_with("08") || code.starts_with("57P") || code == "53300"
        }),
        _ => false,
    }
}

/// Runs storage operations, reconnecting through outages.
///
/// On an unavailability error the guard resets the connection handle, sleeps
/// out the next backoff entry, and retries the whole operation. When the
/// schedule is exhausted the failure escalates to
/// [`CollectError::StorageUnavailable`], which aborts the cycle instead of
/// being folded into per-entity failure state.
pub struct OutageGuard {
    schedule: Vec<Duration>,
}

impl OutageGuard {
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config
                .outage_backoff_secs
                .iter()
                .map(|&secs| Duration::from_secs(secs))
                .collect(),
        )
    }

    /// Run `op` with a live pool, retrying through outages.
    ///
    /// Errors that are not outage-shaped return immediately; they are bugs or
    /// data problems, and retrying would not change them.
    pub async fn execute<T, F, Fut>(&self, conn: &ConnectionManager, op: F) -> Result<T>
    where
        F: Fn(PgPool) -> Fut + Send + Sync,
        Fut: Future<Output = sqlx::Result<T>> + Send,
        T: Send,
    {
        let mut last_error = match attempt(conn, &op).await {
            Ok(value) => return Ok(value),
            Err(error) if is_unavailable(&error) => error,
            Err(error) => return Err(error.into()),
        };

        log::warn!("storage unavailable: {last_error}");
        for (retry, delay) in self.schedule.iter().enumerate() {
            conn.reset().await;
            log::warn!(
                "reconnecting to storage in {:?} (attempt {}/{})",
                delay,
                retry + 1,
                self.schedule.len()
            );
            tokio::time::sleep(*delay).await;

            match attempt(conn, &op).await {
                Ok(value) => {
                    log::info!("storage recovered after {} reconnect attempt(s)", retry + 1);
                    return Ok(value);
                }
                Err(error) if is_unavailable(&error) => last_error = error,
                Err(error) => return Err(error.into()),
            }
        }

        log::error!(
            "storage still unavailable after {} reconnect attempts: {last_error}",
            self.schedule.len()
        );
        Err(CollectError::storage_unavailable(
            self.schedule.len(),
            last_error,
        ))
    }
}

async fn attempt<T, F, Fut>(conn: &ConnectionManager, op: &F) -> sqlx::Result<T>
where
    F: Fn(PgPool) -> Fut + Send + Sync,
    Fut: Future<Output = sqlx::Result<T>> + Send,
{
    let pool = conn.acquire().await?;
    op(pool).await
}
