// src/storage/connection.rs

//! Database connection lifecycle.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Mutex;

use crate::models::StorageConfig;

/// Owns the PostgreSQL pool handle with an explicit reset path.
///
/// The pool opens lazily on first acquire and is handed out as a cheap
/// clone. During an outage the guard calls [`reset`](Self::reset) to drop the
/// handle; the next acquire dials fresh instead of reusing sockets the server
/// side already abandoned.
pub struct ConnectionManager {
    url: String,
    connect_timeout: Duration,
    pool: Mutex<Option<PgPool>>,
}

impl ConnectionManager {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            pool: Mutex::new(None),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(
            config.database_url(),
            Duration::from_secs(config.connect_timeout_secs),
        )
    }

    /// Current pool, dialing a new one if none is open.
    pub async fn acquire(&self) -> sqlx::Result<PgPool> {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.as_ref() {
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }

        log::debug!("opening database connection");
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.url)
            .await?;
        *slot = Some(pool.clone());
        Ok(pool)
    }

    /// Force-close the pool so the next acquire dials fresh.
    pub async fn reset(&self) {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.take() {
            log::debug!("resetting database connection");
            pool.close().await;
        }
    }

    /// Close the pool at shutdown.
    pub async fn release(&self) {
        let mut slot = self.pool.lock().await;
        if let Some(pool) = slot.take() {
            log::info!("database connection released");
            pool.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_fails_cleanly_without_server() {
        // Port 1 refuses immediately; no listener runs there
        let conn = ConnectionManager::new(
            "postgres://nobody@127.0.0.1:1/nothing",
            Duration::from_secs(2),
        );
        assert!(conn.acquire().await.is_err());
        // Reset on an unopened handle is a no-op
        conn.reset().await;
        conn.release().await;
    }
}
