//! # Async Database Management Module (sqlx + SQLite)
//!
//! Durable storage for the directory, routing rules, queue entries, call
//! records, round-robin cursors and the notification log. Everything goes
//! through one [`DatabaseManager`], which is cheap to clone and safe to move
//! into `tokio::spawn`.
//!
//! ## Layout
//!
//! - [`directory`]: servers, users, extensions, accounts, groups, rules
//! - [`call_logs`]: call records and the history queries used for estimates
//! - [`queue_entries`]: per-group waiting queues
//! - [`cursors`]: persisted round-robin positions
//! - [`statistics`]: aggregate queries behind reports
//! - [`notifications`]: notification audit trail
//!
//! Writes on the inbound and status-update paths go through
//! [`DatabaseManager::with_write_retry`], which retries busy/locked errors
//! with linear backoff before surfacing
//! [`CallEngineError::TransientStore`].

pub mod call_logs;
pub mod cursors;
pub mod directory;
pub mod notifications;
pub mod queue_entries;
pub mod statistics;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::error::{is_transient, CallEngineError, Result};

pub use call_logs::NewCallLog;
pub use statistics::{CallCounts, StatsFilter};

/// Bounded retry for transient write failures
#[derive(Debug, Clone, Copy)]
pub struct WriteRetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Main database manager using sqlx for async operations
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
    retry: WriteRetryPolicy,
}

impl DatabaseManager {
    /// Open (creating if needed) the database and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_config(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub async fn with_config(config: &DatabaseConfig) -> Result<Self> {
        info!("🗄️ Initializing sqlx database manager: {}", config.url);

        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true)
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` is its own database, so the
        // in-memory pool is pinned to one connection that never idles out.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await.map_err(|e| {
            CallEngineError::database(format!("Failed to connect to database: {}", e))
        })?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✅ Database manager initialized successfully");
        Ok(Self {
            pool,
            retry: WriteRetryPolicy {
                attempts: config.write_retry_attempts.max(1),
                backoff: Duration::from_millis(config.write_retry_backoff_ms),
            },
        })
    }

    /// Create an in-memory database for testing
    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn retry_policy(&self) -> WriteRetryPolicy {
        self.retry
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run a write, retrying transient failures.
    ///
    /// `op` is invoked once per attempt and must build a fresh future each
    /// time; capture owned clones rather than borrows of the caller's locals.
    pub async fn with_write_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.retry.attempts => {
                    warn!(
                        "Transient store error during {} (attempt {}/{}): {}",
                        what, attempt, self.retry.attempts, e
                    );
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
