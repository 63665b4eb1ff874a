//! Persistence adapter: a thin wrapper around a single-writer sqlite store
//! exposing bounded-retry exec/query, grounded in the pack's sqlx-backed
//! adapter lineage rather than a hand-rolled DB layer.

use std::time::Duration;

use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("persisted timestamp is not valid RFC-3339: {0}")]
    CorruptTimestamp(String),

    #[error("persistence contention exceeded {attempts} attempts")]
    ContentionExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Bounded retry policy for contention errors (`SQLITE_BUSY`/`SQLITE_LOCKED`).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(50),
        }
    }
}

fn is_contention(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code == "5" || code == "6"; // SQLITE_BUSY / SQLITE_LOCKED
        }
    }
    false
}

/// A thin handle around a sqlite pool. Route Table and Certificate Manager
/// code depend on this, not on `sqlx` directly.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl SqlitePersistence {
    pub async fn connect(database_path: &str) -> Result<Self> {
        let url = format!("sqlite://{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        let store = Self {
            pool,
            retry: RetryPolicy::default(),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                domain TEXT PRIMARY KEY,
                container_id TEXT NOT NULL,
                container_ip TEXT NOT NULL,
                container_port TEXT NOT NULL,
                protocol TEXT NOT NULL,
                path TEXT NOT NULL,
                active INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS certificates (
                domain TEXT PRIMARY KEY,
                cert_pem TEXT NOT NULL,
                key_pem TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                issuer TEXT NOT NULL,
                status TEXT NOT NULL,
                cert_type TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS acme_accounts (
                email TEXT PRIMARY KEY,
                private_key_pem TEXT NOT NULL,
                registration_resource TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs `op` against the pool, retrying a bounded number of times when
    /// the underlying error is sqlite contention.
    pub async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(SqlitePool) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op(self.pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if is_contention(&err) && attempt + 1 < self.retry.attempts => {
                    attempt += 1;
                    let delay = self.retry.base_delay * attempt;
                    tracing::warn!(attempt, "persistence contention, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) if is_contention(&err) => {
                    return Err(PersistenceError::ContentionExhausted {
                        attempts: self.retry.attempts,
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Parses a stored RFC-3339 timestamp column, surfacing corruption instead
/// of silently defaulting (spec §4.6/§7: "bubbles up; never silently
/// masked").
pub fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<time::OffsetDateTime> {
    let raw: String = row
        .try_get(column)
        .map_err(|e| PersistenceError::CorruptTimestamp(e.to_string()))?;
    time::OffsetDateTime::parse(&raw, &time::format_description::well_known::Rfc3339)
        .map_err(|_| PersistenceError::CorruptTimestamp(raw))
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .expect("RFC-3339 formatting of current time cannot fail")
}
