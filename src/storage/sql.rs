// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL system of record for claims and resource stock.
//!
//! ```sql
//! CREATE TABLE claims (
//!   claim_id BIGINT PRIMARY KEY,   -- idempotency key for redelivered claims
//!   resource_id BIGINT NOT NULL,
//!   client_id BIGINT NOT NULL,
//!   created_at BIGINT NOT NULL
//! );
//! CREATE TABLE claim_resources (
//!   resource_id BIGINT PRIMARY KEY,
//!   title TEXT,
//!   stock BIGINT NOT NULL,         -- never decremented below zero
//!   window_start BIGINT NOT NULL,
//!   window_end BIGINT NOT NULL
//! );
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver has no unsigned integers, so ids are bound as `i64`,
//! and MySQL hands TEXT back as bytes (see [`text_column`]).

use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::AnyConnection;
use sqlx::{AnyPool, Row};
use tracing::debug;

use super::traits::{ClaimRecordStore, InsertOutcome, StockOutcome, StorageError};
use crate::claim::{Claim, Resource};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Future returned by a [`SqlRecordStore::with_transaction`] body.
pub type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'c>>;

pub struct SqlRecordStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlRecordStore {
    /// Connect with startup-mode retry (fails fast if the URL is wrong) and create the tables.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(backend)
        })
        .await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&store.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let (claims, resources) = if self.is_sqlite {
            (
                r#"CREATE TABLE IF NOT EXISTS claims (
                    claim_id INTEGER PRIMARY KEY,
                    resource_id INTEGER NOT NULL,
                    client_id INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                )"#,
                r#"CREATE TABLE IF NOT EXISTS claim_resources (
                    resource_id INTEGER PRIMARY KEY,
                    title TEXT,
                    stock INTEGER NOT NULL,
                    window_start INTEGER NOT NULL DEFAULT 0,
                    window_end INTEGER NOT NULL DEFAULT 0
                )"#,
            )
        } else {
            (
                r#"CREATE TABLE IF NOT EXISTS claims (
                    claim_id BIGINT PRIMARY KEY,
                    resource_id BIGINT NOT NULL,
                    client_id BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    INDEX idx_resource (resource_id)
                )"#,
                r#"CREATE TABLE IF NOT EXISTS claim_resources (
                    resource_id BIGINT PRIMARY KEY,
                    title VARCHAR(255),
                    stock BIGINT NOT NULL,
                    window_start BIGINT NOT NULL DEFAULT 0,
                    window_end BIGINT NOT NULL DEFAULT 0
                )"#,
            )
        };

        for ddl in [claims, resources] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }

    /// Run `body` inside one transaction: commit if it returns `Ok`, roll back otherwise.
    ///
    /// ```rust,no_run
    /// # use claim_engine::storage::sql::SqlRecordStore;
    /// # async fn example(store: &SqlRecordStore) -> Result<(), claim_engine::StorageError> {
    /// let rows = store
    ///     .with_transaction("touch", |conn| {
    ///         Box::pin(async move {
    ///             let done = sqlx::query("UPDATE claim_resources SET stock = stock")
    ///                 .execute(&mut *conn)
    ///                 .await
    ///                 .map_err(|e| claim_engine::StorageError::Backend(e.to_string()))?;
    ///             Ok::<_, claim_engine::StorageError>(done.rows_affected())
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_transaction<T, F>(&self, op: &'static str, body: F) -> Result<T, StorageError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut AnyConnection) -> TxFuture<'c, T> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        match body(&mut *tx).await {
            Ok(value) => {
                tx.commit().await.map_err(backend)?;
                Ok(value)
            }
            Err(e) => {
                debug!(op, error = %e, "Rolling back transaction");
                if let Err(rb) = tx.rollback().await {
                    debug!(op, error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    fn insert_claim_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT OR IGNORE INTO claims (claim_id, resource_id, client_id, created_at) VALUES (?, ?, ?, ?)"
        } else {
            "INSERT IGNORE INTO claims (claim_id, resource_id, client_id, created_at) VALUES (?, ?, ?, ?)"
        }
    }
}

const DECREMENT_SQL: &str = "UPDATE claim_resources SET stock = stock - 1 WHERE resource_id = ? AND stock > 0";

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

/// TEXT column that SQLite returns as a string and MySQL as bytes.
fn text_column(row: &AnyRow, name: &str) -> Option<String> {
    row.try_get::<String, _>(name).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(name)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn claim_from_row(row: &AnyRow) -> Result<Claim, StorageError> {
    Ok(Claim {
        claim_id: to_u64(row.try_get("claim_id").map_err(backend)?),
        resource_id: to_u64(row.try_get("resource_id").map_err(backend)?),
        client_id: to_u64(row.try_get("client_id").map_err(backend)?),
        created_at: row.try_get("created_at").unwrap_or(0),
    })
}

fn resource_from_row(row: &AnyRow) -> Result<Resource, StorageError> {
    let stock: i64 = row.try_get("stock").map_err(backend)?;
    Ok(Resource {
        resource_id: to_u64(row.try_get("resource_id").map_err(backend)?),
        title: text_column(row, "title").unwrap_or_default(),
        stock: u32::try_from(stock.max(0)).unwrap_or(u32::MAX),
        window_start: row.try_get("window_start").unwrap_or(0),
        window_end: row.try_get("window_end").unwrap_or(0),
    })
}

#[async_trait]
impl ClaimRecordStore for SqlRecordStore {
    async fn insert_if_absent(&self, claim: &Claim) -> Result<InsertOutcome, StorageError> {
        let result = sqlx::query(self.insert_claim_sql())
            .bind(to_i64(claim.claim_id))
            .bind(to_i64(claim.resource_id))
            .bind(to_i64(claim.client_id))
            .bind(claim.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(if result.rows_affected() > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    async fn decrement_stock_if_positive(&self, resource_id: u64) -> Result<StockOutcome, StorageError> {
        let result = sqlx::query(DECREMENT_SQL)
            .bind(to_i64(resource_id))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(if result.rows_affected() > 0 {
            StockOutcome::Decremented
        } else {
            StockOutcome::InsufficientStock
        })
    }

    async fn persist_claim(&self, claim: &Claim) -> Result<InsertOutcome, StorageError> {
        let insert_sql = self.insert_claim_sql();
        let claim = claim.clone();

        self.with_transaction("persist_claim", move |conn| {
            Box::pin(async move {
                let inserted = sqlx::query(insert_sql)
                    .bind(to_i64(claim.claim_id))
                    .bind(to_i64(claim.resource_id))
                    .bind(to_i64(claim.client_id))
                    .bind(claim.created_at)
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
                if inserted.rows_affected() == 0 {
                    return Ok(InsertOutcome::AlreadyExists);
                }

                let decremented = sqlx::query(DECREMENT_SQL)
                    .bind(to_i64(claim.resource_id))
                    .execute(&mut *conn)
                    .await
                    .map_err(backend)?;
                if decremented.rows_affected() == 0 {
                    // Admission already reserved the unit; a floor hit here only
                    // means the durable stock was seeded lower than the shared one.
                    debug!(claim_id = claim.claim_id, resource_id = claim.resource_id, "Durable stock already at zero");
                }
                Ok::<_, StorageError>(InsertOutcome::Inserted)
            })
        })
        .await
    }

    async fn find_claim(&self, claim_id: u64) -> Result<Option<Claim>, StorageError> {
        let row = sqlx::query("SELECT claim_id, resource_id, client_id, created_at FROM claims WHERE claim_id = ?")
            .bind(to_i64(claim_id))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(claim_from_row).transpose()
    }

    async fn find_resource(&self, resource_id: u64) -> Result<Option<Resource>, StorageError> {
        let row = sqlx::query(
            "SELECT resource_id, title, stock, window_start, window_end FROM claim_resources WHERE resource_id = ?",
        )
        .bind(to_i64(resource_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO claim_resources (resource_id, title, stock, window_start, window_end) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(resource_id) DO UPDATE SET \
                title = excluded.title, \
                stock = excluded.stock, \
                window_start = excluded.window_start, \
                window_end = excluded.window_end"
        } else {
            "INSERT INTO claim_resources (resource_id, title, stock, window_start, window_end) VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                title = VALUES(title), \
                stock = VALUES(stock), \
                window_start = VALUES(window_start), \
                window_end = VALUES(window_end)"
        };
        sqlx::query(sql)
            .bind(to_i64(resource.resource_id))
            .bind(resource.title.clone())
            .bind(i64::from(resource.stock))
            .bind(resource.window_start)
            .bind(resource.window_end)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn count_claims(&self, resource_id: u64) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM claims WHERE resource_id = ?")
            .bind(to_i64(resource_id))
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(to_u64(count))
    }
}
