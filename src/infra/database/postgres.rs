//! PostgreSQL transaction store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

use crate::domain::{
    AppError, PaginatedResponse, StoreError, Transaction, TransactionMutation, TransactionStatus,
    TransactionStore, ValidationError,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// PostgreSQL transaction store with connection pooling
pub struct PostgresStore {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = "reference, gateway_transaction_id, amount, currency, status, \
     action, delivery_attempts, last_delivery_error, idempotency_token, version, \
     created_at, updated_at";

impl PostgresStore {
    /// Create a new store with custom pool configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new store with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction, AppError> {
        let status_str: String = row.get("status");
        let action_str: String = row.get("action");

        Ok(Transaction {
            reference: row.get("reference"),
            gateway_transaction_id: row.get("gateway_transaction_id"),
            amount: row.get("amount"),
            currency: row.get("currency"),
            status: status_str.parse().unwrap_or(TransactionStatus::Initiated),
            action: action_str.parse().unwrap_or_default(),
            delivery_attempts: row.get("delivery_attempts"),
            last_delivery_error: row.get("last_delivery_error"),
            idempotency_token: row.get("idempotency_token"),
            version: row.get("version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, tx), fields(reference = %tx.reference, amount = %tx.amount))]
    async fn create(&self, tx: &Transaction) -> Result<Transaction, AppError> {
        sqlx::query(
            r#"
            INSERT INTO transactions (
                reference, gateway_transaction_id, amount, currency, status,
                action, delivery_attempts, last_delivery_error,
                idempotency_token, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&tx.reference)
        .bind(&tx.gateway_transaction_id)
        .bind(tx.amount)
        .bind(&tx.currency)
        .bind(tx.status.as_str())
        .bind(tx.action.as_str())
        .bind(tx.delivery_attempts)
        .bind(&tx.last_delivery_error)
        .bind(&tx.idempotency_token)
        .bind(tx.version)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::from(e)))?;

        Ok(tx.clone())
    }

    #[instrument(skip(self))]
    async fn get(&self, reference: &str) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE reference = $1",
            SELECT_COLUMNS
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_by_gateway_transaction_id(
        &self,
        id: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE gateway_transaction_id = $1",
            SELECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, mutation))]
    async fn compare_and_swap(
        &self,
        reference: &str,
        expected_version: i32,
        mutation: &TransactionMutation,
    ) -> Result<Transaction, AppError> {
        let status = mutation.status.map(|s| s.as_str());
        let attempts_increment: i32 = if mutation.increment_delivery_attempts {
            1
        } else {
            0
        };
        let (set_error, error_value) = match &mutation.last_delivery_error {
            Some(value) => (true, value.clone()),
            None => (false, None),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE transactions
            SET status = COALESCE($3, status),
                gateway_transaction_id = COALESCE(gateway_transaction_id, $4),
                delivery_attempts = delivery_attempts + $5,
                last_delivery_error = CASE WHEN $6 THEN $7 ELSE last_delivery_error END,
                amount = COALESCE($8, amount),
                currency = COALESCE($9, currency),
                version = version + 1,
                updated_at = NOW()
            WHERE reference = $1 AND version = $2
            RETURNING {}
            "#,
            SELECT_COLUMNS
        ))
        .bind(reference)
        .bind(expected_version)
        .bind(status)
        .bind(&mutation.gateway_transaction_id)
        .bind(attempts_increment)
        .bind(set_error)
        .bind(&error_value)
        .bind(mutation.amount)
        .bind(&mutation.currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        match row {
            Some(row) => Self::row_to_transaction(&row),
            None => {
                // Distinguish a lost race from a missing row
                if self.get(reference).await?.is_some() {
                    Err(AppError::Store(StoreError::VersionConflict {
                        reference: reference.to_string(),
                        expected: expected_version,
                    }))
                } else {
                    Err(AppError::Store(StoreError::NotFound(reference.to_string())))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        limit: i64,
        cursor: Option<&str>,
    ) -> Result<PaginatedResponse<Transaction>, AppError> {
        let limit = limit.clamp(1, 100);
        // Fetch one extra to determine if there are more items
        let fetch_limit = limit + 1;

        let rows = match cursor {
            Some(cursor_ref) => {
                let cursor_row =
                    sqlx::query("SELECT created_at FROM transactions WHERE reference = $1")
                        .bind(cursor_ref)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

                let cursor_created_at: DateTime<Utc> = match cursor_row {
                    Some(row) => row.get("created_at"),
                    None => {
                        return Err(AppError::Validation(ValidationError::InvalidField {
                            field: "cursor".to_string(),
                            message: "Invalid cursor".to_string(),
                        }));
                    }
                };

                sqlx::query(&format!(
                    r#"
                    SELECT {}
                    FROM transactions
                    WHERE (created_at, reference) < ($1, $2)
                    ORDER BY created_at DESC, reference DESC
                    LIMIT $3
                    "#,
                    SELECT_COLUMNS
                ))
                .bind(cursor_created_at)
                .bind(cursor_ref)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?
            }
            None => sqlx::query(&format!(
                r#"
                SELECT {}
                FROM transactions
                ORDER BY created_at DESC, reference DESC
                LIMIT $1
                "#,
                SELECT_COLUMNS
            ))
            .bind(fetch_limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?,
        };

        let has_more = rows.len() > limit as usize;
        let transactions: Vec<Transaction> = rows
            .iter()
            .take(limit as usize)
            .map(Self::row_to_transaction)
            .collect::<Result<Vec<_>, _>>()?;

        let next_cursor = if has_more {
            transactions.last().map(|tx| tx.reference.clone())
        } else {
            None
        };

        Ok(PaginatedResponse::new(transactions, next_cursor, has_more))
    }

    #[instrument(skip(self))]
    async fn list_stale_pending(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE status = 'pending' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
            SELECT_COLUMNS
        ))
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self))]
    async fn list_undelivered(&self, limit: i64) -> Result<Vec<Transaction>, AppError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM transactions
            WHERE status IN ('paid', 'delivery_failed')
            ORDER BY updated_at ASC
            LIMIT $1
            "#,
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_transaction).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }
}
