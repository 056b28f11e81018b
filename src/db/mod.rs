//! Database module
//!
//! PostgreSQL pool management plus the serializable-transaction helper every
//! engine operation runs under.

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;

use crate::config::AppConfig;

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        tracing::info!(
            max = config.db_max_connections,
            min = config.db_min_connections,
            acquire_timeout_secs = config.db_acquire_timeout_secs,
            "connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .min_connections(config.db_min_connections)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        tracing::info!(size = pool.size(), idle = pool.num_idle(), "database pool established");

        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

/// Begin a transaction at SERIALIZABLE isolation.
///
/// Matching, cancellation and amendment each run inside exactly one of these;
/// serialization failures abort and surface to the caller for retry.
pub async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}
