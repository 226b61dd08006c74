//! Database connection and query helpers.

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::Config;

/// SQLSTATE raised when row-level security or grants refuse a read.
const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// SQLSTATE raised when a bound value does not parse as the column type.
const INVALID_TEXT_REPRESENTATION: &str = "22P02";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    ConnectionError(#[from] sqlx::Error),
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &Config) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database connection is healthy.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// True when the database refused the query for permission reasons,
/// which in practice means a row-level security policy is misconfigured.
pub fn is_access_denied(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE),
        _ => false,
    }
}

/// True when a bound value failed to cast to the column type, e.g. a
/// session id that is not a uuid.
pub fn is_invalid_text(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some(INVALID_TEXT_REPRESENTATION),
        _ => false,
    }
}
