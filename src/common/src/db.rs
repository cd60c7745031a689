//! Database connection and query helpers.

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::config::{Config, ConfigError};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not configured: {0}")]
    NotConfigured(#[from] ConfigError),

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
        let url = config.require_database_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(url)
            .await?;

        Ok(Self { pool })
    }

    /// Connect only when DATABASE_URL is configured.
    pub async fn connect_optional(config: &Config) -> Result<Option<Self>, DbError> {
        if config.database_url.is_none() {
            return Ok(None);
        }
        Self::connect(config).await.map(Some)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_optional_without_url() {
        let config = Config {
            database_url: None,
            db_max_connections: 1,
        };

        let db = Database::connect_optional(&config).await.unwrap();
        assert!(db.is_none());
    }

    #[tokio::test]
    async fn test_connect_requires_url() {
        let config = Config {
            database_url: None,
            db_max_connections: 1,
        };

        let result = Database::connect(&config).await;
        assert!(matches!(result, Err(DbError::NotConfigured(_))));
    }
}
