//! Durable storage.
//!
//! This module contains:
//! - `StorageError`: the error type every store surfaces
//! - `StorageConfig`: backend selection and pool sizing
//! - `schema`: table identifiers and DDL
//! - `sql`: unified store implementations over SQLite and PostgreSQL

pub mod schema;
pub mod sql;

use serde::Deserialize;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Invalid {field} value: {value}")]
    InvalidColumn { field: &'static str, value: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
}

/// Storage backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Postgres,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: String,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
        }
    }
}

/// Connect a SQLite pool and apply the schema.
///
/// An in-memory database is pinned to a single connection: each SQLite
/// connection to `:memory:` would otherwise open its own database.
#[cfg(feature = "sqlite")]
pub async fn connect_sqlite(config: &StorageConfig) -> Result<sqlx::SqlitePool> {
    let max_connections = if config.url.contains(":memory:") {
        1
    } else {
        config.max_connections
    };

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&config.url)
        .await?;
    schema::init_sqlite(&pool).await?;
    Ok(pool)
}

/// Connect a PostgreSQL pool and apply the schema.
#[cfg(feature = "postgres")]
pub async fn connect_postgres(config: &StorageConfig) -> Result<sqlx::PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    schema::init_postgres(&pool).await?;
    Ok(pool)
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_in_memory_sqlite() {
        let pool = connect_sqlite(&StorageConfig::default()).await.unwrap();
        // The schema is applied: core tables exist.
        for table in ["outbox_events", "sessions", "dsr_requests"] {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            sqlx::query(&sql).fetch_one(&pool).await.unwrap();
        }
    }
}
