//! Unified SQL storage implementations.
//!
//! Store structs are generic over the [`SqlDatabase`] backend; a macro per
//! store generates the trait implementation for each enabled backend,
//! eliminating duplication while keeping concrete pool and row types.

mod compliance_store;
mod dlq_store;
mod idempotency_store;
mod outbox_store;
mod saga_log_store;
mod session_store;

pub use compliance_store::{SqlConsentStore, SqlDsrStore};
pub use dlq_store::SqlDeadLetterStore;
pub use idempotency_store::SqlIdempotencyStore;
pub use outbox_store::SqlOutboxStore;
pub use saga_log_store::SqlSagaLogStore;
pub use session_store::SqlSessionStore;

use chrono::{DateTime, Utc};

use super::{Result, StorageError};

/// Trait for SQL database backends.
///
/// Abstracts over PostgreSQL and SQLite by providing the pool type and the
/// query rendering methods.
pub trait SqlDatabase: Send + Sync + 'static {
    /// The connection pool type for this database.
    type Pool: Clone + Send + Sync;

    fn build_select(stmt: sea_query::SelectStatement) -> String;

    fn build_insert(stmt: sea_query::InsertStatement) -> String;

    fn build_update(stmt: sea_query::UpdateStatement) -> String;

    fn build_delete(stmt: sea_query::DeleteStatement) -> String;
}

/// Timestamps are persisted as milliseconds since the epoch.
pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(StorageError::InvalidTimestamp(ms))
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

#[cfg(feature = "postgres")]
pub mod postgres {
    //! PostgreSQL database backend.

    use sea_query::PostgresQueryBuilder;
    use sqlx::PgPool;

    /// PostgreSQL database marker type.
    pub struct Postgres;

    impl super::SqlDatabase for Postgres {
        type Pool = PgPool;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_update(stmt: sea_query::UpdateStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(PostgresQueryBuilder)
        }
    }

    pub type PostgresOutboxStore = super::SqlOutboxStore<Postgres>;
    pub type PostgresDeadLetterStore = super::SqlDeadLetterStore<Postgres>;
    pub type PostgresSessionStore = super::SqlSessionStore<Postgres>;
    pub type PostgresSagaLogStore = super::SqlSagaLogStore<Postgres>;
    pub type PostgresConsentStore = super::SqlConsentStore<Postgres>;
    pub type PostgresDsrStore = super::SqlDsrStore<Postgres>;
    pub type PostgresIdempotencyStore = super::SqlIdempotencyStore<Postgres>;
}

#[cfg(feature = "sqlite")]
pub mod sqlite {
    //! SQLite database backend.

    use sea_query::SqliteQueryBuilder;
    use sqlx::SqlitePool;

    /// SQLite database marker type.
    pub struct Sqlite;

    impl super::SqlDatabase for Sqlite {
        type Pool = SqlitePool;

        fn build_select(stmt: sea_query::SelectStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_insert(stmt: sea_query::InsertStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_update(stmt: sea_query::UpdateStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }

        fn build_delete(stmt: sea_query::DeleteStatement) -> String {
            stmt.to_string(SqliteQueryBuilder)
        }
    }

    pub type SqliteOutboxStore = super::SqlOutboxStore<Sqlite>;
    pub type SqliteDeadLetterStore = super::SqlDeadLetterStore<Sqlite>;
    pub type SqliteSessionStore = super::SqlSessionStore<Sqlite>;
    pub type SqliteSagaLogStore = super::SqlSagaLogStore<Sqlite>;
    pub type SqliteConsentStore = super::SqlConsentStore<Sqlite>;
    pub type SqliteDsrStore = super::SqlDsrStore<Sqlite>;
    pub type SqliteIdempotencyStore = super::SqlIdempotencyStore<Sqlite>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let back = from_millis(to_millis(now)).unwrap();
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_opt_millis() {
        assert_eq!(opt_from_millis(None).unwrap(), None);
        assert!(opt_from_millis(Some(0)).unwrap().is_some());
    }
}
