//! Unified SQL SagaLogStore implementation.

use std::marker::PhantomData;

use crate::storage::schema::SagaLog;

use super::SqlDatabase;

/// SQL-based implementation of `SagaLogStore`.
pub struct SqlSagaLogStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlSagaLogStore<DB> {
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

/// Implement the saga log store for a specific SQL backend.
macro_rules! impl_saga_log_store {
    ($db_type:ty, $row_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlSagaLogStore<$db_type> {
            fn map_row(row: &$row_type) -> crate::storage::Result<crate::saga::SagaLogEntry> {
                use crate::saga::{SagaLogEntry, SagaLogStatus};
                use crate::storage::StorageError;
                use sqlx::Row;

                let id: String = row.try_get("id")?;
                let status: String = row.try_get("status")?;

                Ok(SagaLogEntry {
                    id: uuid::Uuid::parse_str(&id)?,
                    name: row.try_get("name")?,
                    status: SagaLogStatus::parse(&status).ok_or(StorageError::InvalidColumn {
                        field: "status",
                        value: status,
                    })?,
                    error: row.try_get("error")?,
                    started_at: crate::storage::sql::from_millis(row.try_get("started_at")?)?,
                    timeout_at: crate::storage::sql::from_millis(row.try_get("timeout_at")?)?,
                    completed_at: crate::storage::sql::opt_from_millis(
                        row.try_get("completed_at")?,
                    )?,
                })
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::saga::SagaLogStore for SqlSagaLogStore<$db_type> {
            async fn insert(
                &self,
                entry: &crate::saga::SagaLogEntry,
            ) -> crate::storage::Result<()> {
                use sea_query::Query;

                let stmt = Query::insert()
                    .into_table(SagaLog::Table)
                    .columns([
                        SagaLog::Id,
                        SagaLog::Name,
                        SagaLog::Status,
                        SagaLog::Error,
                        SagaLog::StartedAt,
                        SagaLog::TimeoutAt,
                        SagaLog::CompletedAt,
                    ])
                    .values_panic([
                        entry.id.to_string().into(),
                        entry.name.clone().into(),
                        entry.status.as_str().into(),
                        entry.error.clone().into(),
                        crate::storage::sql::to_millis(entry.started_at).into(),
                        crate::storage::sql::to_millis(entry.timeout_at).into(),
                        entry
                            .completed_at
                            .map(crate::storage::sql::to_millis)
                            .into(),
                    ])
                    .to_owned();
                let sql = <$db_type>::build_insert(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn mark_terminal(
                &self,
                id: uuid::Uuid,
                status: crate::saga::SagaLogStatus,
                error: Option<&str>,
                completed_at: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(SagaLog::Table)
                    .value(SagaLog::Status, status.as_str())
                    .value(SagaLog::Error, error)
                    .value(
                        SagaLog::CompletedAt,
                        crate::storage::sql::to_millis(completed_at),
                    )
                    .and_where(Expr::col(SagaLog::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn mark_timed_out(
                &self,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use crate::saga::SagaLogStatus;
                use sea_query::{Expr, Query};

                let now_ms = crate::storage::sql::to_millis(now);
                let stmt = Query::update()
                    .table(SagaLog::Table)
                    .value(SagaLog::Status, SagaLogStatus::TimedOut.as_str())
                    .value(SagaLog::Error, "saga deadline exceeded")
                    .value(SagaLog::CompletedAt, now_ms)
                    .and_where(Expr::col(SagaLog::Status).eq(SagaLogStatus::Running.as_str()))
                    .and_where(Expr::col(SagaLog::TimeoutAt).lt(now_ms))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }

            async fn purge_terminal_before(
                &self,
                cutoff: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use crate::saga::SagaLogStatus;
                use sea_query::{Expr, Query};

                let stmt = Query::delete()
                    .from_table(SagaLog::Table)
                    .and_where(Expr::col(SagaLog::Status).ne(SagaLogStatus::Running.as_str()))
                    .and_where(
                        Expr::col(SagaLog::CompletedAt)
                            .lt(crate::storage::sql::to_millis(cutoff)),
                    )
                    .to_owned();
                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }

            async fn get(
                &self,
                id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::saga::SagaLogEntry>> {
                use sea_query::{Expr, Query};

                let stmt = Query::select()
                    .columns([
                        SagaLog::Id,
                        SagaLog::Name,
                        SagaLog::Status,
                        SagaLog::Error,
                        SagaLog::StartedAt,
                        SagaLog::TimeoutAt,
                        SagaLog::CompletedAt,
                    ])
                    .from(SagaLog::Table)
                    .and_where(Expr::col(SagaLog::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.map(|r| Self::map_row(&r)).transpose()
            }

            async fn count_running(&self) -> crate::storage::Result<i64> {
                use crate::saga::SagaLogStatus;
                use sea_query::{Alias, Expr, Query};
                use sqlx::Row;

                let stmt = Query::select()
                    .expr_as(Expr::cust("COUNT(*)"), Alias::new("count"))
                    .from(SagaLog::Table)
                    .and_where(Expr::col(SagaLog::Status).eq(SagaLogStatus::Running.as_str()))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
                Ok(row.try_get("count")?)
            }
        }
    };
}

impl_saga_log_store!(
    crate::storage::sql::postgres::Postgres,
    sqlx::postgres::PgRow,
    "postgres"
);
impl_saga_log_store!(
    crate::storage::sql::sqlite::Sqlite,
    sqlx::sqlite::SqliteRow,
    "sqlite"
);
