//! Unified SQL IdempotencyStore implementation.

use std::marker::PhantomData;

use crate::storage::schema::IdempotencyKeys;

use super::SqlDatabase;

/// SQL-based implementation of `IdempotencyStore`.
pub struct SqlIdempotencyStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlIdempotencyStore<DB> {
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

/// Implement the idempotency store for a specific SQL backend.
macro_rules! impl_idempotency_store {
    ($db_type:ty, $qb:expr, $feature:literal) => {
        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::outbox::consumer::IdempotencyStore for SqlIdempotencyStore<$db_type> {
            async fn seen(&self, key: &str) -> crate::storage::Result<bool> {
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;

                let (sql, values) = Query::select()
                    .column(IdempotencyKeys::Key)
                    .from(IdempotencyKeys::Table)
                    .and_where(Expr::col(IdempotencyKeys::Key).eq(key))
                    .build_sqlx($qb);
                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&self.pool)
                    .await?;
                Ok(row.is_some())
            }

            async fn record(
                &self,
                key: &str,
                expires_at: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use sea_query::{OnConflict, Query};
                use sea_query_binder::SqlxBinder;

                let (sql, values) = Query::insert()
                    .into_table(IdempotencyKeys::Table)
                    .columns([IdempotencyKeys::Key, IdempotencyKeys::ExpiresAt])
                    .values_panic([
                        key.into(),
                        crate::storage::sql::to_millis(expires_at).into(),
                    ])
                    .on_conflict(
                        OnConflict::column(IdempotencyKeys::Key)
                            .do_nothing()
                            .to_owned(),
                    )
                    .build_sqlx($qb);
                sqlx::query_with(&sql, values).execute(&self.pool).await?;
                Ok(())
            }

            async fn purge_expired(
                &self,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use sea_query::{Expr, Query};

                let stmt = Query::delete()
                    .from_table(IdempotencyKeys::Table)
                    .and_where(
                        Expr::col(IdempotencyKeys::ExpiresAt)
                            .lt(crate::storage::sql::to_millis(now)),
                    )
                    .to_owned();
                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }
        }
    };
}

impl_idempotency_store!(
    crate::storage::sql::postgres::Postgres,
    sea_query::PostgresQueryBuilder,
    "postgres"
);
impl_idempotency_store!(
    crate::storage::sql::sqlite::Sqlite,
    sea_query::SqliteQueryBuilder,
    "sqlite"
);
