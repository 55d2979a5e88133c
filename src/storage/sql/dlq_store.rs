//! Unified SQL DeadLetterStore implementation.

use std::marker::PhantomData;

use crate::storage::schema::DeadLetterEvents;

use super::SqlDatabase;

/// SQL-based implementation of `DeadLetterStore`.
pub struct SqlDeadLetterStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlDeadLetterStore<DB> {
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

fn dead_letter_columns() -> [DeadLetterEvents; 12] {
    [
        DeadLetterEvents::Id,
        DeadLetterEvents::OriginalOutboxId,
        DeadLetterEvents::AggregateType,
        DeadLetterEvents::AggregateId,
        DeadLetterEvents::EventType,
        DeadLetterEvents::Payload,
        DeadLetterEvents::LastError,
        DeadLetterEvents::RetryCount,
        DeadLetterEvents::Status,
        DeadLetterEvents::FirstFailedAt,
        DeadLetterEvents::ResolvedAt,
        DeadLetterEvents::CreatedAt,
    ]
}

/// Implement the dead-letter store for a specific SQL backend.
macro_rules! impl_dlq_store {
    ($db_type:ty, $sqlx_db:ty, $row_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlDeadLetterStore<$db_type> {
            fn map_row(row: &$row_type) -> crate::storage::Result<crate::dlq::DeadLetterEvent> {
                use crate::dlq::{DeadLetterEvent, DeadLetterStatus};
                use crate::storage::StorageError;
                use sqlx::Row;

                let id: String = row.try_get("id")?;
                let original: String = row.try_get("original_outbox_id")?;
                let status: String = row.try_get("status")?;
                let payload: String = row.try_get("payload")?;

                Ok(DeadLetterEvent {
                    id: uuid::Uuid::parse_str(&id)?,
                    original_outbox_id: uuid::Uuid::parse_str(&original)?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: serde_json::from_str(&payload)?,
                    last_error: row.try_get("last_error")?,
                    retry_count: row.try_get("retry_count")?,
                    status: DeadLetterStatus::parse(&status).ok_or(
                        StorageError::InvalidColumn {
                            field: "status",
                            value: status,
                        },
                    )?,
                    first_failed_at: crate::storage::sql::from_millis(
                        row.try_get("first_failed_at")?,
                    )?,
                    resolved_at: crate::storage::sql::opt_from_millis(
                        row.try_get("resolved_at")?,
                    )?,
                    created_at: crate::storage::sql::from_millis(row.try_get("created_at")?)?,
                })
            }

            /// CAS `UNRESOLVED → target`.
            async fn close(
                &self,
                id: uuid::Uuid,
                target: crate::dlq::DeadLetterStatus,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<bool> {
                use crate::dlq::DeadLetterStatus;
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(DeadLetterEvents::Table)
                    .value(DeadLetterEvents::Status, target.as_str())
                    .value(
                        DeadLetterEvents::ResolvedAt,
                        crate::storage::sql::to_millis(now),
                    )
                    .and_where(Expr::col(DeadLetterEvents::Id).eq(id.to_string()))
                    .and_where(
                        Expr::col(DeadLetterEvents::Status)
                            .eq(DeadLetterStatus::Unresolved.as_str()),
                    )
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected() > 0)
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::dlq::DeadLetterStore for SqlDeadLetterStore<$db_type> {
            async fn get(
                &self,
                id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::dlq::DeadLetterEvent>> {
                use sea_query::{Expr, Query};

                let stmt = Query::select()
                    .columns(dead_letter_columns())
                    .from(DeadLetterEvents::Table)
                    .and_where(Expr::col(DeadLetterEvents::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.map(|r| Self::map_row(&r)).transpose()
            }

            async fn list_unresolved(
                &self,
                limit: u32,
            ) -> crate::storage::Result<Vec<crate::dlq::DeadLetterEvent>> {
                use crate::dlq::DeadLetterStatus;
                use sea_query::{Expr, Order, Query};

                let stmt = Query::select()
                    .columns(dead_letter_columns())
                    .from(DeadLetterEvents::Table)
                    .and_where(
                        Expr::col(DeadLetterEvents::Status)
                            .eq(DeadLetterStatus::Unresolved.as_str()),
                    )
                    .order_by(DeadLetterEvents::CreatedAt, Order::Asc)
                    .limit(limit as u64)
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::map_row).collect()
            }

            async fn resolve(
                &self,
                id: uuid::Uuid,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<bool> {
                self.close(id, crate::dlq::DeadLetterStatus::Resolved, now).await
            }

            async fn ignore(
                &self,
                id: uuid::Uuid,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<bool> {
                self.close(id, crate::dlq::DeadLetterStatus::Ignored, now).await
            }

            async fn requeue(
                &self,
                id: uuid::Uuid,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<bool> {
                use crate::dlq::DeadLetterStatus;
                use crate::outbox::NewOutboxEvent;
                use sea_query::{Expr, Query};

                let Some(dead) = self.get(id).await? else {
                    return Ok(false);
                };
                if dead.status != DeadLetterStatus::Unresolved {
                    return Ok(false);
                }

                let mut tx = self.pool.begin().await?;

                // Re-enter the outbox under a fresh id and retry budget: the
                // requeue is a new delivery, not a replay of the old one.
                let event = NewOutboxEvent::new(
                    dead.aggregate_type.clone(),
                    dead.aggregate_id.clone(),
                    dead.event_type.clone(),
                    dead.payload.clone(),
                );
                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;

                let stmt = Query::update()
                    .table(DeadLetterEvents::Table)
                    .value(DeadLetterEvents::Status, DeadLetterStatus::Resolved.as_str())
                    .value(
                        DeadLetterEvents::ResolvedAt,
                        crate::storage::sql::to_millis(now),
                    )
                    .and_where(Expr::col(DeadLetterEvents::Id).eq(id.to_string()))
                    .and_where(
                        Expr::col(DeadLetterEvents::Status)
                            .eq(DeadLetterStatus::Unresolved.as_str()),
                    )
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&mut *tx).await?;
                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                tx.commit().await?;
                tracing::info!(dead_letter_id = %id, outbox_id = %event.id, "Dead letter requeued");
                Ok(true)
            }

            async fn purge_closed_before(
                &self,
                cutoff: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use crate::dlq::DeadLetterStatus;
                use sea_query::{Expr, Query};

                let stmt = Query::delete()
                    .from_table(DeadLetterEvents::Table)
                    .and_where(Expr::col(DeadLetterEvents::Status).is_in([
                        DeadLetterStatus::Resolved.as_str(),
                        DeadLetterStatus::Ignored.as_str(),
                    ]))
                    .and_where(
                        Expr::col(DeadLetterEvents::CreatedAt)
                            .lt(crate::storage::sql::to_millis(cutoff)),
                    )
                    .to_owned();
                let sql = <$db_type>::build_delete(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }

            async fn count_by_status(
                &self,
                status: crate::dlq::DeadLetterStatus,
            ) -> crate::storage::Result<i64> {
                use sea_query::{Alias, Expr, Query};
                use sqlx::Row;

                let stmt = Query::select()
                    .expr_as(Expr::cust("COUNT(*)"), Alias::new("count"))
                    .from(DeadLetterEvents::Table)
                    .and_where(Expr::col(DeadLetterEvents::Status).eq(status.as_str()))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
                Ok(row.try_get("count")?)
            }
        }
    };
}

impl_dlq_store!(
    crate::storage::sql::postgres::Postgres,
    sqlx::Postgres,
    sqlx::postgres::PgRow,
    "postgres"
);
impl_dlq_store!(
    crate::storage::sql::sqlite::Sqlite,
    sqlx::Sqlite,
    sqlx::sqlite::SqliteRow,
    "sqlite"
);
