//! Unified SQL OutboxStore implementation.
//!
//! The producer-side `append_in_tx` takes the caller's transaction handle,
//! so an event can only ever be appended inside a transaction - pairing the
//! domain write and the event durably (appending outside a transaction is
//! unrepresentable, not just discouraged).

use std::marker::PhantomData;

use super::SqlDatabase;

/// SQL-based implementation of `OutboxStore`.
pub struct SqlOutboxStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlOutboxStore<DB> {
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }

    pub fn pool(&self) -> &DB::Pool {
        &self.pool
    }
}

/// Implement the outbox store for a specific SQL backend.
macro_rules! impl_outbox_store {
    ($db_type:ty, $sqlx_db:ty, $row_type:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlOutboxStore<$db_type> {
            /// Append one event inside the caller's transaction.
            pub async fn append_in_tx(
                tx: &mut sqlx::Transaction<'_, $sqlx_db>,
                event: &crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<()> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::Query;

                let payload = serde_json::to_string(&event.payload)?;
                let stmt = Query::insert()
                    .into_table(OutboxEvents::Table)
                    .columns([
                        OutboxEvents::Id,
                        OutboxEvents::AggregateType,
                        OutboxEvents::AggregateId,
                        OutboxEvents::EventType,
                        OutboxEvents::Payload,
                        OutboxEvents::Status,
                        OutboxEvents::RetryCount,
                        OutboxEvents::MaxRetries,
                        OutboxEvents::CreatedAt,
                    ])
                    .values_panic([
                        event.id.to_string().into(),
                        event.aggregate_type.clone().into(),
                        event.aggregate_id.clone().into(),
                        event.event_type.clone().into(),
                        payload.into(),
                        OutboxStatus::Pending.as_str().into(),
                        0.into(),
                        event.max_retries.into(),
                        crate::storage::sql::to_millis(event.created_at).into(),
                    ])
                    .to_owned();

                let sql = <$db_type>::build_insert(stmt);
                sqlx::query(&sql).execute(&mut **tx).await?;
                tracing::debug!(
                    id = %event.id,
                    event_type = %event.event_type,
                    "Event appended to outbox"
                );
                Ok(())
            }

            async fn fetch(&self, id: &str) -> crate::storage::Result<Option<crate::outbox::OutboxEvent>> {
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};

                let stmt = Query::select()
                    .columns([
                        OutboxEvents::Id,
                        OutboxEvents::AggregateType,
                        OutboxEvents::AggregateId,
                        OutboxEvents::EventType,
                        OutboxEvents::Payload,
                        OutboxEvents::Status,
                        OutboxEvents::RetryCount,
                        OutboxEvents::MaxRetries,
                        OutboxEvents::LastError,
                        OutboxEvents::ProcessedAt,
                        OutboxEvents::RetryAfter,
                        OutboxEvents::CreatedAt,
                    ])
                    .from(OutboxEvents::Table)
                    .and_where(Expr::col(OutboxEvents::Id).eq(id))
                    .to_owned();

                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.map(|r| Self::map_row(&r)).transpose()
            }

            fn map_row(row: &$row_type) -> crate::storage::Result<crate::outbox::OutboxEvent> {
                use crate::outbox::{OutboxEvent, OutboxStatus};
                use crate::storage::StorageError;
                use sqlx::Row;

                let id: String = row.try_get("id")?;
                let status: String = row.try_get("status")?;
                let payload: String = row.try_get("payload")?;

                Ok(OutboxEvent {
                    id: uuid::Uuid::parse_str(&id)?,
                    aggregate_type: row.try_get("aggregate_type")?,
                    aggregate_id: row.try_get("aggregate_id")?,
                    event_type: row.try_get("event_type")?,
                    payload: serde_json::from_str(&payload)?,
                    status: OutboxStatus::parse(&status).ok_or(StorageError::InvalidColumn {
                        field: "status",
                        value: status,
                    })?,
                    retry_count: row.try_get("retry_count")?,
                    max_retries: row.try_get("max_retries")?,
                    last_error: row.try_get("last_error")?,
                    processed_at: crate::storage::sql::opt_from_millis(row.try_get("processed_at")?)?,
                    retry_after: crate::storage::sql::opt_from_millis(row.try_get("retry_after")?)?,
                    created_at: crate::storage::sql::from_millis(row.try_get("created_at")?)?,
                })
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::outbox::OutboxStore for SqlOutboxStore<$db_type> {
            async fn claim_batch(
                &self,
                now: chrono::DateTime<chrono::Utc>,
                limit: u32,
            ) -> crate::storage::Result<Vec<crate::outbox::OutboxEvent>> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};
                use sqlx::Row;

                let now_ms = crate::storage::sql::to_millis(now);

                // Per aggregate, only the oldest unprocessed row is eligible:
                // later rows wait until every earlier sibling has completed or
                // dead-lettered. This is what gives consumers FIFO within one
                // aggregate. Ids are time-ordered, so id order is creation
                // order even within one millisecond.
                let select = format!(
                    "SELECT id, status FROM outbox_events o \
                     WHERE (o.status = 'PENDING' \
                            OR (o.status = 'FAILED' AND o.retry_after <= {now_ms})) \
                       AND NOT EXISTS (SELECT 1 FROM outbox_events p \
                            WHERE p.aggregate_type = o.aggregate_type \
                              AND p.aggregate_id = o.aggregate_id \
                              AND p.id < o.id \
                              AND p.status IN ('PENDING', 'PROCESSING', 'FAILED')) \
                     ORDER BY o.created_at ASC, o.id ASC \
                     LIMIT {limit}"
                );
                let candidates = sqlx::query(&select).fetch_all(&self.pool).await?;

                let mut claimed = Vec::with_capacity(candidates.len());
                for row in candidates {
                    let id: String = row.try_get("id")?;
                    let expected_status: String = row.try_get("status")?;

                    // CAS claim: the status column is the mutex between
                    // workers. Losing the swap means another worker won.
                    let stmt = Query::update()
                        .table(OutboxEvents::Table)
                        .value(OutboxEvents::Status, OutboxStatus::Processing.as_str())
                        .and_where(Expr::col(OutboxEvents::Id).eq(id.as_str()))
                        .and_where(Expr::col(OutboxEvents::Status).eq(expected_status.as_str()))
                        .to_owned();
                    let sql = <$db_type>::build_update(stmt);
                    let result = sqlx::query(&sql).execute(&self.pool).await?;
                    if result.rows_affected() == 0 {
                        continue;
                    }

                    if let Some(event) = self.fetch(&id).await? {
                        claimed.push(event);
                    }
                }

                Ok(claimed)
            }

            async fn mark_completed(
                &self,
                id: uuid::Uuid,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(OutboxEvents::Table)
                    .value(OutboxEvents::Status, OutboxStatus::Completed.as_str())
                    .value(OutboxEvents::ProcessedAt, crate::storage::sql::to_millis(now))
                    .and_where(Expr::col(OutboxEvents::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn mark_failed(
                &self,
                id: uuid::Uuid,
                error: &str,
                retry_after: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(OutboxEvents::Table)
                    .value(OutboxEvents::Status, OutboxStatus::Failed.as_str())
                    .value(
                        OutboxEvents::RetryCount,
                        Expr::col(OutboxEvents::RetryCount).add(1),
                    )
                    .value(OutboxEvents::LastError, error)
                    .value(
                        OutboxEvents::RetryAfter,
                        crate::storage::sql::to_millis(retry_after),
                    )
                    .and_where(Expr::col(OutboxEvents::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn move_to_dead_letter(
                &self,
                event: &crate::outbox::OutboxEvent,
                error: &str,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use crate::dlq::DeadLetterStatus;
                use crate::storage::schema::{DeadLetterEvents, OutboxEvents};
                use sea_query::{Expr, Query};

                let now_ms = crate::storage::sql::to_millis(now);
                let payload = serde_json::to_string(&event.payload)?;

                let mut tx = self.pool.begin().await?;

                let insert = Query::insert()
                    .into_table(DeadLetterEvents::Table)
                    .columns([
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
                        DeadLetterEvents::CreatedAt,
                    ])
                    .values_panic([
                        crate::ids::new_id().to_string().into(),
                        event.id.to_string().into(),
                        event.aggregate_type.clone().into(),
                        event.aggregate_id.clone().into(),
                        event.event_type.clone().into(),
                        payload.into(),
                        error.into(),
                        (event.retry_count + 1).into(),
                        DeadLetterStatus::Unresolved.as_str().into(),
                        crate::storage::sql::to_millis(
                            event.retry_after.unwrap_or(event.created_at),
                        )
                        .into(),
                        now_ms.into(),
                    ])
                    .to_owned();
                let sql = <$db_type>::build_insert(insert);
                sqlx::query(&sql).execute(&mut *tx).await?;

                let delete = Query::delete()
                    .from_table(OutboxEvents::Table)
                    .and_where(Expr::col(OutboxEvents::Id).eq(event.id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_delete(delete);
                sqlx::query(&sql).execute(&mut *tx).await?;

                tx.commit().await?;
                Ok(())
            }

            async fn release(&self, id: uuid::Uuid) -> crate::storage::Result<()> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(OutboxEvents::Table)
                    .value(OutboxEvents::Status, OutboxStatus::Pending.as_str())
                    .and_where(Expr::col(OutboxEvents::Id).eq(id.to_string()))
                    .and_where(
                        Expr::col(OutboxEvents::Status).eq(OutboxStatus::Processing.as_str()),
                    )
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn release_stale(&self) -> crate::storage::Result<u64> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(OutboxEvents::Table)
                    .value(OutboxEvents::Status, OutboxStatus::Pending.as_str())
                    .and_where(
                        Expr::col(OutboxEvents::Status).eq(OutboxStatus::Processing.as_str()),
                    )
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }

            async fn delete_completed_before(
                &self,
                cutoff: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use crate::outbox::OutboxStatus;
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Expr, Query};

                let stmt = Query::delete()
                    .from_table(OutboxEvents::Table)
                    .and_where(
                        Expr::col(OutboxEvents::Status).eq(OutboxStatus::Completed.as_str()),
                    )
                    .and_where(
                        Expr::col(OutboxEvents::ProcessedAt)
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
            ) -> crate::storage::Result<Option<crate::outbox::OutboxEvent>> {
                self.fetch(&id.to_string()).await
            }

            async fn count_by_status(
                &self,
                status: crate::outbox::OutboxStatus,
            ) -> crate::storage::Result<i64> {
                use crate::storage::schema::OutboxEvents;
                use sea_query::{Alias, Expr, Query};
                use sqlx::Row;

                let stmt = Query::select()
                    .expr_as(Expr::cust("COUNT(*)"), Alias::new("count"))
                    .from(OutboxEvents::Table)
                    .and_where(Expr::col(OutboxEvents::Status).eq(status.as_str()))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
                Ok(row.try_get("count")?)
            }
        }
    };
}

impl_outbox_store!(
    crate::storage::sql::postgres::Postgres,
    sqlx::Postgres,
    sqlx::postgres::PgRow,
    "postgres"
);
impl_outbox_store!(
    crate::storage::sql::sqlite::Sqlite,
    sqlx::Sqlite,
    sqlx::sqlite::SqliteRow,
    "sqlite"
);

#[cfg(all(test, feature = "sqlite"))]
mod sqlite_tests {
    use chrono::{Duration, Utc};
    use sqlx::sqlite::SqlitePoolOptions;

    use super::SqlOutboxStore;
    use crate::outbox::{NewOutboxEvent, OutboxStatus, OutboxStore};
    use crate::storage::schema;
    use crate::storage::sql::sqlite::{Sqlite, SqliteOutboxStore};

    async fn create_store() -> SqliteOutboxStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        schema::init_sqlite(&pool).await.unwrap();
        SqlOutboxStore::new(pool)
    }

    async fn append(store: &SqliteOutboxStore, event: NewOutboxEvent) {
        let mut tx = store.pool().begin().await.unwrap();
        SqlOutboxStore::<Sqlite>::append_in_tx(&mut tx, &event)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    fn event_for(aggregate_id: &str, event_type: &str) -> NewOutboxEvent {
        NewOutboxEvent::new("session", aggregate_id, event_type, serde_json::json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_append_and_claim() {
        let store = create_store().await;
        let event = event_for("agg-1", "SESSION_CREATED");
        let id = event.id;
        append(&store, event).await;

        let claimed = store.claim_batch(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, OutboxStatus::Processing);
        assert_eq!(claimed[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_claimed_rows_are_not_reclaimed() {
        let store = create_store().await;
        append(&store, event_for("agg-1", "SESSION_CREATED")).await;

        let first = store.claim_batch(Utc::now(), 10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim_batch(Utc::now(), 10).await.unwrap();
        assert!(second.is_empty(), "processing rows must not be reclaimed");
    }

    #[tokio::test]
    async fn test_one_claim_per_aggregate_preserves_fifo() {
        let store = create_store().await;
        append(&store, event_for("agg-1", "FIRST")).await;
        append(&store, event_for("agg-1", "SECOND")).await;
        append(&store, event_for("agg-2", "OTHER")).await;

        let claimed = store.claim_batch(Utc::now(), 10).await.unwrap();
        let types: Vec<&str> = claimed.iter().map(|e| e.event_type.as_str()).collect();
        // agg-1's SECOND must wait for FIRST; agg-2 is independent.
        assert_eq!(types, vec!["FIRST", "OTHER"]);
    }

    #[tokio::test]
    async fn test_later_event_waits_for_failed_sibling() {
        let store = create_store().await;
        let first = event_for("agg-1", "FIRST");
        let first_id = first.id;
        append(&store, first).await;
        append(&store, event_for("agg-1", "SECOND")).await;

        let claimed = store.claim_batch(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        store
            .mark_failed(first_id, "bus down", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        // FIRST is failed and awaiting retry; SECOND stays blocked.
        let claimed = store.claim_batch(Utc::now(), 10).await.unwrap();
        assert!(claimed.is_empty());

        // Once the backoff elapses, FIRST itself is claimable again.
        let claimed = store
            .claim_batch(Utc::now() + Duration::hours(2), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first_id);
        assert_eq!(claimed[0].retry_count, 1);
        assert_eq!(claimed[0].last_error.as_deref(), Some("bus down"));
    }

    #[tokio::test]
    async fn test_mark_completed_sets_processed_at() {
        let store = create_store().await;
        let event = event_for("agg-1", "SESSION_CREATED");
        let id = event.id;
        append(&store, event).await;

        store.claim_batch(Utc::now(), 10).await.unwrap();
        let now = Utc::now();
        store.mark_completed(id, now).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Completed);
        let processed_at = stored.processed_at.expect("processed_at set on completion");
        assert_eq!(processed_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_move_to_dead_letter_removes_outbox_row() {
        let store = create_store().await;
        let event = event_for("agg-1", "SESSION_CREATED");
        let id = event.id;
        append(&store, event).await;

        let claimed = store.claim_batch(Utc::now(), 10).await.unwrap();
        store
            .move_to_dead_letter(&claimed[0], "gave up", Utc::now())
            .await
            .unwrap();

        assert!(store.get(id).await.unwrap().is_none());
        use sqlx::Row;
        let row = sqlx::query("SELECT original_outbox_id, status, last_error FROM dead_letter_events")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("original_outbox_id"), id.to_string());
        assert_eq!(row.get::<String, _>("status"), "UNRESOLVED");
        assert_eq!(row.get::<String, _>("last_error"), "gave up");
    }

    #[tokio::test]
    async fn test_release_returns_row_to_pending() {
        let store = create_store().await;
        let event = event_for("agg-1", "SESSION_CREATED");
        let id = event.id;
        append(&store, event).await;

        store.claim_batch(Utc::now(), 10).await.unwrap();
        store.release(id).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn test_gc_only_touches_old_completed_rows() {
        let store = create_store().await;
        let old = event_for("agg-1", "OLD");
        let old_id = old.id;
        append(&store, old).await;
        let fresh = event_for("agg-2", "FRESH");
        let fresh_id = fresh.id;
        append(&store, fresh).await;

        store.claim_batch(Utc::now(), 10).await.unwrap();
        let long_ago = Utc::now() - Duration::days(10);
        store.mark_completed(old_id, long_ago).await.unwrap();
        store.mark_completed(fresh_id, Utc::now()).await.unwrap();

        let deleted = store
            .delete_completed_before(Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(old_id).await.unwrap().is_none());
        assert!(store.get(fresh_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_batch_limit_is_respected() {
        let store = create_store().await;
        for i in 0..5 {
            append(&store, event_for(&format!("agg-{i}"), "E")).await;
        }

        let claimed = store.claim_batch(Utc::now(), 3).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(
            store.count_by_status(OutboxStatus::Pending).await.unwrap(),
            2
        );
    }
}
