//! Unified SQL stores for consents and DSR requests.
//!
//! Both stores pair every observable transition with its outbox event in
//! one transaction, and guard reconciler-driven transitions with a
//! compare-and-swap on the current status or escalation level so each
//! transition emits exactly one event.

use std::marker::PhantomData;

use crate::storage::schema::{Consents, DsrRequests};

use super::SqlDatabase;

/// SQL-based implementation of `ConsentStore`.
pub struct SqlConsentStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlConsentStore<DB> {
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

/// SQL-based implementation of `DsrStore`.
pub struct SqlDsrStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlDsrStore<DB> {
    pub fn new(pool: DB::Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

fn consent_columns() -> [Consents; 6] {
    [
        Consents::Id,
        Consents::AccountId,
        Consents::DocumentType,
        Consents::Status,
        Consents::GrantedAt,
        Consents::ExpiresAt,
    ]
}

fn dsr_columns() -> [DsrRequests; 8] {
    [
        DsrRequests::Id,
        DsrRequests::AccountId,
        DsrRequests::RequestType,
        DsrRequests::Status,
        DsrRequests::DueDate,
        DsrRequests::EscalationLevel,
        DsrRequests::OpenedAt,
        DsrRequests::ClosedAt,
    ]
}

/// Implement both compliance stores for a specific SQL backend.
macro_rules! impl_compliance_stores {
    ($db_type:ty, $row_type:ty, $qb:expr, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlConsentStore<$db_type> {
            fn map_row(row: &$row_type) -> crate::storage::Result<crate::compliance::Consent> {
                use crate::compliance::{Consent, ConsentStatus};
                use crate::storage::StorageError;
                use sqlx::Row;

                let id: String = row.try_get("id")?;
                let account_id: String = row.try_get("account_id")?;
                let status: String = row.try_get("status")?;

                Ok(Consent {
                    id: uuid::Uuid::parse_str(&id)?,
                    account_id: uuid::Uuid::parse_str(&account_id)?,
                    document_type: row.try_get("document_type")?,
                    status: ConsentStatus::parse(&status).ok_or(StorageError::InvalidColumn {
                        field: "status",
                        value: status,
                    })?,
                    granted_at: crate::storage::sql::from_millis(row.try_get("granted_at")?)?,
                    expires_at: crate::storage::sql::opt_from_millis(row.try_get("expires_at")?)?,
                })
            }

            /// CAS a consent into `target` and append the event, in one
            /// transaction.
            async fn transition(
                &self,
                id: uuid::Uuid,
                expected: &[crate::compliance::ConsentStatus],
                target: crate::compliance::ConsentStatus,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use sea_query::{Expr, Query};

                let mut tx = self.pool.begin().await?;

                let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
                let stmt = Query::update()
                    .table(Consents::Table)
                    .value(Consents::Status, target.as_str())
                    .and_where(Expr::col(Consents::Id).eq(id.to_string()))
                    .and_where(Expr::col(Consents::Status).is_in(expected))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&mut *tx).await?;
                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(true)
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::compliance::ConsentStore for SqlConsentStore<$db_type> {
            async fn get(
                &self,
                account_id: uuid::Uuid,
                document_type: &str,
            ) -> crate::storage::Result<Option<crate::compliance::Consent>> {
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;

                let (sql, values) = Query::select()
                    .columns(consent_columns())
                    .from(Consents::Table)
                    .and_where(Expr::col(Consents::AccountId).eq(account_id.to_string()))
                    .and_where(Expr::col(Consents::DocumentType).eq(document_type))
                    .build_sqlx($qb);
                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&self.pool)
                    .await?;
                row.map(|r| Self::map_row(&r)).transpose()
            }

            async fn upsert_grant(
                &self,
                consent: &crate::compliance::Consent,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<()> {
                use sea_query::{OnConflict, Query};
                use sea_query_binder::SqlxBinder;

                let mut tx = self.pool.begin().await?;

                let (sql, values) = Query::insert()
                    .into_table(Consents::Table)
                    .columns(consent_columns())
                    .values_panic([
                        consent.id.to_string().into(),
                        consent.account_id.to_string().into(),
                        consent.document_type.clone().into(),
                        consent.status.as_str().into(),
                        crate::storage::sql::to_millis(consent.granted_at).into(),
                        consent
                            .expires_at
                            .map(crate::storage::sql::to_millis)
                            .into(),
                    ])
                    .on_conflict(
                        // Re-granting refreshes the existing row in place.
                        OnConflict::columns([Consents::AccountId, Consents::DocumentType])
                            .update_columns([
                                Consents::Status,
                                Consents::GrantedAt,
                                Consents::ExpiresAt,
                            ])
                            .to_owned(),
                    )
                    .build_sqlx($qb);
                sqlx::query_with(&sql, values).execute(&mut *tx).await?;

                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(())
            }

            async fn revoke(
                &self,
                account_id: uuid::Uuid,
                document_type: &str,
                _now: chrono::DateTime<chrono::Utc>,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use crate::compliance::ConsentStatus;
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;

                let mut tx = self.pool.begin().await?;

                let (sql, values) = Query::update()
                    .table(Consents::Table)
                    .value(Consents::Status, ConsentStatus::Revoked.as_str())
                    .and_where(Expr::col(Consents::AccountId).eq(account_id.to_string()))
                    .and_where(Expr::col(Consents::DocumentType).eq(document_type))
                    .and_where(Expr::col(Consents::Status).is_in([
                        ConsentStatus::Granted.as_str(),
                        ConsentStatus::ExpiringSoon.as_str(),
                    ]))
                    .build_sqlx($qb);
                let result = sqlx::query_with(&sql, values).execute(&mut *tx).await?;
                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(true)
            }

            async fn find_expiring(
                &self,
                now: chrono::DateTime<chrono::Utc>,
                horizon: chrono::DateTime<chrono::Utc>,
                limit: u32,
            ) -> crate::storage::Result<Vec<crate::compliance::Consent>> {
                use crate::compliance::ConsentStatus;
                use sea_query::{Expr, Order, Query};

                let stmt = Query::select()
                    .columns(consent_columns())
                    .from(Consents::Table)
                    .and_where(Expr::col(Consents::Status).eq(ConsentStatus::Granted.as_str()))
                    .and_where(Expr::col(Consents::ExpiresAt).is_not_null())
                    .and_where(Expr::col(Consents::ExpiresAt).gt(crate::storage::sql::to_millis(now)))
                    .and_where(
                        Expr::col(Consents::ExpiresAt)
                            .lte(crate::storage::sql::to_millis(horizon)),
                    )
                    .order_by(Consents::ExpiresAt, Order::Asc)
                    .limit(limit as u64)
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::map_row).collect()
            }

            async fn mark_expiring_soon(
                &self,
                id: uuid::Uuid,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use crate::compliance::ConsentStatus;
                self.transition(
                    id,
                    &[ConsentStatus::Granted],
                    ConsentStatus::ExpiringSoon,
                    event,
                )
                .await
            }

            async fn find_expired(
                &self,
                now: chrono::DateTime<chrono::Utc>,
                limit: u32,
            ) -> crate::storage::Result<Vec<crate::compliance::Consent>> {
                use crate::compliance::ConsentStatus;
                use sea_query::{Expr, Order, Query};

                let stmt = Query::select()
                    .columns(consent_columns())
                    .from(Consents::Table)
                    .and_where(Expr::col(Consents::Status).is_in([
                        ConsentStatus::Granted.as_str(),
                        ConsentStatus::ExpiringSoon.as_str(),
                    ]))
                    .and_where(Expr::col(Consents::ExpiresAt).is_not_null())
                    .and_where(
                        Expr::col(Consents::ExpiresAt).lte(crate::storage::sql::to_millis(now)),
                    )
                    .order_by(Consents::ExpiresAt, Order::Asc)
                    .limit(limit as u64)
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::map_row).collect()
            }

            async fn mark_expired(
                &self,
                id: uuid::Uuid,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use crate::compliance::ConsentStatus;
                self.transition(
                    id,
                    &[ConsentStatus::Granted, ConsentStatus::ExpiringSoon],
                    ConsentStatus::Expired,
                    event,
                )
                .await
            }
        }

        #[cfg(feature = $feature)]
        impl SqlDsrStore<$db_type> {
            fn map_row(row: &$row_type) -> crate::storage::Result<crate::compliance::DsrRequest> {
                use crate::compliance::{DsrRequest, DsrStatus, EscalationLevel};
                use crate::storage::StorageError;
                use sqlx::Row;

                let id: String = row.try_get("id")?;
                let account_id: String = row.try_get("account_id")?;
                let status: String = row.try_get("status")?;
                let level: String = row.try_get("escalation_level")?;

                Ok(DsrRequest {
                    id: uuid::Uuid::parse_str(&id)?,
                    account_id: uuid::Uuid::parse_str(&account_id)?,
                    request_type: row.try_get("request_type")?,
                    status: DsrStatus::parse(&status).ok_or(StorageError::InvalidColumn {
                        field: "status",
                        value: status,
                    })?,
                    due_date: crate::storage::sql::from_millis(row.try_get("due_date")?)?,
                    escalation_level: EscalationLevel::parse(&level).ok_or(
                        StorageError::InvalidColumn {
                            field: "escalation_level",
                            value: level,
                        },
                    )?,
                    opened_at: crate::storage::sql::from_millis(row.try_get("opened_at")?)?,
                    closed_at: crate::storage::sql::opt_from_millis(row.try_get("closed_at")?)?,
                })
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::compliance::DsrStore for SqlDsrStore<$db_type> {
            async fn insert(
                &self,
                request: &crate::compliance::DsrRequest,
            ) -> crate::storage::Result<()> {
                use sea_query::Query;
                use sea_query_binder::SqlxBinder;

                let (sql, values) = Query::insert()
                    .into_table(DsrRequests::Table)
                    .columns(dsr_columns())
                    .values_panic([
                        request.id.to_string().into(),
                        request.account_id.to_string().into(),
                        request.request_type.clone().into(),
                        request.status.as_str().into(),
                        crate::storage::sql::to_millis(request.due_date).into(),
                        request.escalation_level.as_str().into(),
                        crate::storage::sql::to_millis(request.opened_at).into(),
                        request
                            .closed_at
                            .map(crate::storage::sql::to_millis)
                            .into(),
                    ])
                    .build_sqlx($qb);
                sqlx::query_with(&sql, values).execute(&self.pool).await?;
                Ok(())
            }

            async fn get(
                &self,
                id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::compliance::DsrRequest>> {
                use sea_query::{Expr, Query};

                let stmt = Query::select()
                    .columns(dsr_columns())
                    .from(DsrRequests::Table)
                    .and_where(Expr::col(DsrRequests::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
                row.map(|r| Self::map_row(&r)).transpose()
            }

            async fn find_escalation_candidates(
                &self,
                horizon: chrono::DateTime<chrono::Utc>,
                limit: u32,
            ) -> crate::storage::Result<Vec<crate::compliance::DsrRequest>> {
                use crate::compliance::{DsrStatus, EscalationLevel};
                use sea_query::{Expr, Order, Query};

                let stmt = Query::select()
                    .columns(dsr_columns())
                    .from(DsrRequests::Table)
                    .and_where(Expr::col(DsrRequests::Status).is_in([
                        DsrStatus::Open.as_str(),
                        DsrStatus::InProgress.as_str(),
                    ]))
                    .and_where(
                        Expr::col(DsrRequests::EscalationLevel)
                            .ne(EscalationLevel::Overdue.as_str()),
                    )
                    .and_where(
                        Expr::col(DsrRequests::DueDate)
                            .lte(crate::storage::sql::to_millis(horizon)),
                    )
                    .order_by(DsrRequests::DueDate, Order::Asc)
                    .limit(limit as u64)
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                rows.iter().map(Self::map_row).collect()
            }

            async fn escalate(
                &self,
                id: uuid::Uuid,
                expected: crate::compliance::EscalationLevel,
                target: crate::compliance::EscalationLevel,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use crate::compliance::DsrStatus;
                use sea_query::{Expr, Query};

                let mut tx = self.pool.begin().await?;

                let stmt = Query::update()
                    .table(DsrRequests::Table)
                    .value(DsrRequests::EscalationLevel, target.as_str())
                    .and_where(Expr::col(DsrRequests::Id).eq(id.to_string()))
                    .and_where(
                        Expr::col(DsrRequests::EscalationLevel).eq(expected.as_str()),
                    )
                    .and_where(Expr::col(DsrRequests::Status).is_in([
                        DsrStatus::Open.as_str(),
                        DsrStatus::InProgress.as_str(),
                    ]))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&mut *tx).await?;
                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(true)
            }
        }
    };
}

impl_compliance_stores!(
    crate::storage::sql::postgres::Postgres,
    sqlx::postgres::PgRow,
    sea_query::PostgresQueryBuilder,
    "postgres"
);
impl_compliance_stores!(
    crate::storage::sql::sqlite::Sqlite,
    sqlx::sqlite::SqliteRow,
    sea_query::SqliteQueryBuilder,
    "sqlite"
);
