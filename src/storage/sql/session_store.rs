//! Unified SQL SessionStore implementation.
//!
//! Every observable mutation (insert, rotate, revoke, cascade) pairs the
//! session write with its outbox event in one transaction. Token rotation
//! and revocation are compare-and-swap updates, so concurrent refreshes or
//! double revokes resolve to exactly one winner.

use std::marker::PhantomData;

use crate::storage::schema::Sessions;

use super::SqlDatabase;

/// SQL-based implementation of `SessionStore`.
pub struct SqlSessionStore<DB: SqlDatabase> {
    pool: DB::Pool,
    _marker: PhantomData<DB>,
}

impl<DB: SqlDatabase> SqlSessionStore<DB> {
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

fn session_columns() -> [Sessions; 14] {
    [
        Sessions::Id,
        Sessions::AccountId,
        Sessions::DeviceId,
        Sessions::TokenHash,
        Sessions::RefreshTokenHash,
        Sessions::PreviousRefreshTokenHash,
        Sessions::IpAddress,
        Sessions::UserAgent,
        Sessions::ExpiresAt,
        Sessions::IsActive,
        Sessions::RevokedAt,
        Sessions::RevokedReason,
        Sessions::LastActivityAt,
        Sessions::CreatedAt,
    ]
}

/// Implement the session store for a specific SQL backend.
macro_rules! impl_session_store {
    ($db_type:ty, $sqlx_db:ty, $row_type:ty, $qb:expr, $feature:literal) => {
        #[cfg(feature = $feature)]
        impl SqlSessionStore<$db_type> {
            fn map_row(row: &$row_type) -> crate::storage::Result<crate::session::Session> {
                use crate::session::Session;
                use sqlx::Row;

                let id: String = row.try_get("id")?;
                let account_id: String = row.try_get("account_id")?;
                let device_id: Option<String> = row.try_get("device_id")?;

                Ok(Session {
                    id: uuid::Uuid::parse_str(&id)?,
                    account_id: uuid::Uuid::parse_str(&account_id)?,
                    device_id: device_id
                        .map(|d| uuid::Uuid::parse_str(&d))
                        .transpose()?,
                    token_hash: row.try_get("token_hash")?,
                    refresh_token_hash: row.try_get("refresh_token_hash")?,
                    previous_refresh_token_hash: row.try_get("previous_refresh_token_hash")?,
                    ip_address: row.try_get("ip_address")?,
                    user_agent: row.try_get("user_agent")?,
                    expires_at: crate::storage::sql::from_millis(row.try_get("expires_at")?)?,
                    is_active: row.try_get("is_active")?,
                    revoked_at: crate::storage::sql::opt_from_millis(row.try_get("revoked_at")?)?,
                    revoked_reason: row.try_get("revoked_reason")?,
                    last_activity_at: crate::storage::sql::from_millis(
                        row.try_get("last_activity_at")?,
                    )?,
                    created_at: crate::storage::sql::from_millis(row.try_get("created_at")?)?,
                })
            }

            async fn find_one_where(
                &self,
                condition: sea_query::SimpleExpr,
            ) -> crate::storage::Result<Option<crate::session::Session>> {
                use sea_query::Query;
                use sea_query_binder::SqlxBinder;

                let (sql, values) = Query::select()
                    .columns(session_columns())
                    .from(Sessions::Table)
                    .and_where(condition)
                    .build_sqlx($qb);
                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&self.pool)
                    .await?;
                row.map(|r| Self::map_row(&r)).transpose()
            }

            /// Deny-list access tokens of the given sessions inside a
            /// transaction. Idempotent per hash.
            async fn deny_list_in_tx(
                tx: &mut sqlx::Transaction<'_, $sqlx_db>,
                tokens: &[crate::session::RevokedToken],
            ) -> crate::storage::Result<()> {
                use crate::storage::schema::RevokedTokens;
                use sea_query::{OnConflict, Query};

                for token in tokens {
                    let stmt = Query::insert()
                        .into_table(RevokedTokens::Table)
                        .columns([RevokedTokens::TokenHash, RevokedTokens::ExpiresAt])
                        .values_panic([
                            token.token_hash.clone().into(),
                            crate::storage::sql::to_millis(token.expires_at).into(),
                        ])
                        .on_conflict(
                            OnConflict::column(RevokedTokens::TokenHash)
                                .do_nothing()
                                .to_owned(),
                        )
                        .to_owned();
                    let sql = <$db_type>::build_insert(stmt);
                    sqlx::query(&sql).execute(&mut **tx).await?;
                }
                Ok(())
            }
        }

        #[cfg(feature = $feature)]
        #[async_trait::async_trait]
        impl crate::session::SessionStore for SqlSessionStore<$db_type> {
            async fn insert(
                &self,
                session: &crate::session::Session,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<()> {
                use sea_query::Query;
                use sea_query_binder::SqlxBinder;

                let mut tx = self.pool.begin().await?;

                let (sql, values) = Query::insert()
                    .into_table(Sessions::Table)
                    .columns(session_columns())
                    .values_panic([
                        session.id.to_string().into(),
                        session.account_id.to_string().into(),
                        session.device_id.map(|d| d.to_string()).into(),
                        session.token_hash.clone().into(),
                        session.refresh_token_hash.clone().into(),
                        session.previous_refresh_token_hash.clone().into(),
                        session.ip_address.clone().into(),
                        session.user_agent.clone().into(),
                        crate::storage::sql::to_millis(session.expires_at).into(),
                        session.is_active.into(),
                        session
                            .revoked_at
                            .map(crate::storage::sql::to_millis)
                            .into(),
                        session.revoked_reason.clone().into(),
                        crate::storage::sql::to_millis(session.last_activity_at).into(),
                        crate::storage::sql::to_millis(session.created_at).into(),
                    ])
                    .build_sqlx($qb);
                sqlx::query_with(&sql, values).execute(&mut *tx).await?;

                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(())
            }

            async fn get(
                &self,
                id: uuid::Uuid,
            ) -> crate::storage::Result<Option<crate::session::Session>> {
                use sea_query::Expr;
                self.find_one_where(Expr::col(Sessions::Id).eq(id.to_string()))
                    .await
            }

            async fn find_by_token_hash(
                &self,
                token_hash: &str,
            ) -> crate::storage::Result<Option<crate::session::Session>> {
                use sea_query::Expr;
                self.find_one_where(Expr::col(Sessions::TokenHash).eq(token_hash))
                    .await
            }

            async fn find_by_refresh_hash(
                &self,
                refresh_hash: &str,
            ) -> crate::storage::Result<Option<crate::session::Session>> {
                use sea_query::Expr;
                self.find_one_where(Expr::col(Sessions::RefreshTokenHash).eq(refresh_hash))
                    .await
            }

            async fn find_active_by_previous_refresh_hash(
                &self,
                refresh_hash: &str,
            ) -> crate::storage::Result<Option<crate::session::Session>> {
                use sea_query::Expr;
                self.find_one_where(
                    Expr::col(Sessions::PreviousRefreshTokenHash)
                        .eq(refresh_hash)
                        .and(Expr::col(Sessions::IsActive).eq(true)),
                )
                .await
            }

            async fn rotate(
                &self,
                id: uuid::Uuid,
                expected_refresh_hash: &str,
                rotation: &crate::session::SessionRotation,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;

                let mut tx = self.pool.begin().await?;

                let (sql, values) = Query::update()
                    .table(Sessions::Table)
                    .value(Sessions::TokenHash, rotation.token_hash.clone())
                    .value(Sessions::RefreshTokenHash, rotation.refresh_token_hash.clone())
                    .value(
                        Sessions::PreviousRefreshTokenHash,
                        rotation.previous_refresh_token_hash.clone(),
                    )
                    .value(
                        Sessions::ExpiresAt,
                        crate::storage::sql::to_millis(rotation.expires_at),
                    )
                    .value(
                        Sessions::LastActivityAt,
                        crate::storage::sql::to_millis(rotation.last_activity_at),
                    )
                    .and_where(Expr::col(Sessions::Id).eq(id.to_string()))
                    .and_where(Expr::col(Sessions::RefreshTokenHash).eq(expected_refresh_hash))
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

            async fn revoke(
                &self,
                id: uuid::Uuid,
                reason: &str,
                now: chrono::DateTime<chrono::Utc>,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<bool> {
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;
                use sqlx::Row;

                let mut tx = self.pool.begin().await?;

                let (sql, values) = Query::select()
                    .columns([Sessions::TokenHash, Sessions::ExpiresAt])
                    .from(Sessions::Table)
                    .and_where(Expr::col(Sessions::Id).eq(id.to_string()))
                    .and_where(Expr::col(Sessions::IsActive).eq(true))
                    .build_sqlx($qb);
                let Some(row) = sqlx::query_with(&sql, values)
                    .fetch_optional(&mut *tx)
                    .await?
                else {
                    tx.rollback().await?;
                    return Ok(false);
                };
                let tokens = vec![crate::session::RevokedToken {
                    token_hash: row.try_get("token_hash")?,
                    expires_at: crate::storage::sql::from_millis(row.try_get("expires_at")?)?,
                }];

                let stmt = Query::update()
                    .table(Sessions::Table)
                    .value(Sessions::IsActive, false)
                    .value(Sessions::RevokedAt, crate::storage::sql::to_millis(now))
                    .value(Sessions::RevokedReason, reason)
                    .and_where(Expr::col(Sessions::Id).eq(id.to_string()))
                    .and_where(Expr::col(Sessions::IsActive).eq(true))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&mut *tx).await?;
                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                Self::deny_list_in_tx(&mut tx, &tokens).await?;
                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(true)
            }

            async fn revoke_all_for_account(
                &self,
                account_id: uuid::Uuid,
                exclude: Option<uuid::Uuid>,
                reason: &str,
                now: chrono::DateTime<chrono::Utc>,
                event: crate::outbox::NewOutboxEvent,
            ) -> crate::storage::Result<u64> {
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;
                use sqlx::Row;

                let mut tx = self.pool.begin().await?;

                let mut select = Query::select()
                    .columns([Sessions::TokenHash, Sessions::ExpiresAt])
                    .from(Sessions::Table)
                    .and_where(Expr::col(Sessions::AccountId).eq(account_id.to_string()))
                    .and_where(Expr::col(Sessions::IsActive).eq(true))
                    .to_owned();
                if let Some(excluded) = exclude {
                    select.and_where(Expr::col(Sessions::Id).ne(excluded.to_string()));
                }
                let (sql, values) = select.build_sqlx($qb);
                let rows = sqlx::query_with(&sql, values).fetch_all(&mut *tx).await?;
                let mut tokens = Vec::with_capacity(rows.len());
                for row in &rows {
                    tokens.push(crate::session::RevokedToken {
                        token_hash: row.try_get("token_hash")?,
                        expires_at: crate::storage::sql::from_millis(row.try_get("expires_at")?)?,
                    });
                }

                // One statement flips the whole account.
                let mut update = Query::update()
                    .table(Sessions::Table)
                    .value(Sessions::IsActive, false)
                    .value(Sessions::RevokedAt, crate::storage::sql::to_millis(now))
                    .value(Sessions::RevokedReason, reason)
                    .and_where(Expr::col(Sessions::AccountId).eq(account_id.to_string()))
                    .and_where(Expr::col(Sessions::IsActive).eq(true))
                    .to_owned();
                if let Some(excluded) = exclude {
                    update.and_where(Expr::col(Sessions::Id).ne(excluded.to_string()));
                }
                let sql = <$db_type>::build_update(update);
                let result = sqlx::query(&sql).execute(&mut *tx).await?;

                Self::deny_list_in_tx(&mut tx, &tokens).await?;
                crate::storage::sql::SqlOutboxStore::<$db_type>::append_in_tx(&mut tx, &event)
                    .await?;
                tx.commit().await?;
                Ok(result.rows_affected())
            }

            async fn touch(
                &self,
                id: uuid::Uuid,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<()> {
                use sea_query::{Expr, Query};

                let stmt = Query::update()
                    .table(Sessions::Table)
                    .value(
                        Sessions::LastActivityAt,
                        crate::storage::sql::to_millis(now),
                    )
                    .and_where(Expr::col(Sessions::Id).eq(id.to_string()))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                sqlx::query(&sql).execute(&self.pool).await?;
                Ok(())
            }

            async fn count_active(
                &self,
                account_id: uuid::Uuid,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<i64> {
                use sea_query::{Alias, Expr, Query};
                use sqlx::Row;

                let stmt = Query::select()
                    .expr_as(Expr::cust("COUNT(*)"), Alias::new("count"))
                    .from(Sessions::Table)
                    .and_where(Expr::col(Sessions::AccountId).eq(account_id.to_string()))
                    .and_where(Expr::col(Sessions::IsActive).eq(true))
                    .and_where(Expr::col(Sessions::ExpiresAt).gt(crate::storage::sql::to_millis(now)))
                    .to_owned();
                let sql = <$db_type>::build_select(stmt);
                let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
                Ok(row.try_get("count")?)
            }

            async fn expire_batch(
                &self,
                now: chrono::DateTime<chrono::Utc>,
                limit: u32,
            ) -> crate::storage::Result<u64> {
                use sea_query::{Expr, Query};

                let now_ms = crate::storage::sql::to_millis(now);
                let batch = Query::select()
                    .column(Sessions::Id)
                    .from(Sessions::Table)
                    .and_where(Expr::col(Sessions::IsActive).eq(true))
                    .and_where(Expr::col(Sessions::ExpiresAt).lt(now_ms))
                    .limit(limit as u64)
                    .to_owned();

                let stmt = Query::update()
                    .table(Sessions::Table)
                    .value(Sessions::IsActive, false)
                    .value(Sessions::RevokedAt, now_ms)
                    .value(Sessions::RevokedReason, "expired")
                    .and_where(Expr::col(Sessions::Id).in_subquery(batch))
                    .to_owned();
                let sql = <$db_type>::build_update(stmt);
                let result = sqlx::query(&sql).execute(&self.pool).await?;
                Ok(result.rows_affected())
            }

            async fn is_token_revoked(&self, token_hash: &str) -> crate::storage::Result<bool> {
                use crate::storage::schema::RevokedTokens;
                use sea_query::{Expr, Query};
                use sea_query_binder::SqlxBinder;

                let (sql, values) = Query::select()
                    .column(RevokedTokens::TokenHash)
                    .from(RevokedTokens::Table)
                    .and_where(Expr::col(RevokedTokens::TokenHash).eq(token_hash))
                    .build_sqlx($qb);
                let row = sqlx::query_with(&sql, values)
                    .fetch_optional(&self.pool)
                    .await?;
                Ok(row.is_some())
            }

            async fn purge_revoked_before(
                &self,
                now: chrono::DateTime<chrono::Utc>,
            ) -> crate::storage::Result<u64> {
                use crate::storage::schema::RevokedTokens;
                use sea_query::{Expr, Query};

                let stmt = Query::delete()
                    .from_table(RevokedTokens::Table)
                    .and_where(
                        Expr::col(RevokedTokens::ExpiresAt)
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

impl_session_store!(
    crate::storage::sql::postgres::Postgres,
    sqlx::Postgres,
    sqlx::postgres::PgRow,
    sea_query::PostgresQueryBuilder,
    "postgres"
);
impl_session_store!(
    crate::storage::sql::sqlite::Sqlite,
    sqlx::Sqlite,
    sqlx::sqlite::SqliteRow,
    sea_query::SqliteQueryBuilder,
    "sqlite"
);
