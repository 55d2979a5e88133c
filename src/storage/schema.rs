//! Database schema definitions.
//!
//! `Iden` enums give type-safe identifiers for query building; the DDL
//! constants create the tables and indexes. Timestamps are stored as
//! milliseconds since the epoch and identifiers as hyphenated UUID text
//! (time-ordered v7, so text order is creation order). Both dialects accept
//! the same DDL.

use sea_query::Iden;

use super::Result;

/// Outbox table schema.
#[derive(Iden)]
pub enum OutboxEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "aggregate_type"]
    AggregateType,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "retry_count"]
    RetryCount,
    #[iden = "max_retries"]
    MaxRetries,
    #[iden = "last_error"]
    LastError,
    #[iden = "processed_at"]
    ProcessedAt,
    #[iden = "retry_after"]
    RetryAfter,
    #[iden = "created_at"]
    CreatedAt,
}

/// Dead-letter table schema. Mirrors the outbox shape plus triage fields.
#[derive(Iden)]
pub enum DeadLetterEvents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "original_outbox_id"]
    OriginalOutboxId,
    #[iden = "aggregate_type"]
    AggregateType,
    #[iden = "aggregate_id"]
    AggregateId,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "last_error"]
    LastError,
    #[iden = "retry_count"]
    RetryCount,
    #[iden = "status"]
    Status,
    #[iden = "first_failed_at"]
    FirstFailedAt,
    #[iden = "resolved_at"]
    ResolvedAt,
    #[iden = "created_at"]
    CreatedAt,
}

/// Sessions table schema.
#[derive(Iden)]
pub enum Sessions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "device_id"]
    DeviceId,
    #[iden = "token_hash"]
    TokenHash,
    #[iden = "refresh_token_hash"]
    RefreshTokenHash,
    #[iden = "previous_refresh_token_hash"]
    PreviousRefreshTokenHash,
    #[iden = "ip_address"]
    IpAddress,
    #[iden = "user_agent"]
    UserAgent,
    #[iden = "expires_at"]
    ExpiresAt,
    #[iden = "is_active"]
    IsActive,
    #[iden = "revoked_at"]
    RevokedAt,
    #[iden = "revoked_reason"]
    RevokedReason,
    #[iden = "last_activity_at"]
    LastActivityAt,
    #[iden = "created_at"]
    CreatedAt,
}

/// Revoked-token deny list schema.
#[derive(Iden)]
pub enum RevokedTokens {
    Table,
    #[iden = "token_hash"]
    TokenHash,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// Saga lifecycle log schema.
#[derive(Iden)]
pub enum SagaLog {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "status"]
    Status,
    #[iden = "error"]
    Error,
    #[iden = "started_at"]
    StartedAt,
    #[iden = "timeout_at"]
    TimeoutAt,
    #[iden = "completed_at"]
    CompletedAt,
}

/// Consents table schema.
#[derive(Iden)]
pub enum Consents {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "document_type"]
    DocumentType,
    #[iden = "status"]
    Status,
    #[iden = "granted_at"]
    GrantedAt,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// DSR requests table schema.
#[derive(Iden)]
pub enum DsrRequests {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "account_id"]
    AccountId,
    #[iden = "request_type"]
    RequestType,
    #[iden = "status"]
    Status,
    #[iden = "due_date"]
    DueDate,
    #[iden = "escalation_level"]
    EscalationLevel,
    #[iden = "opened_at"]
    OpenedAt,
    #[iden = "closed_at"]
    ClosedAt,
}

/// Consumer idempotency keys schema.
#[derive(Iden)]
pub enum IdempotencyKeys {
    Table,
    #[iden = "key"]
    Key,
    #[iden = "expires_at"]
    ExpiresAt,
}

/// DDL applied at startup, one statement per entry.
pub const DDL: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS outbox_events (
    id TEXT PRIMARY KEY,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 5,
    last_error TEXT,
    processed_at BIGINT,
    retry_after BIGINT,
    created_at BIGINT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox_events(status, created_at) WHERE status = 'PENDING'",
    "CREATE INDEX IF NOT EXISTS idx_outbox_failed ON outbox_events(status, retry_after) WHERE status = 'FAILED'",
    "CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox_events(aggregate_type, aggregate_id)",
    r#"
CREATE TABLE IF NOT EXISTS dead_letter_events (
    id TEXT PRIMARY KEY,
    original_outbox_id TEXT NOT NULL,
    aggregate_type TEXT NOT NULL,
    aggregate_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    last_error TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'UNRESOLVED',
    first_failed_at BIGINT NOT NULL,
    resolved_at BIGINT,
    created_at BIGINT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_dead_letter_status ON dead_letter_events(status, created_at)",
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    device_id TEXT,
    token_hash TEXT NOT NULL UNIQUE,
    refresh_token_hash TEXT NOT NULL UNIQUE,
    previous_refresh_token_hash TEXT,
    ip_address TEXT,
    user_agent TEXT,
    expires_at BIGINT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    revoked_at BIGINT,
    revoked_reason TEXT,
    last_activity_at BIGINT NOT NULL,
    created_at BIGINT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_active ON sessions(account_id, is_active, expires_at) WHERE is_active = TRUE",
    "CREATE INDEX IF NOT EXISTS idx_sessions_previous_refresh ON sessions(previous_refresh_token_hash) WHERE previous_refresh_token_hash IS NOT NULL",
    r#"
CREATE TABLE IF NOT EXISTS revoked_tokens (
    token_hash TEXT PRIMARY KEY,
    expires_at BIGINT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_revoked_tokens_expiry ON revoked_tokens(expires_at)",
    r#"
CREATE TABLE IF NOT EXISTS saga_log (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'RUNNING',
    error TEXT,
    started_at BIGINT NOT NULL,
    timeout_at BIGINT NOT NULL,
    completed_at BIGINT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_saga_log_running ON saga_log(status, timeout_at) WHERE status = 'RUNNING'",
    r#"
CREATE TABLE IF NOT EXISTS consents (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    document_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'GRANTED',
    granted_at BIGINT NOT NULL,
    expires_at BIGINT,
    UNIQUE (account_id, document_type)
)"#,
    "CREATE INDEX IF NOT EXISTS idx_consents_expiry ON consents(status, expires_at) WHERE expires_at IS NOT NULL",
    r#"
CREATE TABLE IF NOT EXISTS dsr_requests (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    request_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'OPEN',
    due_date BIGINT NOT NULL,
    escalation_level TEXT NOT NULL DEFAULT 'NONE',
    opened_at BIGINT NOT NULL,
    closed_at BIGINT
)"#,
    "CREATE INDEX IF NOT EXISTS idx_dsr_due ON dsr_requests(status, due_date)",
    r#"
CREATE TABLE IF NOT EXISTS idempotency_keys (
    key TEXT PRIMARY KEY,
    expires_at BIGINT NOT NULL
)"#,
    "CREATE INDEX IF NOT EXISTS idx_idempotency_expiry ON idempotency_keys(expires_at)",
];

/// Apply the schema to a SQLite database.
#[cfg(feature = "sqlite")]
pub async fn init_sqlite(pool: &sqlx::SqlitePool) -> Result<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Schema initialized (SQLite)");
    Ok(())
}

/// Apply the schema to a PostgreSQL database.
#[cfg(feature = "postgres")]
pub async fn init_postgres(pool: &sqlx::PgPool) -> Result<()> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Schema initialized (PostgreSQL)");
    Ok(())
}
