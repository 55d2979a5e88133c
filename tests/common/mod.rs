//! Shared test harness: an in-memory SQLite database with every store, a
//! mock bus, and a relay factory.

#![allow(dead_code)]

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::watch;

use keel::bus::MockBus;
use keel::outbox::relay::{BatchOutcome, OutboxRelay};
use keel::outbox::OutboxConfig;
use keel::storage::schema;
use keel::storage::sql::sqlite::{
    Sqlite, SqliteConsentStore, SqliteDeadLetterStore, SqliteDsrStore, SqliteIdempotencyStore,
    SqliteOutboxStore, SqliteSagaLogStore, SqliteSessionStore,
};
use keel::storage::sql::{
    SqlConsentStore, SqlDeadLetterStore, SqlDsrStore, SqlIdempotencyStore, SqlOutboxStore,
    SqlSagaLogStore, SqlSessionStore,
};

pub struct Harness {
    pub pool: SqlitePool,
    pub outbox: Arc<SqliteOutboxStore>,
    pub sessions: Arc<SqliteSessionStore>,
    pub dead_letters: Arc<SqliteDeadLetterStore>,
    pub saga_log: Arc<SqliteSagaLogStore>,
    pub consents: Arc<SqliteConsentStore>,
    pub dsr_requests: Arc<SqliteDsrStore>,
    pub idempotency: Arc<SqliteIdempotencyStore>,
    pub bus: Arc<MockBus>,
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool");
        schema::init_sqlite(&pool).await.expect("schema");

        let (shutdown_tx, _) = watch::channel(false);

        Self {
            outbox: Arc::new(SqlOutboxStore::<Sqlite>::new(pool.clone())),
            sessions: Arc::new(SqlSessionStore::<Sqlite>::new(pool.clone())),
            dead_letters: Arc::new(SqlDeadLetterStore::<Sqlite>::new(pool.clone())),
            saga_log: Arc::new(SqlSagaLogStore::<Sqlite>::new(pool.clone())),
            consents: Arc::new(SqlConsentStore::<Sqlite>::new(pool.clone())),
            dsr_requests: Arc::new(SqlDsrStore::<Sqlite>::new(pool.clone())),
            idempotency: Arc::new(SqlIdempotencyStore::<Sqlite>::new(pool.clone())),
            bus: Arc::new(MockBus::new()),
            pool,
            shutdown_tx,
        }
    }

    /// Relay config tuned for tests: small batches, no redelivery backoff.
    pub fn relay_config(&self) -> OutboxConfig {
        OutboxConfig {
            batch_size: 10,
            retry_backoff_base_ms: 0,
            ..Default::default()
        }
    }

    pub fn relay(&self) -> OutboxRelay {
        OutboxRelay::new(
            Arc::clone(&self.outbox) as _,
            Arc::clone(&self.bus) as _,
            self.relay_config(),
            self.shutdown_tx.subscribe(),
        )
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run relay batches until the outbox has nothing claimable.
    pub async fn drain_relay(&self) -> BatchOutcome {
        let relay = self.relay();
        let mut total = BatchOutcome::default();
        loop {
            let outcome = relay.process_batch().await.expect("relay batch");
            if outcome.claimed == 0 {
                break;
            }
            total.claimed += outcome.claimed;
            total.published += outcome.published;
            total.retried += outcome.retried;
            total.dead_lettered += outcome.dead_lettered;
            total.released += outcome.released;
        }
        total
    }

    /// Count outbox rows carrying a given event type, any status.
    pub async fn count_outbox_events(&self, event_type: &str) -> i64 {
        use sqlx::Row;
        sqlx::query("SELECT COUNT(*) AS count FROM outbox_events WHERE event_type = ?")
            .bind(event_type)
            .fetch_one(&self.pool)
            .await
            .map(|row| row.get("count"))
            .unwrap_or(0)
    }
}
