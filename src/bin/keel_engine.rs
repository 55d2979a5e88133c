//! Keel engine process.
//!
//! Runs the background machinery: the outbox relay and the scheduled
//! reconciler. Lifecycle operations (sessions, sagas, consents) are library
//! calls made by the services embedding keel; this process is what keeps
//! their durable side effects flowing and their time-based transitions
//! firing.
//!
//! Wiring is explicit: every relay, job and subscriber below exists because
//! this startup routine registered it.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info};

use keel::bus::ChannelBus;
use keel::config::Config;
use keel::outbox::relay::OutboxRelay;
use keel::reconciler::jobs::{
    ConsentExpiryJob, DsrDeadlinesJob, ExpireSessionsJob, GcDeadLettersJob, GcIdempotencyJob,
    GcOutboxJob, GcRevokedTokensJob, SagaTimeoutsJob,
};
use keel::reconciler::Reconciler;
use keel::storage::StorageBackend;
use keel::utils::bootstrap::{init_tracing, ShutdownSignal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(std::env::args().nth(1).as_deref())?;
    info!(backend = ?config.storage.backend, "Keel engine starting");

    match config.storage.backend {
        #[cfg(feature = "sqlite")]
        StorageBackend::Sqlite => run_sqlite(config).await,
        #[cfg(feature = "postgres")]
        StorageBackend::Postgres => run_postgres(config).await,
        #[allow(unreachable_patterns)]
        other => Err(format!("storage backend {other:?} not compiled into this binary").into()),
    }
}

macro_rules! engine_main {
    ($fn_name:ident, $connect:path, $db:ty, $feature:literal) => {
        #[cfg(feature = $feature)]
        async fn $fn_name(config: Config) -> Result<(), Box<dyn std::error::Error>> {
            use keel::storage::sql::{
                SqlConsentStore, SqlDeadLetterStore, SqlDsrStore, SqlIdempotencyStore,
                SqlOutboxStore, SqlSagaLogStore, SqlSessionStore,
            };

            let pool = (|| async { $connect(&config.storage).await })
                .retry(ExponentialBuilder::default())
                .notify(|err, delay| {
                    error!(error = %err, retry_in = ?delay, "Database connection failed");
                })
                .await?;

            let outbox_store = Arc::new(SqlOutboxStore::<$db>::new(pool.clone()));
            let session_store = Arc::new(SqlSessionStore::<$db>::new(pool.clone()));
            let dead_letter_store = Arc::new(SqlDeadLetterStore::<$db>::new(pool.clone()));
            let saga_log_store = Arc::new(SqlSagaLogStore::<$db>::new(pool.clone()));
            let consent_store = Arc::new(SqlConsentStore::<$db>::new(pool.clone()));
            let dsr_store = Arc::new(SqlDsrStore::<$db>::new(pool.clone()));
            let idempotency_store = Arc::new(SqlIdempotencyStore::<$db>::new(pool.clone()));

            let shutdown = ShutdownSignal::new();
            let bus = Arc::new(ChannelBus::new());

            // Downstream delivery sink. Real deployments subscribe brokers
            // or projectors here; the engine always keeps one subscriber so
            // delivery has somewhere to land.
            let mut delivery_rx = bus.subscribe().await;
            let mut delivery_shutdown = shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = delivery_shutdown.changed() => break,
                        envelope = delivery_rx.recv() => {
                            let Some(envelope) = envelope else { break };
                            info!(
                                id = %envelope.id,
                                event_type = %envelope.event_type,
                                aggregate = %envelope.aggregate_id,
                                "Event delivered"
                            );
                        }
                    }
                }
            });

            let relay = OutboxRelay::new(
                Arc::clone(&outbox_store) as _,
                Arc::clone(&bus) as _,
                config.outbox.clone(),
                shutdown.subscribe(),
            );
            let relay_handle = tokio::spawn(relay.run());

            let mut reconciler = Reconciler::new();
            let job_handles = if config.reconciler.enabled {
                let r = &config.reconciler;
                reconciler
                    .register(
                        Arc::new(ExpireSessionsJob {
                            sessions: Arc::clone(&session_store) as _,
                            batch_size: r.sweep_batch_size,
                        }),
                        Duration::from_secs(r.expire_sessions_interval_secs),
                    )
                    .register(
                        Arc::new(GcRevokedTokensJob {
                            sessions: Arc::clone(&session_store) as _,
                        }),
                        Duration::from_secs(r.gc_revoked_tokens_interval_secs),
                    )
                    .register(
                        Arc::new(GcIdempotencyJob {
                            keys: Arc::clone(&idempotency_store) as _,
                        }),
                        Duration::from_secs(r.gc_idempotency_interval_secs),
                    )
                    .register(
                        Arc::new(SagaTimeoutsJob {
                            saga_log: Arc::clone(&saga_log_store) as _,
                            retention_days: r.saga_log_retention_days,
                        }),
                        Duration::from_secs(r.saga_timeouts_interval_secs),
                    )
                    .register(
                        Arc::new(GcDeadLettersJob {
                            dead_letters: Arc::clone(&dead_letter_store) as _,
                            retention_days: r.dead_letter_retention_days,
                        }),
                        Duration::from_secs(r.gc_dead_letters_interval_secs),
                    )
                    .register(
                        Arc::new(GcOutboxJob {
                            outbox: Arc::clone(&outbox_store) as _,
                            retention_days: r.outbox_retention_days,
                        }),
                        Duration::from_secs(r.gc_outbox_interval_secs),
                    )
                    .register(
                        Arc::new(ConsentExpiryJob {
                            consents: Arc::clone(&consent_store) as _,
                            warning_days: r.consent_warning_days,
                            batch_size: r.sweep_batch_size,
                        }),
                        Duration::from_secs(r.consent_expiry_interval_secs),
                    )
                    .register(
                        Arc::new(DsrDeadlinesJob {
                            dsr_requests: Arc::clone(&dsr_store) as _,
                            batch_size: r.sweep_batch_size,
                        }),
                        Duration::from_secs(r.dsr_deadlines_interval_secs),
                    );
                reconciler.spawn()
            } else {
                info!("Reconciler disabled by configuration");
                Vec::new()
            };

            info!(jobs = ?reconciler.job_names(), "Keel engine running");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown requested");

            shutdown.trigger();
            reconciler.shutdown();
            if let Err(e) = relay_handle.await {
                error!(error = %e, "Relay task panicked");
            }
            for handle in job_handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Reconciler task panicked");
                }
            }

            info!("Keel engine stopped");
            Ok(())
        }
    };
}

engine_main!(
    run_sqlite,
    keel::storage::connect_sqlite,
    keel::storage::sql::sqlite::Sqlite,
    "sqlite"
);
engine_main!(
    run_postgres,
    keel::storage::connect_postgres,
    keel::storage::sql::postgres::Postgres,
    "postgres"
);
