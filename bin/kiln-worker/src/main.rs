//! kiln-worker – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Register a generation backend per kind.
//! 5. Start the dispatcher, the reconciler and the audit logger.
//! 6. Re-enqueue jobs interrupted by a previous run, then wait for
//!    SIGINT/SIGTERM and shut down gracefully.

mod config;
mod placeholder;

use std::sync::Arc;
use std::time::Duration;

use strum::IntoEnumIterator;
use tracing::info;

use kiln_core::{
    spawn_audit_logger, BackendRegistry, Dispatcher, DispatcherConfig, JobKind, JobQueues,
    KindPolicies, Reconciler, SqliteJobStore, SqliteLedger, TrackingQueue,
};

use crate::config::Config;
use crate::placeholder::PlaceholderBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: KILN_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kiln-worker starting");

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = Arc::new(SqliteJobStore::connect(&cfg.database_url).await?);
    let ledger = Arc::new(SqliteLedger::from_pool(store.pool().clone()).await?);
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Backends ────────────────────────────────────────────────────────────
    let mut backends = BackendRegistry::new();
    for kind in JobKind::iter() {
        backends.register(kind, Arc::new(PlaceholderBackend::new(kind)));
    }

    // ── 5. Dispatcher, reconciler, audit logger ────────────────────────────────
    let (queues, receivers) = JobQueues::new(cfg.queue_capacity);
    let tracking = TrackingQueue::new();
    let audit = spawn_audit_logger(tracking.subscribe());

    let dispatcher = Dispatcher::start(
        DispatcherConfig {
            workers_per_kind: cfg.workers_per_kind,
            policies: KindPolicies::standard(),
        },
        store.clone(),
        ledger.clone(),
        queues.clone(),
        receivers,
        backends,
        tracking.clone(),
    )?;
    info!(workers_per_kind = cfg.workers_per_kind, "dispatcher started");

    // ── 6. Recovery ────────────────────────────────────────────────────────────
    // Workers are already draining the queues, so re-enqueueing more jobs
    // than a queue's capacity cannot stall startup.
    Dispatcher::recover(store.as_ref(), &queues).await?;

    let (aux_shutdown_tx, aux_shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler = Reconciler::new(
        store.clone(),
        ledger.clone(),
        Duration::from_secs(cfg.retention_hours * 3600),
    )
    .spawn(
        Duration::from_secs(cfg.reconcile_interval_secs),
        aux_shutdown_rx,
    );

    // ── 7. Graceful shutdown ───────────────────────────────────────────────────
    shutdown_signal().await;

    dispatcher.shutdown().await;
    let _ = aux_shutdown_tx.send(true);
    let _ = reconciler.await;
    drop(tracking);
    let _ = audit.await;

    info!("kiln-worker stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
