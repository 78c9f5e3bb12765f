//! PulseWatch - HTTP uptime monitor
//!
//! Periodically probes registered endpoints, refusing any whose address
//! resolves into a private or loopback range, and records uptime and latency.

mod config;
mod db;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use probe::{Guard, ProbeSettings, Prober};
use scheduler::{Scheduler, SchedulerConfig};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pulsewatch=info".parse()?))
        .init();

    // Load configuration; a bad value stops startup
    let cfg = ServerConfig::load()?;
    tracing::info!(
        "Starting PulseWatch (interval={:?}, timeout={:?}, verify_tls={})",
        cfg.check_interval,
        cfg.http_timeout,
        cfg.verify_tls
    );
    if !cfg.verify_tls {
        tracing::warn!("TLS certificate verification is disabled for probes");
    }
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized ({} checks recorded)", store.count_checks()?);

    let prober = Prober::new(ProbeSettings {
        timeout: cfg.http_timeout,
        verify_tls: cfg.verify_tls,
    })?;
    let guard = Guard::new().resolve_timeout(cfg.http_timeout);

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        store.clone(),
        guard,
        prober,
        SchedulerConfig {
            interval: cfg.check_interval,
            max_concurrent_probes: cfg.max_concurrent_probes,
        },
    ));

    let runner = scheduler.clone();
    let scheduler_task = tokio::spawn(async move { runner.run().await });

    // Both the scheduler and the web server stop on the first shutdown signal
    let (stop_tx, mut stop_rx) = tokio::sync::broadcast::channel::<()>(1);
    let server = Server::new(cfg.http_port, store);
    let mut server_task = tokio::spawn(async move {
        server
            .start(async move {
                let _ = stop_rx.recv().await;
            })
            .await
    });

    let server_exited = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested");
            None
        }
        result = &mut server_task => Some(result),
    };

    scheduler.shutdown();
    let _ = stop_tx.send(());

    let server_result = match server_exited {
        Some(result) => result,
        None => server_task.await,
    };
    if let Err(e) = scheduler_task.await {
        tracing::error!("Scheduler task failed: {}", e);
    }

    match server_result {
        Ok(result) => result?,
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
