use std::path::Path;

use anyhow::Context;
use tonic::transport::Server;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

mod config;
mod environment;
mod handle;
mod lifecycle_service;
mod manager;
mod registry;
mod restart;
mod supervisor;
mod watchdog;

use config::AfmConfig;
use registry::Registry;

/// Upper bound on waiting for children during shutdown, on top of the
/// per-app grace period.
const SHUTDOWN_SLACK: std::time::Duration = std::time::Duration::from_secs(5);

fn init_tracing(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_filter(filter());

    let file = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, "afm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Some((
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(filter()),
                guard,
            ))
        }
        Err(err) => {
            eprintln!("failed to create log dir {}: {err}", log_dir.display());
            None
        }
    };

    match file {
        Some((layer, guard)) => {
            tracing_subscriber::registry()
                .with(stdout)
                .with(layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stdout).init();
            None
        }
    }
}

fn load_registry(cfg: &AfmConfig) -> Registry {
    let seed = match &cfg.apps_file {
        Some(path) => match registry::load_seed(path) {
            Ok(seed) => seed,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "registry file unusable; using built-in applications"
                );
                registry::builtin_seed()
            }
        },
        None => registry::builtin_seed(),
    };
    let registry = Registry::from_seed(seed);
    for rec in registry.iter() {
        tracing::info!(
            app_id = %rec.id,
            app = %rec.name,
            display_name = %rec.display_name,
            autostart = rec.autostart,
            "registered application"
        );
    }
    registry
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "SIGTERM handler unavailable; waiting for ctrl-c only"
                );
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AfmConfig::from_env().context("load configuration")?;
    let _log_guard = init_tracing(&cfg.log_dir);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        service = headunit_proto::SERVICE_NAME,
        object_path = headunit_proto::OBJECT_PATH,
        search_paths = ?cfg.search_paths,
        "headunit-afm starting"
    );

    let registry = load_registry(&cfg);
    let handle = manager::spawn(&cfg, registry);

    tracing::info!(addr = %cfg.listen, "lifecycle RPC listening");
    let served = Server::builder()
        .add_service(lifecycle_service::server(handle.clone()))
        .serve_with_shutdown(cfg.listen, shutdown_signal())
        .await;

    if let Err(err) = served {
        // Not fatal: keep supervising, just without remote control.
        tracing::error!(addr = %cfg.listen, error = %err, "RPC server failed; running degraded");
        shutdown_signal().await;
    }

    tracing::info!("shutdown requested");
    let budget = cfg.stop_grace + SHUTDOWN_SLACK;
    match tokio::time::timeout(budget, handle.shutdown()).await {
        Ok(Ok(())) => tracing::info!("headunit-afm stopped"),
        Ok(Err(err)) => tracing::warn!(error = %err, "lifecycle manager already gone"),
        Err(_) => tracing::error!(
            budget_ms = budget.as_millis() as u64,
            "applications did not stop in time; exiting anyway"
        ),
    }
    Ok(())
}
