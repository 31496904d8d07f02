use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;

use lib_flights::auth::IntrospectionAuthorizer;
use lib_flights::connections::PostgresConnector;
use lib_flights::{DedupCache, SessionCoordinator};
use nearby_servers::flights_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads the environment
    dotenvy::dotenv().ok();

    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = config::load_config().settings();
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    let authorizer = IntrospectionAuthorizer::new(&settings.introspection_url, settings.introspection_retries)
        .context("configuring token introspection")?;
    let connector = PostgresConnector::new(settings.postgres.clone());
    let coordinator = SessionCoordinator::new(
        Arc::new(connector),
        Arc::new(DedupCache::new()),
        settings.session.clone(),
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let app_state = state::AppState::new(Arc::new(authorizer), coordinator, shutdown_tx.clone());

    let mut downstream_handle = tokio::spawn(downstream::run(
        settings.clone(),
        app_state.clone(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
        finished = &mut downstream_handle => {
            match finished {
                Ok(Ok(())) => log::warn!("Downstream server stopped unexpectedly."),
                Ok(Err(e)) => log::error!("Downstream server failed: {:#}", e),
                Err(e) => log::error!("Downstream server task failed: {}", e),
            }
            return Ok(());
        }
    }

    // Health goes NOT_SERVING and every session gets the broadcast
    let notified = app_state.shutdown();
    log::info!("Shutdown sent to {} session(s).", notified);

    // Wait for components to shut down, bounded by the grace period
    let drained = tokio::time::timeout(settings.shutdown_grace, async {
        match downstream_handle.await {
            Ok(Err(e)) => log::error!("Downstream server failed: {:#}", e),
            Err(e) => log::error!("Downstream server task failed: {}", e),
            Ok(Ok(())) => {}
        }
        app_state.sessions.wait().await;
    })
    .await;

    if drained.is_err() {
        log::warn!(
            "Grace period of {:?} elapsed with {} session(s) still running.",
            settings.shutdown_grace,
            app_state.sessions.len()
        );
    }

    log::info!("Shutdown complete.");
    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-unix platforms, just wait forever.
        std::future::pending::<()>().await;
    }
}
