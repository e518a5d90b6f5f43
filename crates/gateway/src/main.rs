//! Gateway entry point: configuration, servers, and orderly shutdown.
//!
//! Exit codes: 0 clean drain, 1 configuration error, 2 bind failure.

use common::Settings;
use gateway::health::{create_health_router, HealthState};
use gateway::{create_router, AppState, SessionManager, SubscriberRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&settings);
    info!("starting candle gateway");

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to install metrics recorder");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(SubscriberRegistry::new());
    let manager = match SessionManager::new(settings.clone(), registry.clone()) {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            error!(error = %err, "failed to initialise session manager");
            std::process::exit(1);
        }
    };

    // Health/metrics surface, separate port.
    let mut health_server = None;
    if settings.server.health_check_enabled {
        let state = Arc::new(HealthState {
            health: manager.health(),
            prometheus,
            inactivity_timeout: settings.connector.inactivity_timeout,
        });
        let app = create_health_router(state);
        let addr = format!("{}:{}", settings.server.host, settings.server.health_check_port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%addr, error = %err, "failed to bind health check port");
                std::process::exit(2);
            }
        };
        info!(%addr, "health check endpoints available at /health, /ready, /metrics");
        health_server = Some(tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "health server failed");
            }
        }));
    }

    // Subscriber-facing WebSocket server.
    let state = Arc::new(AppState {
        registry,
        manager: manager.clone(),
        settings: settings.clone(),
    });
    let app = create_router(state);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to bind websocket port");
            std::process::exit(2);
        }
    };
    info!(%addr, "gateway accepting subscribers");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "websocket server failed");
        std::process::exit(1);
    }

    info!("draining before exit");
    manager.drain().await;
    if let Some(health_server) = health_server {
        health_server.abort();
    }
    info!("gateway stopped");
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.server.log_level.to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on the first SIGINT/SIGTERM; a second signal terminates
/// the process immediately instead of waiting for the drain.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, draining"),
        _ = terminate => info!("received SIGTERM, draining"),
    }

    tokio::spawn(async {
        let ctrl_c = async {
            signal::ctrl_c().await.ok();
        };

        #[cfg(unix)]
        let terminate = async {
            if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
                sig.recv().await;
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        warn!("second shutdown signal, terminating immediately");
        std::process::exit(1);
    });
}
