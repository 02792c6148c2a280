//! # voice-dialer server
//!
//! Hosts the capture relay and the status API for calls placed by
//! [`voice_dialer::call::CallRunner`].
//!
//! The server does not dial on its own: placing a call needs a browser
//! automation backend implementing [`voice_dialer::driver::PageDriver`]. An
//! embedding process builds one, creates a runner with
//! `CallRunner::for_state(&state, driver)` against the same `AppState` it
//! serves, and calls `run(contact)`. Until then `/ws/capture` answers 404 for
//! every call id.
//!
//! ## Routes:
//! - `GET /health`, `GET /api/v1/health`: liveness and load
//! - `GET /api/v1/metrics`: request and relay counters
//! - `GET|PUT /api/v1/config`: runtime configuration
//! - `GET /api/v1/calls`, `GET /api/v1/calls/{call_id}`: call snapshots
//! - `GET /ws/capture?call_id=<id>`: page audio relay

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_dialer::config::AppConfig;
use voice_dialer::state::AppState;
use voice_dialer::{handlers, health, middleware, relay};

const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-dialer v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, agent '{}'",
        config.server.host, config.server.port, config.session.agent_id
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let sweeper = tokio::spawn(sweep_finished_calls(app_state.clone()));

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{call_id}", web::get().to(handlers::get_call)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/capture", web::get().to(relay::capture_websocket))
    })
    .bind(&bind_addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    sweeper.abort();
    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` wins; otherwise `voice_dialer=debug,actix_web=info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_dialer=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed is
/// logged and ignored so the other one still works.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Drops finished calls once they are older than the configured retention.
async fn sweep_finished_calls(state: AppState) {
    let mut interval = tokio::time::interval(REGISTRY_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let retention = state.get_config().performance.call_retention_secs;
        let removed = state.calls.cleanup_old(retention);
        if removed > 0 {
            info!("Removed {} finished calls from the registry", removed);
        }
    }
}
