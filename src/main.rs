//! # Live Relay - Main Application Entry Point
//!
//! A WebSocket relay that lets a browser talk to a realtime streaming API
//! without ever seeing the API credential.
//!
//! ## How a connection flows:
//! 1. The **router** accepts it on the public port and peeks at the request head
//! 2. Upgrade requests for the streaming API become relay **sessions**; the
//!    upstream URL gets the credential attached on the way out
//! 3. Plain HTTP requests are handed to the internal actix-web server
//!    (health, metrics, config)
//! 4. Anything else is dropped
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection is a lightweight task
//! - **Arc**: the configuration is shared read-only by every task
//! - **tokio::select!**: the process runs until a server stops or a signal arrives
//!
//! ## Application Architecture:
//! - **config**: configuration (config.toml + environment variables)
//! - **credential**: the secret and how it is attached to URLs
//! - **state**: shared state and metrics
//! - **router**: the public listener
//! - **relay**: per-session relay (connector, queue, pump)
//! - **health**, **handlers**, **middleware**: the internal HTTP server
//! - **error**: error types for both surfaces

mod config;
mod credential;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod router;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. `.env` and `.env.local` are loaded (missing files are fine)
/// 2. Logging, then configuration; a bad configuration aborts startup
/// 3. The internal HTTP server binds an ephemeral loopback port
/// 4. The public listener binds and the router starts accepting
///
/// A missing credential does not abort startup: health checks keep working
/// and every relay session is refused with a policy close.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    dotenv::from_filename(".env.local").ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        upstream = %config.upstream.endpoint,
        path_marker = %config.upstream.path_marker,
        credential_kind = ?config.upstream.credential_kind,
        "Configuration loaded"
    );
    if config.credential().is_none() {
        warn!("No upstream credential configured (GEMINI_API_KEY); relay sessions will be refused");
    }

    let app_state = AppState::new(config.clone());

    setup_signal_handlers();

    // Only reachable through the router's splice
    let internal = std::net::TcpListener::bind("127.0.0.1:0")?;
    let internal_addr = internal.local_addr()?;

    let http_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .wrap(cors)
            .wrap(middleware::RequestObserver)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .default_service(web::to(handlers::not_found))
    })
    .listen(internal)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    let listener = router::bind(&config.bind_addr()).await?;
    let router_task = tokio::spawn(router::UpgradeRouter::new(app_state, internal_addr).serve(listener));

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("HTTP server error: {}", e),
                Err(e) => error!("HTTP server task error: {}", e),
                Ok(Ok(())) => warn!("HTTP server stopped"),
            }
        }
        result = router_task => {
            if let Err(e) = result {
                error!("Router task error: {}", e);
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping...");
            server_handle.stop(true).await;
        }
    }

    info!("Relay stopped");
    Ok(())
}

/// ## Environment Variables:
/// - `RUST_LOG`: what gets logged, e.g. `live_relay=trace`
/// - Defaults to `live_relay=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Set the shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
