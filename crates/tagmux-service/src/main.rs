//! tagmux service - SensorTag arbitration with an HTTP control surface.
//!
//! Run with: `cargo run -p tagmux-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use tagmux_core::{BtleConfig, BtleTransport, Coordinator};
use tagmux_service::{AppState, Config, Pipeline, api, ws};

/// tagmux service - shares SensorTags between configured consumers.
#[derive(Parser, Debug)]
#[command(name = "tagmux-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Wait for `/sensortag/restart` before scanning.
    #[arg(long)]
    no_scan_on_start: bool,

    /// Hold connecting back until `/sensortag/safe` is called.
    #[arg(long)]
    wait_for_safe: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tagmux_service=info".parse()?)
                .add_directive("tagmux_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if args.no_scan_on_start {
        config.coordinator.scan_on_start = false;
    }
    if args.wait_for_safe {
        config.coordinator.initially_safe = false;
    }
    config.validate()?;

    if args.check {
        println!(
            "Configuration OK: {} consumer(s), listening on {}",
            config.consumers.len(),
            config.server.bind
        );
        return Ok(());
    }

    let addr: SocketAddr = config.server.bind.parse()?;

    let transport = Arc::new(BtleTransport::new(BtleConfig::default()).await?);
    let coordinator =
        Coordinator::spawn(transport, config.coordinator.to_coordinator_config()).await?;

    let state = AppState::new(coordinator.clone(), config);
    let pipeline = Pipeline::start(Arc::clone(&state)).await?;

    let app = Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Disconnecting tags");
    pipeline.shutdown().await;
    coordinator.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
