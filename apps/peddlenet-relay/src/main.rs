mod activity;
mod cli;
mod config;
mod fanout;
mod handlers;
mod notify;
mod protocol;
mod relay;
mod room_code;
mod rooms;
mod state;
mod store;
mod telemetry;
mod websocket;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cli::{run_debug_client, Cli, Commands};
use crate::config::Config;
use crate::state::{spawn_sweepers, AppState};
use crate::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Debug client mode: no server, no metrics recorder, quiet logs.
    if let Some(Commands::Debug {
        url,
        room,
        name,
        command,
    }) = cli.command
    {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "warn");
        }
        Telemetry::init_tracing()?;
        if let Err(e) = run_debug_client(url, room, name, command).await {
            error!("Debug client error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let telemetry = Telemetry::init()?;
    let config = Config::from_env();
    run(config, telemetry).await
}

async fn run(config: Config, telemetry: Telemetry) -> Result<()> {
    let port = config.port;
    let shutdown_grace = Duration::from_secs(config.shutdown_grace_seconds);

    let state = AppState::new(config)
        .await?
        .with_prometheus(telemetry.metrics_handle());
    let sweepers = spawn_sweepers(&state);

    let app = handlers::router(state.clone())
        .merge(websocket::router(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("PeddleNet relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Give in-flight writes and close frames a moment to drain.
    for sweeper in sweepers {
        sweeper.abort();
    }
    tokio::time::sleep(shutdown_grace).await;
    info!("Relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
