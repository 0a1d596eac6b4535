use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use clap::Parser;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

mod adapters;
mod app;
mod driver;
mod http;
mod replay;
mod runner;
mod verify;

use switchboard_core::config::{
    SwitchboardConfig, MAX_WEBHOOK_BODY_BYTES, WEBHOOK_BODY_TIMEOUT_SECS,
};

#[derive(Debug, Parser)]
#[command(name = "switchboard-gateway", about = "Multi-channel assistant gateway")]
struct Args {
    /// Config file path (defaults to SWITCHBOARD_CONFIG or
    /// ~/.switchboard/switchboard.toml).
    #[arg(long)]
    config: Option<String>,

    /// Validate the config and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,switchboard_gateway=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = SwitchboardConfig::load(args.config.as_deref())?;

    let report = config.validate();
    if !report.valid() {
        for error in &report.errors {
            eprintln!("config: {error}");
        }
        anyhow::bail!("configuration invalid ({} problem(s))", report.errors.len());
    }
    if args.check {
        println!("config ok");
        return Ok(());
    }

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;

    let (state, flush_rx) = app::AppState::build(config)?;
    app::spawn_flush_consumer(Arc::clone(&state), flush_rx);

    // Queue recovery and the cron loop come up before the listener binds.
    state.recover_and_start().await?;

    let router = Router::new()
        .route(
            "/webhooks/{channel}/{account}",
            post(http::webhooks::webhook_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
        .layer(TimeoutLayer::new(Duration::from_secs(WEBHOOK_BODY_TIMEOUT_SECS)))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(%addr, "switchboard gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
    .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<app::AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested, draining");
    state.pipeline.stop();
    state.scheduler.stop();
    state.shutdown.cancel();
}
