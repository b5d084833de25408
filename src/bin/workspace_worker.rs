use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warmdock::agent::workspace::{app, spawn_idle_watchdog, WorkspaceWorkerState};

#[derive(Parser)]
#[command(name = "warmdock-workspace")]
#[command(about = "Interactive workspace worker: shell and file bridge")]
struct Args {
    /// Port to listen on inside the container
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Exit after this many seconds without requests
    /// (overridden by WARMDOCK_IDLE_TIMEOUT_SECS)
    #[arg(long, default_value = "1800")]
    idle_timeout_secs: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let idle_timeout_secs = std::env::var("WARMDOCK_IDLE_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(args.idle_timeout_secs);

    let state = Arc::new(WorkspaceWorkerState::new(Duration::from_secs(
        idle_timeout_secs,
    )));
    spawn_idle_watchdog(Arc::clone(&state));
    let app = app(state);

    let address = format!("0.0.0.0:{}", args.port);
    info!(
        idle_timeout_secs,
        "Workspace worker listening on {}", address
    );
    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
