use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warmdock::agent::worker::{app, WorkerState};

#[derive(Parser)]
#[command(name = "warmdock-worker")]
#[command(about = "Warm job worker: runs inside each pool container")]
struct Args {
    /// Port to listen on inside the container
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Agent command to execute per job (overridden by WARMDOCK_AGENT_CMD)
    #[arg(long, default_value = "claude")]
    agent_cmd: String,

    /// Repository checkout the job branch is switched in
    #[arg(long)]
    repo_dir: Option<String>,

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

    let agent_cmd = std::env::var("WARMDOCK_AGENT_CMD").unwrap_or(args.agent_cmd);
    let agent_cmd: Vec<String> = agent_cmd.split_whitespace().map(String::from).collect();
    let repo_dir = args
        .repo_dir
        .or_else(|| std::env::var("WARMDOCK_REPO_DIR").ok());

    let state = Arc::new(WorkerState::new(agent_cmd, repo_dir));
    let app = app(state);

    let address = format!("0.0.0.0:{}", args.port);
    info!("Warm worker listening on {}", address);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
