//! Workspace-worker HTTP program: a generic shell/file bridge inside the
//! persistent workspace container. Every request refreshes the activity
//! timestamp; an idle watchdog exits the process once the container has
//! been unused for the configured window.

use crate::error::{OrchestratorError, Result};
use crate::protocol::{
    ExecRequest, ExecResponse, HealthResponse, InstallRequest, ReadFileRequest, ReadFileResponse,
    ShutdownResponse, WriteFileRequest, WriteFileResponse,
};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);
const TIMEOUT_EXIT_CODE: i32 = 124;

pub struct WorkspaceWorkerState {
    started_at: Instant,
    last_activity: Mutex<Instant>,
    idle_timeout: Duration,
}

impl WorkspaceWorkerState {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
            idle_timeout,
        }
    }

    async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

pub fn app(state: Arc<WorkspaceWorkerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/exec", post(exec))
        .route("/read-file", post(read_file))
        .route("/write-file", post(write_file))
        .route("/install", post(install))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Exit the process once no request has arrived for the idle window.
pub fn spawn_idle_watchdog(state: Arc<WorkspaceWorkerState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(WATCHDOG_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let idle = state.last_activity.lock().await.elapsed();
            if idle >= state.idle_timeout {
                info!(
                    idle_secs = idle.as_secs(),
                    "Idle timeout reached; workspace worker exiting"
                );
                std::process::exit(0);
            }
        }
    });
}

async fn health(State(state): State<Arc<WorkspaceWorkerState>>) -> Json<HealthResponse> {
    state.touch().await;
    Json(HealthResponse {
        ready: true,
        busy: None,
        jobs_run: None,
        current_job_id: None,
        uptime_seconds: Some(state.started_at.elapsed().as_secs()),
    })
}

async fn exec(
    State(state): State<Arc<WorkspaceWorkerState>>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecResponse>> {
    state.touch().await;
    if request.command.trim().is_empty() {
        return Err(OrchestratorError::BadRequest("command is empty".to_string()));
    }
    let mut command = Command::new("sh");
    command.arg("-c").arg(&request.command);
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    let timeout = request
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_EXEC_TIMEOUT);
    Ok(Json(run_command(command, timeout).await))
}

async fn read_file(
    State(state): State<Arc<WorkspaceWorkerState>>,
    Json(request): Json<ReadFileRequest>,
) -> Result<Json<ReadFileResponse>> {
    state.touch().await;
    let content = tokio::fs::read_to_string(&request.path).await?;
    let size = content.len() as u64;
    Ok(Json(ReadFileResponse { content, size }))
}

async fn write_file(
    State(state): State<Arc<WorkspaceWorkerState>>,
    Json(request): Json<WriteFileRequest>,
) -> Result<Json<WriteFileResponse>> {
    state.touch().await;
    if let Some(parent) = Path::new(&request.path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&request.path, &request.content).await?;
    Ok(Json(WriteFileResponse {
        success: true,
        path: request.path,
    }))
}

async fn install(
    State(state): State<Arc<WorkspaceWorkerState>>,
    Json(request): Json<InstallRequest>,
) -> Result<Json<ExecResponse>> {
    state.touch().await;
    if request.packages.is_empty() {
        return Err(OrchestratorError::BadRequest(
            "no packages requested".to_string(),
        ));
    }
    let mut command = match request.manager.as_str() {
        "npm" => {
            let mut c = Command::new("npm");
            c.arg("install");
            c
        }
        "pip" => {
            let mut c = Command::new("pip");
            c.arg("install");
            c
        }
        "apt" => {
            let mut c = Command::new("apt-get");
            c.args(["install", "-y"]);
            c
        }
        other => {
            return Err(OrchestratorError::BadRequest(format!(
                "unknown package manager '{other}'"
            )))
        }
    };
    command.args(&request.packages);
    Ok(Json(run_command(command, DEFAULT_EXEC_TIMEOUT).await))
}

async fn shutdown() -> Json<ShutdownResponse> {
    info!("Shutdown requested; exiting");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(0);
    });
    Json(ShutdownResponse {
        status: "shutting_down".to_string(),
    })
}

async fn run_command(mut command: Command, timeout: Duration) -> ExecResponse {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => ExecResponse {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Ok(Err(e)) => {
            warn!(error = %e, "Command failed to start");
            ExecResponse {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("failed to start command: {e}"),
            }
        }
        Err(_) => ExecResponse {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("command timed out after {}s", timeout.as_secs()),
        },
    }
}
