//! Warm-worker HTTP program: accepts one job at a time over `/run`,
//! executes the agent command against the job's branch, and reports the
//! outcome. The orchestrator polls `/health` and treats transport errors
//! as this process being dead.

use crate::error::{OrchestratorError, Result};
use crate::logbuf::LogBuffer;
use crate::protocol::{
    CancelResponse, HealthResponse, RunRequest, RunResponse, RunStatus, ShutdownResponse,
};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const FAILURE_TAIL_BYTES: usize = 500;

struct RunningJob {
    job_id: String,
    /// None while the slot is reserved but the agent has not spawned yet.
    child: Option<Child>,
}

pub struct WorkerState {
    started_at: Instant,
    jobs_run: AtomicU32,
    current: Mutex<Option<RunningJob>>,
    /// Agent invocation, first element is the program.
    agent_cmd: Vec<String>,
    /// Checkout target for job branches, when a repository is mounted.
    repo_dir: Option<String>,
}

impl WorkerState {
    pub fn new(agent_cmd: Vec<String>, repo_dir: Option<String>) -> Self {
        let agent_cmd = if agent_cmd.is_empty() {
            vec!["claude".to_string()]
        } else {
            agent_cmd
        };
        Self {
            started_at: Instant::now(),
            jobs_run: AtomicU32::new(0),
            current: Mutex::new(None),
            agent_cmd,
            repo_dir,
        }
    }
}

pub fn app(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(run_job))
        .route("/cancel", post(cancel))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

async fn health(State(state): State<Arc<WorkerState>>) -> Json<HealthResponse> {
    let current = state.current.lock().await;
    Json(HealthResponse {
        ready: true,
        busy: Some(current.is_some()),
        jobs_run: Some(state.jobs_run.load(Ordering::SeqCst)),
        current_job_id: current.as_ref().map(|j| j.job_id.clone()),
        uptime_seconds: Some(state.started_at.elapsed().as_secs()),
    })
}

async fn run_job(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>> {
    {
        // Reserve the slot before any await so a concurrent `/run` cannot
        // also pass the busy check.
        let mut current = state.current.lock().await;
        if let Some(job) = current.as_ref() {
            return Err(OrchestratorError::WorkerBusy(job.job_id.clone()));
        }
        *current = Some(RunningJob {
            job_id: request.job_id.clone(),
            child: None,
        });
    }

    info!(job_id = %request.job_id, branch = %request.branch, "Running job");

    if let Some(repo_dir) = &state.repo_dir {
        if let Err(e) = checkout_branch(repo_dir, &request.branch).await {
            warn!(job_id = %request.job_id, error = %e, "Branch checkout failed");
            state.current.lock().await.take();
            return Ok(Json(RunResponse {
                status: RunStatus::Failed,
                error: Some(format!("checkout failed: {e}")),
            }));
        }
    }

    let mut command = Command::new(&state.agent_cmd[0]);
    command
        .args(&state.agent_cmd[1..])
        .env("WARMDOCK_JOB_ID", &request.job_id)
        .env("WARMDOCK_BRANCH", &request.branch)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(job_id = %request.job_id, error = %e, "Agent command failed to spawn");
            state.current.lock().await.take();
            return Ok(Json(RunResponse {
                status: RunStatus::Failed,
                error: Some(format!("agent spawn failed: {e}")),
            }));
        }
    };

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });
    // Drain stdout so the agent never blocks on a full pipe.
    if let Some(mut stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = stdout.read_to_end(&mut sink).await;
        });
    }

    {
        let mut current = state.current.lock().await;
        if let Some(job) = current.as_mut() {
            job.child = Some(child);
        }
    }

    // Reap by polling so `/cancel` can kill the child under the same lock.
    let exit_status = loop {
        tokio::time::sleep(REAP_POLL_INTERVAL).await;
        let mut current = state.current.lock().await;
        match current.as_mut().and_then(|job| job.child.as_mut()) {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    current.take();
                    break Some(status);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %request.job_id, error = %e, "Failed to poll agent process");
                    current.take();
                    break None;
                }
            },
            None => break None,
        }
    };

    state.jobs_run.fetch_add(1, Ordering::SeqCst);

    let stderr_text = match stderr_reader {
        Some(reader) => reader.await.unwrap_or_default(),
        None => String::new(),
    };

    let response = match exit_status {
        Some(status) if status.success() => {
            info!(job_id = %request.job_id, "Job completed");
            RunResponse {
                status: RunStatus::Completed,
                error: None,
            }
        }
        Some(status) => {
            let mut tail = LogBuffer::new(FAILURE_TAIL_BYTES);
            tail.append(stderr_text);
            let error = if tail.is_empty() {
                format!("agent exited with {status}")
            } else {
                tail.tail(FAILURE_TAIL_BYTES)
            };
            warn!(job_id = %request.job_id, %status, "Job failed");
            RunResponse {
                status: RunStatus::Failed,
                error: Some(error),
            }
        }
        None => RunResponse {
            status: RunStatus::Failed,
            error: Some("agent process lost before exit".to_string()),
        },
    };
    Ok(Json(response))
}

async fn cancel(State(state): State<Arc<WorkerState>>) -> Json<CancelResponse> {
    let mut current = state.current.lock().await;
    match current.as_mut() {
        Some(job) => {
            info!(job_id = %job.job_id, "Cancelling running job");
            if let Some(child) = job.child.as_mut() {
                let _ = child.start_kill();
            }
            Json(CancelResponse {
                cancelled: true,
                current_job_id: Some(job.job_id.clone()),
            })
        }
        None => Json(CancelResponse {
            cancelled: false,
            current_job_id: None,
        }),
    }
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

async fn checkout_branch(repo_dir: &str, branch: &str) -> anyhow::Result<()> {
    for args in [
        vec!["fetch", "origin", branch],
        vec!["checkout", branch],
    ] {
        let output = Command::new("git")
            .args(&args)
            .current_dir(repo_dir)
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
    }
    Ok(())
}
