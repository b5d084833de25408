//! Workspace container manager: one persistent, user-interactive
//! container (distinct from job workers) that tool calls can execute
//! shell commands against. Lazily started, idle-expired by the
//! in-container program itself.

use crate::config::{collect_secrets, llm_secrets, WorkspaceConfig};
use crate::error::{OrchestratorError, Result};
use crate::protocol::WorkerClient;
use crate::runtime::{ContainerRuntime, ContainerSpec, WORKSPACE_LABEL};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const WORKSPACE_CONTAINER_NAME: &str = "warmdock-workspace";
/// Port the workspace program listens on inside its container.
pub const WORKSPACE_CONTAINER_PORT: u16 = 8080;

const SHUTDOWN_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Stopped,
    Starting,
    Ready,
    Dead,
}

struct WorkspaceState {
    status: WorkspaceStatus,
    container_id: Option<String>,
    started_at: Option<Instant>,
    last_activity: Option<Instant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceReport {
    pub status: WorkspaceStatus,
    pub container_id: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub idle_seconds: Option<u64>,
}

type StartFuture = Shared<BoxFuture<'static, std::result::Result<(), String>>>;

pub struct WorkspaceManager {
    config: WorkspaceConfig,
    image: String,
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<WorkspaceState>,
    /// In-flight start attempt, shared so concurrent callers never race
    /// to spawn duplicate containers.
    starting: Mutex<Option<StartFuture>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkspaceManager {
    pub fn new(
        config: WorkspaceConfig,
        image: String,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            image,
            runtime,
            state: Mutex::new(WorkspaceState {
                status: WorkspaceStatus::Stopped,
                container_id: None,
                started_at: None,
                last_activity: None,
            }),
            starting: Mutex::new(None),
            health_task: Mutex::new(None),
        }
    }

    /// Make sure the workspace container is up. Already-ready just
    /// refreshes the activity timestamp; concurrent callers during
    /// startup all await the same attempt.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.status == WorkspaceStatus::Ready {
                state.last_activity = Some(Instant::now());
                return Ok(());
            }
        }

        let attempt = {
            let mut starting = self.starting.lock().await;
            match starting.as_ref() {
                Some(shared) => shared.clone(),
                None => {
                    let manager = Arc::clone(self);
                    let shared = async move {
                        manager
                            .start_container()
                            .await
                            .map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();
                    *starting = Some(shared.clone());
                    shared
                }
            }
        };

        let result = attempt.clone().await;
        {
            // Only the attempt we awaited may be cleared; a late waiter must
            // not evict a newer in-flight attempt another caller registered.
            let mut starting = self.starting.lock().await;
            if starting.as_ref().is_some_and(|s| s.ptr_eq(&attempt)) {
                starting.take();
            }
        }
        result.map_err(OrchestratorError::Spawn)
    }

    /// Generic JSON bridge to the in-container workspace program.
    /// Auto-starts the container when needed and refreshes activity so
    /// the program's idle watchdog stays quiet while in use.
    pub async fn fetch(self: &Arc<Self>, path: &str, body: &Value) -> Result<Value> {
        self.ensure_running().await?;
        {
            let mut state = self.state.lock().await;
            state.last_activity = Some(Instant::now());
        }
        let client = WorkerClient::new(&self.config.host, self.config.port);
        client.post_json(path, body, self.config.fetch_timeout).await
    }

    pub async fn status(&self) -> WorkspaceReport {
        let state = self.state.lock().await;
        WorkspaceReport {
            status: state.status,
            container_id: state.container_id.clone(),
            uptime_seconds: state.started_at.map(|t| t.elapsed().as_secs()),
            idle_seconds: state.last_activity.map(|t| t.elapsed().as_secs()),
        }
    }

    /// Best-effort notify the container, then force-remove it and reset
    /// all state.
    pub async fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }
        let client = WorkerClient::new(&self.config.host, self.config.port);
        let _ = client.shutdown(SHUTDOWN_CALL_TIMEOUT).await;
        let _ = self.runtime.remove(WORKSPACE_CONTAINER_NAME).await;

        let mut state = self.state.lock().await;
        state.status = WorkspaceStatus::Stopped;
        state.container_id = None;
        state.started_at = None;
        state.last_activity = None;
        info!("Workspace container shut down");
    }

    async fn start_container(self: Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.status = WorkspaceStatus::Starting;
        }

        // A same-named leftover from a previous run would collide.
        let _ = self.runtime.remove(WORKSPACE_CONTAINER_NAME).await;

        let mut env = vec![
            ("WARMDOCK_SECRETS".to_string(), collect_secrets().to_string()),
            (
                "WARMDOCK_WORKSPACE".to_string(),
                WORKSPACE_CONTAINER_NAME.to_string(),
            ),
            (
                "WARMDOCK_IDLE_TIMEOUT_SECS".to_string(),
                self.config.idle_timeout.as_secs().to_string(),
            ),
        ];
        if let Some(blob) = llm_secrets() {
            env.push(("WARMDOCK_LLM_SECRETS".to_string(), blob));
        }

        let spec = ContainerSpec {
            name: WORKSPACE_CONTAINER_NAME.to_string(),
            image: self.image.clone(),
            env,
            labels: vec![(WORKSPACE_LABEL.to_string(), "workspace".to_string())],
            port_map: Some((self.config.port, WORKSPACE_CONTAINER_PORT)),
        };

        info!(image = %spec.image, "Starting workspace container");
        let container_id = match self.runtime.start_detached(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.mark_dead().await;
                return Err(e);
            }
        };

        let client = WorkerClient::new(&self.config.host, self.config.port);
        let deadline = Instant::now() + self.config.ready_deadline;
        loop {
            match client.health(self.config.health_timeout).await {
                Ok(health) if health.ready => break,
                _ => {}
            }
            if Instant::now() >= deadline {
                warn!("Workspace container never became ready");
                self.mark_dead().await;
                return Err(OrchestratorError::StartupTimeout {
                    name: WORKSPACE_CONTAINER_NAME.to_string(),
                    deadline_secs: self.config.ready_deadline.as_secs(),
                });
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }

        {
            let mut state = self.state.lock().await;
            state.status = WorkspaceStatus::Ready;
            state.container_id = Some(container_id);
            state.started_at = Some(Instant::now());
            state.last_activity = Some(Instant::now());
        }
        self.spawn_health_tick().await;
        info!("Workspace container ready");
        Ok(())
    }

    /// Light watchdog: mark the manager dead when the container stops
    /// answering. No auto-respawn; the next `fetch` starts a fresh
    /// container because `Dead` is not `Ready`.
    async fn spawn_health_tick(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut task = self.health_task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.config.health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let ready = {
                    let state = manager.state.lock().await;
                    state.status == WorkspaceStatus::Ready
                };
                if !ready {
                    continue;
                }
                let client = WorkerClient::new(&manager.config.host, manager.config.port);
                if let Err(e) = client.health(manager.config.health_timeout).await {
                    warn!(error = %e, "Workspace health check failed; marking dead");
                    manager.mark_dead().await;
                }
            }
        }));
    }

    async fn mark_dead(&self) {
        let mut state = self.state.lock().await;
        state.status = WorkspaceStatus::Dead;
    }
}
