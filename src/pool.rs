//! Warm worker pool: N long-lived job containers, each running the
//! warm-worker HTTP program, with health checking, usage/age recycling,
//! and transparent fallback to the cold runner when a worker dies
//! mid-job. A crashed warm worker degrades latency, never correctness.

use crate::config::{collect_secrets, llm_secrets, model_overrides, PoolConfig};
use crate::error::{OrchestratorError, Result};
use crate::jobs::{
    run_completion_hooks, spawn_best_effort, CompletionHooks, ExecutionTier, JobPatch, JobStatus,
    JobStore,
};
use crate::local::{short_id, LocalRunner};
use crate::protocol::{RunRequest, RunStatus, WorkerClient};
use crate::runtime::{ContainerRuntime, ContainerSpec, POOL_LABEL};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Port the worker program listens on inside its container.
pub const WORKER_CONTAINER_PORT: u16 = 8080;

const SHUTDOWN_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Dead,
    Recycling,
}

/// One pool slot. The slot identity (index, name, port) is stable for the
/// pool's lifetime; the container behind it changes on recycle.
struct Worker {
    index: usize,
    container_id: Option<String>,
    container_name: String,
    port: u16,
    status: WorkerStatus,
    jobs_run: u32,
    started_at: Instant,
    current_job_id: Option<String>,
    consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub index: usize,
    pub container_name: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub jobs_run: u32,
    pub current_job_id: Option<String>,
    pub uptime_seconds: u64,
}

pub struct WarmPool {
    config: PoolConfig,
    image: String,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn JobStore>,
    hooks: Arc<dyn CompletionHooks>,
    local: Arc<LocalRunner>,
    workers: Mutex<Vec<Worker>>,
    shutting_down: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl WarmPool {
    pub fn new(
        config: PoolConfig,
        image: String,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn JobStore>,
        hooks: Arc<dyn CompletionHooks>,
        local: Arc<LocalRunner>,
    ) -> Self {
        Self {
            config,
            image,
            runtime,
            store,
            hooks,
            local,
            workers: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            health_task: Mutex::new(None),
        }
    }

    /// Bring up the fleet: remove leftovers from a previous instance,
    /// start one container per slot, wait for readiness (slots that never
    /// report healthy become `Dead` without blocking the rest), then start
    /// the recurring health tick.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        match self.runtime.list_labeled(POOL_LABEL).await {
            Ok(leftovers) => {
                for container in leftovers {
                    warn!(container = %container.name, "Removing leftover pool container");
                    let _ = self.runtime.remove(&container.name).await;
                }
            }
            Err(e) => warn!(error = %e, "Could not list leftover pool containers"),
        }

        {
            let mut workers = self.workers.lock().await;
            workers.clear();
            for index in 0..self.config.size {
                workers.push(Worker {
                    index,
                    container_id: None,
                    container_name: format!("warmdock-pool-{index}"),
                    port: self.config.port_start + index as u16,
                    status: WorkerStatus::Starting,
                    jobs_run: 0,
                    started_at: Instant::now(),
                    current_job_id: None,
                    consecutive_failures: 0,
                });
            }
        }

        let startups = (0..self.config.size).map(|index| {
            let pool = Arc::clone(self);
            async move { pool.start_and_await_ready(index).await }
        });
        join_all(startups).await;

        let ready = self.count_with_status(WorkerStatus::Ready).await;
        info!(
            ready,
            size = self.config.size,
            "Warm pool initialized"
        );

        let pool = Arc::clone(self);
        let mut task = self.health_task.lock().await;
        *task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.config.health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await; // first tick fires immediately; skip it
            loop {
                tick.tick().await;
                if pool.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                pool.health_tick().await;
            }
        }));
        Ok(())
    }

    pub async fn has_available_worker(&self) -> bool {
        self.workers
            .lock()
            .await
            .iter()
            .any(|w| w.status == WorkerStatus::Ready)
    }

    /// Assign a job to the first ready worker. Callers must check
    /// `has_available_worker` first; `NoIdleWorker` is returned otherwise.
    ///
    /// A transport-level failure mid-run marks the worker dead, triggers
    /// its recycle in the background, and re-submits the job to the cold
    /// runner so the job is never lost.
    pub async fn assign_job(self: &Arc<Self>, job_id: &str, branch: &str) -> Result<()> {
        let (index, port) = {
            let mut workers = self.workers.lock().await;
            let worker = workers
                .iter_mut()
                .find(|w| w.status == WorkerStatus::Ready)
                .ok_or(OrchestratorError::NoIdleWorker)?;
            worker.status = WorkerStatus::Busy;
            worker.current_job_id = Some(job_id.to_string());
            (worker.index, worker.port)
        };

        self.patch_job(
            job_id,
            JobPatch::status(JobStatus::Running).with_tier(ExecutionTier::Warm),
        )
        .await;
        info!(job_id = %short_id(job_id), worker = index, "Assigned job to warm worker");

        let client = WorkerClient::new(&self.config.host, port);
        let request = RunRequest {
            job_id: job_id.to_string(),
            branch: branch.to_string(),
        };

        match client.run(&request, self.config.run_timeout).await {
            Ok(response) => {
                let recycle_due = {
                    let mut workers = self.workers.lock().await;
                    match workers.get_mut(index) {
                        Some(worker) => {
                            worker.status = WorkerStatus::Ready;
                            worker.current_job_id = None;
                            worker.jobs_run += 1;
                            worker.consecutive_failures = 0;
                            self.recycle_due(worker)
                        }
                        None => false,
                    }
                };

                match response.status {
                    RunStatus::Completed => {
                        self.patch_job(job_id, JobPatch::status(JobStatus::Completed))
                            .await;
                        run_completion_hooks(
                            Arc::clone(&self.hooks),
                            job_id.to_string(),
                            format!("Job {} completed", short_id(job_id)),
                        );
                    }
                    RunStatus::Failed => {
                        let error = response
                            .error
                            .unwrap_or_else(|| "worker reported failure".to_string());
                        self.patch_job(job_id, JobPatch::failed(error)).await;
                        run_completion_hooks(
                            Arc::clone(&self.hooks),
                            job_id.to_string(),
                            format!("Job {} failed", short_id(job_id)),
                        );
                    }
                }

                if recycle_due {
                    self.recycle_worker(index).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    job_id = %short_id(job_id),
                    worker = index,
                    error = %e,
                    "Warm worker unreachable mid-job; falling back to cold runner"
                );
                self.mark_dead(index).await;
                let pool = Arc::clone(self);
                spawn_best_effort("recycle_dead_worker", async move {
                    pool.recycle_worker(index).await;
                    Ok(())
                });

                self.patch_job(job_id, JobPatch::default().with_tier(ExecutionTier::LocalFallback))
                    .await;
                self.local.run(job_id, branch).await
            }
        }
    }

    /// Forward a cancel request to the worker running `job_id`. The
    /// in-container program is responsible for terminating its own child;
    /// the pool cannot preempt a running warm job.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let port = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .find(|w| {
                    w.status == WorkerStatus::Busy && w.current_job_id.as_deref() == Some(job_id)
                })
                .map(|w| w.port)
        };
        match port {
            Some(port) => {
                let client = WorkerClient::new(&self.config.host, port);
                match client.cancel(CANCEL_CALL_TIMEOUT).await {
                    Ok(response) => response.cancelled,
                    Err(e) => {
                        warn!(job_id = %short_id(job_id), error = %e, "Cancel request failed");
                        false
                    }
                }
            }
            None => false,
        }
    }

    pub async fn status(&self) -> Vec<WorkerReport> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|w| WorkerReport {
                index: w.index,
                container_name: w.container_name.clone(),
                port: w.port,
                status: w.status,
                jobs_run: w.jobs_run,
                current_job_id: w.current_job_id.clone(),
                uptime_seconds: w.started_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Tear the fleet down. Idempotent against repeated calls.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.health_task.lock().await.take() {
            task.abort();
        }

        let targets: Vec<(String, u16)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .map(|w| (w.container_name.clone(), w.port))
                .collect()
        };
        for (name, port) in targets {
            let client = WorkerClient::new(&self.config.host, port);
            let _ = client.shutdown(SHUTDOWN_CALL_TIMEOUT).await;
            let _ = self.runtime.remove(&name).await;
        }
        info!("Warm pool shut down");
    }

    /// One health pass over the fleet, plus the idle recycle-policy sweep.
    async fn health_tick(self: &Arc<Self>) {
        let snapshot: Vec<(usize, u16)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .filter(|w| matches!(w.status, WorkerStatus::Ready | WorkerStatus::Busy))
                .map(|w| (w.index, w.port))
                .collect()
        };

        for (index, port) in snapshot {
            let client = WorkerClient::new(&self.config.host, port);
            match client.health(self.config.health_timeout).await {
                Ok(health) => {
                    let mut workers = self.workers.lock().await;
                    let Some(worker) = workers.get_mut(index) else {
                        continue;
                    };
                    if !matches!(worker.status, WorkerStatus::Ready | WorkerStatus::Busy) {
                        continue;
                    }
                    worker.consecutive_failures = 0;
                    // A worker we believe busy but that explicitly reports
                    // idle lost its job; reconcile so the slot is usable
                    // again. A reply omitting the flag proves nothing.
                    if worker.status == WorkerStatus::Busy && health.busy == Some(false) {
                        warn!(worker = index, "Worker reports idle while marked busy; reconciling");
                        worker.status = WorkerStatus::Ready;
                        worker.current_job_id = None;
                    }
                }
                Err(e) => {
                    let trigger_recycle = {
                        let mut workers = self.workers.lock().await;
                        let Some(worker) = workers.get_mut(index) else {
                            continue;
                        };
                        worker.consecutive_failures += 1;
                        warn!(
                            worker = index,
                            failures = worker.consecutive_failures,
                            error = %e,
                            "Worker health check failed"
                        );
                        worker.consecutive_failures >= self.config.health_failure_threshold
                    };
                    if trigger_recycle {
                        let pool = Arc::clone(self);
                        spawn_best_effort("recycle_unhealthy_worker", async move {
                            pool.recycle_worker(index).await;
                            Ok(())
                        });
                    }
                }
            }
        }

        // Idle workers age out too, even when no jobs arrive.
        let due: Vec<usize> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .filter(|w| w.status == WorkerStatus::Ready && self.recycle_due(w))
                .map(|w| w.index)
                .collect()
        };
        for index in due {
            let pool = Arc::clone(self);
            spawn_best_effort("recycle_aged_worker", async move {
                pool.recycle_worker(index).await;
                Ok(())
            });
        }
    }

    fn recycle_due(&self, worker: &Worker) -> bool {
        worker.jobs_run >= self.config.max_jobs_per_worker
            || worker.started_at.elapsed() >= self.config.max_lifetime
    }

    /// Replace a worker's container while keeping its slot identity.
    /// Idempotent: a worker already recycling is left alone, and a busy
    /// worker is never preempted.
    pub async fn recycle_worker(&self, index: usize) {
        let (name, port) = {
            let mut workers = self.workers.lock().await;
            let Some(worker) = workers.get_mut(index) else {
                return;
            };
            if worker.status == WorkerStatus::Recycling
                || worker.status == WorkerStatus::Busy
                || self.shutting_down.load(Ordering::SeqCst)
            {
                return;
            }
            worker.status = WorkerStatus::Recycling;
            worker.current_job_id = None;
            (worker.container_name.clone(), worker.port)
        };

        info!(worker = index, "Recycling worker");
        let client = WorkerClient::new(&self.config.host, port);
        let _ = client.shutdown(SHUTDOWN_CALL_TIMEOUT).await;
        let _ = self.runtime.remove(&name).await;

        self.start_and_await_ready(index).await;
    }

    /// Start (or restart) the container for a slot and poll its health
    /// endpoint until ready or the deadline elapses. Marks the slot
    /// `Ready` with counters reset on success, `Dead` otherwise.
    async fn start_and_await_ready(&self, index: usize) {
        let spec = self.slot_spec(index).await;
        let port = match spec.port_map {
            Some((host_port, _)) => host_port,
            None => self.config.port_start + index as u16,
        };

        let container_id = match self.runtime.start_detached(&spec).await {
            Ok(id) => id,
            Err(e) => {
                warn!(worker = index, error = %e, "Worker container failed to spawn");
                self.mark_dead(index).await;
                return;
            }
        };

        let client = WorkerClient::new(&self.config.host, port);
        let deadline = Instant::now() + self.config.ready_deadline;
        loop {
            match client.health(self.config.health_timeout).await {
                Ok(health) if health.ready => {
                    let mut workers = self.workers.lock().await;
                    if let Some(worker) = workers.get_mut(index) {
                        worker.status = WorkerStatus::Ready;
                        worker.container_id = Some(container_id);
                        worker.jobs_run = 0;
                        worker.consecutive_failures = 0;
                        worker.started_at = Instant::now();
                        worker.current_job_id = None;
                    }
                    info!(worker = index, "Worker ready");
                    return;
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                warn!(
                    worker = index,
                    deadline_secs = self.config.ready_deadline.as_secs(),
                    "Worker never became ready; marking dead"
                );
                self.mark_dead(index).await;
                return;
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    async fn slot_spec(&self, index: usize) -> ContainerSpec {
        let (name, port) = {
            let workers = self.workers.lock().await;
            match workers.get(index) {
                Some(w) => (w.container_name.clone(), w.port),
                None => (
                    format!("warmdock-pool-{index}"),
                    self.config.port_start + index as u16,
                ),
            }
        };
        let mut env = vec![
            ("WARMDOCK_SECRETS".to_string(), collect_secrets().to_string()),
            ("WARMDOCK_WORKER_INDEX".to_string(), index.to_string()),
        ];
        env.extend(model_overrides());
        if let Some(blob) = llm_secrets() {
            env.push(("WARMDOCK_LLM_SECRETS".to_string(), blob));
        }
        ContainerSpec {
            name,
            image: self.image.clone(),
            env,
            labels: vec![(POOL_LABEL.to_string(), index.to_string())],
            port_map: Some((port, WORKER_CONTAINER_PORT)),
        }
    }

    async fn mark_dead(&self, index: usize) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get_mut(index) {
            worker.status = WorkerStatus::Dead;
            worker.current_job_id = None;
        }
    }

    async fn count_with_status(&self, status: WorkerStatus) -> usize {
        self.workers
            .lock()
            .await
            .iter()
            .filter(|w| w.status == status)
            .count()
    }

    async fn patch_job(&self, job_id: &str, patch: JobPatch) {
        if let Err(e) = self.store.update_job(job_id, patch).await {
            warn!(job_id = %short_id(job_id), error = %e, "Failed to patch job record");
        }
    }
}
