//! Local cold-start runner: executes a job in a freshly spawned,
//! single-use container, under a global concurrency cap with a FIFO wait
//! queue.
//!
//! Job-level failure is recorded on the job record, never returned to the
//! caller; only a spawn failure (the container runtime rejected the run)
//! propagates as `Err`, so the warm-pool fallback path can observe it.

use crate::config::{collect_secrets, llm_secrets, model_overrides, LocalRunnerConfig};
use crate::error::Result;
use crate::jobs::{run_completion_hooks, CompletionHooks, JobPatch, JobStatus, JobStore};
use crate::logbuf::LogBuffer;
use crate::runtime::{ContainerRuntime, ContainerSpec, OutputChunk, OutputStream, JOB_LABEL};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

/// How much captured stderr is surfaced as a failed job's error.
const STDERR_TAIL_BYTES: usize = 500;

struct PendingEntry {
    job_id: String,
    branch: String,
    done: oneshot::Sender<Result<()>>,
    #[allow(dead_code)]
    queued_at: Instant,
}

struct ActiveJob {
    container_name: String,
    cancelled: bool,
}

struct RunnerState {
    running: usize,
    pending: VecDeque<PendingEntry>,
    active: HashMap<String, ActiveJob>,
}

pub struct LocalRunner {
    config: LocalRunnerConfig,
    image: String,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn JobStore>,
    hooks: Arc<dyn CompletionHooks>,
    state: Mutex<RunnerState>,
}

impl LocalRunner {
    pub fn new(
        config: LocalRunnerConfig,
        image: String,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn JobStore>,
        hooks: Arc<dyn CompletionHooks>,
    ) -> Self {
        Self {
            config,
            image,
            runtime,
            store,
            hooks,
            state: Mutex::new(RunnerState {
                running: 0,
                pending: VecDeque::new(),
                active: HashMap::new(),
            }),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Run a job in a single-use container, waiting in the FIFO queue when
    /// the concurrency cap is reached. Resolves once the container exited
    /// and bookkeeping is done.
    pub async fn run(self: &Arc<Self>, job_id: &str, branch: &str) -> Result<()> {
        let waiter = {
            let mut state = self.state.lock().await;
            if state.running >= self.config.max_concurrent {
                let (tx, rx) = oneshot::channel();
                state.pending.push_back(PendingEntry {
                    job_id: job_id.to_string(),
                    branch: branch.to_string(),
                    done: tx,
                    queued_at: Instant::now(),
                });
                Some(rx)
            } else {
                state.running += 1;
                None
            }
        };

        match waiter {
            Some(rx) => {
                self.patch_job(job_id, JobPatch::status(JobStatus::Queued))
                    .await;
                info!(job_id = %short_id(job_id), "Job queued: local runner at capacity");
                // A dropped sender means the entry was cancelled; that is a
                // successful no-op from the caller's point of view.
                rx.await.unwrap_or(Ok(()))
            }
            None => {
                let result = self.execute(job_id, branch).await;
                if let Some(next) = self.finish_and_take_next().await {
                    self.spawn_chain(next);
                }
                result
            }
        }
    }

    /// Cancel a job. An active job's container is stopped (gracefully,
    /// then killed); a queued job is removed before it ever starts.
    /// Returns whether anything was found to cancel.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let container_name = {
            let mut state = self.state.lock().await;
            match state.active.get_mut(job_id) {
                Some(active) => {
                    active.cancelled = true;
                    Some(active.container_name.clone())
                }
                None => None,
            }
        };

        if let Some(name) = container_name {
            info!(job_id = %short_id(job_id), container = %name, "Stopping active job container");
            if self.runtime.stop(&name, self.config.stop_grace).await.is_err() {
                let _ = self.runtime.kill(&name).await;
            }
            return true;
        }

        let mut state = self.state.lock().await;
        let pos = state.pending.iter().position(|e| e.job_id == job_id);
        if let Some(entry) = pos.and_then(|p| state.pending.remove(p)) {
            drop(state);
            let _ = entry.done.send(Ok(()));
            self.patch_job(job_id, JobPatch::status(JobStatus::Cancelled))
                .await;
            info!(job_id = %short_id(job_id), "Removed queued job before start");
            return true;
        }
        false
    }

    /// Reconcile containers left running by a previous orchestrator
    /// process. Call once at startup, before accepting jobs.
    pub async fn cleanup_orphans(&self) -> Result<()> {
        let leftovers = self.runtime.list_labeled(JOB_LABEL).await?;
        for container in leftovers {
            warn!(
                container = %container.name,
                job_id = %container.label_value,
                "Force-stopping orphaned job container from a previous run"
            );
            let _ = self.runtime.remove(&container.name).await;

            let job_id = &container.label_value;
            if job_id.is_empty() {
                continue;
            }
            match self.store.job_status(job_id).await {
                Ok(Some(JobStatus::Created)) | Ok(Some(JobStatus::Queued)) => {
                    self.patch_job(
                        job_id,
                        JobPatch::failed("orphaned by orchestrator restart"),
                    )
                    .await;
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Could not look up orphaned job"),
            }
        }
        Ok(())
    }

    async fn execute(&self, job_id: &str, branch: &str) -> Result<()> {
        let short = short_id(job_id);
        let container_name = format!("warmdock-job-{short}");

        {
            let mut state = self.state.lock().await;
            state.active.insert(
                job_id.to_string(),
                ActiveJob {
                    container_name: container_name.clone(),
                    cancelled: false,
                },
            );
        }
        self.patch_job(job_id, JobPatch::status(JobStatus::Running))
            .await;

        let mut env = vec![
            ("WARMDOCK_SECRETS".to_string(), collect_secrets().to_string()),
            ("WARMDOCK_JOB_ID".to_string(), job_id.to_string()),
            ("WARMDOCK_BRANCH".to_string(), branch.to_string()),
        ];
        env.extend(model_overrides());
        if let Some(blob) = llm_secrets() {
            env.push(("WARMDOCK_LLM_SECRETS".to_string(), blob));
        }

        let spec = ContainerSpec {
            name: container_name,
            image: self.image.clone(),
            env,
            labels: vec![(JOB_LABEL.to_string(), job_id.to_string())],
            port_map: None,
        };

        let (tx, rx) = mpsc::channel::<OutputChunk>(256);
        let log_cap = self.config.log_cap_bytes;
        let collector = tokio::spawn(collect_output(rx, short.clone(), log_cap));

        info!(job_id = %short, image = %spec.image, "Starting cold job container");
        let run_result = self.runtime.run_streaming(&spec, tx).await;

        let (_stdout_log, stderr_log) = collector
            .await
            .unwrap_or_else(|_| (LogBuffer::new(log_cap), LogBuffer::new(log_cap)));

        let cancelled = {
            let mut state = self.state.lock().await;
            state
                .active
                .remove(job_id)
                .map(|a| a.cancelled)
                .unwrap_or(false)
        };

        match run_result {
            Ok(0) => {
                info!(job_id = %short, "Cold job completed");
                self.patch_job(job_id, JobPatch::status(JobStatus::Completed))
                    .await;
                run_completion_hooks(
                    Arc::clone(&self.hooks),
                    job_id.to_string(),
                    format!("Job {short} completed"),
                );
                Ok(())
            }
            Ok(code) if cancelled => {
                info!(job_id = %short, code, "Cold job container stopped by cancellation");
                self.patch_job(job_id, JobPatch::status(JobStatus::Cancelled))
                    .await;
                Ok(())
            }
            Ok(code) => {
                let error = if stderr_log.is_empty() {
                    format!("exited with code {code}")
                } else {
                    stderr_log.tail(STDERR_TAIL_BYTES)
                };
                warn!(job_id = %short, code, "Cold job failed");
                self.patch_job(job_id, JobPatch::failed(error)).await;
                run_completion_hooks(
                    Arc::clone(&self.hooks),
                    job_id.to_string(),
                    format!("Job {short} failed"),
                );
                Ok(())
            }
            Err(e) => {
                warn!(job_id = %short, error = %e, "Cold job container failed to spawn");
                self.patch_job(job_id, JobPatch::failed(e.to_string())).await;
                run_completion_hooks(
                    Arc::clone(&self.hooks),
                    job_id.to_string(),
                    format!("Job {short} failed to start"),
                );
                Err(e)
            }
        }
    }

    /// Release the finished job's slot and claim the oldest queued entry,
    /// both under one lock acquisition so two overlapping completions can
    /// never dequeue the same entry.
    async fn finish_and_take_next(&self) -> Option<PendingEntry> {
        let mut state = self.state.lock().await;
        state.running -= 1;
        if state.running < self.config.max_concurrent {
            if let Some(entry) = state.pending.pop_front() {
                state.running += 1;
                return Some(entry);
            }
        }
        None
    }

    fn spawn_chain(self: &Arc<Self>, entry: PendingEntry) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut entry = entry;
            loop {
                let result = runner.execute(&entry.job_id, &entry.branch).await;
                let _ = entry.done.send(result);
                match runner.finish_and_take_next().await {
                    Some(next) => entry = next,
                    None => break,
                }
            }
        });
    }

    async fn patch_job(&self, job_id: &str, patch: JobPatch) {
        if let Err(e) = self.store.update_job(job_id, patch).await {
            warn!(job_id = %short_id(job_id), error = %e, "Failed to patch job record");
        }
    }
}

/// First eight characters of a job id, for log prefixes.
pub fn short_id(job_id: &str) -> String {
    job_id.chars().take(8).collect()
}

async fn collect_output(
    mut rx: mpsc::Receiver<OutputChunk>,
    short: String,
    log_cap: usize,
) -> (LogBuffer, LogBuffer) {
    let mut stdout_log = LogBuffer::new(log_cap);
    let mut stderr_log = LogBuffer::new(log_cap);
    while let Some(chunk) = rx.recv().await {
        match chunk.stream {
            OutputStream::Stdout => {
                info!(job = %short, "{}", chunk.line);
                stdout_log.append(format!("{}\n", chunk.line));
            }
            OutputStream::Stderr => {
                warn!(job = %short, "{}", chunk.line);
                stderr_log.append(format!("{}\n", chunk.line));
            }
        }
    }
    (stdout_log, stderr_log)
}
