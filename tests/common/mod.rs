//! Shared test doubles: a scripted container runtime, recording hooks,
//! and config helpers with test-sized timeouts.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use warmdock::config::{LocalRunnerConfig, PoolConfig, WorkspaceConfig};
use warmdock::error::{OrchestratorError, Result};
use warmdock::jobs::{CompletionHooks, InMemoryJobStore};
use warmdock::local::LocalRunner;
use warmdock::runtime::{
    ContainerRuntime, ContainerSpec, ContainerSummary, OutputChunk, OutputStream,
};

pub struct ScriptedRun {
    pub chunks: Vec<(OutputStream, &'static str)>,
    pub exit: std::result::Result<i32, String>,
    pub delay: Duration,
}

impl Default for ScriptedRun {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            exit: Ok(0),
            delay: Duration::from_millis(20),
        }
    }
}

impl ScriptedRun {
    pub fn exit_code(code: i32) -> Self {
        Self {
            exit: Ok(code),
            ..Default::default()
        }
    }

    pub fn spawn_error(message: &str) -> Self {
        Self {
            exit: Err(message.to_string()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, line: &'static str) -> Self {
        self.chunks.push((OutputStream::Stderr, line));
        self
    }
}

/// Scripted `ContainerRuntime`: records every operation and plays back
/// queued run scripts in start order.
pub struct MockRuntime {
    pub available: AtomicBool,
    pub ping_count: AtomicUsize,
    pub fail_detached_start: AtomicBool,
    runs: Mutex<VecDeque<ScriptedRun>>,
    pub started: Mutex<Vec<ContainerSpec>>,
    pub removed: Mutex<Vec<String>>,
    pub labeled: Mutex<Vec<ContainerSummary>>,
    /// Job ids in the order their containers started running.
    pub run_order: Mutex<Vec<String>>,
    running_now: AtomicUsize,
    pub max_running: AtomicUsize,
    stop_signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            ping_count: AtomicUsize::new(0),
            fail_detached_start: AtomicBool::new(false),
            runs: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            labeled: Mutex::new(Vec::new()),
            run_order: Mutex::new(Vec::new()),
            running_now: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            stop_signals: Mutex::new(HashMap::new()),
        })
    }

    pub async fn script(&self, run: ScriptedRun) {
        self.runs.lock().await.push_back(run);
    }

    pub async fn add_labeled(&self, name: &str, label_value: &str) {
        self.labeled.lock().await.push(ContainerSummary {
            id: format!("cid-{name}"),
            name: name.to_string(),
            label_value: label_value.to_string(),
        });
    }

    pub async fn started_count(&self) -> usize {
        self.started.lock().await.len()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> bool {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        self.available.load(Ordering::SeqCst)
    }

    async fn start_detached(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_detached_start.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Spawn("scripted spawn failure".into()));
        }
        let mut started = self.started.lock().await;
        started.push(spec.clone());
        Ok(format!("cid-{}", started.len()))
    }

    async fn run_streaming(
        &self,
        spec: &ContainerSpec,
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<i32> {
        let job_id = spec
            .env
            .iter()
            .find(|(k, _)| k == "WARMDOCK_JOB_ID")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let script = self.runs.lock().await.pop_front().unwrap_or_default();

        let exit = match script.exit {
            Ok(code) => code,
            Err(message) => return Err(OrchestratorError::Spawn(message)),
        };

        self.run_order.lock().await.push(job_id);
        let now = self.running_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);

        for (stream, line) in script.chunks {
            let _ = output
                .send(OutputChunk {
                    stream,
                    line: line.to_string(),
                })
                .await;
        }
        drop(output);

        let stopper = Arc::new(Notify::new());
        self.stop_signals
            .lock()
            .await
            .insert(spec.name.clone(), Arc::clone(&stopper));

        let exit = tokio::select! {
            _ = tokio::time::sleep(script.delay) => exit,
            _ = stopper.notified() => 137,
        };

        self.stop_signals.lock().await.remove(&spec.name);
        self.running_now.fetch_sub(1, Ordering::SeqCst);
        Ok(exit)
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<()> {
        if let Some(stopper) = self.stop_signals.lock().await.get(name) {
            stopper.notify_waiters();
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.stop(name, Duration::ZERO).await
    }

    async fn remove(&self, name: &str) -> Result<()> {
        if let Some(stopper) = self.stop_signals.lock().await.get(name) {
            stopper.notify_waiters();
        }
        self.removed.lock().await.push(name.to_string());
        Ok(())
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        // Only job-label listings are scripted; pool cleanup sees nothing.
        if label == warmdock::runtime::JOB_LABEL {
            Ok(self.labeled.lock().await.clone())
        } else {
            Ok(Vec::new())
        }
    }
}

#[derive(Default)]
pub struct RecordingHooks {
    pub extracted: Mutex<Vec<String>>,
    pub notified: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionHooks for RecordingHooks {
    async fn extract_memories(&self, job_id: &str) -> anyhow::Result<()> {
        self.extracted.lock().await.push(job_id.to_string());
        Ok(())
    }

    async fn notify(&self, text: &str, _job_id: &str) -> anyhow::Result<()> {
        self.notified.lock().await.push(text.to_string());
        Ok(())
    }
}

pub fn local_runner(
    max_concurrent: usize,
    runtime: Arc<MockRuntime>,
    store: Arc<InMemoryJobStore>,
    hooks: Arc<RecordingHooks>,
) -> Arc<LocalRunner> {
    Arc::new(LocalRunner::new(
        LocalRunnerConfig {
            max_concurrent,
            log_cap_bytes: 4096,
            stop_grace: Duration::from_millis(50),
        },
        "test-image:0".to_string(),
        runtime,
        store,
        hooks,
    ))
}

/// Pool config with test-sized timeouts, pointed at `port` for slot 0.
pub fn pool_config(port: u16, size: usize) -> PoolConfig {
    PoolConfig {
        size,
        max_jobs_per_worker: 100,
        max_lifetime: Duration::from_secs(3600),
        port_start: port,
        host: "127.0.0.1".to_string(),
        ready_poll_interval: Duration::from_millis(25),
        ready_deadline: Duration::from_millis(1500),
        health_interval: Duration::from_secs(3600),
        health_timeout: Duration::from_millis(500),
        health_failure_threshold: 3,
        run_timeout: Duration::from_secs(5),
    }
}

pub fn workspace_config(port: u16) -> WorkspaceConfig {
    WorkspaceConfig {
        port,
        host: "127.0.0.1".to_string(),
        idle_timeout: Duration::from_secs(600),
        ready_poll_interval: Duration::from_millis(25),
        ready_deadline: Duration::from_millis(1500),
        health_interval: Duration::from_secs(3600),
        health_timeout: Duration::from_millis(500),
        fetch_timeout: Duration::from_secs(5),
    }
}
