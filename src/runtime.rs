//! Container runtime abstraction and its Docker CLI implementation.
//!
//! All container operations funnel through `ContainerRuntime` so the pool,
//! cold runner, and workspace manager can be exercised against a scripted
//! runtime in tests.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Label identifying single-use job containers.
pub const JOB_LABEL: &str = "warmdock.job";
/// Label identifying warm pool member containers.
pub const POOL_LABEL: &str = "warmdock.pool";
/// Label identifying the workspace container.
pub const WORKSPACE_LABEL: &str = "warmdock.workspace";

const SPAWN_TIMEOUT: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    /// `(host_port, container_port)` published 1:1.
    pub port_map: Option<(u16, u16)>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    /// Value of the label the listing matched on.
    pub label_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub line: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Probe whether the runtime is reachable at all.
    async fn ping(&self) -> bool;

    /// Start a long-lived container detached, returning its id.
    async fn start_detached(&self, spec: &ContainerSpec) -> Result<String>;

    /// Run a single-use container in the foreground, streaming each output
    /// line into `output`, and return its exit code once it terminates.
    async fn run_streaming(
        &self,
        spec: &ContainerSpec,
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<i32>;

    /// Graceful stop with a grace period, after which the runtime kills.
    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    async fn kill(&self, name: &str) -> Result<()>;

    /// Force-remove a container, running or not.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Running containers carrying `label`, with that label's value.
    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>>;
}

/// `ContainerRuntime` backed by the `docker` CLI.
pub struct DockerCli;

impl DockerCli {
    fn base_args(spec: &ContainerSpec, detach: bool) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];
        if detach {
            args.push("-d".to_string());
        }
        args.push("--name".to_string());
        args.push(spec.name.clone());
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some((host, container)) = spec.port_map {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1:{host}:{container}"));
        }
        args.push(spec.image.clone());
        args
    }

    async fn docker(args: &[String]) -> Result<std::process::Output> {
        let output = tokio::time::timeout(
            SPAWN_TIMEOUT,
            Command::new("docker")
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| OrchestratorError::Spawn("docker command timed out".to_string()))?
        .map_err(|e| OrchestratorError::Spawn(format!("failed to run docker: {e}")))?;
        Ok(output)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> bool {
        let probe = Command::new("docker")
            .args(["info", "--format", "{{.ServerVersion}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        matches!(
            tokio::time::timeout(PING_TIMEOUT, probe).await,
            Ok(Ok(status)) if status.success()
        )
    }

    async fn start_detached(&self, spec: &ContainerSpec) -> Result<String> {
        let args = Self::base_args(spec, true);
        debug!(container = %spec.name, "Starting detached container");
        let output = Self::docker(&args).await?;
        if !output.status.success() {
            return Err(OrchestratorError::Spawn(format!(
                "docker run failed for '{}': {}",
                spec.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_streaming(
        &self,
        spec: &ContainerSpec,
        output: mpsc::Sender<OutputChunk>,
    ) -> Result<i32> {
        let args = Self::base_args(spec, false);
        debug!(container = %spec.name, "Running foreground container");
        let mut child = Command::new("docker")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::Spawn(format!("failed to run docker: {e}")))?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = output.clone();
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                tx,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = output.clone();
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                tx,
            )));
        }
        drop(output);

        let status = child
            .wait()
            .await
            .map_err(|e| OrchestratorError::Spawn(format!("failed to wait for docker: {e}")))?;
        for reader in readers {
            let _ = reader.await;
        }
        Ok(status.code().unwrap_or(-1))
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            name.to_string(),
        ];
        let output = Self::docker(&args).await?;
        if !output.status.success() {
            warn!(container = name, "docker stop reported failure");
        }
        Ok(())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let args = vec!["kill".to_string(), name.to_string()];
        let _ = Self::docker(&args).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let args = vec!["rm".to_string(), "-f".to_string(), name.to_string()];
        let _ = Self::docker(&args).await?;
        Ok(())
    }

    async fn list_labeled(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let args = vec![
            "ps".to_string(),
            "--filter".to_string(),
            format!("label={label}"),
            "--format".to_string(),
            format!("{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.Label \"{label}\"}}}}"),
        ];
        let output = Self::docker(&args).await?;
        if !output.status.success() {
            return Err(OrchestratorError::Spawn(format!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split('\t');
                Some(ContainerSummary {
                    id: parts.next()?.to_string(),
                    name: parts.next()?.to_string(),
                    label_value: parts.next().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputChunk>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(OutputChunk { stream, line }).await.is_err() {
            break;
        }
    }
}
