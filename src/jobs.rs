//! Collaborator contracts for job persistence and post-completion hooks.
//!
//! The orchestrator never owns job records; it patches them through
//! `JobStore` and fires `CompletionHooks` best-effort after a job reaches
//! a terminal state. Both are injected so tests (and embedders without a
//! database) can supply their own implementations.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Which execution tier actually ran (or will run) a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    Warm,
    Local,
    /// Started warm, finished on the cold path after the worker died.
    LocalFallback,
    Github,
}

/// Partial update applied to a job record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ExecutionTier>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_tier(mut self, tier: ExecutionTier) -> Self {
        self.tier = Some(tier);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_id: String,
    pub branch: String,
    pub status: JobStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> Result<()>;
    async fn update_job(&self, job_id: &str, patch: JobPatch) -> Result<()>;
    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>>;
}

/// Best-effort side effects fired after a job reaches a terminal state.
#[async_trait]
pub trait CompletionHooks: Send + Sync {
    async fn extract_memories(&self, job_id: &str) -> Result<()>;
    async fn notify(&self, text: &str, job_id: &str) -> Result<()>;
}

/// Hooks implementation that does nothing.
pub struct NoopHooks;

#[async_trait]
impl CompletionHooks for NoopHooks {
    async fn extract_memories(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }

    async fn notify(&self, _text: &str, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Spawn a background task whose failure is logged and swallowed.
///
/// Makes the "this must never propagate" decision explicit at the call
/// site instead of hiding it in an unobserved task handle.
pub fn spawn_best_effort<F>(label: &'static str, fut: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(task = label, error = %e, "Best-effort task failed");
        }
    });
}

/// Fire both completion hooks for a finished job, best-effort.
pub fn run_completion_hooks(hooks: Arc<dyn CompletionHooks>, job_id: String, summary: String) {
    let hooks2 = Arc::clone(&hooks);
    let id2 = job_id.clone();
    spawn_best_effort("extract_memories", async move {
        hooks.extract_memories(&job_id).await
    });
    spawn_best_effort("notify", async move { hooks2.notify(&summary, &id2).await });
}

#[derive(Debug, Clone)]
struct JobRecord {
    status: JobStatus,
    error: Option<String>,
    tier: Option<ExecutionTier>,
}

/// In-memory job store for tests and embedders without persistence.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn error_of(&self, job_id: &str) -> Option<String> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .and_then(|j| j.error.clone())
    }

    pub async fn tier_of(&self, job_id: &str) -> Option<ExecutionTier> {
        self.jobs.read().await.get(job_id).and_then(|j| j.tier)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<()> {
        self.jobs.write().await.insert(
            job.job_id,
            JobRecord {
                status: job.status,
                error: None,
                tier: None,
            },
        );
        Ok(())
    }

    async fn update_job(&self, job_id: &str, patch: JobPatch) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.entry(job_id.to_string()).or_insert(JobRecord {
            status: JobStatus::Created,
            error: None,
            tier: None,
        });
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(error) = patch.error {
            record.error = Some(error);
        }
        if let Some(tier) = patch.tier {
            record.tier = Some(tier);
        }
        Ok(())
    }

    async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        Ok(self.jobs.read().await.get(job_id).map(|j| j.status))
    }
}
