//! Top-level composition: wires the router, warm pool, cold runner, and
//! workspace manager together with injected collaborators. Construct one
//! per process at the composition root; there are no ambient singletons.

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::jobs::{CompletionHooks, ExecutionTier, JobPatch, JobStatus, JobStore, NewJob};
use crate::local::LocalRunner;
use crate::pool::WarmPool;
use crate::router::{ExecutionRouter, ResolvedMode};
use crate::runtime::ContainerRuntime;
use crate::workspace::WorkspaceManager;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Where a submitted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Executed on the warm/local tier; the job record holds the result.
    Executed,
    /// Routed to the remote CI tier; the caller hands it off from here.
    Github,
}

pub struct Orchestrator {
    router: ExecutionRouter,
    pool: Arc<WarmPool>,
    local: Arc<LocalRunner>,
    workspace: Arc<WorkspaceManager>,
    store: Arc<dyn JobStore>,
    pool_enabled: bool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn JobStore>,
        hooks: Arc<dyn CompletionHooks>,
    ) -> Self {
        let router = ExecutionRouter::new(
            config.mode,
            config.job_image.clone(),
            Arc::clone(&runtime),
        );
        let image = router.resolve_job_image().to_string();

        let local = Arc::new(LocalRunner::new(
            config.local.clone(),
            image.clone(),
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&hooks),
        ));
        let pool = Arc::new(WarmPool::new(
            config.pool.clone(),
            image.clone(),
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&local),
        ));
        let workspace = Arc::new(WorkspaceManager::new(
            config.workspace.clone(),
            image,
            Arc::clone(&runtime),
        ));

        Self {
            router,
            pool,
            local,
            workspace,
            store,
            pool_enabled: config.pool.size > 0,
        }
    }

    /// Startup: reconcile orphans from a previous process, then bring the
    /// warm pool up. Worker fleet state is rebuilt from scratch here.
    pub async fn start(&self) -> Result<()> {
        self.local.cleanup_orphans().await?;
        if self.pool_enabled {
            self.pool.init().await?;
        }
        info!("Orchestrator started");
        Ok(())
    }

    /// Submit a job without a caller-supplied id; returns the generated id
    /// alongside the outcome.
    pub async fn submit_new(&self, branch: &str) -> Result<(String, SubmitOutcome)> {
        let job_id = Uuid::new_v4().to_string();
        let outcome = self.submit(&job_id, branch).await?;
        Ok((job_id, outcome))
    }

    /// Mode-agnostic job entry point: records the job, resolves the
    /// execution tier, and runs it warm-first with cold fallback.
    pub async fn submit(&self, job_id: &str, branch: &str) -> Result<SubmitOutcome> {
        self.store
            .insert_job(NewJob {
                job_id: job_id.to_string(),
                branch: branch.to_string(),
                status: JobStatus::Created,
                created_at: chrono::Utc::now(),
            })
            .await?;

        match self.router.resolve_mode().await {
            ResolvedMode::Github => {
                self.store
                    .update_job(
                        job_id,
                        JobPatch::status(JobStatus::Queued).with_tier(ExecutionTier::Github),
                    )
                    .await?;
                Ok(SubmitOutcome::Github)
            }
            ResolvedMode::Local => {
                if self.pool_enabled && self.pool.has_available_worker().await {
                    match self.pool.assign_job(job_id, branch).await {
                        Ok(()) => return Ok(SubmitOutcome::Executed),
                        // A parallel submission claimed the worker between the
                        // availability check and the assignment; run cold.
                        Err(OrchestratorError::NoIdleWorker) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.store
                    .update_job(job_id, JobPatch::default().with_tier(ExecutionTier::Local))
                    .await?;
                self.local.run(job_id, branch).await?;
                Ok(SubmitOutcome::Executed)
            }
        }
    }

    /// Cancel a job wherever it is: warm worker, active cold container,
    /// or still in the cold queue.
    pub async fn cancel(&self, job_id: &str) -> bool {
        if self.pool_enabled && self.pool.cancel_job(job_id).await {
            return true;
        }
        self.local.cancel(job_id).await
    }

    pub fn pool(&self) -> &Arc<WarmPool> {
        &self.pool
    }

    pub fn local(&self) -> &Arc<LocalRunner> {
        &self.local
    }

    pub fn workspace(&self) -> &Arc<WorkspaceManager> {
        &self.workspace
    }

    pub async fn shutdown(&self) {
        if self.pool_enabled {
            self.pool.shutdown().await;
        }
        self.workspace.shutdown().await;
        info!("Orchestrator shut down");
    }
}
