//! Execution-mode routing: decides which tier handles a job and which
//! container image job workers run.

use crate::config::ExecutionMode;
use crate::runtime::ContainerRuntime;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// How long one runtime-availability probe result is trusted. A runtime
/// outage is therefore detected within one window, not instantly.
pub const PROBE_TTL: Duration = Duration::from_secs(30);

const DEFAULT_IMAGE_REPO: &str = "ghcr.io/warmdock/agent";

/// The tier a job is actually routed to (never `Auto`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedMode {
    Github,
    Local,
}

struct ProbeCache {
    checked_at: Instant,
    available: bool,
}

pub struct ExecutionRouter {
    mode: ExecutionMode,
    image_override: Option<String>,
    runtime: Arc<dyn ContainerRuntime>,
    probe_ttl: Duration,
    probe_cache: Mutex<Option<ProbeCache>>,
    image: OnceLock<String>,
}

impl ExecutionRouter {
    pub fn new(
        mode: ExecutionMode,
        image_override: Option<String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self::with_probe_ttl(mode, image_override, runtime, PROBE_TTL)
    }

    pub fn with_probe_ttl(
        mode: ExecutionMode,
        image_override: Option<String>,
        runtime: Arc<dyn ContainerRuntime>,
        probe_ttl: Duration,
    ) -> Self {
        Self {
            mode,
            image_override,
            runtime,
            probe_ttl,
            probe_cache: Mutex::new(None),
            image: OnceLock::new(),
        }
    }

    /// Resolve the execution mode for the next job. `auto` picks the local
    /// tier iff the container runtime answers a (cached) probe.
    pub async fn resolve_mode(&self) -> ResolvedMode {
        match self.mode {
            ExecutionMode::Github => ResolvedMode::Github,
            ExecutionMode::Local => ResolvedMode::Local,
            ExecutionMode::Auto => {
                if self.runtime_available().await {
                    ResolvedMode::Local
                } else {
                    ResolvedMode::Github
                }
            }
        }
    }

    async fn runtime_available(&self) -> bool {
        let mut cache = self.probe_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.checked_at.elapsed() < self.probe_ttl {
                return cached.available;
            }
        }
        let available = self.runtime.ping().await;
        debug!(available, "Probed container runtime availability");
        *cache = Some(ProbeCache {
            checked_at: Instant::now(),
            available,
        });
        available
    }

    /// The image job workers run: an explicit override, or a version-pinned
    /// tag derived from this crate's version. Memoized for the process
    /// lifetime since image identity cannot change without a restart.
    pub fn resolve_job_image(&self) -> &str {
        self.image.get_or_init(|| {
            self.image_override.clone().unwrap_or_else(|| {
                format!("{DEFAULT_IMAGE_REPO}:{}", env!("CARGO_PKG_VERSION"))
            })
        })
    }
}
