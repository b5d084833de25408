use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;

/// Environment variables whose suffix becomes a secret key inside job
/// containers, e.g. `WARMDOCK_SECRET_GITHUB_TOKEN` -> `GITHUB_TOKEN`.
pub const SECRET_ENV_PREFIX: &str = "WARMDOCK_SECRET_";

/// Credentials forwarded when no prefixed secrets are configured.
pub const WELL_KNOWN_SECRET_VARS: &[&str] =
    &["ANTHROPIC_API_KEY", "GITHUB_TOKEN", "OPENAI_API_KEY"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Github,
    Local,
    Auto,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(ExecutionMode::Github),
            "local" => Ok(ExecutionMode::Local),
            "auto" => Ok(ExecutionMode::Auto),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub max_jobs_per_worker: u32,
    pub max_lifetime: Duration,
    pub port_start: u16,
    pub host: String,
    /// Interval between readiness probes while a container starts.
    pub ready_poll_interval: Duration,
    /// How long a starting container may take to report healthy.
    pub ready_deadline: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Consecutive health failures before a worker is recycled.
    pub health_failure_threshold: u32,
    /// Upper bound for a full agent run on a warm worker.
    pub run_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            max_jobs_per_worker: 20,
            max_lifetime: Duration::from_secs(3600),
            port_start: 39200,
            host: "127.0.0.1".to_string(),
            ready_poll_interval: Duration::from_secs(3),
            ready_deadline: Duration::from_secs(180),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            health_failure_threshold: 3,
            run_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalRunnerConfig {
    pub max_concurrent: usize,
    /// Cap for each of the captured stdout/stderr buffers.
    pub log_cap_bytes: usize,
    /// Grace period for `docker stop` before the container is killed.
    pub stop_grace: Duration,
}

impl Default for LocalRunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            log_cap_bytes: 256 * 1024,
            stop_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    pub port: u16,
    pub host: String,
    pub idle_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub ready_deadline: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    /// Upper bound for a generic bridged request.
    pub fetch_timeout: Duration,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            port: 39180,
            host: "127.0.0.1".to_string(),
            idle_timeout: Duration::from_secs(1800),
            ready_poll_interval: Duration::from_secs(3),
            ready_deadline: Duration::from_secs(120),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: ExecutionMode,
    pub job_image: Option<String>,
    pub pool: PoolConfig,
    pub local: LocalRunnerConfig,
    pub workspace: WorkspaceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Auto,
            job_image: None,
            pool: PoolConfig::default(),
            local: LocalRunnerConfig::default(),
            workspace: WorkspaceConfig::default(),
        }
    }
}

impl Config {
    /// Build a config from `WARMDOCK_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(mode) = env_parse::<ExecutionMode>("WARMDOCK_MODE") {
            config.mode = mode;
        }
        config.job_image = std::env::var("WARMDOCK_JOB_IMAGE").ok().filter(|s| !s.is_empty());

        if let Some(n) = env_parse::<usize>("WARMDOCK_MAX_LOCAL_JOBS") {
            config.local.max_concurrent = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("WARMDOCK_POOL_SIZE") {
            config.pool.size = n;
        }
        if let Some(n) = env_parse::<u32>("WARMDOCK_POOL_MAX_JOBS_PER_WORKER") {
            config.pool.max_jobs_per_worker = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("WARMDOCK_POOL_MAX_LIFETIME_SECS") {
            config.pool.max_lifetime = Duration::from_secs(secs);
        }
        if let Some(port) = env_parse::<u16>("WARMDOCK_POOL_PORT_START") {
            config.pool.port_start = port;
        }
        if let Some(secs) = env_parse::<u64>("WARMDOCK_WORKSPACE_IDLE_TIMEOUT_SECS") {
            config.workspace.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(port) = env_parse::<u16>("WARMDOCK_WORKSPACE_PORT") {
            config.workspace.port = port;
        }

        config
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Assemble the secrets blob passed into every spawned container.
///
/// Prefixed variables win; when none are present a short list of
/// well-known credential variables is forwarded instead so a bare
/// environment still produces a usable container.
pub fn collect_secrets() -> Value {
    collect_secrets_from(std::env::vars())
}

pub fn collect_secrets_from(vars: impl Iterator<Item = (String, String)>) -> Value {
    let mut prefixed = serde_json::Map::new();
    let mut well_known = serde_json::Map::new();

    for (key, value) in vars {
        if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
            if !name.is_empty() {
                prefixed.insert(name.to_string(), Value::String(value));
            }
        } else if WELL_KNOWN_SECRET_VARS.contains(&key.as_str()) {
            well_known.insert(key, Value::String(value));
        }
    }

    if prefixed.is_empty() {
        json!(well_known)
    } else {
        json!(prefixed)
    }
}

/// Optional LLM-provider secrets blob forwarded verbatim to containers.
pub fn llm_secrets() -> Option<String> {
    std::env::var("WARMDOCK_LLM_SECRETS")
        .ok()
        .filter(|s| !s.is_empty())
}

/// Optional model-routing overrides forwarded verbatim to containers.
pub fn model_overrides() -> Vec<(String, String)> {
    ["WARMDOCK_MODEL", "WARMDOCK_SMALL_MODEL"]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_known_values() {
        assert_eq!("local".parse::<ExecutionMode>(), Ok(ExecutionMode::Local));
        assert_eq!("GitHub".parse::<ExecutionMode>(), Ok(ExecutionMode::Github));
        assert_eq!("auto".parse::<ExecutionMode>(), Ok(ExecutionMode::Auto));
        assert!("warp".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn prefixed_secrets_take_precedence() {
        let vars = vec![
            ("WARMDOCK_SECRET_API_KEY".to_string(), "abc".to_string()),
            ("GITHUB_TOKEN".to_string(), "tok".to_string()),
        ];
        let blob = collect_secrets_from(vars.into_iter());
        assert_eq!(blob["API_KEY"], "abc");
        assert!(blob.get("GITHUB_TOKEN").is_none());
    }

    #[test]
    fn falls_back_to_well_known_credentials() {
        let vars = vec![
            ("GITHUB_TOKEN".to_string(), "tok".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let blob = collect_secrets_from(vars.into_iter());
        assert_eq!(blob["GITHUB_TOKEN"], "tok");
        assert!(blob.get("HOME").is_none());
    }
}
