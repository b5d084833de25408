mod common;

use common::MockRuntime;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use warmdock::config::ExecutionMode;
use warmdock::router::{ExecutionRouter, ResolvedMode};

fn router(mode: ExecutionMode, runtime: Arc<MockRuntime>, ttl: Duration) -> ExecutionRouter {
    ExecutionRouter::with_probe_ttl(mode, None, runtime, ttl)
}

#[tokio::test]
async fn explicit_modes_skip_the_probe() {
    let runtime = MockRuntime::new();
    let github = router(
        ExecutionMode::Github,
        Arc::clone(&runtime),
        Duration::from_secs(30),
    );
    let local = router(
        ExecutionMode::Local,
        Arc::clone(&runtime),
        Duration::from_secs(30),
    );

    assert_eq!(github.resolve_mode().await, ResolvedMode::Github);
    assert_eq!(local.resolve_mode().await, ResolvedMode::Local);
    assert_eq!(runtime.ping_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auto_routes_local_when_runtime_answers() {
    let runtime = MockRuntime::new();
    let router = router(
        ExecutionMode::Auto,
        Arc::clone(&runtime),
        Duration::from_secs(30),
    );

    assert_eq!(router.resolve_mode().await, ResolvedMode::Local);
    assert_eq!(runtime.ping_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auto_routes_github_when_runtime_is_down() {
    let runtime = MockRuntime::new();
    runtime.available.store(false, Ordering::SeqCst);
    let router = router(
        ExecutionMode::Auto,
        Arc::clone(&runtime),
        Duration::from_secs(30),
    );

    assert_eq!(router.resolve_mode().await, ResolvedMode::Github);
}

#[tokio::test]
async fn probe_result_is_cached_within_ttl() {
    let runtime = MockRuntime::new();
    let router = router(
        ExecutionMode::Auto,
        Arc::clone(&runtime),
        Duration::from_secs(30),
    );

    assert_eq!(router.resolve_mode().await, ResolvedMode::Local);
    // The runtime goes away, but the cached probe still answers.
    runtime.available.store(false, Ordering::SeqCst);
    assert_eq!(router.resolve_mode().await, ResolvedMode::Local);
    assert_eq!(runtime.ping_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_probe_is_refreshed() {
    let runtime = MockRuntime::new();
    let router = router(ExecutionMode::Auto, Arc::clone(&runtime), Duration::ZERO);

    assert_eq!(router.resolve_mode().await, ResolvedMode::Local);
    runtime.available.store(false, Ordering::SeqCst);
    assert_eq!(router.resolve_mode().await, ResolvedMode::Github);
    assert_eq!(runtime.ping_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn job_image_defaults_to_version_pinned_tag() {
    let runtime = MockRuntime::new();
    let router = ExecutionRouter::new(ExecutionMode::Local, None, runtime);

    let expected = format!("ghcr.io/warmdock/agent:{}", env!("CARGO_PKG_VERSION"));
    assert_eq!(router.resolve_job_image(), expected);
}

#[tokio::test]
async fn job_image_override_wins() {
    let runtime = MockRuntime::new();
    let router = ExecutionRouter::new(
        ExecutionMode::Local,
        Some("registry.local/custom:latest".to_string()),
        runtime,
    );

    assert_eq!(router.resolve_job_image(), "registry.local/custom:latest");
    // Memoized: same answer on every call.
    assert_eq!(router.resolve_job_image(), "registry.local/custom:latest");
}
