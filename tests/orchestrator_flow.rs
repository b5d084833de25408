mod common;

use common::{pool_config, MockRuntime, RecordingHooks, ScriptedRun};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use warmdock::config::{Config, ExecutionMode};
use warmdock::jobs::{ExecutionTier, InMemoryJobStore, JobStatus, JobStore};
use warmdock::orchestrator::{Orchestrator, SubmitOutcome};
use warmdock::runtime::ContainerRuntime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn orchestrator(
    mode: ExecutionMode,
    runtime: Arc<MockRuntime>,
    store: Arc<InMemoryJobStore>,
) -> Orchestrator {
    let config = Config {
        mode,
        pool: warmdock::config::PoolConfig {
            size: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    Orchestrator::new(
        config,
        runtime,
        store,
        Arc::new(RecordingHooks::default()),
    )
}

#[tokio::test]
async fn github_mode_hands_the_job_to_ci() {
    let runtime = MockRuntime::new();
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(ExecutionMode::Github, Arc::clone(&runtime), Arc::clone(&store));
    orchestrator.start().await.unwrap();

    let outcome = orchestrator.submit("job-gh", "main").await.unwrap();

    assert_eq!(outcome, SubmitOutcome::Github);
    assert_eq!(
        store.job_status("job-gh").await.unwrap(),
        Some(JobStatus::Queued)
    );
    assert_eq!(store.tier_of("job-gh").await, Some(ExecutionTier::Github));
    // Forced mode never touches the container runtime.
    assert_eq!(runtime.ping_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn local_mode_without_pool_runs_cold() {
    let runtime = MockRuntime::new();
    runtime.script(ScriptedRun::exit_code(0)).await;
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(ExecutionMode::Local, Arc::clone(&runtime), Arc::clone(&store));
    orchestrator.start().await.unwrap();

    let outcome = orchestrator.submit("job-cold", "main").await.unwrap();

    assert_eq!(outcome, SubmitOutcome::Executed);
    assert_eq!(
        store.job_status("job-cold").await.unwrap(),
        Some(JobStatus::Completed)
    );
    assert_eq!(store.tier_of("job-cold").await, Some(ExecutionTier::Local));
    assert_eq!(*runtime.run_order.lock().await, vec!["job-cold"]);
}

#[tokio::test]
async fn auto_mode_degrades_to_ci_when_runtime_is_down() {
    let runtime = MockRuntime::new();
    runtime.available.store(false, Ordering::SeqCst);
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(ExecutionMode::Auto, Arc::clone(&runtime), Arc::clone(&store));
    orchestrator.start().await.unwrap();

    let outcome = orchestrator.submit("job-auto", "main").await.unwrap();

    assert_eq!(outcome, SubmitOutcome::Github);
    assert_eq!(store.tier_of("job-auto").await, Some(ExecutionTier::Github));
}

#[tokio::test]
async fn parallel_submits_against_one_warm_worker_both_finish() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ready": true})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": "completed"}))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let runtime = MockRuntime::new();
    let store = Arc::new(InMemoryJobStore::new());
    let config = Config {
        mode: ExecutionMode::Local,
        pool: pool_config(server.address().port(), 1),
        ..Default::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(RecordingHooks::default()),
    ));
    orchestrator.start().await.unwrap();

    let (a, b) = tokio::join!(
        {
            let o = Arc::clone(&orchestrator);
            async move { o.submit("job-p1", "main").await }
        },
        {
            let o = Arc::clone(&orchestrator);
            async move { o.submit("job-p2", "main").await }
        }
    );

    // Whichever submit loses the single worker still executes via the
    // cold path; neither job is lost or left non-terminal.
    assert_eq!(a.unwrap(), SubmitOutcome::Executed);
    assert_eq!(b.unwrap(), SubmitOutcome::Executed);
    assert_eq!(
        store.job_status("job-p1").await.unwrap(),
        Some(JobStatus::Completed)
    );
    assert_eq!(
        store.job_status("job-p2").await.unwrap(),
        Some(JobStatus::Completed)
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn submit_new_generates_a_usable_job_id() {
    let runtime = MockRuntime::new();
    runtime.script(ScriptedRun::exit_code(0)).await;
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(ExecutionMode::Local, Arc::clone(&runtime), Arc::clone(&store));
    orchestrator.start().await.unwrap();

    let (job_id, outcome) = orchestrator.submit_new("main").await.unwrap();

    assert_eq!(outcome, SubmitOutcome::Executed);
    assert!(!job_id.is_empty());
    assert_eq!(
        store.job_status(&job_id).await.unwrap(),
        Some(JobStatus::Completed)
    );
}

#[tokio::test]
async fn cancel_falls_through_to_the_cold_queue() {
    let runtime = MockRuntime::new();
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = orchestrator(ExecutionMode::Local, Arc::clone(&runtime), Arc::clone(&store));
    orchestrator.start().await.unwrap();

    // Nothing running anywhere: cancel reports false rather than erroring.
    assert!(!orchestrator.cancel("job-missing").await);
}
