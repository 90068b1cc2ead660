use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

use scheduler_api::{create_app, AppState};
use scheduler_core::config::SchedulerConfig;
use scheduler_dispatcher::registry::{PipelineRegistry, StaticPipelineSource};
use scheduler_dispatcher::{DaemonTracker, ExecutionCoordinator, Stores};
use scheduler_domain::entities::InstanceIdentity;
use scheduler_domain::runnable::RunnableRegistry;
use scheduler_testing_utils::{
    FakeRunnable, MockDaemonStateRepository, MockExecutionRepository, MockJobStore,
    MockResourceLockRepository, PipelineConfigBuilder, RecordingAlertSink,
};

struct TestApp {
    router: Router,
    coordinator: Arc<ExecutionCoordinator>,
    daemon: Arc<DaemonTracker>,
}

async fn test_app() -> TestApp {
    let config = SchedulerConfig::default();
    let identity = InstanceIdentity::new("api-host", 7);
    let source = Arc::new(StaticPipelineSource::new(vec![
        PipelineConfigBuilder::new("fxrate").with_priority(1).build(),
        PipelineConfigBuilder::new("rentroll")
            .with_cron("0 6 * * *")
            .build(),
    ]));
    let registry = Arc::new(PipelineRegistry::load(source).await.unwrap());
    let mut runnables = RunnableRegistry::new();
    runnables.register("fxrate", Arc::new(FakeRunnable::succeeding(1)));

    let coordinator = Arc::new(ExecutionCoordinator::new(
        config.clone(),
        identity.clone(),
        registry,
        Stores {
            jobs: Arc::new(MockJobStore::new()),
            executions: Arc::new(MockExecutionRepository::new()),
            locks: Arc::new(MockResourceLockRepository::new()),
        },
        Arc::new(runnables),
        Arc::new(RecordingAlertSink::new()),
    ));
    coordinator.sync_jobs(Utc::now()).await.unwrap();

    let daemon = Arc::new(DaemonTracker::new(
        Arc::new(MockDaemonStateRepository::new()),
        identity,
        &config,
    ));

    TestApp {
        router: create_app(AppState::new(coordinator.clone(), daemon.clone())),
        coordinator,
        daemon,
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_health_reflects_daemon_liveness() {
    let app = test_app().await;

    let (status, body) = send(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unavailable");

    let now = Utc::now();
    app.daemon.mark_starting(None, now).await.unwrap();
    app.daemon.mark_running(now).await.unwrap();

    let (status, body) = send(&app.router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["daemon"]["status"], "running");
}

#[tokio::test]
async fn test_list_pipelines_includes_next_run() {
    let app = test_app().await;

    let (status, body) = send(&app.router, "GET", "/api/pipelines", None).await;
    assert_eq!(status, StatusCode::OK);
    let pipelines = body["data"].as_array().unwrap();
    assert_eq!(pipelines.len(), 2);

    let fxrate = pipelines.iter().find(|p| p["name"] == "fxrate").unwrap();
    assert_eq!(fxrate["priority"], 1);
    assert!(fxrate["next_run_time"].is_string());
    assert_eq!(fxrate["paused"], false);
}

#[tokio::test]
async fn test_trigger_and_query_execution() {
    let app = test_app().await;

    let (status, body) = send(
        &app.router,
        "POST",
        "/api/pipelines/fxrate/trigger",
        Some(r#"{"params": {"mode": "full"}}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "queued");
    assert_eq!(body["data"]["triggered_by"], "api");
    let id = body["data"]["execution_id"].as_str().unwrap().to_string();

    let (status, body) = send(&app.router, "GET", &format!("/api/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pipeline_name"], "fxrate");

    let (status, body) = send(
        &app.router,
        "GET",
        "/api/executions?pipeline=fxrate&status=queued",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(&app.router, "GET", "/api/executions?status=running", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_trigger_without_body() {
    let app = test_app().await;
    let (status, _) = send(&app.router, "POST", "/api/pipelines/rentroll/trigger", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_unknown_resources_return_404() {
    let app = test_app().await;

    let (status, body) = send(&app.router, "POST", "/api/pipelines/nope/trigger", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "PIPELINE_NOT_FOUND");

    let missing = uuid::Uuid::new_v4();
    let (status, _) = send(&app.router, "GET", &format!("/api/executions/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_status_filter_is_rejected() {
    let app = test_app().await;
    let (status, body) = send(&app.router, "GET", "/api/executions?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_cancel_queued_execution() {
    let app = test_app().await;
    let (_, body) = send(&app.router, "POST", "/api/pipelines/fxrate/trigger", None).await;
    let id = body["data"]["execution_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app.router,
        "POST",
        &format!("/api/executions/{id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["outcome"], "cancelled");

    let (_, body) = send(
        &app.router,
        "POST",
        &format!("/api/executions/{id}/cancel"),
        None,
    )
    .await;
    assert_eq!(body["data"]["outcome"], "already_finished");
}

#[tokio::test]
async fn test_pause_and_resume_dispatch() {
    let app = test_app().await;

    // 未运行时不能暂停
    let (status, _) = send(&app.router, "POST", "/api/daemon/pause", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let now = Utc::now();
    app.daemon.mark_starting(None, now).await.unwrap();
    app.daemon.mark_running(now).await.unwrap();

    let (status, body) = send(&app.router, "POST", "/api/daemon/pause", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "paused");
    assert!(app.coordinator.is_paused());

    let (_, body) = send(&app.router, "GET", "/api/daemon", None).await;
    assert_eq!(body["data"]["dispatch_paused"], true);

    let (status, _) = send(&app.router, "POST", "/api/daemon/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!app.coordinator.is_paused());
}

#[tokio::test]
async fn test_pause_and_resume_pipeline_job() {
    let app = test_app().await;

    let (status, _) = send(&app.router, "POST", "/api/pipelines/rentroll/pause", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&app.router, "GET", "/api/pipelines", None).await;
    let rentroll = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["name"] == "rentroll")
        .cloned()
        .unwrap();
    assert_eq!(rentroll["paused"], true);

    let (status, body) = send(&app.router, "POST", "/api/pipelines/rentroll/resume", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["next_run_time"].is_string());

    let (_, locks) = send(&app.router, "GET", "/api/locks", None).await;
    assert!(locks["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_events_endpoint_is_an_sse_stream() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/events?pipeline=fxrate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));
}
