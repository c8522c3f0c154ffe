use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::db::{DbHandle, TaskLogger};
use crate::errors::SandboxError;
use crate::sandbox::interpreter::{run_fragment, Fragment};
use crate::sandbox::SessionRegistry;
use crate::tasks::{CreateTask, TaskStatus};
use crate::telemetry::{TelemetryEvent, TelemetryQueue};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub registry: Arc<SessionRegistry>,
    pub telemetry: TelemetryQueue,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub prompt: Option<String>,
    pub repo_url: Option<String>,
    pub selected_agent: Option<String>,
    pub selected_model: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ClearTasksParams {
    pub action: Option<String>,
}

#[derive(Deserialize)]
pub struct TelemetryBatch {
    pub events: Vec<TelemetryEvent>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/tasks",
            get(list_tasks).post(create_task).delete(clear_tasks),
        )
        .route("/api/tasks/{task_id}", get(get_task).delete(delete_task))
        .route("/api/sandbox", post(run_sandbox))
        .route("/api/telemetry", post(ingest_telemetry))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_tasks(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let tasks = state.db.call(|db| db.list_tasks()).await.map_err(|e| {
        tracing::error!(error = %e, "error fetching tasks");
        ApiError::Internal("Failed to fetch tasks".into())
    })?;
    Ok(Json(serde_json::json!({ "tasks": tasks })))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let prompt = match req.prompt {
        Some(p) if !p.trim().is_empty() => p,
        _ => return Err(ApiError::BadRequest("Prompt is required".into())),
    };

    let data = CreateTask {
        prompt,
        repo_url: req.repo_url,
        selected_agent: req.selected_agent,
        selected_model: req.selected_model,
        user_id: req.user_id,
    };

    let task = state
        .db
        .call(move |db| db.create_task(&data))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "error creating task");
            ApiError::Internal("Failed to create task".into())
        })?;

    state.telemetry.track(
        "task_created",
        serde_json::json!({ "taskId": task.id, "agent": task.selected_agent }),
        None,
    );

    spawn_task_runner(Arc::clone(&state), task.id.clone());

    Ok(Json(serde_json::json!({ "task": task })))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = task_id.clone();
    let task = state.db.call(move |db| db.get_task(&id)).await.map_err(|e| {
        tracing::error!(task_id = %task_id, error = %e, "error fetching task");
        ApiError::Internal("Failed to fetch task".into())
    })?;

    match task {
        Some(task) => Ok(Json(serde_json::json!({ "task": task }))),
        None => Err(ApiError::NotFound("Task not found".into())),
    }
}

async fn delete_task(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = task_id.clone();
    let deleted = state
        .db
        .call(move |db| {
            // Check existence first so a missing row is a 404, not a no-op.
            if db.get_task(&id)?.is_none() {
                return Ok(None);
            }
            db.delete_task(&id).map(Some)
        })
        .await
        .map_err(|e| {
            tracing::error!(task_id = %task_id, error = %e, "error deleting task");
            ApiError::Internal("Failed to delete task".into())
        })?;

    match deleted {
        Some(_) => Ok(Json(
            serde_json::json!({ "message": "Task deleted successfully" }),
        )),
        None => Err(ApiError::NotFound("Task not found".into())),
    }
}

/// Bulk delete: `DELETE /api/tasks?action=completed,failed`.
async fn clear_tasks(
    State(state): State<SharedState>,
    Query(params): Query<ClearTasksParams>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(action) = params.action else {
        return Err(ApiError::BadRequest("Action parameter is required".into()));
    };

    let actions: Vec<String> = action.split(',').map(|a| a.trim().to_string()).collect();
    const VALID_ACTIONS: [&str; 2] = ["completed", "failed"];
    let invalid: Vec<&str> = actions
        .iter()
        .map(String::as_str)
        .filter(|a| !VALID_ACTIONS.contains(a))
        .collect();
    if !invalid.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "Invalid action(s): {}. Valid actions: {}",
            invalid.join(", "),
            VALID_ACTIONS.join(", ")
        )));
    }

    let mut statuses = Vec::new();
    if actions.iter().any(|a| a == "completed") {
        statuses.push(TaskStatus::Completed);
    }
    if actions.iter().any(|a| a == "failed") {
        statuses.push(TaskStatus::Error);
    }

    let deleted = state
        .db
        .call(move |db| db.delete_tasks_by_status(&statuses))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "error deleting tasks");
            ApiError::Internal("Failed to delete tasks".into())
        })?;

    let message = if deleted > 0 {
        format!(
            "{} {} task(s) deleted successfully",
            deleted,
            actions.join(" and ")
        )
    } else {
        "No tasks found to delete".to_string()
    };

    Ok(Json(serde_json::json!({
        "message": message,
        "deletedCount": deleted,
    })))
}

/// Execute a generated fragment in the session's sandbox.
async fn run_sandbox(
    State(state): State<SharedState>,
    Json(fragment): Json<Fragment>,
) -> Response {
    if fragment.code.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "Missing code data",
                "type": "validation_error",
            })),
        )
            .into_response();
    }

    match run_fragment(&state.registry, &fragment).await {
        Ok(result) => Json(result).into_response(),
        Err(SandboxError::MissingApiKey) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "Code execution service is not configured. Please check environment settings.",
                "type": "config_error",
            })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(session = %fragment.session_id, error = %err, "sandbox execution failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "Code execution failed. There may be an error in your code or dependencies.",
                    "type": "execution_error",
                    "details": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Ingestion side of the telemetry pipeline.
async fn ingest_telemetry(Json(batch): Json<TelemetryBatch>) -> impl IntoResponse {
    for event in &batch.events {
        tracing::info!(
            event = %event.event_name,
            session = %event.session_id,
            "telemetry event"
        );
    }
    Json(serde_json::json!({ "received": batch.events.len() }))
}

// ── Background task processing ────────────────────────────────────────

const TASK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const TASK_WARNING_AFTER: Duration = Duration::from_secs(4 * 60);

/// Run the task's generation job off the request path. The watchdog
/// logs a warning after four minutes and fails the task at five.
fn spawn_task_runner(state: SharedState, task_id: String) {
    tokio::spawn(async move {
        let warning = {
            let logger = TaskLogger::new(state.db.clone(), task_id.clone());
            tokio::spawn(async move {
                tokio::time::sleep(TASK_WARNING_AFTER).await;
                let _ = logger
                    .info("Task is taking longer than expected (4+ minutes). Will timeout in 1 minute.")
                    .await;
            })
        };

        let logger = TaskLogger::new(state.db.clone(), task_id.clone());
        match tokio::time::timeout(TASK_TIMEOUT, process_task(&state, &task_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(task_id = %task_id, error = %err, "task processing failed");
                let _ = logger.error(format!("Error: {}", err)).await;
                let _ = logger
                    .update_status(TaskStatus::Error, Some(err.to_string()))
                    .await;
            }
            Err(_) => {
                tracing::error!(task_id = %task_id, "task timed out");
                let _ = logger
                    .error("Task execution timed out after 5 minutes")
                    .await;
                let _ = logger
                    .update_status(
                        TaskStatus::Error,
                        Some(
                            "Task execution timed out after 5 minutes. The operation took too long to complete."
                                .into(),
                        ),
                    )
                    .await;
            }
        }
        warning.abort();
    });
}

async fn process_task(state: &SharedState, task_id: &str) -> anyhow::Result<()> {
    let logger = TaskLogger::new(state.db.clone(), task_id.to_string());

    logger
        .update_status(TaskStatus::Processing, None)
        .await?;
    logger
        .update_progress(10, Some("Initializing task execution...".into()))
        .await?;
    logger
        .update_progress(25, Some("Setting up environment...".into()))
        .await?;

    let id = task_id.to_string();
    let task = state
        .db
        .call(move |db| db.get_task(&id))
        .await?
        .ok_or_else(|| anyhow::anyhow!("Task {} disappeared mid-run", task_id))?;

    logger
        .update_progress(50, Some("Processing request...".into()))
        .await?;

    // TODO: drive the selected agent inside the session sandbox instead
    // of the staged placeholder below (needs the agent runner surface).
    logger.success("Task processing completed successfully").await?;
    logger
        .update_progress(75, Some("Finalizing results...".into()))
        .await?;
    logger
        .update_progress(100, Some("Task completed successfully".into()))
        .await?;
    logger.update_status(TaskStatus::Completed, None).await?;
    logger
        .success(format!("Task completed: {}", task.prompt))
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::TaskDb;
    use crate::sandbox::client::mock::MockSandboxService;
    use crate::telemetry::{TelemetrySink, TelemetryQueue};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    struct NullSink;

    #[async_trait::async_trait]
    impl TelemetrySink for NullSink {
        async fn deliver(&self, _events: &[TelemetryEvent]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_state() -> (SharedState, Arc<MockSandboxService>) {
        let service = Arc::new(MockSandboxService::default());
        let state = Arc::new(AppState {
            db: DbHandle::new(TaskDb::new_in_memory().unwrap()),
            registry: Arc::new(SessionRegistry::new(
                service.clone(),
                &AppConfig::default(),
            )),
            telemetry: TelemetryQueue::detached(Arc::new(NullSink)),
        });
        (state, service)
    }

    fn test_router() -> (Router, SharedState, Arc<MockSandboxService>) {
        let (state, service) = test_state();
        let router = api_router().with_state(state.clone());
        (router, state, service)
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (app, _, _) = test_router();
        let resp = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_missing_task_returns_exact_404_envelope() {
        let (app, _, _) = test_router();
        let resp = app.oneshot(get("/api/tasks/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "Task not found"})
        );
    }

    #[tokio::test]
    async fn stored_logs_json_round_trips_through_get() {
        let (app, state, _) = test_router();
        state
            .db
            .call(|db| {
                db.raw_insert_for_tests(
                    "task-1",
                    "prompt",
                    r#"[{"line":"hi"}]"#,
                )
            })
            .await
            .unwrap();

        let resp = app.oneshot(get("/api/tasks/task-1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["task"]["logs"], serde_json::json!([{"line": "hi"}]));
    }

    #[tokio::test]
    async fn delete_then_get_is_404() {
        let (app, state, _) = test_router();
        let task = state
            .db
            .call(|db| {
                db.create_task(&CreateTask {
                    prompt: "delete me".into(),
                    ..Default::default()
                })
            })
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/tasks/{}", task.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"message": "Task deleted successfully"})
        );

        let resp = app
            .oneshot(get(&format!("/api/tasks/{}", task.id)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_missing_task_is_404() {
        let (app, _, _) = test_router();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/tasks/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "Task not found"})
        );
    }

    #[tokio::test]
    async fn create_task_requires_a_prompt() {
        let (app, _, _) = test_router();
        let resp = app
            .oneshot(json_request("POST", "/api/tasks", serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"error": "Prompt is required"})
        );
    }

    #[tokio::test]
    async fn create_task_returns_pending_task_and_queues_telemetry() {
        let (app, state, _) = test_router();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/tasks",
                serde_json::json!({"prompt": "build a todo app", "repoUrl": "owner/repo"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["task"]["prompt"], "build a todo app");
        assert_eq!(body["task"]["status"], "pending");
        assert_eq!(body["task"]["repo_url"], "owner/repo");
        assert_eq!(state.telemetry.pending(), 1);
    }

    #[tokio::test]
    async fn clear_tasks_requires_valid_actions() {
        let (app, _, _) = test_router();

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/tasks")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/tasks?action=pending")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("Invalid action(s): pending"));
    }

    #[tokio::test]
    async fn clear_tasks_deletes_by_status() {
        let (app, state, _) = test_router();
        let (a, _b) = state
            .db
            .call(|db| {
                let a = db.create_task(&CreateTask {
                    prompt: "a".into(),
                    ..Default::default()
                })?;
                let b = db.create_task(&CreateTask {
                    prompt: "b".into(),
                    ..Default::default()
                })?;
                db.update_status(&a.id, TaskStatus::Completed, None)?;
                Ok((a, b))
            })
            .await
            .unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/tasks?action=completed,failed")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["deletedCount"], 1);

        let id = a.id.clone();
        let gone = state.db.call(move |db| db.get_task(&id)).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn run_sandbox_executes_interpreter_fragment() {
        let (app, _, service) = test_router();
        *service.execution.lock().unwrap() = crate::sandbox::Execution {
            stdout: vec!["hi".into()],
            ..Default::default()
        };

        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/sandbox",
                serde_json::json!({"sessionID": "s1", "code": "print('hi')"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["stdout"][0], "hi");
        assert!(body["sbxId"].as_str().is_some());
        assert_eq!(service.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_sandbox_rejects_empty_code() {
        let (app, _, _) = test_router();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/sandbox",
                serde_json::json!({"sessionID": "s1", "code": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["type"], "validation_error");
    }

    #[tokio::test]
    async fn run_sandbox_maps_missing_credential_to_503() {
        let (app, _, service) = test_router();
        service.missing_key.store(true, Ordering::SeqCst);

        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/sandbox",
                serde_json::json!({"sessionID": "s1", "code": "print(1)"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["type"], "config_error");
    }

    #[tokio::test]
    async fn telemetry_ingest_acknowledges_batch() {
        let (app, _, _) = test_router();
        let resp = app
            .oneshot(json_request(
                "POST",
                "/api/telemetry",
                serde_json::json!({"events": [
                    {"eventName": "page_view", "eventProperties": {}, "sessionId": "s-1"},
                    {"eventName": "task_created", "eventProperties": {}, "sessionId": "s-1"},
                ]}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["received"], 2);
    }
}
