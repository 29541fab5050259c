use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::info;

use super::issue_pipeline::IssueTask;
use super::models::{ApplyReviewRequest, ProcessIssueRequest, TriggerResponse};
use super::review_pipeline::ReviewTask;
use super::runner::AgentRunner;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub runner: AgentRunner,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
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

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/agent/process", post(process_issue))
        .route("/api/agent/trigger", post(process_issue))
        .route("/api/agent/status", get(agent_status))
        .route("/api/agent/apply-review", post(apply_review))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn positive(value: i64, field: &str) -> Result<u64, ApiError> {
    u64::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| ApiError::BadRequest(format!("{} must be a positive integer", field)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn process_issue(
    State(state): State<SharedState>,
    payload: Result<Json<ProcessIssueRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let number = positive(req.issue_number, "issue_number")?;

    info!(issue_number = number, "Agent processing requested");
    state.runner.start_issue(IssueTask {
        number,
        title: req.issue_title,
        body: req.issue_body,
    });

    Ok(Json(TriggerResponse {
        success: true,
        message: "Agent processing started".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    issue_number: Option<String>,
}

async fn agent_status(
    State(state): State<SharedState>,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = query
        .issue_number
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing issue_number".to_string()))?;
    let number: u64 = raw
        .trim()
        .parse()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| ApiError::BadRequest("Invalid issue_number".to_string()))?;

    state
        .runner
        .store()
        .get(number)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No status for this issue".to_string()))
}

async fn apply_review(
    State(state): State<SharedState>,
    payload: Result<Json<ApplyReviewRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let issue_number = positive(req.issue_number, "issue_number")?;
    let pr_number = positive(req.pr_number, "pr_number")?;
    if req.comments.is_empty() {
        return Err(ApiError::BadRequest("No review comments provided".to_string()));
    }
    if req.comments.iter().any(|c| c.body.trim().is_empty()) {
        return Err(ApiError::BadRequest("Review comment body must not be empty".to_string()));
    }

    info!(issue_number, pr_number, comments = req.comments.len(), "Review application requested");
    state.runner.start_review(ReviewTask {
        issue_number,
        pr_number,
        comments: req.comments,
    });

    Ok(Json(TriggerResponse {
        success: true,
        message: format!("Applying review comments to PR #{}", pr_number),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ids::JobKind;
    use crate::agent::models::{AgentJob, JobState};
    use crate::agent::runner::PipelineContext;
    use crate::agent::status::AgentStatusStore;
    use crate::config::AgentConfig;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let config = AgentConfig {
            repo_path: std::env::temp_dir().join("airgit-api-test-not-a-repo"),
            worktrees_dir: std::env::temp_dir().join("airgit-api-test-worktrees"),
            ..AgentConfig::default()
        };
        let runner = AgentRunner::new(PipelineContext::from_config(config), AgentStatusStore::new());
        Arc::new(AppState { runner })
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app(test_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_status_unknown_issue_is_404() {
        let response = test_app(test_state())
            .oneshot(get("/api/agent/status?issue_number=123"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["error"], "No status for this issue");
    }

    #[tokio::test]
    async fn test_status_missing_issue_number_is_400() {
        let response = test_app(test_state())
            .oneshot(get("/api/agent/status"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["error"], "Missing issue_number");
    }

    #[tokio::test]
    async fn test_status_invalid_issue_number_is_400() {
        for uri in [
            "/api/agent/status?issue_number=abc",
            "/api/agent/status?issue_number=-4",
            "/api/agent/status?issue_number=0",
        ] {
            let response = test_app(test_state()).oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let json: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(json["error"], "Invalid issue_number");
        }
    }

    #[tokio::test]
    async fn test_status_returns_recorded_job() {
        let state = test_state();
        let handle = state
            .runner
            .store()
            .set(AgentJob::pending(8, JobKind::Issue, "Queued"));
        handle.mark_running("Reading files");

        let response = test_app(state)
            .oneshot(get("/api/agent/status?issue_number=8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["issueNumber"], 8);
        assert_eq!(json["state"], "running");
        assert_eq!(json["message"], "Reading files");
        assert!(json.get("endedAt").is_none());
    }

    #[tokio::test]
    async fn test_process_records_job_and_acknowledges() {
        let state = test_state();
        let response = test_app(state.clone())
            .oneshot(post_json(
                "/api/agent/process",
                serde_json::json!({"issue_number": 42, "issue_title": "Fix typo", "issue_body": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "Agent processing started");

        let job = state.runner.store().get(42).expect("job recorded before returning");
        assert_eq!(job.kind, JobKind::Issue);
        state.runner.shutdown(std::time::Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn test_trigger_alias_routes_to_process() {
        let state = test_state();
        let response = test_app(state.clone())
            .oneshot(post_json(
                "/api/agent/trigger",
                serde_json::json!({"issue_number": 5, "issue_title": "t"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.runner.store().get(5).is_some());
        state.runner.shutdown(std::time::Duration::from_secs(10)).await;
    }

    #[tokio::test]
    async fn test_process_rejects_non_positive_issue_number() {
        let state = test_state();
        let response = test_app(state.clone())
            .oneshot(post_json(
                "/api/agent/process",
                serde_json::json!({"issue_number": 0, "issue_title": "t"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.runner.store().is_empty());
    }

    #[tokio::test]
    async fn test_process_rejects_malformed_json() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/agent/process")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = test_app(test_state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn test_apply_review_requires_comments() {
        let state = test_state();
        let response = test_app(state.clone())
            .oneshot(post_json(
                "/api/agent/apply-review",
                serde_json::json!({"issue_number": 3, "pr_number": 4, "comments": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.runner.store().get(3).is_none());
    }

    #[tokio::test]
    async fn test_apply_review_rejects_bad_pr_number() {
        let response = test_app(test_state())
            .oneshot(post_json(
                "/api/agent/apply-review",
                serde_json::json!({"issue_number": 3, "pr_number": -1, "comments": [{"body": "x"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_apply_review_records_review_job() {
        let state = test_state();
        let response = test_app(state.clone())
            .oneshot(post_json(
                "/api/agent/apply-review",
                serde_json::json!({
                    "issue_number": 3,
                    "pr_number": 4,
                    "comments": [{"path": "a.txt", "body": "please delete this file"}]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(json["success"], true);

        let job = state.runner.store().get(3).unwrap();
        assert_eq!(job.kind, JobKind::Review);
        assert_ne!(job.state, JobState::Completed);
        state.runner.shutdown(std::time::Duration::from_secs(10)).await;
    }
}
