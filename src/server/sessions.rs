//! Session routes: the boundary adapter between HTTP ingress and the FSM.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::instrument;

use crate::errors::EngineError;
use crate::session::types::{BrowserState, SessionConfig};
use crate::session::{ActionResultIngress, ExecuteSpec};

use super::state::ServeState;

pub(crate) fn router() -> Router<ServeState> {
    Router::new()
        .route("/sessions", get(list_handler))
        .route("/sessions/create", post(create_handler))
        .route("/sessions/:id/execute", post(execute_handler))
        .route("/sessions/:id/follow-up", post(follow_up_handler))
        .route("/sessions/:id/next-action", get(next_action_handler))
        .route("/sessions/:id/action-result", post(action_result_handler))
        .route("/sessions/:id/state", post(state_handler))
        .route("/sessions/:id/pause", post(pause_handler))
        .route("/sessions/:id/resume", post(resume_handler))
        .route("/sessions/:id/cancel", post(cancel_handler))
        .route("/sessions/:id/history", get(history_handler))
        .route("/sessions/:id/events", get(events_handler))
        .route("/sessions/:id/replay", post(replay_handler))
        .route("/sessions/:id/extract", post(extract_handler))
}

/// Map an engine error onto the `{error}` envelope with a fitting status.
fn error_response(err: EngineError) -> Response {
    let status = match &err {
        EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EngineError::PlannerParse(_) | EngineError::ActionRejected(_) => StatusCode::BAD_REQUEST,
        EngineError::Llm { .. } => StatusCode::BAD_GATEWAY,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EngineError::Other(_) => StatusCode::BAD_REQUEST,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn rejection_response(rejection: JsonRejection) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": rejection.body_text() })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CreateBody {
    #[allow(dead_code)]
    extension_id: Option<String>,
    config: Option<SessionConfig>,
}

#[instrument(name = "webpilot.sessions.create", skip(state, body))]
async fn create_handler(
    State(state): State<ServeState>,
    body: Option<Json<CreateBody>>,
) -> Response {
    let config = body.and_then(|Json(body)| body.config);
    match state.service.create(config).await {
        Ok(id) => Json(json!({
            "sessionId": id.0,
            "durableObjectId": id.0,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.list", skip(state))]
async fn list_handler(State(state): State<ServeState>) -> Response {
    let sessions = state.service.list().await;
    Json(json!({ "sessions": sessions })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody {
    task: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    vision: Option<bool>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    provider: Option<String>,
    #[serde(default)]
    config: Option<SessionConfig>,
}

#[instrument(name = "webpilot.sessions.execute", skip(state, body), fields(session = %id))]
async fn execute_handler(
    State(state): State<ServeState>,
    Path(id): Path<String>,
    body: Result<Json<ExecuteBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let spec = ExecuteSpec {
        api_key: body.api_key,
        model: body.model,
        provider: body.provider,
        vision: body.vision.unwrap_or(false),
    };
    match state
        .service
        .execute(&id, body.task, spec, body.config)
        .await
    {
        Ok(task_id) => Json(json!({ "success": true, "taskId": task_id.0 })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct FollowUpBody {
    task: String,
}

#[instrument(name = "webpilot.sessions.follow_up", skip(state, body), fields(session = %id))]
async fn follow_up_handler(
    State(state): State<ServeState>,
    Path(id): Path<String>,
    body: Result<Json<FollowUpBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.follow_up(body.task).await {
        Ok(task_id) => Json(json!({ "success": true, "taskId": task_id.0 })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.next_action", skip(state), fields(session = %id))]
async fn next_action_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.next_action().await {
        Ok(reply) => {
            if let Some(action) = reply.action {
                Json(json!({
                    "action": action,
                    "waiting": false,
                    "taskComplete": false,
                }))
                .into_response()
            } else {
                Json(json!({
                    "waiting": true,
                    "taskComplete": reply.task_complete,
                }))
                .into_response()
            }
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionResultBody {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    screenshot: Option<String>,
    #[serde(default)]
    dom_state: Option<BrowserState>,
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[instrument(name = "webpilot.sessions.action_result", skip(state, body), fields(session = %id))]
async fn action_result_handler(
    State(state): State<ServeState>,
    Path(id): Path<String>,
    body: Result<Json<ActionResultBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    let ingress = ActionResultIngress {
        success: body.success,
        data: body.result,
        error: body.error,
        screenshot: body.screenshot,
        browser_state: body.dom_state,
        duration_ms: body.duration_ms.unwrap_or(0),
    };
    match handle.action_result(ingress).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.state", skip(state, body), fields(session = %id))]
async fn state_handler(
    State(state): State<ServeState>,
    Path(id): Path<String>,
    body: Result<Json<BrowserState>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.update_state(body).await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.pause", skip(state), fields(session = %id))]
async fn pause_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.pause().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.resume", skip(state), fields(session = %id))]
async fn resume_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.resume().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.cancel", skip(state), fields(session = %id))]
async fn cancel_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.cancel().await {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

#[instrument(name = "webpilot.sessions.history", skip(state), fields(session = %id))]
async fn history_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    let snapshot = handle.snapshot().await;
    Json(json!({
        "sessionId": snapshot.id.0,
        "tasks": snapshot.tasks,
        "currentTaskIndex": snapshot.current_task_index,
        "executionState": snapshot.state,
        "actionHistory": snapshot.action_history,
        "plannerHistory": snapshot.planner_history,
        "securityEvents": snapshot.security_events,
        "metrics": snapshot.metrics,
        "stepCount": snapshot.step_count,
    }))
    .into_response()
}

#[instrument(name = "webpilot.sessions.events", skip(state), fields(session = %id))]
async fn events_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    let mut receiver = handle.subscribe();

    let stream = stream! {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let payload =
                        serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                    yield Ok::<Event, Infallible>(Event::default().data(payload));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}

#[instrument(name = "webpilot.sessions.replay", skip(state), fields(session = %id))]
async fn replay_handler(State(state): State<ServeState>, Path(id): Path<String>) -> Response {
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle.export_replay().await {
        Ok(replay_id) => {
            Json(json!({ "success": true, "replayId": replay_id })).into_response()
        }
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractBody {
    fields: Vec<String>,
    content: String,
    #[serde(default)]
    extraction_prompt: Option<String>,
}

#[instrument(name = "webpilot.sessions.extract", skip(state, body), fields(session = %id))]
async fn extract_handler(
    State(state): State<ServeState>,
    Path(id): Path<String>,
    body: Result<Json<ExtractBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_response(rejection),
    };
    let handle = match state.service.get(&id) {
        Ok(handle) => handle,
        Err(err) => return error_response(err),
    };
    match handle
        .extract(&body.fields, &body.content, body.extraction_prompt.as_deref())
        .await
    {
        Ok((data, confidence)) => Json(json!({
            "success": true,
            "data": data,
            "confidence": confidence,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}
