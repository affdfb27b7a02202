//! HTTP control plane for covend.
//!
//! Implements the local-only RPC surface from spec Section 6.1: session
//! and task lifecycle, workflow inspection and control, merge/question
//! resolution, health, and an SSE event stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use coven_core::{Config, Event, Id, ReviewDecision};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::event_bus::EventBus;
use crate::review_gate::{InputResolution, MergeResolution, ReviewGates};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::{Storage, StorageError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct AppState {
    pub storage: Arc<Storage>,
    pub events: Arc<EventBus>,
    pub gates: Arc<ReviewGates>,
    pub scheduler: Arc<Scheduler>,
    pub config: Config,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

pub fn build_router(
    storage: Arc<Storage>,
    events: Arc<EventBus>,
    gates: Arc<ReviewGates>,
    scheduler: Arc<Scheduler>,
    config: Config,
    shutdown: CancellationToken,
) -> Router {
    let state = Arc::new(AppState { storage, events, gates, scheduler, config, started_at: Instant::now(), shutdown });

    Router::new()
        .route("/sessions", post(start_session))
        .route("/sessions/stop", post(stop_session))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/stop", post(stop_task))
        .route("/workflows", get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/retry", post(retry_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/approve", post(approve_merge))
        .route("/workflows/{id}/reject", post(reject_merge))
        .route("/workflows/{id}/answer", post(answer_question))
        .route("/workflows/{id}/events", get(stream_workflow_events))
        .route("/events", get(stream_all_events))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: message.into() }))
}

fn scheduler_err(e: SchedulerError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        SchedulerError::SessionAlreadyActive
        | SchedulerError::NoActiveSession
        | SchedulerError::WorkflowNotRetryable(_) => StatusCode::CONFLICT,
        SchedulerError::BranchNotFound(_) | SchedulerError::TaskNotClaimable(_) => StatusCode::BAD_REQUEST,
        SchedulerError::NoInFlightWorkflow(_) => StatusCode::NOT_FOUND,
        SchedulerError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::Storage(StorageError::TaskNotFound(_) | StorageError::WorkflowNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    err(status, e.to_string())
}

// --- session lifecycle ---

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    target_branch: String,
}

#[derive(Debug, Serialize)]
struct StartSessionResponse {
    session_id: Id,
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let session_id = state.scheduler.start_session(req.target_branch).await.map_err(scheduler_err)?;
    let _ = state
        .events
        .publish(
            Event::new(
                coven_core::EventKind::SessionStarted,
                0,
                coven_core::events::SessionStartedPayload {
                    target_branch: state.scheduler.active_session().await.map(|s| s.target_branch).unwrap_or_default(),
                },
            )
            .expect("session payload always serializes"),
        )
        .await;
    Ok(Json(StartSessionResponse { session_id }))
}

async fn stop_session(State(state): State<Arc<AppState>>) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state.scheduler.stop_session().await.map_err(scheduler_err)?;
    let _ = state
        .events
        .publish(Event::new(coven_core::EventKind::SessionStopped, 0, serde_json::json!({})).expect("serializes"))
        .await;
    Ok(StatusCode::NO_CONTENT)
}

// --- task lifecycle ---

#[derive(Debug, Serialize)]
struct StartTaskResponse {
    workflow_id: Id,
}

async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StartTaskResponse>, (StatusCode, Json<ErrorResponse>)> {
    let task_id = Id::from_string(id);
    let workflow_id =
        state.scheduler.start_task(&task_id, state.shutdown.clone()).await.map_err(scheduler_err)?;
    Ok(Json(StartTaskResponse { workflow_id }))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let task_id = Id::from_string(id);
    state.scheduler.stop_task(&task_id).await.map_err(scheduler_err)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- workflow inspection and control ---

#[derive(Debug, Serialize)]
struct WorkflowSummary {
    workflow_id: Id,
    task_id: Id,
    grimoire: String,
    status: coven_core::WorkflowStatus,
    current_step: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListWorkflowsResponse {
    workflows: Vec<WorkflowSummary>,
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListWorkflowsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let ids = state.storage.list_workflow_ids().await.map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let mut workflows = Vec::with_capacity(ids.len());
    for id in ids {
        let row = state.storage.get_workflow(&id).await.map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        workflows.push(WorkflowSummary {
            workflow_id: row.context.workflow_id.clone(),
            task_id: row.context.task.id.clone(),
            grimoire: row.context.grimoire_name.clone(),
            status: row.context.status,
            current_step: row.context.current_step_path.last().map(|e| e.step_name.clone()),
        });
    }
    Ok(Json(ListWorkflowsResponse { workflows }))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<coven_core::Context>, (StatusCode, Json<ErrorResponse>)> {
    let row = state
        .storage
        .get_workflow(&Id::from_string(id))
        .await
        .map_err(|e| err(StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(row.context))
}

#[derive(Debug, Serialize)]
struct RetryWorkflowResponse {
    workflow_id: Id,
}

async fn retry_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RetryWorkflowResponse>, (StatusCode, Json<ErrorResponse>)> {
    let workflow_id =
        state.scheduler.retry_workflow(&Id::from_string(id), state.shutdown.clone()).await.map_err(scheduler_err)?;
    Ok(Json(RetryWorkflowResponse { workflow_id }))
}

async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if state.scheduler.cancel_workflow(&Id::from_string(id)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(err(StatusCode::CONFLICT, "workflow already terminal"))
    }
}

// --- merge review and questions ---

#[derive(Debug, Deserialize, Default)]
struct ApproveMergeRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn approve_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<ApproveMergeRequest>>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let reason = body.map(|Json(r)| r.reason).unwrap_or(None);
    state
        .gates
        .resolve_merge(&Id::from_string(id), MergeResolution { decision: ReviewDecision::Approve, reason })
        .map_err(|e| err(StatusCode::CONFLICT, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct RejectMergeRequest {
    reason: String,
}

async fn reject_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RejectMergeRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .gates
        .resolve_merge(&Id::from_string(id), MergeResolution { decision: ReviewDecision::Reject, reason: Some(req.reason) })
        .map_err(|e| err(StatusCode::CONFLICT, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AnswerQuestionRequest {
    #[serde(default)]
    question_id: Option<String>,
    response: String,
}

async fn answer_question(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AnswerQuestionRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    if req.question_id.is_none() {
        warn!(workflow_id = %id, "answer_question called with no question_id");
    }
    state
        .gates
        .resolve_input(&Id::from_string(id), InputResolution { answer: req.response })
        .map_err(|e| err(StatusCode::CONFLICT, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// --- health and events ---

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: VERSION, uptime_secs: state.started_at.elapsed().as_secs() })
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    #[serde(default)]
    since: Option<i64>,
}

async fn stream_all_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    let backlog = state
        .storage
        .list_events_since(query.since.unwrap_or(0))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let stream = event_stream(backlog, state.events.subscribe(), None);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn stream_workflow_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    let workflow_id = Id::from_string(id);
    let backlog = state
        .storage
        .list_events_since(query.since.unwrap_or(0))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .into_iter()
        .filter(|e| e.workflow_id.as_ref() == Some(&workflow_id))
        .collect();
    let stream = event_stream(backlog, state.events.subscribe(), Some(workflow_id));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn event_stream(
    backlog: Vec<Event>,
    rx: broadcast::Receiver<Event>,
    workflow_filter: Option<Id>,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold((backlog.into_iter(), rx, workflow_filter), move |(mut backlog, mut rx, filter)| async move {
        loop {
            if let Some(event) = backlog.next() {
                let sse = to_sse(&event);
                return Some((Ok(sse), (backlog, rx, filter)));
            }
            match rx.recv().await {
                Ok(event) => {
                    if let Some(wf) = &filter {
                        if event.workflow_id.as_ref() != Some(wf) {
                            continue;
                        }
                    }
                    let sse = to_sse(&event);
                    return Some((Ok(sse), (backlog, rx, filter)));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

fn to_sse(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_default();
    SseEvent::default().event(event.kind.as_str()).data(data)
}
