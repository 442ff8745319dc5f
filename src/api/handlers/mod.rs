use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchSummary, Dispatcher, StatusReport};
use crate::error::LedgerError;
use crate::lifecycle::TaskLifecycle;
use crate::models::*;
use crate::recovery::RecoveryEngine;

/// Shared handler state. Every field shares the same store and write lock.
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: TaskLifecycle,
    pub recovery: RecoveryEngine,
    pub dispatcher: Dispatcher,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Map a ledger error to a response.
///
/// Client errors are returned as-is. Store failures are logged server-side
/// and the client only sees a generic message.
fn ledger_error(e: LedgerError) -> (StatusCode, String) {
    let status = match &e {
        LedgerError::FeatureNotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::DuplicateTask(_)
        | LedgerError::DuplicateFeature(_)
        | LedgerError::InvalidTransition { .. } => StatusCode::CONFLICT,
        LedgerError::InvalidAgent(_)
        | LedgerError::InvalidInput(_)
        | LedgerError::Config(_) => StatusCode::BAD_REQUEST,
        LedgerError::Store(_) => {
            tracing::error!("Internal error: {:#}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            );
        }
    };
    tracing::warn!("Rejected request: {}", e);
    (status, e.to_string())
}

fn task_not_found() -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, "Task not found".to_string())
}

fn transition_response(outcome: TransitionOutcome) -> ApiResult<Json<TransitionOutcome>> {
    match outcome {
        TransitionOutcome::NotFound => Err(task_not_found()),
        outcome => Ok(Json(outcome)),
    }
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn health_report(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.recovery.health_check())
}

// ============================================================
// Features
// ============================================================

pub async fn list_features(State(state): State<AppState>) -> Json<Vec<FeatureProgress>> {
    Json(state.lifecycle.list_features())
}

pub async fn get_feature(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<FeatureProgress>> {
    state
        .lifecycle
        .feature_progress(&id)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "Feature not found".to_string()))
}

pub async fn create_feature(
    State(state): State<AppState>,
    Json(input): Json<CreateFeatureInput>,
) -> ApiResult<(StatusCode, Json<Feature>)> {
    state
        .lifecycle
        .create_feature(input)
        .map(|f| (StatusCode::CREATED, Json(f)))
        .map_err(ledger_error)
}

/// Create a feature together with its tasks in one save.
pub async fn create_plan(
    State(state): State<AppState>,
    Json(plan): Json<FeaturePlan>,
) -> ApiResult<(StatusCode, Json<FeatureProgress>)> {
    state
        .lifecycle
        .create_plan(plan)
        .map(|p| (StatusCode::CREATED, Json(p)))
        .map_err(ledger_error)
}

pub async fn create_task(
    State(state): State<AppState>,
    Path(feature_id): Path<String>,
    Json(input): Json<CreateTaskInput>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    state
        .lifecycle
        .create_task(&feature_id, input)
        .map(|t| (StatusCode::CREATED, Json(t)))
        .map_err(ledger_error)
}

// ============================================================
// Tasks
// ============================================================

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    /// Only return tasks in this status.
    pub status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(TaskStatus::from_str(s).ok_or((
            StatusCode::BAD_REQUEST,
            format!("Unknown task status: {}", s),
        ))?),
        None => None,
    };
    Ok(Json(state.lifecycle.list_tasks(status)))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Task>> {
    state.lifecycle.get_task(&id).map(Json).ok_or_else(task_not_found)
}

pub async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransitionOutcome>> {
    transition_response(state.lifecycle.start(&id).map_err(ledger_error)?)
}

pub async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ProgressInput>,
) -> ApiResult<Json<TransitionOutcome>> {
    if let Some(message) = &input.message {
        tracing::debug!(task_id = %id, "Progress {}%: {}", input.progress, message);
    }
    transition_response(
        state
            .lifecycle
            .update_progress(&id, input.progress)
            .map_err(ledger_error)?,
    )
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<CompleteTaskInput>,
) -> ApiResult<Json<TransitionOutcome>> {
    transition_response(
        state
            .lifecycle
            .complete(&id, input.result)
            .map_err(ledger_error)?,
    )
}

pub async fn fail_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<FailTaskInput>,
) -> ApiResult<Json<TransitionOutcome>> {
    transition_response(state.lifecycle.fail(&id, input.error).map_err(ledger_error)?)
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransitionOutcome>> {
    transition_response(state.lifecycle.retry(&id).map_err(ledger_error)?)
}

pub async fn assign_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TransitionOutcome>> {
    transition_response(state.dispatcher.assign(&id).map_err(ledger_error)?)
}

// ============================================================
// Dispatch
// ============================================================

pub async fn dispatch_pending(State(state): State<AppState>) -> ApiResult<Json<DispatchSummary>> {
    state
        .dispatcher
        .dispatch_pending()
        .map(Json)
        .map_err(ledger_error)
}

/// Apply a status report posted directly by an agent.
pub async fn post_report(
    State(state): State<AppState>,
    Json(report): Json<StatusReport>,
) -> ApiResult<Json<TransitionOutcome>> {
    transition_response(state.dispatcher.handle_report(&report).map_err(ledger_error)?)
}

// ============================================================
// Recovery
// ============================================================

#[derive(Debug, Deserialize)]
pub struct StalledQuery {
    /// Minutes in progress before a task counts as stalled. Defaults to 30.
    pub timeout: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RetryQuery {
    /// Defaults to 3.
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    /// Retention window in days. Defaults to 7.
    pub days: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StalledResponse {
    pub recovered: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

pub async fn recover_stalled(
    State(state): State<AppState>,
    Query(query): Query<StalledQuery>,
) -> ApiResult<Json<StalledResponse>> {
    let timeout = query
        .timeout
        .unwrap_or(state.recovery.policy().stall_timeout_minutes);
    state
        .recovery
        .recover_stalled_tasks(timeout)
        .map(|recovered| Json(StalledResponse { recovered }))
        .map_err(ledger_error)
}

pub async fn retry_failed(
    State(state): State<AppState>,
    Query(query): Query<RetryQuery>,
) -> ApiResult<Json<RetrySummary>> {
    let max_retries = query
        .max_retries
        .unwrap_or(state.recovery.policy().max_retries);
    state
        .recovery
        .retry_failed_tasks(max_retries)
        .map(Json)
        .map_err(ledger_error)
}

pub async fn cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<CleanupResponse>> {
    let days = query.days.unwrap_or(state.recovery.policy().retention_days);
    state
        .recovery
        .cleanup_completed_tasks(days)
        .map(|removed| Json(CleanupResponse { removed }))
        .map_err(ledger_error)
}

pub async fn full_recovery(State(state): State<AppState>) -> ApiResult<Json<RecoverySummary>> {
    state
        .recovery
        .full_recovery()
        .map(Json)
        .map_err(ledger_error)
}

// ============================================================
// Statistics & Agents
// ============================================================

pub async fn statistics(State(state): State<AppState>) -> Json<TaskStatistics> {
    Json(state.recovery.statistics())
}

pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentWorkload>> {
    Json(state.recovery.agent_workloads())
}

pub async fn agent_pending(
    State(state): State<AppState>,
    Path(agent): Path<String>,
) -> Json<Vec<PendingTask>> {
    Json(state.recovery.pending_tasks_by_agent(&agent))
}
