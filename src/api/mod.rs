//! HTTP API server.
//!
//! Polling-only surface over the scheduler, orchestrator, and store: submit
//! (loose and strict), query, cancel, and the system status endpoints. No
//! authentication and no push; clients poll.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::constants::{SERVICE_NAME, SERVICE_VERSION};
use crate::models::{
    ModelTier, NewTask, Orchestration, Task, TaskSpec,
};
use crate::monitoring::ResourceMonitor;
use crate::orchestrator::Orchestrator;
use crate::resilience::BreakerRecord;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::validation::{AdmissionSurface, TaskAdmissionValidator};
use crate::{BreakerRegistry, CapstanError, Result};

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASKS_STRICT: &str = "/tasks/strict";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_CANCEL: &str = "/tasks/{task_id}/cancel";
const ROUTE_TASK_LOGS: &str = "/tasks/{task_id}/logs";
const ROUTE_ORCHESTRATIONS: &str = "/orchestrations";
const ROUTE_ORCHESTRATION_BY_ID: &str = "/orchestrations/{orch_id}";
const ROUTE_ORCHESTRATION_CANCEL: &str = "/orchestrations/{orch_id}/cancel";
const ROUTE_SYSTEM_STATUS: &str = "/system/status";
const ROUTE_SYSTEM_METRICS: &str = "/system/metrics";

#[derive(Clone)]
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<ResourceMonitor>,
    pub breakers: Arc<BreakerRegistry>,
    pub validator: TaskAdmissionValidator,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub execution_prompt: String,
    pub working_dir: Option<String>,
    pub system_prompt: Option<String>,
    pub model_tier: Option<ModelTier>,
}

impl CreateTaskRequest {
    fn into_new_task(self) -> std::result::Result<NewTask, CapstanError> {
        // The working directory is always client-supplied; the service
        // never substitutes its own current directory.
        let working_dir = self.working_dir.ok_or_else(|| {
            CapstanError::validation("working_dir", "is required")
        })?;
        Ok(NewTask {
            execution_prompt: self.execution_prompt,
            working_dir,
            system_prompt: self.system_prompt,
            model_tier: self.model_tier.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: i64,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskSpecRequest {
    pub task_identifier: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub wait_after_dependencies: f64,
    pub execution_prompt: String,
    pub working_dir: Option<String>,
    pub system_prompt: Option<String>,
    pub model_tier: Option<ModelTier>,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrchestrationRequest {
    pub tasks: Vec<TaskSpecRequest>,
}

#[derive(Debug, Serialize)]
pub struct CreateOrchestrationResponse {
    pub orchestration_id: i64,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: i64,
    pub status: String,
    pub model_tier: String,
    pub working_dir: String,
    pub last_action: Option<String>,
    pub final_summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub orchestration_id: Option<i64>,
    pub task_identifier: Option<String>,
    pub summary_log_path: String,
    pub detailed_log_path: String,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status.to_string(),
            model_tier: task.model_tier.to_string(),
            working_dir: task.working_dir,
            last_action: task.last_action,
            final_summary: task.final_summary,
            error_message: task.error_message,
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            ended_at: task.ended_at.map(|t| t.to_rfc3339()),
            orchestration_id: task.orchestration_id,
            task_identifier: task.task_identifier,
            summary_log_path: task.summary_log_path,
            detailed_log_path: task.detailed_log_path,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrchestrationResponse {
    pub orchestration_id: i64,
    pub status: String,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub failed_tasks: i64,
    pub skipped_tasks: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<TaskResponse>>,
}

impl OrchestrationResponse {
    fn from_parts(orch: Orchestration, members: Option<Vec<Task>>) -> Self {
        Self {
            orchestration_id: orch.id,
            status: orch.status.to_string(),
            total_tasks: orch.total_tasks,
            completed_tasks: orch.completed_tasks,
            failed_tasks: orch.failed_tasks,
            skipped_tasks: orch.skipped_tasks,
            created_at: orch.created_at.to_rfc3339(),
            started_at: orch.started_at.map(|t| t.to_rfc3339()),
            ended_at: orch.ended_at.map(|t| t.to_rfc3339()),
            tasks: members.map(|m| m.into_iter().map(TaskResponse::from).collect()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub detailed: bool,
    pub tail: Option<usize>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = std::result::Result<T, ApiError>;

fn error_response(error: CapstanError) -> ApiError {
    match &error {
        CapstanError::Validation { field, message } => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: message.clone(),
                field: Some(field.clone()),
                details: None,
            }),
        ),
        CapstanError::DependencyGraph(message) | CapstanError::Orchestration(message) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: message.clone(),
                field: None,
                details: None,
            }),
        ),
        CapstanError::NotFound(what) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("not found: {what}"),
                field: None,
                details: None,
            }),
        ),
        other => {
            warn!("Request failed: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal server error".to_string(),
                    field: None,
                    details: None,
                }),
            )
        }
    }
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub async fn run(&self) -> Result<()> {
        let app = self.build_router();
        let listener =
            tokio::net::TcpListener::bind(format!("{}:{}", self.config.host, self.config.port))
                .await?;
        info!(
            "API server listening on {}:{}",
            self.config.host, self.config.port
        );
        axum::serve(listener, app).await?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route(ROUTE_HEALTH, get(health_check))
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASKS_STRICT, post(create_task_strict))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_CANCEL, post(cancel_task))
            .route(ROUTE_TASK_LOGS, get(get_task_logs))
            .route(
                ROUTE_ORCHESTRATIONS,
                post(create_orchestration).get(list_orchestrations),
            )
            .route(ROUTE_ORCHESTRATION_BY_ID, get(get_orchestration))
            .route(ROUTE_ORCHESTRATION_CANCEL, post(cancel_orchestration))
            .route(ROUTE_SYSTEM_STATUS, get(get_system_status))
            .route(ROUTE_SYSTEM_METRICS, get(get_system_metrics))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.state.clone())
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn submit_with_surface(
    state: &AppState,
    request: CreateTaskRequest,
    surface: AdmissionSurface,
) -> ApiResult<(StatusCode, Json<CreateTaskResponse>)> {
    let new_task = request.into_new_task().map_err(error_response)?;
    state
        .validator
        .validate(&new_task, surface)
        .map_err(error_response)?;

    let task = state
        .scheduler
        .submit(new_task)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.id,
            status: task.status.to_string(),
        }),
    ))
}

/// Loose surface: human clients, defaults apply.
async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<CreateTaskResponse>)> {
    submit_with_surface(&state, request, AdmissionSurface::Loose).await
}

/// Strict surface: machine/tool clients, hard field rules.
async fn create_task_strict(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<CreateTaskResponse>)> {
    submit_with_surface(&state, request, AdmissionSurface::Strict).await
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<TaskResponse>>> {
    let tasks = state.store.list_tasks().await.map_err(error_response)?;
    Ok(Json(tasks.into_iter().map(TaskResponse::from).collect()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state.store.get_task(task_id).await.map_err(error_response)?;
    Ok(Json(task.into()))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<Json<CreateTaskResponse>> {
    let status = state
        .scheduler
        .cancel(task_id)
        .await
        .map_err(error_response)?;
    Ok(Json(CreateTaskResponse {
        task_id,
        status: status.to_string(),
    }))
}

async fn get_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<String> {
    let task = state.store.get_task(task_id).await.map_err(error_response)?;
    let path = if query.detailed {
        &task.detailed_log_path
    } else {
        &task.summary_log_path
    };
    let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
    match query.tail {
        Some(n) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(n);
            Ok(lines[start..].join("\n"))
        }
        None => Ok(content),
    }
}

async fn create_orchestration(
    State(state): State<AppState>,
    Json(request): Json<CreateOrchestrationRequest>,
) -> ApiResult<(StatusCode, Json<CreateOrchestrationResponse>)> {
    let mut specs = Vec::with_capacity(request.tasks.len());
    for spec in request.tasks {
        let new_task = CreateTaskRequest {
            execution_prompt: spec.execution_prompt,
            working_dir: spec.working_dir,
            system_prompt: spec.system_prompt,
            model_tier: spec.model_tier,
        }
        .into_new_task()
        .map_err(error_response)?;
        state
            .validator
            .validate(&new_task, AdmissionSurface::Loose)
            .map_err(error_response)?;
        specs.push(TaskSpec {
            task_identifier: spec.task_identifier,
            depends_on: spec.depends_on,
            wait_after_dependencies: spec.wait_after_dependencies,
            task: new_task,
        });
    }

    let orch = state
        .orchestrator
        .submit_group(specs)
        .await
        .map_err(error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateOrchestrationResponse {
            orchestration_id: orch.id,
            status: orch.status.to_string(),
        }),
    ))
}

async fn list_orchestrations(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<OrchestrationResponse>>> {
    let orchs = state
        .store
        .list_orchestrations()
        .await
        .map_err(error_response)?;
    Ok(Json(
        orchs
            .into_iter()
            .map(|o| OrchestrationResponse::from_parts(o, None))
            .collect(),
    ))
}

async fn get_orchestration(
    State(state): State<AppState>,
    Path(orch_id): Path<i64>,
) -> ApiResult<Json<OrchestrationResponse>> {
    let orch = state
        .store
        .get_orchestration(orch_id)
        .await
        .map_err(error_response)?;
    let members = state
        .store
        .orchestration_members(orch_id)
        .await
        .map_err(error_response)?;
    Ok(Json(OrchestrationResponse::from_parts(orch, Some(members))))
}

async fn cancel_orchestration(
    State(state): State<AppState>,
    Path(orch_id): Path<i64>,
) -> ApiResult<Json<OrchestrationResponse>> {
    let orch = state
        .orchestrator
        .cancel(orch_id)
        .await
        .map_err(error_response)?;
    Ok(Json(OrchestrationResponse::from_parts(orch, None)))
}

#[derive(Debug, Serialize)]
struct SystemStatusResponse {
    scheduler: crate::scheduler::SchedulerStats,
    circuit_breakers: HashMap<String, BreakerRecord>,
    uptime_seconds: f64,
    health: crate::monitoring::HealthStatus,
}

async fn get_system_status(State(state): State<AppState>) -> Json<SystemStatusResponse> {
    let snapshot = state.monitor.snapshot().await;
    Json(SystemStatusResponse {
        scheduler: state.scheduler.stats(),
        circuit_breakers: state.breakers.snapshot().await,
        uptime_seconds: snapshot.uptime_seconds,
        health: snapshot.health,
    })
}

async fn get_system_metrics(
    State(state): State<AppState>,
) -> Json<crate::monitoring::MonitorSnapshot> {
    Json(state.monitor.snapshot().await)
}
