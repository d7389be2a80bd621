//! Task endpoint handlers
//!
//! Creation, listing and the lifecycle actions: run, pause, resume, cancel
//! and delete. Action endpoints answer with `{"status","task_id"}`.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiResult;
use crate::api::routes::AppState;
use crate::engine::CreateTaskRequest;
use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
}

/// Response of a lifecycle action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskActionResponse {
    pub status: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
}

impl TaskActionResponse {
    fn new(status: &str, task_id: String) -> Self {
        Self {
            status: status.to_string(),
            task_id,
            task: None,
        }
    }
}

/// POST /api/tasks
pub async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state.engine.create(request).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// GET /api/tasks
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Json<Vec<Task>>> {
    Ok(Json(state.engine.list(query.status).await?))
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.engine.get(&id).await?))
}

/// DELETE /api/tasks/:id
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/tasks/:id/run
pub async fn run_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskActionResponse>> {
    let task = state.engine.run(&id).await?;
    Ok(Json(TaskActionResponse {
        task: Some(task),
        ..TaskActionResponse::new("started", id)
    }))
}

/// POST /api/tasks/:id/pause
pub async fn pause_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskActionResponse>> {
    state.engine.pause(&id).await?;
    Ok(Json(TaskActionResponse::new("paused", id)))
}

/// POST /api/tasks/:id/resume
pub async fn resume_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskActionResponse>> {
    state.engine.resume(&id).await?;
    Ok(Json(TaskActionResponse::new("resumed", id)))
}

/// POST /api/tasks/:id/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskActionResponse>> {
    state.engine.cancel(&id).await?;
    Ok(Json(TaskActionResponse::new("cancelled", id)))
}
