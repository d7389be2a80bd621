//! Project endpoint handlers
//!
//! Looking a project up opens its database through the LRU handle cache.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::AppState;
use crate::project::{CacheStats, ProjectEntry};
use crate::storage::TaskStore;
use crate::task::Task;

#[derive(Debug, Clone, Serialize)]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectEntry>,
    pub cache: Option<CacheStats>,
}

/// GET /api/projects
pub async fn list_projects(State(state): State<AppState>) -> Json<ProjectsResponse> {
    match &state.projects {
        Some(cache) => Json(ProjectsResponse {
            projects: cache.registry().list(),
            cache: Some(cache.stats().await),
        }),
        None => Json(ProjectsResponse {
            projects: Vec::new(),
            cache: None,
        }),
    }
}

/// GET /api/projects/:id
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ProjectEntry>> {
    let cache = state
        .projects
        .as_ref()
        .ok_or_else(|| ApiError::NotFound(format!("Project not found: {}", id)))?;
    let store = cache.get(&id).await?;
    store
        .health_check()
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    cache
        .registry()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Project not found: {}", id)))
}

/// GET /api/projects/:id/tasks
pub async fn list_project_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Task>>> {
    let cache = state
        .projects
        .as_ref()
        .ok_or_else(|| ApiError::NotFound(format!("Project not found: {}", id)))?;
    let store = cache.get(&id).await?;
    let tasks = store
        .list_tasks()
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(tasks))
}
