//! API route definitions

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::api::middleware::{cors_layer, logging_layer};
use crate::api::{handlers, ws};
use crate::engine::TaskEngine;
use crate::events::Publisher;
use crate::project::{ProjectCache, SqliteOpener};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: TaskEngine,
    /// Bus the WebSocket and SSE endpoints subscribe to
    pub events: Arc<dyn Publisher>,
    pub projects: Option<Arc<ProjectCache<SqliteOpener>>>,
    pub connections: Arc<ws::ConnectionPool>,
}

impl AppState {
    pub fn new(engine: TaskEngine, events: Arc<dyn Publisher>) -> Self {
        Self {
            engine,
            events,
            projects: None,
            connections: Arc::new(ws::ConnectionPool::default()),
        }
    }

    pub fn with_projects(mut self, projects: Arc<ProjectCache<SqliteOpener>>) -> Self {
        self.projects = Some(projects);
        self
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.connections = Arc::new(ws::ConnectionPool::new(max_connections));
        self
    }
}

/// Build the complete API router
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Tasks
        .route(
            "/api/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route(
            "/api/tasks/:id",
            get(handlers::get_task).delete(handlers::delete_task),
        )
        .route("/api/tasks/:id/run", post(handlers::run_task))
        .route("/api/tasks/:id/pause", post(handlers::pause_task))
        .route("/api/tasks/:id/resume", post(handlers::resume_task))
        .route("/api/tasks/:id/cancel", post(handlers::cancel_task))
        // Decisions
        .route("/api/decisions", get(handlers::list_decisions))
        .route(
            "/api/decisions/:id",
            get(handlers::get_decision).post(handlers::resolve_decision),
        )
        // Workflows
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route(
            "/api/workflows/:id",
            get(handlers::get_workflow)
                .put(handlers::update_workflow)
                .delete(handlers::delete_workflow),
        )
        .route("/api/workflows/:id/clone", post(handlers::clone_workflow))
        // Session and projects
        .route("/api/session", get(handlers::get_session))
        .route("/api/projects", get(handlers::list_projects))
        .route("/api/projects/:id", get(handlers::get_project))
        .route("/api/projects/:id/tasks", get(handlers::list_project_tasks))
        // Streaming
        .route("/api/events", get(handlers::event_stream))
        .route("/ws", get(ws::ws_handler))
        .layer(logging_layer())
        .layer(cors_layer(cors_origins))
        .with_state(state)
}
