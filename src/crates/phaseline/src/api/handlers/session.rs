//! Session metrics endpoint

use axum::{extract::State, Json};

use crate::api::routes::AppState;
use crate::session::SessionUpdate;

/// GET /api/session
///
/// Without a broadcaster only the running-task count is known.
pub async fn get_session(State(state): State<AppState>) -> Json<SessionUpdate> {
    match state.engine.session() {
        Some(session) => Json(session.current_metrics().await),
        None => Json(SessionUpdate {
            tasks_running: state.engine.executing_count() as u32,
            ..Default::default()
        }),
    }
}
