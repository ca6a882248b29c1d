use crate::{
    error::{AppError, AppResult},
    state::AppState,
};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// List live sessions, oldest first.
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    })))
}

/// Force-close a session; the device is disconnected and all its state released.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if !state.registry.close(&session_id) {
        return Err(AppError::NotFound(format!("session {}", session_id)));
    }
    info!(session_id = %session_id, "Session closed through the API");

    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "session_id": session_id
    })))
}
