//! Playback control for live media stream sessions.
//!
//! ## Endpoints:
//! - `POST /api/v1/sessions/{session_id}/mark`: ask the provider to echo a named mark
//!   once its outbound playback reaches this point
//! - `POST /api/v1/sessions/{session_id}/clear`: ask the provider to drop buffered playback
//!
//! Both answer 202 once the message is queued on the socket, 404 for an unknown session
//! and 409 while the provider has not yet sent `start`.

use crate::bridge::SessionControl;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct MarkRequest {
    pub name: String,
}

pub async fn send_mark(
    path: web::Path<String>,
    body: web::Json<MarkRequest>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Mark name cannot be empty".to_string()));
    }

    let control = find_session(&state, &session_id)?;
    if !control.send_mark(name) {
        return Err(not_streaming(&session_id));
    }

    Ok(accepted(&session_id, "mark"))
}

pub async fn clear_playback(path: web::Path<String>, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();

    let control = find_session(&state, &session_id)?;
    if !control.clear_playback() {
        return Err(not_streaming(&session_id));
    }

    Ok(accepted(&session_id, "clear"))
}

fn find_session(state: &AppState, session_id: &str) -> AppResult<SessionControl> {
    state
        .session_control(session_id)
        .ok_or_else(|| AppError::NotFound(format!("No active session '{}'", session_id)))
}

fn not_streaming(session_id: &str) -> AppError {
    AppError::Conflict(format!("Session '{}' is not streaming yet", session_id))
}

fn accepted(session_id: &str, event: &str) -> HttpResponse {
    HttpResponse::Accepted().json(json!({
        "session_id": session_id,
        "event": event,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
