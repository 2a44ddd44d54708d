use crate::audio::session::SessionSnapshot;
use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde_json::json;

fn session_json(snapshot: &SessionSnapshot) -> serde_json::Value {
    let idle_ms = (Utc::now() - snapshot.last_activity).num_milliseconds().max(0);
    let idle_seconds = idle_ms as f64 / 1000.0;
    json!({
        "connection_id": snapshot.connection_id,
        "frame_index": snapshot.frame_index,
        "display_state": snapshot.display_state,
        "consecutive_count": snapshot.consecutive_count,
        "smoothed_is_noisy": snapshot.smoothed_is_noisy,
        "frames_failed": snapshot.frames_failed,
        "created_at": snapshot.created_at.to_rfc3339(),
        "last_activity": snapshot.last_activity.to_rfc3339(),
        "idle_seconds": idle_seconds
    })
}

/// GET /api/v1/sessions
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let snapshots = state.sessions.snapshots().await;
    let sessions: Vec<serde_json::Value> = snapshots.iter().map(session_json).collect();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "max_concurrent_sessions": state.sessions.settings().max_concurrent_sessions,
        "sessions": sessions
    })))
}

/// GET /api/v1/sessions/{connection_id}
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let snapshot = state.sessions.snapshot(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(session_json(&snapshot)))
}
