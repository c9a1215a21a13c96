//! Server-sent progress events per session

use axum::{
    extract::{Path, State},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::web::AppState;

/// Stream progress events of every job in a session
///
/// Only events published after the subscription are delivered; use the job
/// status endpoint for the current state.
#[utoipa::path(
    get,
    path = "/api/v1/sessions/{session_id}/events",
    params(("session_id" = String, Path, description = "Session that submitted the jobs")),
    responses(
        (status = 200, description = "Progress events stream (SSE)", content_type = "text/event-stream")
    ),
    tag = "progress"
)]
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    debug!("Starting progress SSE stream for session {}", session_id);
    let mut receiver = state.orchestrator.progress().subscribe(&session_id).await;

    let stream = async_stream::stream! {
        yield Ok::<Event, axum::Error>(Event::default()
            .event("heartbeat")
            .data("connected"));

        loop {
            match receiver.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        yield Ok::<Event, axum::Error>(Event::default()
                            .event("progress")
                            .id(event.job_id.to_string())
                            .data(json));
                    }
                    Err(e) => error!("Failed to serialize progress event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("SSE subscriber of session {} lagged, skipped {} events", session_id, skipped);
                    continue;
                }
                Err(RecvError::Closed) => {
                    debug!("Progress channel of session {} closed", session_id);
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.web.sse_keep_alive))
}
