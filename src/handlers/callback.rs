use axum::{body::Bytes, extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::error::AppError;
use crate::queue::Task;
use crate::AppState;

/// `POST /callback`. Only checks that the body is a JSON object and queues it;
/// the upstream gets its acknowledgement before any processing happens.
pub async fn callback(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) if value.is_object() => {}
        Ok(_) => return Err(AppError::BadRequest("Invalid JSON".to_string())),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid JSON in callback");
            return Err(AppError::BadRequest("Invalid JSON".to_string()));
        }
    }

    let task = Task::callback(body.to_vec());
    state.queue.enqueue(&task).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to enqueue callback");
        AppError::Internal("Failed to queue callback".to_string())
    })?;

    tracing::info!(task_id = %task.id, "Callback queued");

    Ok((StatusCode::OK, Json(json!({ "status": "received" }))))
}
