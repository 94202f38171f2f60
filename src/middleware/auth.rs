use axum::{
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::utils::secrets_match;
use crate::AppState;

pub const INTERNAL_SECRET_HEADER: &str = "X-Internal-Secret";

/// Guards internal endpoints with the shared `X-Internal-Secret` header.
pub async fn internal_auth<B>(
    State(state): State<AppState>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, AppError> {
    let provided = req
        .headers()
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    if provided.is_empty() || !secrets_match(provided, &state.internal_secret) {
        tracing::warn!(path = %req.uri().path(), "Rejected request with invalid internal secret");
        return Err(AppError::Unauthorized("invalid internal secret".to_string()));
    }

    Ok(next.run(req).await)
}
