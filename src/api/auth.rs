//! HTTP Basic authentication middleware

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::AppState;
use crate::error::AppError;

/// Reject requests without a valid Basic credential. Mounted only on the
/// protected routes, and only when the server config carries credentials.
pub async fn basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let server = &state.config.server;
    if !server.auth_enabled() {
        return Ok(next.run(request).await);
    }

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Authentication("missing credentials".to_string()))?;

    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| AppError::Authentication("basic credentials required".to_string()))?;

    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| AppError::Authentication("malformed credentials".to_string()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AppError::Authentication("malformed credentials".to_string()))?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| AppError::Authentication("malformed credentials".to_string()))?;

    if username != server.username || password != server.password {
        return Err(AppError::Authentication("invalid credentials".to_string()));
    }

    Ok(next.run(request).await)
}
