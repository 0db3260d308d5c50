//! Bearer-token authentication for the control API.
//!
//! The token is 16 random bytes hex-encoded, stored by the manager. When
//! auth is disabled every request passes. `/ping` and the WS handshake live
//! outside this middleware entirely.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let (enabled, token) = state.manager.auth_config();
    if !enabled {
        return Ok(next.run(request).await);
    }

    let presented = bearer_token(&request).or_else(|| query_token(&request));
    match presented {
        Some(t) if t == token => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}
