// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bearer-token authentication middleware.

use crate::AppState;
use crate::api::ApiError;
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Length-gated, non-short-circuiting byte comparison.
///
/// Deliberately free of any crypto-crate dependency: XOR-fold the whole
/// buffer so the comparison time does not depend on where the first
/// difference sits.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Reject any request lacking `Authorization: Bearer <token>` with the
/// configured token. Applied to every route.
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthorized)?;

    let token = header.strip_prefix("Bearer ").ok_or_else(unauthorized)?;
    if token.is_empty()
        || !constant_time_eq(token.as_bytes(), state.config.bridge_token.as_bytes())
    {
        return Err(unauthorized());
    }

    Ok(next.run(req).await)
}

fn unauthorized() -> ApiError {
    ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized")
}
