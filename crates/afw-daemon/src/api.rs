// SPDX-License-Identifier: MIT OR Apache-2.0
//! Request/response envelopes and the API error type.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Body of `202 Accepted` for `POST /v1/tasks`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskAccepted {
    /// Identifier for polling the new session.
    pub session_id: String,
}

/// Query parameters for `GET /v1/sessions/:id/excerpt`.
///
/// `line_start`/`line_end` also accept the short aliases `start`/`end`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ExcerptQuery {
    /// Target file path (required).
    pub path: Option<String>,
    /// 1-based first line.
    pub line_start: Option<usize>,
    /// Alias for `line_start`.
    pub start: Option<usize>,
    /// 1-based last line, inclusive.
    pub line_end: Option<usize>,
    /// Alias for `line_end`.
    pub end: Option<usize>,
    /// Response size cap in characters.
    pub max_chars: Option<usize>,
}

impl ExcerptQuery {
    /// Resolved first line (default 1).
    pub fn first_line(&self) -> usize {
        self.line_start.or(self.start).unwrap_or(1).max(1)
    }

    /// Resolved last line, if bounded.
    pub fn last_line(&self) -> Option<usize> {
        self.line_end.or(self.end)
    }
}

/// Body of `200 OK` for the excerpt route. Content is redacted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExcerptResponse {
    /// Canonical path that was read.
    pub path: String,
    /// First line returned (1-based).
    pub line_start: usize,
    /// Last line returned (1-based).
    pub line_end: usize,
    /// Redacted, possibly truncated file content.
    pub content: String,
}

/// Query parameters for `GET /v1/sessions/:id/logtail`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogtailQuery {
    /// `stdout` (default) or `stderr`.
    pub stream: Option<String>,
    /// Number of lines wanted; capped by configuration.
    pub n: Option<usize>,
    /// Literal substring filter.
    pub grep: Option<String>,
}

/// Body of `200 OK` for the logtail route. Lines are redacted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogtailResponse {
    /// Tail lines, oldest first.
    pub lines: Vec<String>,
    /// Which stream was read.
    pub stream: String,
    /// The effective line budget.
    pub n: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An HTTP-mapped error with a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    details: serde_json::Map<String, serde_json::Value>,
}

impl ApiError {
    /// A bare error with status and message.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: serde_json::Map::new(),
        }
    }

    /// Attach an extra top-level body field.
    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    /// `400` carrying the per-field error list.
    pub fn invalid_input(errors: Vec<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid input")
            .with_detail("errors", json!(errors))
    }

    /// `404` for an unknown session.
    pub fn session_not_found(id: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("unknown session: {id}"))
    }

    /// The mapped status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::Map::new();
        body.insert("error".to_string(), json!(self.message));
        body.extend(self.details);
        (self.status, Json(serde_json::Value::Object(body))).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}
