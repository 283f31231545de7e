// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! afw-daemon
//!
//! The HTTP surface of the agent firewall. Callers POST declarative tasks
//! and poll for state; they never submit shell commands. Every route sits
//! behind bearer authentication, and every piece of text leaving the server
//! goes through the redactor.

pub mod api;
pub mod auth;
pub mod config;
pub mod logtail;
pub mod middleware;

use afw_core::{SessionStatus, SharedState, StatePatch, TaskSpec};
use afw_gate::Gate;
use afw_pathguard::{DenyGlobs, PathDecision, PathGuard};
use afw_policy::{PolicyLimits, TaskSubmission, TaskValidation, ValidTask};
use afw_prompt::{PromptBuilder, PromptError};
use afw_redact::redact;
use afw_store::SessionStore;
use afw_supervisor::{AbortSignal, RunRequest, Supervisor};
use api::{
    ApiError, ExcerptQuery, ExcerptResponse, LogtailQuery, LogtailResponse, TaskAccepted,
};
use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use config::Config;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Shared state handed to every handler.
pub struct AppState {
    /// Immutable process configuration.
    pub config: Arc<Config>,
    /// Session persistence.
    pub store: Arc<SessionStore>,
    /// Single-slot admission gate.
    pub gate: Arc<Gate>,
    /// Worker subprocess supervisor.
    pub supervisor: Arc<Supervisor>,
    /// Prompt assembly (validated operator append).
    pub prompt_builder: PromptBuilder,
    /// Guard for task submission (allowed roots + deny globs).
    pub submission_guard: PathGuard,
    /// Compiled deny globs, reused for per-session excerpt guards.
    pub deny_globs: DenyGlobs,
    /// Abort signals of in-flight sessions, keyed by session id.
    pub aborts: Mutex<HashMap<String, AbortSignal>>,
}

/// Wire up collaborators from configuration.
pub fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let deny_globs = DenyGlobs::compile(&config.deny_globs)?;
    let submission_guard = PathGuard::new(&config.allowed_roots, deny_globs.clone())?;
    let prompt_builder = PromptBuilder::new(&config.prompt_append)?;

    let store = Arc::new(SessionStore::new(config.data_dir.clone()));
    let gate = Arc::new(Gate::new());
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&store),
        Arc::clone(&gate),
        config.worker_bin.clone(),
    ));

    Ok(Arc::new(AppState {
        config: Arc::new(config),
        store,
        gate,
        supervisor,
        prompt_builder,
        submission_guard,
        deny_globs,
        aborts: Mutex::new(HashMap::new()),
    }))
}

/// Build the Axum router with all gateway routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/tasks", post(submit_task))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/{id}/state", get(get_state))
        .route("/v1/sessions/{id}/abort", post(abort_session))
        .route("/v1/sessions/{id}/excerpt", get(get_excerpt))
        .route("/v1/sessions/{id}/artifacts", get(list_artifacts))
        .route("/v1/sessions/{id}/artifacts/{name}", get(get_artifact))
        .route("/v1/sessions/{id}/logtail", get(get_logtail))
        .route("/v1/health", get(health))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_bearer,
        ))
        .layer(axum::middleware::from_fn(middleware::request_logger))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Task submission
// ---------------------------------------------------------------------------

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let submission: TaskSubmission = serde_json::from_value(body)
        .map_err(|_| ApiError::invalid_input(vec!["body must be a JSON object".into()]))?;

    let limits = PolicyLimits {
        turns_cap: state.config.turns_cap,
        timeout_cap: state.config.timeout_cap,
    };
    let task = match afw_policy::validate(&submission, &limits, &state.submission_guard) {
        TaskValidation::Valid(task) => task,
        TaskValidation::Invalid { errors } => return Err(ApiError::invalid_input(errors)),
        TaskValidation::Denied { reason } => {
            return Err(ApiError::new(StatusCode::FORBIDDEN, reason));
        }
    };

    let prompt = state
        .prompt_builder
        .build(&task.goal, &task.workspace_root, &task.allowed_tools)
        .map_err(|err| match err {
            PromptError::InjectionBlocked { .. } | PromptError::AppendTooLarge { .. } => {
                ApiError::invalid_input(vec![err.to_string()])
            }
        })?;

    let session_id = Uuid::new_v4().to_string();

    if !state.gate.acquire(&task.workspace_root, &session_id) {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "another session is active",
        )
        .with_detail("active_session", json!(state.gate.active_session_id())));
    }

    if let Err(err) = state
        .store
        .create(&session_id, &task_spec(&task, &state.prompt_builder))
        .await
    {
        state.gate.release(&task.workspace_root, &session_id);
        error!(session_id = %session_id, error = %err, "session creation failed");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "session could not be created",
        ));
    }

    let signal = AbortSignal::new();
    state
        .aborts
        .lock()
        .expect("abort map poisoned")
        .insert(session_id.clone(), signal.clone());

    let run = RunRequest {
        session_id: session_id.clone(),
        goal: task.goal.clone(),
        prompt,
        workspace: task.workspace_root.clone(),
        allowed_tools: task.allowed_tools.clone(),
        timeout: Duration::from_secs(task.timeout_seconds),
    };
    let supervisor = Arc::clone(&state.supervisor);
    let tracked = Arc::clone(&state);
    let tracked_id = session_id.clone();
    tokio::spawn(async move {
        supervisor.run(run, signal).await;
        tracked
            .aborts
            .lock()
            .expect("abort map poisoned")
            .remove(&tracked_id);
    });

    info!(session_id = %session_id, "task accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted { session_id }),
    )
        .into_response())
}

fn task_spec(task: &ValidTask, prompt_builder: &PromptBuilder) -> TaskSpec {
    TaskSpec {
        goal: task.goal.clone(),
        workspace_root: task.workspace_root.clone(),
        allowed_tools: task.allowed_tools.clone(),
        turns_max: task.turns_max,
        timeout_seconds: task.timeout_seconds,
        created_at: Utc::now(),
        template_digest: prompt_builder.template_digest().to_string(),
        extra: BTreeMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Session reads
// ---------------------------------------------------------------------------

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let summaries = state.store.list_sessions().await.map_err(internal)?;
    Ok(Json(summaries).into_response())
}

async fn get_state(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Json<SharedState>, ApiError> {
    state
        .store
        .get_state(&id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| ApiError::session_not_found(&id))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_session": state.gate.active_session_id(),
    }))
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

async fn abort_session(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Response, ApiError> {
    let current = state
        .store
        .get_state(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::session_not_found(&id))?;

    if current.status != SessionStatus::Running {
        return Err(
            ApiError::new(StatusCode::CONFLICT, "session is not running")
                .with_detail("status", json!(current.status)),
        );
    }

    // Advisory: flip the signal so the supervisor skips further writes, and
    // mark the session aborted right away. The gate stays held until the
    // worker actually exits.
    if let Some(signal) = state.aborts.lock().expect("abort map poisoned").get(&id) {
        signal.abort();
    }
    state
        .store
        .update_state(
            &id,
            StatePatch::terminal(
                SessionStatus::Aborted,
                Some("Aborted by client request".to_string()),
            ),
        )
        .await
        .map_err(internal)?;

    info!(session_id = %id, "session aborted by client");
    Ok(Json(json!({"status": "aborted"})).into_response())
}

// ---------------------------------------------------------------------------
// Excerpt
// ---------------------------------------------------------------------------

async fn get_excerpt(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Query(query): Query<ExcerptQuery>,
) -> Result<Json<ExcerptResponse>, ApiError> {
    let Some(path) = query.path.clone().filter(|p| !p.is_empty()) else {
        return Err(ApiError::invalid_input(vec!["path is required".into()]));
    };

    let task = state
        .store
        .get_task(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::session_not_found(&id))?;

    // Scoped to the session's own workspace, not the global allowed roots,
    // so one session cannot read a sibling workspace.
    let guard = PathGuard::new(
        std::slice::from_ref(&task.workspace_root),
        state.deny_globs.clone(),
    )
    .map_err(internal)?;

    // Relative paths are taken as workspace-relative.
    let path = if std::path::Path::new(&path).is_absolute() {
        path
    } else {
        task.workspace_root.join(&path).display().to_string()
    };

    let resolved = match guard.validate(&path) {
        PathDecision::Allowed { resolved } => resolved,
        PathDecision::Denied { reason } => {
            return Err(ApiError::new(StatusCode::FORBIDDEN, reason));
        }
    };

    let contents = match tokio::fs::read_to_string(&resolved).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::new(StatusCode::NOT_FOUND, "file not found"));
        }
        Err(err) => return Err(internal(err)),
    };

    let first = query.first_line();
    let all_lines: Vec<&str> = contents.lines().collect();
    let last = query
        .last_line()
        .unwrap_or(all_lines.len())
        .min(all_lines.len());
    let slice = if first > last {
        String::new()
    } else {
        all_lines[first - 1..last].join("\n")
    };

    let cap = query
        .max_chars
        .unwrap_or(state.config.excerpt_max_chars)
        .min(state.config.excerpt_max_chars);
    let truncated: String = slice.chars().take(cap).collect();

    Ok(Json(ExcerptResponse {
        path: resolved.display().to_string(),
        line_start: first,
        line_end: last,
        content: redact(&truncated),
    }))
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_state(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::session_not_found(&id))?;
    Ok(Json(json!({"artifacts": session.artifacts})).into_response())
}

async fn get_artifact(
    State(state): State<Arc<AppState>>,
    AxPath((id, name)): AxPath<(String, String)>,
) -> Result<Response, ApiError> {
    let session = state
        .store
        .get_state(&id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::session_not_found(&id))?;

    // Only names listed verbatim in the current state index are servable.
    if !session.artifacts.iter().any(|a| a.name == name) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "artifact not found"));
    }

    let path = state
        .store
        .artifact_path(&id, &name, None)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "artifact not found"))?;

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "artifact not found"))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Logtail
// ---------------------------------------------------------------------------

async fn get_logtail(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
    Query(query): Query<LogtailQuery>,
) -> Result<Json<LogtailResponse>, ApiError> {
    let stream = query.stream.clone().unwrap_or_else(|| "stdout".to_string());
    if stream != "stdout" && stream != "stderr" {
        return Err(ApiError::invalid_input(vec![format!(
            "stream must be stdout or stderr, got {stream:?}"
        )]));
    }

    if state.store.get_state(&id).await.map_err(internal)?.is_none() {
        return Err(ApiError::session_not_found(&id));
    }

    let n = query
        .n
        .unwrap_or(50)
        .clamp(1, state.config.logtail_max_lines);

    let session_dir = state.store.session_dir(&id);
    let lines = match logtail::latest_turn_dir(&session_dir).await {
        None => Vec::new(),
        Some(turn_dir) => {
            let raw = logtail::tail_lines(&turn_dir.join(format!("{stream}.log")), n)
                .await
                .map_err(internal)?;
            raw.into_iter()
                .filter(|line| match &query.grep {
                    Some(needle) => line.contains(needle.as_str()),
                    None => true,
                })
                .map(|line| redact(&line))
                .collect()
        }
    };

    Ok(Json(LogtailResponse { lines, stream, n }))
}

// ---------------------------------------------------------------------------

fn internal(err: impl std::fmt::Display) -> ApiError {
    error!(error = %err, "internal error");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
