// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-core
//!
//! The stable contract for the agent-firewall gateway: session records,
//! live state, and the patch type used to mutate state.
//!
//! Everything persisted or sent over the wire lives here. Unknown fields in
//! persisted records survive read-modify-write cycles via the `extra` maps.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Session id grammar: 1–128 characters from `[A-Za-z0-9_-]`.
pub const SESSION_ID_MAX_LEN: usize = 128;

/// Returns `true` if `id` is a well-formed session identifier.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= SESSION_ID_MAX_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The worker subprocess is (or is about to be) executing.
    Running,
    /// The worker exited with code 0.
    Done,
    /// The worker timed out, exited non-zero, or could not be spawned.
    Failed,
    /// The session was aborted by a client or by startup recovery.
    Aborted,
}

impl SessionStatus {
    /// Returns `true` if this status is terminal.
    ///
    /// A terminal state is a fixpoint: no further mutation of the session's
    /// shared state is observable once one has been written.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Returns `true` if transitioning from `self` to `next` is valid.
    ///
    /// `Running` transitions at most once, and only to a terminal state.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self {
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task record
// ---------------------------------------------------------------------------

/// The immutable task record written to `task.json` at session creation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    /// Natural-language goal (≤ 4 KiB UTF-8, enforced by policy).
    pub goal: String,
    /// Absolute, symlink-resolved workspace root.
    pub workspace_root: PathBuf,
    /// Tool names forwarded to the worker via `--allowedTools`.
    pub allowed_tools: Vec<String>,
    /// Upper bound on worker turns.
    pub turns_max: u32,
    /// Wall-clock timeout for the worker, in seconds.
    pub timeout_seconds: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// First 16 hex chars of the prompt template digest the session saw.
    pub template_digest: String,
    /// Unknown fields from older or newer writers, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// An automatically extracted `file:line[-line]` reference from worker
/// output, signalling where work remains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Blocker {
    /// The full output line containing the reference.
    pub description: String,
    /// File path as it appeared in the output.
    pub file: String,
    /// `"NN"` or `"NN-MM"`.
    pub line_range: String,
}

/// A regular file found in the workspace artifacts directory at completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactEntry {
    /// File name (basename, no separators).
    pub name: String,
    /// Absolute path on the server.
    pub path: String,
    /// Size in bytes.
    pub bytes: u64,
    /// Lowercase SHA-256 hex of the contents.
    pub sha256: String,
}

/// A record that a CLI flag was dropped because the worker rejected it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FallbackEvent {
    /// When the fallback was taken.
    pub time: DateTime<Utc>,
    /// The flag the worker rejected (e.g. `--allowedTools`).
    pub attempted_flag: String,
    /// Why the fallback fired (worker stderr evidence).
    pub reason: String,
    /// What the supervisor did instead.
    pub fallback_action: String,
}

/// The live status record, persisted as `shared_state.json` and replaced
/// atomically on every update.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SharedState {
    /// Equal to the session directory name. Never mutates.
    pub session_id: String,
    /// Equal to `task.json`'s goal. Never mutates.
    pub goal: String,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Completed worker turns. Monotonically non-decreasing.
    pub turns_completed: u32,
    /// Turn cap from the task. Never mutates.
    pub turns_max: u32,
    /// Append-only progress notes.
    pub progress: Vec<String>,
    /// Replaced wholesale on update; at most 10 entries.
    pub blockers: Vec<Blocker>,
    /// Workspace-relative changed paths, written at finalization.
    pub files_changed: Vec<String>,
    /// Indexed artifacts, written at finalization.
    pub artifacts: Vec<ArtifactEntry>,
    /// Append-only; empty on the success path.
    pub fallback_events: Vec<FallbackEvent>,
    /// Cost reported by the worker's structured output, if any.
    pub cost_usd: Option<f64>,
    /// Set on every write.
    pub updated_at: DateTime<Utc>,
    /// Non-null exactly when `status != done`.
    pub error_summary: Option<String>,
    /// Unknown fields from older or newer writers, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl SharedState {
    /// Initial state for a freshly created session.
    pub fn initial(session_id: &str, task: &TaskSpec) -> Self {
        Self {
            session_id: session_id.to_string(),
            goal: task.goal.clone(),
            status: SessionStatus::Running,
            turns_completed: 0,
            turns_max: task.turns_max,
            progress: Vec::new(),
            blockers: Vec::new(),
            files_changed: Vec::new(),
            artifacts: Vec::new(),
            fallback_events: Vec::new(),
            cost_usd: None,
            updated_at: Utc::now(),
            error_summary: None,
            extra: BTreeMap::new(),
        }
    }

    /// Shallow-merge `patch` into this state and bump `updated_at`.
    ///
    /// `session_id` and `goal` cannot be patched. Sequences marked
    /// append-only in the contract (`progress`, `fallback_events`) are
    /// extended; the rest are replaced. Returns `false` without touching
    /// anything when the current status is already terminal.
    pub fn apply(&mut self, patch: StatePatch) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(status) = patch.status {
            if self.status.can_transition_to(status) || status == self.status {
                self.status = status;
            }
        }
        if let Some(turns) = patch.turns_completed {
            self.turns_completed = self.turns_completed.max(turns);
        }
        self.progress.extend(patch.progress);
        if let Some(blockers) = patch.blockers {
            self.blockers = blockers;
        }
        if let Some(files) = patch.files_changed {
            self.files_changed = files;
        }
        if let Some(artifacts) = patch.artifacts {
            self.artifacts = artifacts;
        }
        self.fallback_events.extend(patch.fallback_events);
        if let Some(cost) = patch.cost_usd {
            self.cost_usd = Some(cost);
        }
        if let Some(summary) = patch.error_summary {
            self.error_summary = Some(summary);
        }
        self.updated_at = Utc::now();
        true
    }
}

/// A partial update to [`SharedState`].
///
/// `None` / empty fields leave the corresponding state field untouched.
#[derive(Clone, Debug, Default)]
pub struct StatePatch {
    /// New status; ignored unless the transition is valid.
    pub status: Option<SessionStatus>,
    /// New turn count; never decreases the stored value.
    pub turns_completed: Option<u32>,
    /// Progress notes to append.
    pub progress: Vec<String>,
    /// Wholesale replacement of the blocker list.
    pub blockers: Option<Vec<Blocker>>,
    /// Wholesale replacement of the changed-file list.
    pub files_changed: Option<Vec<String>>,
    /// Wholesale replacement of the artifact index.
    pub artifacts: Option<Vec<ArtifactEntry>>,
    /// Fallback events to append.
    pub fallback_events: Vec<FallbackEvent>,
    /// Worker-reported cost, if one was parsed.
    pub cost_usd: Option<f64>,
    /// Diagnostic summary; set when the session did not end in `done`.
    pub error_summary: Option<String>,
}

impl StatePatch {
    /// A patch that only moves the session to a terminal status.
    pub fn terminal(status: SessionStatus, error_summary: Option<String>) -> Self {
        Self {
            status: Some(status),
            error_summary,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// Summary row returned by `GET /v1/sessions`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: String,
    /// Current status.
    pub status: SessionStatus,
    /// Task goal.
    pub goal: String,
    /// From `task.json`.
    pub created_at: DateTime<Utc>,
    /// From `shared_state.json`.
    pub updated_at: DateTime<Utc>,
}
