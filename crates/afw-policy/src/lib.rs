// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-policy
//!
//! Validates task submissions before a session is created. Field problems
//! are accumulated rather than short-circuited; the output is either a fully
//! sanitized task or the complete list of errors.

use afw_pathguard::{PathDecision, PathGuard};
use serde::Deserialize;
use std::path::PathBuf;

/// Maximum goal size in UTF-8 bytes.
pub const MAX_GOAL_BYTES: usize = 4096;

/// Turn count applied when the submission omits `turns_max`.
pub const DEFAULT_TURNS_MAX: u32 = 20;

/// Timeout applied when the submission omits `timeout_seconds`.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Configured upper bounds for the clamped numeric knobs.
#[derive(Clone, Copy, Debug)]
pub struct PolicyLimits {
    /// Upper bound for `turns_max`.
    pub turns_cap: u32,
    /// Upper bound for `timeout_seconds`.
    pub timeout_cap: u64,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            turns_cap: 50,
            timeout_cap: 1800,
        }
    }
}

/// Permissive mirror of the submission body. Unknown fields are ignored;
/// typed validation happens field by field so every problem is reported.
#[derive(Debug, Default, Deserialize)]
pub struct TaskSubmission {
    /// Natural-language goal.
    #[serde(default)]
    pub goal: Option<serde_json::Value>,
    /// Requested workspace root.
    #[serde(default)]
    pub workspace_root: Option<serde_json::Value>,
    /// Requested tool allowlist.
    #[serde(default)]
    pub allowed_tools: Option<serde_json::Value>,
    /// Requested turn cap.
    #[serde(default)]
    pub turns_max: Option<serde_json::Value>,
    /// Requested timeout in seconds.
    #[serde(default)]
    pub timeout_seconds: Option<serde_json::Value>,
}

/// A sanitized, accepted submission.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidTask {
    /// Trimmed goal text.
    pub goal: String,
    /// Canonicalized workspace root (not the raw input).
    pub workspace_root: PathBuf,
    /// String entries of the submitted allowlist; other entry types dropped.
    pub allowed_tools: Vec<String>,
    /// Clamped turn cap.
    pub turns_max: u32,
    /// Clamped timeout.
    pub timeout_seconds: u64,
}

/// Outcome of validating a submission.
#[derive(Clone, Debug)]
pub enum TaskValidation {
    /// Every check passed; the sanitized task is ready for session creation.
    Valid(ValidTask),
    /// One or more fields were missing, oversized, or of the wrong type.
    Invalid {
        /// Per-field error messages, in field order.
        errors: Vec<String>,
    },
    /// Fields were well-formed but the workspace root failed the path guard.
    Denied {
        /// Guard reason.
        reason: String,
    },
}

/// Validate `submission` against `limits`, resolving the workspace root
/// through `guard` (configured with the allowed roots and deny globs).
pub fn validate(
    submission: &TaskSubmission,
    limits: &PolicyLimits,
    guard: &PathGuard,
) -> TaskValidation {
    let mut errors = Vec::new();

    let goal = match &submission.goal {
        None | Some(serde_json::Value::Null) => {
            errors.push("goal is required".to_string());
            None
        }
        Some(serde_json::Value::String(raw)) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                errors.push("goal must not be empty".to_string());
                None
            } else if trimmed.len() > MAX_GOAL_BYTES {
                errors.push(format!("goal exceeds {MAX_GOAL_BYTES} bytes"));
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(_) => {
            errors.push("goal must be a string".to_string());
            None
        }
    };

    let mut denial: Option<String> = None;
    let workspace_root = match &submission.workspace_root {
        None | Some(serde_json::Value::Null) => {
            errors.push("workspace_root is required".to_string());
            None
        }
        Some(serde_json::Value::String(raw)) if raw.trim().is_empty() => {
            errors.push("workspace_root must not be empty".to_string());
            None
        }
        Some(serde_json::Value::String(raw)) => match guard.validate(raw) {
            PathDecision::Allowed { resolved } => Some(resolved),
            PathDecision::Denied { reason } => {
                denial = Some(format!("workspace_root: {reason}"));
                None
            }
        },
        Some(_) => {
            errors.push("workspace_root must be a string".to_string());
            None
        }
    };

    let allowed_tools = match &submission.allowed_tools {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(entries)) => entries
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(_) => {
            errors.push("allowed_tools must be an array".to_string());
            Vec::new()
        }
    };

    let turns_max = clamp_knob(
        submission.turns_max.as_ref(),
        "turns_max",
        i64::from(DEFAULT_TURNS_MAX),
        i64::from(limits.turns_cap),
        &mut errors,
    ) as u32;

    let timeout_seconds = clamp_knob(
        submission.timeout_seconds.as_ref(),
        "timeout_seconds",
        DEFAULT_TIMEOUT_SECONDS as i64,
        limits.timeout_cap as i64,
        &mut errors,
    ) as u64;

    if !errors.is_empty() {
        if let Some(reason) = denial {
            errors.push(reason);
        }
        return TaskValidation::Invalid { errors };
    }
    if let Some(reason) = denial {
        return TaskValidation::Denied { reason };
    }

    TaskValidation::Valid(ValidTask {
        goal: goal.expect("goal validated"),
        workspace_root: workspace_root.expect("workspace validated"),
        allowed_tools,
        turns_max,
        timeout_seconds,
    })
}

/// Resolve a numeric knob: absent, null, or non-positive values take the
/// default; everything else clamps to `[1, cap]`.
fn clamp_knob(
    value: Option<&serde_json::Value>,
    field: &str,
    default: i64,
    cap: i64,
    errors: &mut Vec<String>,
) -> i64 {
    let requested = match value {
        None | Some(serde_json::Value::Null) => default,
        Some(v) => match v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)) {
            Some(n) if n <= 0 => default,
            Some(n) => n,
            None => {
                errors.push(format!("{field} must be a number"));
                default
            }
        },
    };
    requested.clamp(1, cap)
}
