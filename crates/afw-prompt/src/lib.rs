// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-prompt
//!
//! Assembles the worker prompt from a fixed base template with three
//! substitution slots (goal, workspace, constraints). The template digest is
//! recorded in each session's task record so deployments can tell which
//! prompt a past session saw. Operator append text and caller goals are
//! screened against a small injection-pattern set before substitution.

use regex::RegexSet;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;

/// Maximum operator-supplied append text, in bytes.
pub const MAX_APPEND_BYTES: usize = 2048;

/// The base template. Slots: `{goal}`, `{workspace}`, `{constraints}`.
const BASE_TEMPLATE: &str = "\
You are an autonomous coding agent operating inside a single bounded workspace.

Goal:
{goal}

Workspace root: {workspace}

Constraints:
{constraints}

Work only under the workspace root. Write any deliverable files into the
workspace artifacts directory. Report remaining work as file:line references.
";

static INJECTION_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)ignore previous",
        r"(?i)disregard (all )?instructions",
        r"(?i)\b(read|cat|open|dump|print)\b[^\n]{0,60}(/etc/|/root/|/proc/|/sys/|\.ssh\b)",
        r"(?i)exfiltrate",
    ])
    .expect("injection pattern set")
});

const INJECTION_LABELS: [&str; 4] = [
    "ignore-previous",
    "disregard-instructions",
    "system-path-read",
    "exfiltrate",
];

/// Errors raised while building a prompt.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// The goal or append text matched an injection pattern.
    #[error("prompt input blocked by injection screen ({pattern})")]
    InjectionBlocked {
        /// Label of the matched pattern.
        pattern: &'static str,
    },

    /// The operator append text exceeds [`MAX_APPEND_BYTES`].
    #[error("prompt append is {actual} bytes (limit {MAX_APPEND_BYTES})")]
    AppendTooLarge {
        /// Observed size.
        actual: usize,
    },
}

fn screen(text: &str) -> Result<(), PromptError> {
    if let Some(idx) = INJECTION_PATTERNS.matches(text).iter().next() {
        return Err(PromptError::InjectionBlocked {
            pattern: INJECTION_LABELS[idx],
        });
    }
    Ok(())
}

/// Builds worker prompts from the fixed base template.
#[derive(Clone, Debug)]
pub struct PromptBuilder {
    append: String,
    digest: String,
}

impl PromptBuilder {
    /// Create a builder with optional operator append text.
    ///
    /// The append is validated here, at startup, so a bad operator value
    /// fails fast rather than on the first submission.
    pub fn new(append: &str) -> Result<Self, PromptError> {
        if append.len() > MAX_APPEND_BYTES {
            return Err(PromptError::AppendTooLarge {
                actual: append.len(),
            });
        }
        screen(append)?;
        Ok(Self {
            append: append.to_string(),
            digest: template_digest(),
        })
    }

    /// First 16 hex chars of the SHA-256 of the base template.
    pub fn template_digest(&self) -> &str {
        &self.digest
    }

    /// Render the prompt for one task.
    ///
    /// Fails with [`PromptError::InjectionBlocked`] when the goal matches
    /// an injection pattern.
    pub fn build(
        &self,
        goal: &str,
        workspace: &Path,
        allowed_tools: &[String],
    ) -> Result<String, PromptError> {
        screen(goal)?;

        let mut constraints = String::from("- Do not read or write outside the workspace root.\n");
        if allowed_tools.is_empty() {
            constraints.push_str("- All standard tools are available.");
        } else {
            constraints.push_str(&format!("- Allowed tools: {}.", allowed_tools.join(", ")));
        }
        if !self.append.is_empty() {
            constraints.push('\n');
            constraints.push_str(&self.append);
        }

        Ok(BASE_TEMPLATE
            .replace("{goal}", goal)
            .replace("{workspace}", &workspace.display().to_string())
            .replace("{constraints}", &constraints))
    }
}

/// Digest of the base template: first 16 hex chars of its SHA-256.
pub fn template_digest() -> String {
    let mut hasher = Sha256::new();
    hasher.update(BASE_TEMPLATE.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}
