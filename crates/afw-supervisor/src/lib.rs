// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-supervisor
//!
//! Owns a session from acceptance to terminal state: spawns the worker CLI
//! inside the workspace, enforces the timeout, falls back gracefully when
//! the worker rejects a CLI flag, persists the unredacted audit logs,
//! derives redacted deliverables, and writes the terminal state. The gate
//! slot is released on every exit path — normal, error, or cancelled — and
//! only once the worker has actually exited.

pub mod artifacts;
pub mod blockers;
mod abort;
mod worker;

pub use abort::AbortSignal;
pub use worker::{SESSION_ENV_VAR, WorkerOutcome, run_worker};

use afw_core::{ArtifactEntry, Blocker, FallbackEvent, SessionStatus, StatePatch};
use afw_gate::Gate;
use afw_redact::redact;
use afw_store::{ARTIFACTS_SUBDIR, SessionStore};
use chrono::Utc;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

static UNKNOWN_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)unknown|unrecognized|not recognized|invalid (option|flag)")
        .expect("unknown-flag pattern")
});

static NAMES_ALLOWED_TOOLS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)allowedtools|allowed-tools|allowed_tools").expect("allowed-tools pattern")
});

static TEST_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"PASS|FAIL|✓|✗|Tests:|Test Suites:|test result:").expect("test marker pattern")
});

/// Most lines copied into `out/test_report.md`.
const TEST_REPORT_MAX_LINES: usize = 100;

const STDOUT_STDERR_MARKER: &str = "\n--- stderr ---\n";

/// Everything the supervisor needs to run one session.
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// Session identifier (also the session directory name).
    pub session_id: String,
    /// Task goal, used for the summary document.
    pub goal: String,
    /// Fully rendered worker prompt.
    pub prompt: String,
    /// Canonical workspace root.
    pub workspace: PathBuf,
    /// Tool allowlist forwarded via `--allowedTools`.
    pub allowed_tools: Vec<String>,
    /// Wall-clock budget for the worker.
    pub timeout: Duration,
}

/// Supervises worker subprocesses for accepted sessions.
pub struct Supervisor {
    store: Arc<SessionStore>,
    gate: Arc<Gate>,
    worker_bin: String,
}

impl Supervisor {
    /// Wire a supervisor to its collaborators. `worker_bin` is invoked by
    /// name (PATH lookup), never through a shell.
    pub fn new(store: Arc<SessionStore>, gate: Arc<Gate>, worker_bin: impl Into<String>) -> Self {
        Self {
            store,
            gate,
            worker_bin: worker_bin.into(),
        }
    }

    /// Run one session to its terminal state.
    ///
    /// Never returns an error: every failure becomes a terminal session
    /// state with a diagnostic `error_summary`. An abort observed on
    /// `abort` suppresses state writes but not the audit logs already on
    /// disk.
    pub async fn run(&self, req: RunRequest, abort: AbortSignal) {
        self.run_inner(&req, &abort).await;
        self.gate.release(&req.workspace, &req.session_id);
        info!(session_id = %req.session_id, "session slot released");
    }

    async fn run_inner(&self, req: &RunRequest, abort: &AbortSignal) {
        let session_dir = self.store.session_dir(&req.session_id);
        let turn_dir = session_dir.join("turns").join("0001");
        let out_dir = session_dir.join("out");
        let artifacts_dir = req.workspace.join(ARTIFACTS_SUBDIR);

        if let Err(err) = fs::create_dir_all(&turn_dir).await {
            warn!(session_id = %req.session_id, error = %err, "turn dir creation failed");
            self.finalize(req, abort, StatePatch::terminal(
                SessionStatus::Failed,
                Some(format!("Session directories could not be created: {err}")),
            ))
            .await;
            return;
        }
        let _ = fs::create_dir_all(&out_dir).await;
        // Best effort: a read-only workspace still gets a session, just no
        // artifact drop-box.
        let _ = fs::create_dir_all(&artifacts_dir).await;

        let mut args = primary_args(&req.prompt, &req.allowed_tools);
        let mut tools_included = !req.allowed_tools.is_empty();
        let mut fallback_events: Vec<FallbackEvent> = Vec::new();
        write_request_record(&turn_dir, &args, &req.prompt, false).await;

        info!(session_id = %req.session_id, worker = %self.worker_bin, "spawning worker");
        let mut outcome = match self.spawn(req, &args).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.finalize(req, abort, StatePatch::terminal(
                    SessionStatus::Failed,
                    Some(format!("Worker could not be spawned: {err}")),
                ))
                .await;
                return;
            }
        };

        // Fallback 1: the worker rejected --allowedTools by name. Dropping
        // only that flag keeps --output-format intact, so a worker that
        // rejects both flags is handled one flag at a time and the tool
        // restriction is never dropped silently.
        if tools_included && rejected_flag(&outcome) && NAMES_ALLOWED_TOOLS.is_match(&stderr_text(&outcome)) {
            let reason = stderr_evidence(&outcome);
            info!(session_id = %req.session_id, "worker rejected --allowedTools, retrying without it");
            fallback_events.push(FallbackEvent {
                time: Utc::now(),
                attempted_flag: "--allowedTools".to_string(),
                reason,
                fallback_action: "retried without --allowedTools".to_string(),
            });
            args = primary_args(&req.prompt, &[]);
            tools_included = false;
            write_request_record(&turn_dir, &args, &req.prompt, true).await;
            outcome = match self.spawn(req, &args).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.finalize(req, abort, StatePatch {
                        fallback_events,
                        ..StatePatch::terminal(
                            SessionStatus::Failed,
                            Some(format!("Worker could not be spawned: {err}")),
                        )
                    })
                    .await;
                    return;
                }
            };
        }

        // Fallback 2: structured output is the remaining suspect flag.
        if rejected_flag(&outcome) {
            let reason = stderr_evidence(&outcome);
            info!(session_id = %req.session_id, "worker rejected --output-format, retrying with --print");
            fallback_events.push(FallbackEvent {
                time: Utc::now(),
                attempted_flag: "--output-format".to_string(),
                reason,
                fallback_action: "retried with --print instead of --output-format json"
                    .to_string(),
            });
            let remaining_tools: &[String] = if tools_included {
                &req.allowed_tools
            } else {
                &[]
            };
            args = print_args(&req.prompt, remaining_tools);
            write_request_record(&turn_dir, &args, &req.prompt, true).await;
            outcome = match self.spawn(req, &args).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.finalize(req, abort, StatePatch {
                        fallback_events,
                        ..StatePatch::terminal(
                            SessionStatus::Failed,
                            Some(format!("Worker could not be spawned: {err}")),
                        )
                    })
                    .await;
                    return;
                }
            };
        }

        // Audit source of truth: raw bytes, protected only by filesystem
        // permissions on the data directory.
        if let Err(err) = fs::write(turn_dir.join("stdout.log"), &outcome.stdout).await {
            warn!(session_id = %req.session_id, error = %err, "stdout.log write failed");
        }
        if let Err(err) = fs::write(turn_dir.join("stderr.log"), &outcome.stderr).await {
            warn!(session_id = %req.session_id, error = %err, "stderr.log write failed");
        }

        let (turns_completed, cost_usd) = match parse_cli_output(&outcome.stdout) {
            Some((value, turns, cost)) => {
                if let Ok(pretty) = serde_json::to_vec_pretty(&value) {
                    let _ = fs::write(turn_dir.join("cli_output.json"), pretty).await;
                }
                (turns, cost)
            }
            None => (1, None),
        };

        let raw_output = format!(
            "{}{}{}",
            String::from_utf8_lossy(&outcome.stdout),
            STDOUT_STDERR_MARKER,
            String::from_utf8_lossy(&outcome.stderr),
        );
        let redacted_output = redact(&raw_output);
        let blockers = blockers::extract_blockers(&redacted_output);

        self.emit_progress(req, abort, turns_completed, &blockers).await;

        // Workspace side-effects run before the deliverables are dropped so
        // the change listing reflects the worker's edits only.
        let (mut files_changed, diff) = tokio::join!(
            afw_git::changed_files(&req.workspace),
            afw_git::diff_against_head(&req.workspace),
        );
        files_changed.retain(|path| !path.starts_with(".agent-firewall/"));

        let status = final_status(&outcome);
        let error_summary = final_error_summary(&outcome);

        let patch_text = match diff {
            None => "(unavailable)\n".to_string(),
            Some(text) if text.trim().is_empty() => "(no changes)\n".to_string(),
            Some(text) => text,
        };
        let summary_text = render_summary(req, status, turns_completed, cost_usd, &blockers, &fallback_events);
        let test_report = render_test_report(&redacted_output);

        let artifact_index = write_deliverables(
            &out_dir,
            &artifacts_dir,
            &patch_text,
            &summary_text,
            test_report.as_deref(),
        )
        .await;

        self.finalize(req, abort, StatePatch {
            status: Some(status),
            turns_completed: Some(turns_completed),
            blockers: Some(blockers),
            files_changed: Some(files_changed),
            artifacts: Some(artifact_index),
            fallback_events,
            cost_usd,
            error_summary,
            progress: Vec::new(),
        })
        .await;
    }

    async fn spawn(&self, req: &RunRequest, args: &[String]) -> std::io::Result<WorkerOutcome> {
        run_worker(
            &self.worker_bin,
            args,
            &req.workspace,
            &req.session_id,
            req.timeout,
        )
        .await
    }

    async fn emit_progress(
        &self,
        req: &RunRequest,
        abort: &AbortSignal,
        turns_completed: u32,
        blockers: &[Blocker],
    ) {
        if abort.is_aborted() {
            return;
        }
        let patch = StatePatch {
            turns_completed: Some(turns_completed),
            blockers: Some(blockers.to_vec()),
            progress: vec![format!(
                "worker finished turn {turns_completed} with {} blocker(s)",
                blockers.len()
            )],
            ..StatePatch::default()
        };
        if let Err(err) = self.store.update_state(&req.session_id, patch).await {
            warn!(session_id = %req.session_id, error = %err, "progress write failed");
        }
    }

    /// Write the terminal patch unless the session was cancelled, in which
    /// case the abort path has already written its own terminal state.
    async fn finalize(&self, req: &RunRequest, abort: &AbortSignal, patch: StatePatch) {
        if abort.is_aborted() {
            info!(session_id = %req.session_id, "cancelled, skipping finalization");
            return;
        }
        match self.store.update_state(&req.session_id, patch).await {
            Ok(state) => {
                info!(session_id = %req.session_id, status = %state.status, "session finalized");
            }
            Err(err) => {
                warn!(session_id = %req.session_id, error = %err, "terminal state write failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Argument vectors
// ---------------------------------------------------------------------------

fn primary_args(prompt: &str, allowed_tools: &[String]) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ];
    if !allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools.join(","));
    }
    args
}

fn print_args(prompt: &str, allowed_tools: &[String]) -> Vec<String> {
    let mut args = vec!["--print".to_string(), prompt.to_string()];
    if !allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools.join(","));
    }
    args
}

/// The argument record keeps flag structure but elides the prompt text.
async fn write_request_record(turn_dir: &Path, args: &[String], prompt: &str, is_fallback: bool) {
    let display: Vec<String> = args
        .iter()
        .map(|a| {
            if a == prompt {
                "<prompt>".to_string()
            } else {
                a.clone()
            }
        })
        .collect();
    let record = serde_json::json!({
        "args": display,
        "is_fallback": is_fallback,
    });
    if let Ok(bytes) = serde_json::to_vec_pretty(&record) {
        let _ = fs::write(turn_dir.join("request.json"), bytes).await;
    }
}

// ---------------------------------------------------------------------------
// Outcome inspection
// ---------------------------------------------------------------------------

fn stderr_text(outcome: &WorkerOutcome) -> String {
    String::from_utf8_lossy(&outcome.stderr).into_owned()
}

fn rejected_flag(outcome: &WorkerOutcome) -> bool {
    !outcome.timed_out
        && outcome.exit_code != Some(0)
        && UNKNOWN_FLAG.is_match(&stderr_text(outcome))
}

/// First non-empty stderr line, bounded, for the fallback record.
fn stderr_evidence(outcome: &WorkerOutcome) -> String {
    let text = stderr_text(outcome);
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("(no stderr)");
    line.chars().take(200).collect()
}

fn final_status(outcome: &WorkerOutcome) -> SessionStatus {
    if outcome.timed_out {
        SessionStatus::Failed
    } else if outcome.exit_code == Some(0) {
        SessionStatus::Done
    } else {
        SessionStatus::Failed
    }
}

fn final_error_summary(outcome: &WorkerOutcome) -> Option<String> {
    if outcome.timed_out {
        Some("Worker timed out".to_string())
    } else {
        match outcome.exit_code {
            Some(0) => None,
            Some(code) => Some(format!("Worker exited with code {code}")),
            None => Some("Worker was terminated by a signal".to_string()),
        }
    }
}

/// Parse stdout as a structured CLI result. Returns the parsed document,
/// the reported turn count (default 1), and the reported cost if any.
fn parse_cli_output(stdout: &[u8]) -> Option<(serde_json::Value, u32, Option<f64>)> {
    let value: serde_json::Value = serde_json::from_slice(stdout).ok()?;
    if !value.is_object() {
        return None;
    }
    let turns = value
        .get("turn_count")
        .and_then(serde_json::Value::as_u64)
        .or_else(|| value.get("turns_completed").and_then(serde_json::Value::as_u64))
        .unwrap_or(1) as u32;
    let cost = value
        .get("cost_usd")
        .and_then(serde_json::Value::as_f64)
        .or_else(|| {
            value
                .get("usage")
                .and_then(|u| u.get("cost"))
                .and_then(serde_json::Value::as_f64)
        });
    Some((value, turns, cost))
}

// ---------------------------------------------------------------------------
// Deliverables
// ---------------------------------------------------------------------------

fn render_summary(
    req: &RunRequest,
    status: SessionStatus,
    turns: u32,
    cost: Option<f64>,
    blockers: &[Blocker],
    fallbacks: &[FallbackEvent],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Session {}\n\n", req.session_id));
    out.push_str(&format!("- Goal: {}\n", req.goal));
    out.push_str(&format!("- Status: {status}\n"));
    out.push_str(&format!("- Turns completed: {turns}\n"));
    match cost {
        Some(cost) => out.push_str(&format!("- Cost (USD): {cost}\n")),
        None => out.push_str("- Cost (USD): unknown\n"),
    }

    out.push_str("\n## Blockers\n\n");
    if blockers.is_empty() {
        out.push_str("None.\n");
    } else {
        for blocker in blockers {
            out.push_str(&format!(
                "- `{}:{}` {}\n",
                blocker.file, blocker.line_range, blocker.description
            ));
        }
    }

    if !fallbacks.is_empty() {
        out.push_str("\n## Fallback events\n\n");
        for event in fallbacks {
            out.push_str(&format!(
                "- `{}`: {} ({})\n",
                event.attempted_flag, event.fallback_action, event.reason
            ));
        }
    }
    out
}

/// First [`TEST_REPORT_MAX_LINES`] output lines carrying test markers, or
/// `None` when the output has none.
fn render_test_report(output: &str) -> Option<String> {
    let lines: Vec<&str> = output
        .lines()
        .filter(|line| TEST_MARKERS.is_match(line))
        .take(TEST_REPORT_MAX_LINES)
        .collect();
    if lines.is_empty() {
        return None;
    }
    let mut report = String::from("# Test output\n\n```\n");
    for line in &lines {
        report.push_str(line);
        report.push('\n');
    }
    report.push_str("```\n");
    Some(report)
}

/// Write the output set to `out/`, mirror it into the workspace artifacts
/// directory, and return the final artifact index (including
/// `artifacts.json` itself).
async fn write_deliverables(
    out_dir: &Path,
    artifacts_dir: &Path,
    patch_text: &str,
    summary_text: &str,
    test_report: Option<&str>,
) -> Vec<ArtifactEntry> {
    let mut deliverables: Vec<(&str, &str)> =
        vec![("patch.diff", patch_text), ("summary.md", summary_text)];
    if let Some(report) = test_report {
        deliverables.push(("test_report.md", report));
    }

    for (name, contents) in &deliverables {
        if let Err(err) = fs::write(out_dir.join(name), contents).await {
            warn!(name = %name, error = %err, "deliverable write failed");
        }
        let _ = fs::write(artifacts_dir.join(name), contents).await;
    }

    let mut index = artifacts::index_artifacts(artifacts_dir).await;

    let index_bytes = serde_json::to_vec_pretty(&index).unwrap_or_else(|_| b"[]".to_vec());
    let _ = fs::write(out_dir.join("artifacts.json"), &index_bytes).await;
    let manifest_path = artifacts_dir.join("artifacts.json");
    if fs::write(&manifest_path, &index_bytes).await.is_ok() {
        if let Some(entry) =
            artifacts::index_one(&manifest_path, index_bytes.len() as u64).await
        {
            index.push(entry);
        }
        index.sort_by(|a, b| a.name.cmp(&b.name));
    }
    index
}
