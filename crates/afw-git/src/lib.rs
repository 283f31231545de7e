// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-git
//!
//! Git subprocess helpers for workspace change detection. Every query is
//! best-effort: missing git, absent repository metadata, or a missing HEAD
//! yields an empty result rather than an error, so a non-repo workspace
//! degrades to "no changes observed".

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Per-query wall-clock budget.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

async fn run_git(workspace: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let out = match tokio::time::timeout(QUERY_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(err)) => {
            debug!(?args, error = %err, "git query failed to run");
            return None;
        }
        Err(_) => {
            debug!(?args, "git query timed out");
            return None;
        }
    };

    if !out.status.success() {
        debug!(?args, code = ?out.status.code(), "git query exited non-zero");
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).into_owned())
}

fn lines_of(output: Option<String>) -> Vec<String> {
    output
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Workspace-relative paths changed since HEAD: tracked files with
/// modifications, plus untracked files that are not ignored.
///
/// The two underlying queries run concurrently; any failure contributes an
/// empty half. Order is tracked-then-untracked, first occurrence wins.
pub async fn changed_files(workspace: &Path) -> Vec<String> {
    let (tracked, untracked) = tokio::join!(
        run_git(workspace, &["diff", "--name-only", "HEAD"]),
        run_git(workspace, &["ls-files", "--others", "--exclude-standard"]),
    );

    let mut out = lines_of(tracked);
    for path in lines_of(untracked) {
        if !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

/// Unified diff of the workspace against HEAD, or `None` when the query
/// cannot run (non-repo, no HEAD, git missing).
pub async fn diff_against_head(workspace: &Path) -> Option<String> {
    run_git(workspace, &["diff", "HEAD", "--no-color"]).await
}
