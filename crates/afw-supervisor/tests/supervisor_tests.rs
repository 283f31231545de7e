// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end supervisor runs against fake worker scripts.
#![cfg(unix)]

use afw_core::{SessionStatus, StatePatch, TaskSpec};
use afw_gate::Gate;
use afw_store::{ARTIFACTS_SUBDIR, SessionStore};
use afw_supervisor::{AbortSignal, RunRequest, Supervisor};
use chrono::Utc;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    _tmp: tempfile::TempDir,
    workspace: PathBuf,
    store: Arc<SessionStore>,
    gate: Arc<Gate>,
}

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let workspace = tmp.path().join("wk");
    std::fs::create_dir_all(&workspace).unwrap();
    let store = Arc::new(SessionStore::new(tmp.path().join("sessions")));
    store.init().await.unwrap();
    Fixture {
        workspace,
        store,
        gate: Arc::new(Gate::new()),
        _tmp: tmp,
    }
}

fn write_script(dir: &Path, body: &str) -> String {
    let path = dir.join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_str().unwrap().to_string()
}

async fn create_session(fx: &Fixture, id: &str, allowed_tools: Vec<String>) -> RunRequest {
    let task = TaskSpec {
        goal: "echo hello".into(),
        workspace_root: fx.workspace.clone(),
        allowed_tools: allowed_tools.clone(),
        turns_max: 20,
        timeout_seconds: 600,
        created_at: Utc::now(),
        template_digest: "deadbeefdeadbeef".into(),
        extra: BTreeMap::new(),
    };
    fx.store.create(id, &task).await.unwrap();
    assert!(fx.gate.acquire(&fx.workspace, id));
    RunRequest {
        session_id: id.into(),
        goal: task.goal.clone(),
        prompt: "Do the thing.".into(),
        workspace: fx.workspace.clone(),
        allowed_tools,
        timeout: Duration::from_secs(20),
    }
}

#[tokio::test]
async fn happy_path_produces_done_state_and_deliverables() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"printf '{"turn_count": 2, "cost_usd": 0.42}'"#,
    );
    let req = create_session(&fx, "happy", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);

    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("happy").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Done);
    assert_eq!(state.turns_completed, 2);
    assert_eq!(state.cost_usd, Some(0.42));
    assert!(state.error_summary.is_none());
    assert!(state.fallback_events.is_empty());

    let names: Vec<&str> = state.artifacts.iter().map(|a| a.name.as_str()).collect();
    assert!(names.contains(&"patch.diff"), "{names:?}");
    assert!(names.contains(&"summary.md"), "{names:?}");
    assert!(names.contains(&"artifacts.json"), "{names:?}");

    // Deliverables exist in both out/ and the workspace artifacts dir.
    let session_dir = fx.store.session_dir("happy");
    assert!(session_dir.join("out/patch.diff").exists());
    assert!(session_dir.join("out/summary.md").exists());
    assert!(session_dir.join("out/artifacts.json").exists());
    assert!(fx.workspace.join(ARTIFACTS_SUBDIR).join("summary.md").exists());

    // Structured output captured alongside the raw logs.
    assert!(session_dir.join("turns/0001/cli_output.json").exists());
    assert!(session_dir.join("turns/0001/stdout.log").exists());
    assert!(session_dir.join("turns/0001/stderr.log").exists());

    // Gate released after the worker exited.
    assert_eq!(fx.gate.active_session_id(), None);
}

#[tokio::test]
async fn worker_artifacts_are_indexed_with_hashes() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"mkdir -p .agent-firewall/artifacts
printf 'report body' > .agent-firewall/artifacts/report.txt
printf '{"turn_count": 1}'"#,
    );
    let req = create_session(&fx, "arts", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("arts").await.unwrap().unwrap();
    let report = state
        .artifacts
        .iter()
        .find(|a| a.name == "report.txt")
        .expect("worker artifact indexed");
    assert_eq!(report.bytes, 11);
    assert_eq!(report.sha256.len(), 64);
}

#[tokio::test]
async fn audit_log_keeps_secret_while_blockers_come_from_redacted_text() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"echo 'Found key sk-ant-abc123def456ghi789 in src/config.rs:12'
exit 0"#,
    );
    let req = create_session(&fx, "secrets", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    // Unredacted audit trail on disk.
    let raw = std::fs::read_to_string(
        fx.store.session_dir("secrets").join("turns/0001/stdout.log"),
    )
    .unwrap();
    assert!(raw.contains("sk-ant-abc123def456ghi789"));

    // Everything derived for callers is scrubbed.
    let state = fx.store.get_state("secrets").await.unwrap().unwrap();
    assert_eq!(state.blockers.len(), 1);
    assert_eq!(state.blockers[0].file, "src/config.rs");
    assert!(state.blockers[0].description.contains("sk-ant-***REDACTED***"));
    assert!(!state.blockers[0].description.contains("abc123def456ghi789"));
}

#[tokio::test]
async fn allowed_tools_fallback_retries_without_flag() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"case "$@" in
  *--allowedTools*)
    echo "error: unknown option '--allowedTools'" >&2
    exit 1
    ;;
esac
printf '{"turn_count": 1}'"#,
    );
    let req = create_session(&fx, "fb1", vec!["Read".into(), "Write".into()]).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("fb1").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Done);
    assert_eq!(state.fallback_events.len(), 1);
    assert_eq!(state.fallback_events[0].attempted_flag, "--allowedTools");
    assert!(
        state.fallback_events[0]
            .fallback_action
            .contains("without --allowedTools")
    );

    let request: serde_json::Value = serde_json::from_slice(
        &std::fs::read(fx.store.session_dir("fb1").join("turns/0001/request.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(request["is_fallback"], serde_json::json!(true));
    let args = request["args"].as_array().unwrap();
    assert!(!args.iter().any(|a| a == "--allowedTools"));
    // The prompt text is elided from the audit record.
    assert!(args.iter().any(|a| a == "<prompt>"));
}

#[tokio::test]
async fn output_format_fallback_switches_to_print() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"case "$@" in
  *--output-format*)
    echo "unrecognized flag: --output-format" >&2
    exit 1
    ;;
esac
echo "plain text result""#,
    );
    let req = create_session(&fx, "fb2", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("fb2").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Done);
    assert_eq!(state.fallback_events.len(), 1);
    assert_eq!(state.fallback_events[0].attempted_flag, "--output-format");
    // Without structured output the turn count defaults to 1.
    assert_eq!(state.turns_completed, 1);
}

#[tokio::test]
async fn both_flags_rejected_takes_both_fallbacks() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"case "$@" in
  *--allowedTools*)
    echo "error: unknown option '--allowedTools'" >&2
    exit 1
    ;;
  *--output-format*)
    echo "error: unknown option '--output-format'" >&2
    exit 1
    ;;
esac
echo done"#,
    );
    let req = create_session(&fx, "fb3", vec!["Read".into()]).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("fb3").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Done);
    let flags: Vec<&str> = state
        .fallback_events
        .iter()
        .map(|e| e.attempted_flag.as_str())
        .collect();
    assert_eq!(flags, vec!["--allowedTools", "--output-format"]);
}

#[tokio::test]
async fn timeout_marks_session_failed() {
    let fx = fixture().await;
    let script = write_script(fx.workspace.as_path(), "sleep 60");
    let mut req = create_session(&fx, "slow", Vec::new()).await;
    req.timeout = Duration::from_millis(300);
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("slow").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(state.error_summary.as_deref(), Some("Worker timed out"));
    assert_eq!(fx.gate.active_session_id(), None);
}

#[tokio::test]
async fn nonzero_exit_marks_session_failed_with_code() {
    let fx = fixture().await;
    let script = write_script(fx.workspace.as_path(), "echo boom >&2; exit 7");
    let req = create_session(&fx, "boom", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("boom").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(
        state.error_summary.as_deref(),
        Some("Worker exited with code 7")
    );
}

#[tokio::test]
async fn missing_worker_binary_fails_cleanly() {
    let fx = fixture().await;
    let req = create_session(&fx, "nobin", Vec::new()).await;
    let supervisor = Supervisor::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.gate),
        "afw-no-such-worker-binary",
    );
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("nobin").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Failed);
    assert!(
        state
            .error_summary
            .as_deref()
            .unwrap()
            .contains("could not be spawned")
    );
    assert_eq!(fx.gate.active_session_id(), None);
}

#[tokio::test]
async fn cancellation_preserves_abort_state_and_releases_gate_on_exit() {
    let fx = fixture().await;
    let script = write_script(fx.workspace.as_path(), "sleep 1");
    let req = create_session(&fx, "cancelme", Vec::new()).await;
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&fx.store),
        Arc::clone(&fx.gate),
        script,
    ));

    let signal = AbortSignal::new();
    let run_signal = signal.clone();
    let run_supervisor = Arc::clone(&supervisor);
    let handle = tokio::spawn(async move {
        run_supervisor.run(req, run_signal).await;
    });

    // The abort path: flip the signal, write the terminal state immediately.
    tokio::time::sleep(Duration::from_millis(100)).await;
    signal.abort();
    fx.store
        .update_state(
            "cancelme",
            StatePatch::terminal(
                SessionStatus::Aborted,
                Some("Aborted by client request".into()),
            ),
        )
        .await
        .unwrap();

    // Gate is still held until the worker actually exits.
    assert_eq!(fx.gate.active_session_id().as_deref(), Some("cancelme"));

    handle.await.unwrap();

    let state = fx.store.get_state("cancelme").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Aborted);
    assert_eq!(
        state.error_summary.as_deref(),
        Some("Aborted by client request")
    );
    assert_eq!(fx.gate.active_session_id(), None);
}

#[tokio::test]
async fn test_markers_produce_report() {
    let fx = fixture().await;
    let script = write_script(
        fx.workspace.as_path(),
        r#"echo "Tests: 3 passed"
echo "PASS src/lib.rs"
exit 0"#,
    );
    let req = create_session(&fx, "testy", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let report = std::fs::read_to_string(
        fx.store.session_dir("testy").join("out/test_report.md"),
    )
    .unwrap();
    assert!(report.contains("Tests: 3 passed"));
    assert!(report.contains("PASS src/lib.rs"));

    let state = fx.store.get_state("testy").await.unwrap().unwrap();
    assert!(state.artifacts.iter().any(|a| a.name == "test_report.md"));
}

#[tokio::test]
async fn files_changed_reflect_worker_edits() {
    let fx = fixture().await;
    // Initialize a git repo with a baseline commit inside the workspace.
    for args in [
        vec!["init", "-q"],
        vec!["add", "-A"],
        vec![
            "-c",
            "user.name=afw",
            "-c",
            "user.email=afw@local",
            "commit",
            "-qm",
            "baseline",
            "--allow-empty",
        ],
    ] {
        let status = std::process::Command::new("git")
            .args(&args)
            .current_dir(&fx.workspace)
            .status()
            .unwrap();
        assert!(status.success());
    }

    let script = write_script(fx.workspace.as_path(), "echo edit > edited.txt\nexit 0");
    let req = create_session(&fx, "editor", Vec::new()).await;
    let supervisor = Supervisor::new(Arc::clone(&fx.store), Arc::clone(&fx.gate), script);
    supervisor.run(req, AbortSignal::new()).await;

    let state = fx.store.get_state("editor").await.unwrap().unwrap();
    assert!(
        state.files_changed.contains(&"edited.txt".to_string()),
        "{:?}",
        state.files_changed
    );
    // Gateway-internal bookkeeping is not reported as workspace changes.
    assert!(
        state
            .files_changed
            .iter()
            .all(|p| !p.starts_with(".agent-firewall/"))
    );
}
