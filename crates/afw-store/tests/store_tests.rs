// SPDX-License-Identifier: MIT OR Apache-2.0
use afw_core::{SessionStatus, StatePatch, TaskSpec};
use afw_store::{ARTIFACTS_SUBDIR, SessionStore, StoreError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;

fn task(workspace: &std::path::Path) -> TaskSpec {
    TaskSpec {
        goal: "echo hello".into(),
        workspace_root: workspace.to_path_buf(),
        allowed_tools: Vec::new(),
        turns_max: 20,
        timeout_seconds: 600,
        created_at: Utc::now(),
        template_digest: "deadbeefdeadbeef".into(),
        extra: BTreeMap::new(),
    }
}

#[tokio::test]
async fn create_then_read_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();

    store.create("s1", &task(tmp.path())).await.unwrap();

    let state = store.get_state("s1").await.unwrap().unwrap();
    assert_eq!(state.session_id, "s1");
    assert_eq!(state.status, SessionStatus::Running);
    assert_eq!(state.turns_completed, 0);

    let stored_task = store.get_task("s1").await.unwrap().unwrap();
    assert_eq!(stored_task.goal, "echo hello");
}

#[tokio::test]
async fn duplicate_create_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();

    store.create("dup", &task(tmp.path())).await.unwrap();
    let err = store.create("dup", &task(tmp.path())).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn invalid_ids_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();

    let long = "x".repeat(129);
    for id in ["", "has/slash", "dot.dot", long.as_str()] {
        let err = store.create(id, &task(tmp.path())).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidId(_)), "{id:?}");
    }

    // Reads treat invalid ids as absent rather than touching the filesystem.
    assert!(store.get_state("../escape").await.unwrap().is_none());
}

#[tokio::test]
async fn absent_session_reads_as_none() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();
    assert!(store.get_state("ghost").await.unwrap().is_none());
    assert!(store.get_task("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn update_merges_and_rejects_unknown_session() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();
    store.create("s1", &task(tmp.path())).await.unwrap();

    let state = store
        .update_state(
            "s1",
            StatePatch {
                turns_completed: Some(1),
                progress: vec!["first turn".into()],
                ..StatePatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(state.turns_completed, 1);
    assert_eq!(state.progress, vec!["first turn".to_string()]);

    let err = store
        .update_state("missing", StatePatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn status_round_trip_laws() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();
    store.create("s1", &task(tmp.path())).await.unwrap();

    assert_eq!(
        store.get_state("s1").await.unwrap().unwrap().status,
        SessionStatus::Running
    );

    store
        .update_state("s1", StatePatch::terminal(SessionStatus::Done, None))
        .await
        .unwrap();
    assert_eq!(
        store.get_state("s1").await.unwrap().unwrap().status,
        SessionStatus::Done
    );
}

#[tokio::test]
async fn terminal_state_is_a_fixpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();
    store.create("s1", &task(tmp.path())).await.unwrap();

    store
        .update_state(
            "s1",
            StatePatch::terminal(SessionStatus::Aborted, Some("Aborted by client request".into())),
        )
        .await
        .unwrap();
    let frozen = store.get_state("s1").await.unwrap().unwrap();

    store
        .update_state(
            "s1",
            StatePatch {
                turns_completed: Some(9),
                progress: vec!["late".into()],
                ..StatePatch::default()
            },
        )
        .await
        .unwrap();

    let after = store.get_state("s1").await.unwrap().unwrap();
    assert_eq!(after.status, SessionStatus::Aborted);
    assert_eq!(after.turns_completed, frozen.turns_completed);
    assert_eq!(after.progress, frozen.progress);
    assert_eq!(after.updated_at, frozen.updated_at);
}

#[tokio::test]
async fn created_at_never_after_updated_at() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();
    store.create("s1", &task(tmp.path())).await.unwrap();
    store
        .update_state(
            "s1",
            StatePatch {
                progress: vec!["tick".into()],
                ..StatePatch::default()
            },
        )
        .await
        .unwrap();

    let list = store.list_sessions().await.unwrap();
    assert_eq!(list.len(), 1);
    assert!(list[0].created_at <= list[0].updated_at);
}

#[tokio::test]
async fn listing_skips_malformed_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("sessions");
    let store = SessionStore::new(&root);
    store.init().await.unwrap();
    store.create("good", &task(tmp.path())).await.unwrap();

    // Directory with a bad id.
    std::fs::create_dir_all(root.join("bad.id")).unwrap();
    // Valid id but missing shared_state.json.
    std::fs::create_dir_all(root.join("half")).unwrap();
    std::fs::write(root.join("half/task.json"), "{}").unwrap();
    // Valid id but corrupt records.
    std::fs::create_dir_all(root.join("corrupt")).unwrap();
    std::fs::write(root.join("corrupt/task.json"), "not json").unwrap();
    std::fs::write(root.join("corrupt/shared_state.json"), "not json").unwrap();

    let list = store.list_sessions().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, "good");
}

#[tokio::test]
async fn startup_recovery_aborts_running_sessions() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();

    store.create("running1", &task(tmp.path())).await.unwrap();
    store.create("running2", &task(tmp.path())).await.unwrap();
    store.create("finished", &task(tmp.path())).await.unwrap();
    store
        .update_state("finished", StatePatch::terminal(SessionStatus::Done, None))
        .await
        .unwrap();

    let recovered = store.mark_aborted_on_startup().await.unwrap();
    assert_eq!(recovered, 2);

    for summary in store.list_sessions().await.unwrap() {
        assert_ne!(summary.status, SessionStatus::Running, "{}", summary.id);
    }
    let state = store.get_state("running1").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Aborted);
    assert_eq!(
        state.error_summary.as_deref(),
        Some("Server restarted while session was running")
    );
    // Terminal sessions keep their state.
    assert_eq!(
        store.get_state("finished").await.unwrap().unwrap().status,
        SessionStatus::Done
    );
}

#[tokio::test]
async fn no_temp_files_left_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SessionStore::new(tmp.path().join("sessions"));
    store.init().await.unwrap();
    store.create("s1", &task(tmp.path())).await.unwrap();
    for i in 0..10 {
        store
            .update_state(
                "s1",
                StatePatch {
                    turns_completed: Some(i),
                    ..StatePatch::default()
                },
            )
            .await
            .unwrap();
    }

    let leftovers: Vec<_> = std::fs::read_dir(store.session_dir("s1"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn concurrent_updates_to_same_session_all_land() {
    let tmp = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(SessionStore::new(tmp.path().join("sessions")));
    store.init().await.unwrap();
    store.create("s1", &task(tmp.path())).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = std::sync::Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .update_state(
                    "s1",
                    StatePatch {
                        progress: vec![format!("note {i}")],
                        ..StatePatch::default()
                    },
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let state = store.get_state("s1").await.unwrap().unwrap();
    assert_eq!(state.progress.len(), 20);
}

mod artifacts {
    use super::*;

    async fn store_with_artifact(name: &str, contents: &[u8]) -> (tempfile::TempDir, SessionStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        store.init().await.unwrap();
        store.create("s1", &task(tmp.path())).await.unwrap();

        let dir = tmp.path().join(ARTIFACTS_SUBDIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), contents).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn resolves_plain_artifact() {
        let (tmp, store) = store_with_artifact("summary.md", b"done").await;
        let path = store
            .artifact_path("s1", "summary.md", Some(tmp.path()))
            .await
            .unwrap()
            .unwrap();
        assert!(path.ends_with("summary.md"));
        assert_eq!(std::fs::read(path).unwrap(), b"done");
    }

    #[tokio::test]
    async fn workspace_defaults_to_task_record() {
        let (_tmp, store) = store_with_artifact("patch.diff", b"--- a\n+++ b\n").await;
        let path = store
            .artifact_path("s1", "patch.diff", None)
            .await
            .unwrap();
        assert!(path.is_some());
    }

    #[tokio::test]
    async fn unsafe_names_rejected() {
        let (tmp, store) = store_with_artifact("real.txt", b"x").await;
        for name in [
            "",
            ".",
            "..",
            "../real.txt",
            "sub/real.txt",
            "..\\real.txt",
            "/etc/passwd",
        ] {
            let got = store
                .artifact_path("s1", name, Some(tmp.path()))
                .await
                .unwrap();
            assert!(got.is_none(), "{name:?} should be rejected");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_artifact_rejected() {
        let (tmp, store) = store_with_artifact("real.txt", b"x").await;
        let dir = tmp.path().join(ARTIFACTS_SUBDIR);
        let outside = tmp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, dir.join("link.txt")).unwrap();

        let got = store
            .artifact_path("s1", "link.txt", Some(tmp.path()))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn missing_artifact_dir_is_none_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        store.init().await.unwrap();
        store.create("s1", &task(tmp.path())).await.unwrap();
        let got = store
            .artifact_path("s1", "anything.md", Some(tmp.path()))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn subdirectory_entry_rejected() {
        let (tmp, store) = store_with_artifact("real.txt", b"x").await;
        let dir = tmp.path().join(ARTIFACTS_SUBDIR);
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        let got = store
            .artifact_path("s1", "nested", Some(tmp.path()))
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
