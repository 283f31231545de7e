// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-store
//!
//! Filesystem-backed session persistence. Each session is a directory under
//! the data root holding `task.json` (immutable), `shared_state.json`
//! (replaced atomically on every update), per-turn audit logs under
//! `turns/NNNN/`, and deliverables under `out/`.
//!
//! The store is the only component that mutates session records. Writes for
//! the same session id are serialized through an in-memory per-id mutex;
//! different sessions' writes may interleave freely. State replacement is
//! temp-file-plus-rename in the session directory, so readers never observe
//! a partial JSON document.

use afw_core::{
    SessionStatus, SessionSummary, SharedState, StatePatch, TaskSpec, is_valid_session_id,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tracing::warn;

/// File name of the immutable task record.
pub const TASK_FILE: &str = "task.json";

/// File name of the live state record.
pub const STATE_FILE: &str = "shared_state.json";

/// Workspace-relative directory the worker drops artifacts into.
pub const ARTIFACTS_SUBDIR: &str = ".agent-firewall/artifacts";

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The id does not match `^[A-Za-z0-9_-]{1,128}$`.
    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    /// `create` found an existing `task.json` for the id.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// A mutation referenced a session with no record on disk.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Underlying filesystem failure.
    #[error("session store I/O: {0}")]
    Io(#[from] io::Error),

    /// A record exists but does not parse.
    #[error("corrupt session record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Filesystem-backed session store rooted at a data directory.
#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionStore {
    /// Create a store rooted at `root`. The directory is created lazily by
    /// [`SessionStore::init`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the data root exists.
    pub async fn init(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// The data root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a session's directory. The id is not validated here;
    /// callers outside this crate should prefer the typed operations.
    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.locks.lock().expect("store lock map poisoned");
        Arc::clone(
            map.entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    // -----------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------

    /// Create the session directory and write both `task.json` and the
    /// initial `shared_state.json` (status `running`, sequences empty).
    pub async fn create(&self, id: &str, task: &TaskSpec) -> Result<(), StoreError> {
        if !is_valid_session_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let dir = self.session_dir(id);
        if fs::try_exists(dir.join(TASK_FILE)).await? {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        fs::create_dir_all(&dir).await?;

        write_json_atomic(&dir, TASK_FILE, task).await?;
        let state = SharedState::initial(id, task);
        write_json_atomic(&dir, STATE_FILE, &state).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// The task record, or `None` when the session does not exist.
    pub async fn get_task(&self, id: &str) -> Result<Option<TaskSpec>, StoreError> {
        if !is_valid_session_id(id) {
            return Ok(None);
        }
        read_json_opt(&self.session_dir(id).join(TASK_FILE)).await
    }

    /// The live state, or `None` when the session does not exist.
    pub async fn get_state(&self, id: &str) -> Result<Option<SharedState>, StoreError> {
        if !is_valid_session_id(id) {
            return Ok(None);
        }
        read_json_opt(&self.session_dir(id).join(STATE_FILE)).await
    }

    // -----------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------

    /// Read-merge-write the state record for `id`.
    ///
    /// `session_id` and `goal` cannot be patched; `updated_at` is bumped on
    /// every applied write. When the stored status is already terminal the
    /// patch is discarded and the stored state is returned unchanged.
    pub async fn update_state(
        &self,
        id: &str,
        patch: StatePatch,
    ) -> Result<SharedState, StoreError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let path = self.session_dir(id).join(STATE_FILE);
        let mut state: SharedState = read_json_opt(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if state.apply(patch) {
            write_json_atomic(&self.session_dir(id), STATE_FILE, &state).await?;
        }
        Ok(state)
    }

    // -----------------------------------------------------------------
    // Listing and recovery
    // -----------------------------------------------------------------

    /// Summaries for every directory that has a valid id and both record
    /// files. Malformed entries are skipped, not errored.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(summaries),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !is_valid_session_id(&id) {
                continue;
            }
            let dir = entry.path();
            let task: TaskSpec = match read_json_opt(&dir.join(TASK_FILE)).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(err) => {
                    warn!(session_id = %id, error = %err, "skipping unreadable task record");
                    continue;
                }
            };
            let state: SharedState = match read_json_opt(&dir.join(STATE_FILE)).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    warn!(session_id = %id, error = %err, "skipping unreadable state record");
                    continue;
                }
            };
            summaries.push(SessionSummary {
                id,
                status: state.status,
                goal: state.goal,
                created_at: task.created_at,
                updated_at: state.updated_at,
            });
        }

        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(summaries)
    }

    /// Transition every session still marked `running` to `aborted`.
    ///
    /// Runs once, before the HTTP listener binds, so a crash plus restart
    /// cannot leave sessions "running" forever. Returns how many sessions
    /// were recovered.
    pub async fn mark_aborted_on_startup(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for summary in self.list_sessions().await? {
            if summary.status != SessionStatus::Running {
                continue;
            }
            let patch = StatePatch::terminal(
                SessionStatus::Aborted,
                Some("Server restarted while session was running".to_string()),
            );
            match self.update_state(&summary.id, patch).await {
                Ok(_) => recovered += 1,
                Err(err) => {
                    warn!(session_id = %summary.id, error = %err, "startup recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------

    /// Resolve an artifact by name inside the session workspace's artifacts
    /// directory.
    ///
    /// Returns the canonical path iff `name` is a bare basename (no
    /// separators, no dot-segments) and resolves to a regular, non-symlink
    /// file under the artifacts directory. `None` otherwise.
    pub async fn artifact_path(
        &self,
        id: &str,
        name: &str,
        workspace: Option<&Path>,
    ) -> Result<Option<PathBuf>, StoreError> {
        if !is_artifact_name_safe(name) {
            return Ok(None);
        }

        let workspace = match workspace {
            Some(w) => w.to_path_buf(),
            None => match self.get_task(id).await? {
                Some(task) => task.workspace_root,
                None => return Ok(None),
            },
        };

        let artifacts_dir = workspace.join(ARTIFACTS_SUBDIR);
        let canonical_dir = match fs::canonicalize(&artifacts_dir).await {
            Ok(dir) => dir,
            Err(_) => return Ok(None),
        };

        let candidate = canonical_dir.join(name);
        let meta = match fs::symlink_metadata(&candidate).await {
            Ok(meta) => meta,
            Err(_) => return Ok(None),
        };
        if !meta.is_file() {
            return Ok(None);
        }

        let canonical = match fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(_) => return Ok(None),
        };
        if !canonical.starts_with(&canonical_dir) {
            return Ok(None);
        }
        Ok(Some(canonical))
    }
}

/// `true` iff `name` is exactly its own basename.
fn is_artifact_name_safe(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    if name.contains('/') || name.contains('\\') || name.bytes().any(|b| b == 0) {
        return false;
    }
    Path::new(name).file_name().map(|f| f == name).unwrap_or(false)
}

async fn read_json_opt<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Write `value` to `dir/name` via a same-directory temp file and rename.
async fn write_json_atomic<T: serde::Serialize>(
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = dir.join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, &bytes).await?;
    match fs::rename(&tmp, dir.join(name)).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&tmp).await;
            Err(err.into())
        }
    }
}
