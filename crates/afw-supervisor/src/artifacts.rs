// SPDX-License-Identifier: MIT OR Apache-2.0
//! Indexing of the workspace artifacts directory.

use afw_core::ArtifactEntry;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Index the artifacts directory, non-recursively.
///
/// Each regular, non-symlink file yields an entry with byte size and the
/// SHA-256 hex of its contents. Subdirectories and symlinks are skipped; a
/// missing directory yields an empty list. Entries are sorted by name.
pub async fn index_artifacts(dir: &Path) -> Vec<ArtifactEntry> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "artifact listing interrupted");
                break;
            }
        };
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path).await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        match index_one(&path, meta.len()).await {
            Some(artifact) => out.push(artifact),
            None => continue,
        }
    }

    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Index a single file that is already known to be regular.
pub async fn index_one(path: &Path, bytes: u64) -> Option<ArtifactEntry> {
    let name = path.file_name()?.to_str()?.to_string();
    let contents = fs::read(path).await.ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Some(ArtifactEntry {
        name,
        path: path.display().to_string(),
        bytes,
        sha256: format!("{:x}", hasher.finalize()),
    })
}
