// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded log-tail reads.
//!
//! The tail of an `n`-line request is computed from a suffix of roughly
//! `n x 512` bytes so large logs never load fully into memory. For
//! unusually long lines the route returns fewer than `n` lines rather than
//! growing the buffer.

use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Suffix budget per requested line.
const BYTES_PER_LINE: u64 = 512;

/// Read up to `n` trailing lines of `path`.
///
/// When the read starts mid-file the first, possibly partial, line is
/// discarded. A missing file yields an empty list.
pub async fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let len = file.metadata().await?.len();
    let budget = (n as u64).saturating_mul(BYTES_PER_LINE);
    let offset = len.saturating_sub(budget);
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }

    let mut buf = Vec::with_capacity(budget.min(len) as usize);
    file.read_to_end(&mut buf).await?;
    let text = String::from_utf8_lossy(&buf);

    let mut lines: Vec<&str> = text.lines().collect();
    if offset > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(n);
    Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
}

/// The `turns/NNNN` directory with the highest index, if any.
pub async fn latest_turn_dir(session_dir: &Path) -> Option<std::path::PathBuf> {
    let mut entries = tokio::fs::read_dir(session_dir.join("turns")).await.ok()?;
    let mut best: Option<(String, std::path::PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if best.as_ref().is_none_or(|(top, _)| name > *top) {
            best = Some((name, entry.path()));
        }
    }
    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_yields_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let lines = tail_lines(&tmp.path().join("absent.log"), 10).await.unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn short_file_returned_whole() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        let lines = tail_lines(&path, 10).await.unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn returns_last_n_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.log");
        let body: String = (0..100).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, body).unwrap();
        let lines = tail_lines(&path, 3).await.unwrap();
        assert_eq!(lines, vec!["line 97", "line 98", "line 99"]);
    }

    #[tokio::test]
    async fn partial_first_line_discarded_on_suffix_read() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.log");
        // Each line is 600 bytes, beyond the per-line budget, so the suffix
        // read starts mid-line.
        let long = "x".repeat(599);
        let body: String = (0..10).map(|i| format!("{long}{i}\n")).collect();
        std::fs::write(&path, body).unwrap();

        let lines = tail_lines(&path, 2).await.unwrap();
        // Fewer than n is acceptable; no partial line may appear.
        assert!(!lines.is_empty() && lines.len() <= 2, "{}", lines.len());
        for line in &lines {
            assert_eq!(line.len(), 600, "partial line leaked: {line:?}");
        }
    }

    #[tokio::test]
    async fn latest_turn_dir_picks_highest_index() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["0001", "0002", "0010"] {
            std::fs::create_dir_all(tmp.path().join("turns").join(name)).unwrap();
        }
        std::fs::create_dir_all(tmp.path().join("turns/junk")).unwrap();
        let best = latest_turn_dir(tmp.path()).await.unwrap();
        assert!(best.ends_with("turns/0010"));
    }

    #[tokio::test]
    async fn no_turns_dir_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(latest_turn_dir(tmp.path()).await.is_none());
    }
}
