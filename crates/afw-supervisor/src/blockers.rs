// SPDX-License-Identifier: MIT OR Apache-2.0
//! Extraction of `file:line[-line]` references from worker output.

use afw_core::Blocker;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Most blockers a single extraction returns.
pub const MAX_BLOCKERS: usize = 10;

// A file reference needs an extension; bare `12:30` timestamps and similar
// digit pairs must not match.
static FILE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z0-9_\-./]+\.[A-Za-z][A-Za-z0-9]{0,9}):([0-9]+)(?:-([0-9]+))?")
        .expect("file:line pattern")
});

/// Scan `text` for `file.ext:NN` / `file.ext:NN-MM` references.
///
/// Each unique `file:range` yields one blocker whose description is the full
/// containing line. Output order is first-occurrence order, capped at
/// [`MAX_BLOCKERS`].
pub fn extract_blockers(text: &str) -> Vec<Blocker> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for line in text.lines() {
        for caps in FILE_LINE.captures_iter(line) {
            let file = caps[1].to_string();
            let line_range = match caps.get(3) {
                Some(end) => format!("{}-{}", &caps[2], end.as_str()),
                None => caps[2].to_string(),
            };
            let key = format!("{file}:{line_range}");
            if !seen.insert(key) {
                continue;
            }
            out.push(Blocker {
                description: line.trim().to_string(),
                file,
                line_range,
            });
            if out.len() == MAX_BLOCKERS {
                return out;
            }
        }
    }
    out
}
