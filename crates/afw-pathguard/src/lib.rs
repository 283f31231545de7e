// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-pathguard
//!
//! Resolves candidate paths and validates them against a set of context
//! roots and deny globs. Canonicalization goes through symlinks; for paths
//! that do not exist yet, the nearest existing ancestor is canonicalized and
//! the unresolved suffix is rejoined, so a not-yet-created file can be
//! validated while symlink escape through any existing prefix is still
//! caught.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io;
use std::path::{Component, Path, PathBuf};

/// Errors raised while compiling guard inputs.
#[derive(Debug, thiserror::Error)]
pub enum PathGuardError {
    /// A deny pattern failed to compile.
    #[error("invalid deny glob {pattern:?}: {source}")]
    InvalidGlob {
        /// The offending pattern.
        pattern: String,
        /// Compiler detail.
        source: globset::Error,
    },

    /// A context root could not be canonicalized.
    #[error("unusable context root {root:?}")]
    UnusableRoot {
        /// The offending root.
        root: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

// ---------------------------------------------------------------------------
// Deny globs
// ---------------------------------------------------------------------------

/// A compiled, reusable set of deny patterns.
///
/// Patterns follow conventional `**` / `*` / `?` semantics and are matched
/// against the target's path relative to its context root, with separators
/// normalized to forward slashes. Dot-files are not special-cased.
#[derive(Clone, Debug, Default)]
pub struct DenyGlobs {
    set: Option<GlobSet>,
    patterns: Vec<String>,
}

impl DenyGlobs {
    /// Compile a pattern list. An empty list means "deny nothing".
    pub fn compile(patterns: &[String]) -> Result<Self, PathGuardError> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern).map_err(|source| PathGuardError::InvalidGlob {
                pattern: pattern.clone(),
                source,
            })?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|source| PathGuardError::InvalidGlob {
                pattern: patterns.join(","),
                source,
            })?;
        Ok(Self {
            set: Some(set),
            patterns: patterns.to_vec(),
        })
    }

    /// The first pattern matching `relative`, if any.
    pub fn first_match(&self, relative: &str) -> Option<&str> {
        let set = self.set.as_ref()?;
        set.matches(relative)
            .first()
            .map(|&idx| self.patterns[idx].as_str())
    }
}

// ---------------------------------------------------------------------------
// Canonicalization
// ---------------------------------------------------------------------------

/// Canonicalize `path`, tolerating a not-yet-existing tail.
///
/// The path is made absolute, lexically normalized (`.` and `..` segments
/// resolved), then canonicalized through symlinks. If the full path does not
/// exist, the walk retreats toward the root until an existing ancestor is
/// found, canonicalizes that ancestor, and rejoins the unresolved suffix.
pub fn canonicalize_lenient(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.clone();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(&existing) {
            Ok(base) => {
                let mut resolved = base;
                for part in suffix.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Err(err);
                };
                let Some(parent) = existing.parent().map(Path::to_path_buf) else {
                    return Err(err);
                };
                suffix.push(name);
                existing = parent;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Outcome of validating a candidate path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathDecision {
    /// The path is inside a context root and matches no deny glob.
    Allowed {
        /// Canonical form of the candidate.
        resolved: PathBuf,
    },
    /// The path was rejected.
    Denied {
        /// Human-readable reason.
        reason: String,
    },
}

impl PathDecision {
    /// Returns `true` for [`PathDecision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The canonical path when allowed.
    pub fn resolved(&self) -> Option<&Path> {
        match self {
            Self::Allowed { resolved } => Some(resolved),
            Self::Denied { .. } => None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }
}

/// Validates candidate paths against context roots and deny globs.
#[derive(Clone, Debug)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
    deny: DenyGlobs,
}

impl PathGuard {
    /// Build a guard over `roots`, canonicalizing each root identically to
    /// candidate resolution.
    pub fn new(roots: &[PathBuf], deny: DenyGlobs) -> Result<Self, PathGuardError> {
        let mut canonical = Vec::with_capacity(roots.len());
        for root in roots {
            let resolved =
                canonicalize_lenient(root).map_err(|source| PathGuardError::UnusableRoot {
                    root: root.clone(),
                    source,
                })?;
            canonical.push(resolved);
        }
        Ok(Self {
            roots: canonical,
            deny,
        })
    }

    /// The canonical context roots.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Validate a raw candidate path.
    pub fn validate(&self, candidate: &str) -> PathDecision {
        if candidate.is_empty() {
            return PathDecision::denied("empty path");
        }
        if candidate.bytes().any(|b| b == 0) {
            return PathDecision::denied("path contains a NUL byte");
        }

        let resolved = match canonicalize_lenient(Path::new(candidate)) {
            Ok(p) => p,
            Err(err) => return PathDecision::denied(format!("path cannot be resolved: {err}")),
        };

        // A target is under a root iff it equals the canonical root or sits
        // strictly below it. Component-wise comparison keeps /a/b from
        // claiming /a/bc.
        let Some(root) = self
            .roots
            .iter()
            .find(|root| resolved == **root || resolved.starts_with(root))
        else {
            return PathDecision::denied("path is outside every allowed root");
        };

        let relative = resolved
            .strip_prefix(root)
            .expect("starts_with checked above");
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if let Some(pattern) = self.deny.first_match(&relative) {
            return PathDecision::denied(format!("path matches deny pattern {pattern:?}"));
        }

        PathDecision::Allowed { resolved }
    }
}
