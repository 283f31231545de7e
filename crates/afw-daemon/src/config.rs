// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-backed daemon configuration.
//!
//! Loaded once at startup and immutable thereafter. Every knob is a flat
//! `AFW_*` variable; only the bridge token and the allowed roots are
//! required.

use std::path::PathBuf;

/// Default deny patterns applied to every guarded path.
pub const DEFAULT_DENY_GLOBS: &[&str] = &[
    "**/.env",
    "**/.ssh/**",
    "**/credentials*",
    "**/*.pem",
    "**/*.key",
];

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is absent or empty.
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is present but unusable.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// What was wrong.
        reason: String,
    },
}

/// Process-wide settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Shared secret for bearer authentication.
    pub bridge_token: String,
    /// Directories workspace roots must canonicalize under.
    pub allowed_roots: Vec<PathBuf>,
    /// TCP listen port.
    pub port: u16,
    /// Interface to bind.
    pub bind: String,
    /// Session storage root.
    pub data_dir: PathBuf,
    /// Path patterns always rejected by the guard.
    pub deny_globs: Vec<String>,
    /// Optional operator-supplied prompt suffix.
    pub prompt_append: String,
    /// Admission width. v0.1 enforces one active session regardless.
    pub max_concurrent: usize,
    /// Upper bound on per-task turns.
    pub turns_cap: u32,
    /// Upper bound on per-task timeout, in seconds.
    pub timeout_cap: u64,
    /// Cap on `/logtail?n=`.
    pub logtail_max_lines: usize,
    /// Cap on excerpt content size, in characters.
    pub excerpt_max_chars: usize,
    /// Worker CLI binary, looked up on PATH.
    pub worker_bin: String,
}

impl Config {
    /// Load from `AFW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let bridge_token = required("AFW_BRIDGE_TOKEN")?;

        let roots_raw = required("AFW_ALLOWED_ROOTS")?;
        let allowed_roots: Vec<PathBuf> = roots_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if allowed_roots.is_empty() {
            return Err(ConfigError::Invalid {
                name: "AFW_ALLOWED_ROOTS",
                reason: "no usable entries".into(),
            });
        }
        for root in &allowed_roots {
            if !root.is_absolute() {
                return Err(ConfigError::Invalid {
                    name: "AFW_ALLOWED_ROOTS",
                    reason: format!("{} is not absolute", root.display()),
                });
            }
        }

        let port = parse_or("AFW_PORT", 8787u32)?;
        if port == 0 || port > 65535 {
            return Err(ConfigError::Invalid {
                name: "AFW_PORT",
                reason: format!("{port} is outside 1-65535"),
            });
        }

        let deny_globs = match optional("AFW_DENY_GLOBS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_DENY_GLOBS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(Self {
            bridge_token,
            allowed_roots,
            port: port as u16,
            bind: optional("AFW_BIND").unwrap_or_else(|| "127.0.0.1".into()),
            data_dir: optional("AFW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/sessions")),
            deny_globs,
            prompt_append: optional("AFW_PROMPT_APPEND").unwrap_or_default(),
            max_concurrent: parse_or("AFW_MAX_CONCURRENT", 1usize)?,
            turns_cap: parse_or("AFW_TURNS_CAP", 50u32)?,
            timeout_cap: parse_or("AFW_TIMEOUT_CAP", 1800u64)?,
            logtail_max_lines: parse_or("AFW_LOGTAIL_MAX_LINES", 200usize)?,
            excerpt_max_chars: parse_or("AFW_EXCERPT_MAX_CHARS", 20_000usize)?,
            worker_bin: optional("AFW_WORKER_BIN").unwrap_or_else(|| "claude".into()),
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err| ConfigError::Invalid {
            name,
            reason: format!("{err}"),
        }),
    }
}
