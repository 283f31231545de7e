// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! afw-gate
//!
//! The single-slot mutual-exclusion primitive serializing active sessions.
//! At most one `(workspace, session_id)` pair holds the slot; release is
//! owner-checked so a stale abort can never free a newer session's slot.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
struct Owner {
    workspace: PathBuf,
    session_id: String,
}

/// Process-global single-slot gate.
///
/// All operations are synchronous and non-blocking; the inner mutex is held
/// only for the duration of a compare-and-swap, never across an await point.
#[derive(Debug, Default)]
pub struct Gate {
    slot: Mutex<Option<Owner>>,
}

impl Gate {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the slot for `(workspace, session_id)`.
    ///
    /// Returns `true` iff the slot was empty.
    pub fn acquire(&self, workspace: &Path, session_id: &str) -> bool {
        let mut slot = self.slot.lock().expect("gate poisoned");
        if slot.is_some() {
            return false;
        }
        *slot = Some(Owner {
            workspace: workspace.to_path_buf(),
            session_id: session_id.to_string(),
        });
        true
    }

    /// Release the slot iff it is held by exactly `(workspace, session_id)`.
    ///
    /// A mismatched release is a no-op and returns `false`.
    pub fn release(&self, workspace: &Path, session_id: &str) -> bool {
        let mut slot = self.slot.lock().expect("gate poisoned");
        match slot.as_ref() {
            Some(owner) if owner.workspace == workspace && owner.session_id == session_id => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// The session id currently holding the slot, if any.
    pub fn active_session_id(&self) -> Option<String> {
        self.slot
            .lock()
            .expect("gate poisoned")
            .as_ref()
            .map(|owner| owner.session_id.clone())
    }
}
