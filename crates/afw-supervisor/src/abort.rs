// SPDX-License-Identifier: MIT OR Apache-2.0
//! Advisory abort signalling for supervised sessions.
//!
//! Aborting is deliberately decoupled from killing the worker: the abort
//! route flips the signal and returns immediately, while the supervisor
//! keeps waiting on the child and merely stops writing state once it
//! observes the flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared abort flag for one session.
///
/// Clones observe the same flag; aborting through any clone is immediately
/// visible to all of them. Aborting twice is harmless.
#[derive(Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
}

impl AbortSignal {
    /// A fresh, un-aborted signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the session aborted.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether [`abort`](Self::abort) has been called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
