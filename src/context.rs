// SPDX-FileCopyrightText: 2025 Abe Kohandel <abe@kodebooth.com>
// SPDX-License-Identifier: MIT

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use uuid::Uuid;

/// Identifies one execution context (a thread or a task) to a
/// [LockManager](crate::LockManager).
///
/// A context holds at most one lock at a time and must not be shared between
/// concurrently running threads or tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate an identifier that is unique within this process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lock one context believes it holds. A context without a lock has no
/// state at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContextState {
    pub token: String,
    pub key: String,
    pub depth: u32,
}

impl ContextState {
    pub fn new(token: String, key: &str) -> Self {
        Self {
            token,
            key: key.to_string(),
            depth: 0,
        }
    }
}

/// Ownership token of context `id` on the instance `instance`.
pub(crate) fn token(instance: &str, id: ContextId) -> String {
    format!("{instance}/{id}")
}

/// Identity of this process, `<hostname>/<uuid>`.
///
/// The random part keeps tokens distinct between processes running on the
/// same host.
pub fn instance_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}/{}", Uuid::new_v4().simple())
}
