//! Per-repository merge locks.
//!
//! Merges, builds, and tests mutate the host checkout, so at most one
//! project may occupy those phases per `repo_path` at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct MergeLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock object for a repo. Callers hold the inner guard across the
    /// merging/building/testing phases.
    pub fn lock_for(&self, repo_path: &Path) -> Arc<Mutex<()>> {
        let key = repo_path
            .canonicalize()
            .unwrap_or_else(|_| repo_path.to_path_buf());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key).or_default())
    }
}

pub fn acquire(lock: &Arc<Mutex<()>>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}
