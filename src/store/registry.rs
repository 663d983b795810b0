//! Process-wide lock registry keyed by canonical store path.
//!
//! Every store handle opened on the same directory must share one
//! reader-writer lock, otherwise two handles in the same process would
//! write the block concurrently. The registry is explicit state the
//! application owns and threads through, not a global singleton.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

/// Maps canonical store directories to their shared locks. Cheap to clone
/// behind an `Arc` if the application wants to share it across threads.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `dir`, creating it on first use. The path is
    /// canonicalized so that aliases of the same directory share a lock;
    /// the directory must already exist.
    pub fn lock_for<P: AsRef<Path>>(&self, dir: P) -> Result<Arc<RwLock<()>>> {
        let dir = dir.as_ref();
        let canonical = dir
            .canonicalize()
            .wrap_err_with(|| format!("failed to canonicalize store path '{}'", dir.display()))?;

        let mut locks = self.locks.lock();
        Ok(Arc::clone(
            locks.entry(canonical).or_insert_with(|| Arc::new(RwLock::new(()))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn same_directory_shares_one_lock() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();

        let a = registry.lock_for(dir.path()).unwrap();
        let b = registry.lock_for(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn path_aliases_resolve_to_the_same_lock() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();

        let direct = registry.lock_for(dir.path()).unwrap();
        let dotted = registry.lock_for(dir.path().join(".")).unwrap();
        assert!(Arc::ptr_eq(&direct, &dotted));
    }

    #[test]
    fn distinct_directories_get_distinct_locks() {
        let a_dir = tempdir().unwrap();
        let b_dir = tempdir().unwrap();
        let registry = LockRegistry::new();

        let a = registry.lock_for(a_dir.path()).unwrap();
        let b = registry.lock_for(b_dir.path()).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let registry = LockRegistry::new();
        assert!(registry.lock_for(dir.path().join("nope")).is_err());
    }
}
