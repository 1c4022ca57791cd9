//! Working-copy write lock
//!
//! The lock is a single row in the `wc_lock` table, so it is shared by every
//! process that opens the same working copy. It is held from the start of a
//! harvest until reconciliation finishes or the commit is abandoned.

use crate::error::{CommitError, Result};
use crate::wc_db::WcDb;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An exclusive write lock on a working-copy root.
///
/// Released by [`WcWriteLock::release`]; dropping an unreleased lock
/// releases it as well.
pub struct WcWriteLock {
    db: Arc<WcDb>,
    root: PathBuf,
    token: String,
    released: bool,
}

impl WcWriteLock {
    /// Take the lock, failing with `WcLocked` if anyone holds it.
    pub fn acquire(db: Arc<WcDb>, root: &Path) -> Result<Self> {
        let token = uuid::Uuid::new_v4().to_string();
        if !db.try_lock(&token)? {
            return Err(CommitError::WcLocked(root.to_path_buf()));
        }
        tracing::debug!("Acquired write lock on {:?}", root);
        Ok(Self {
            db,
            root: root.to_path_buf(),
            token,
            released: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock. Consumes the guard, so this happens at most once.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.db.unlock(&self.token)?;
        tracing::debug!("Released write lock on {:?}", self.root);
        Ok(())
    }
}

impl Drop for WcWriteLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.db.unlock(&self.token) {
            tracing::warn!("Failed to release write lock on {:?}: {}", self.root, e);
        }
    }
}

impl std::fmt::Debug for WcWriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WcWriteLock")
            .field("root", &self.root)
            .field("token", &self.token)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquire_release() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(WcDb::open(tmp.path()).unwrap());

        let lock = WcWriteLock::acquire(db.clone(), tmp.path()).unwrap();
        assert_eq!(db.lock_holder().unwrap().as_deref(), Some(lock.token()));
        lock.release().unwrap();
        assert!(db.lock_holder().unwrap().is_none());

        let _again = WcWriteLock::acquire(db, tmp.path()).unwrap();
    }

    #[test]
    fn test_lock_blocks_second() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(WcDb::open(tmp.path()).unwrap());

        let _lock = WcWriteLock::acquire(db.clone(), tmp.path()).unwrap();
        let second = WcWriteLock::acquire(db, tmp.path());
        assert!(matches!(second, Err(CommitError::WcLocked(_))));
    }

    #[test]
    fn test_drop_releases() {
        let tmp = TempDir::new().unwrap();
        let db = Arc::new(WcDb::open(tmp.path()).unwrap());
        {
            let _lock = WcWriteLock::acquire(db.clone(), tmp.path()).unwrap();
        }
        assert!(db.lock_holder().unwrap().is_none());
    }
}
