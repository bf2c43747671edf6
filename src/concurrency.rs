//! Database locking, tied to the handle lifecycle.
//!
//! Process level: the store's `.lock` sidecar is try-locked when the
//! database is opened — exclusively for a writable handle, shared for a
//! read-only one — and stays locked until the handle is dropped. A second
//! process (or a second handle in this process) gets `OpalError::Lock`
//! up front instead of blocking behind a writer it cannot observe, and
//! before any recovery work touches the store.
//!
//! Thread level: a parking_lot RwLock is the coarse monitor the database
//! entry points take around the storage engine; multiple readers or one
//! writer run inside the process at a time.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use parking_lot::RwLock;

use crate::error::{OpalError, Result};

pub struct DatabaseLock {
    monitor: RwLock<()>,
    lock_file: File,
    lock_path: PathBuf,
}

impl DatabaseLock {
    /// Take the process-level lock for the store at `db_path`. Held until
    /// the returned lock is dropped; fails immediately when another
    /// handle owns the store.
    pub fn acquire(db_path: &Path, read_only: bool) -> Result<Self> {
        let lock_path = db_path.with_extension("lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        let result = if read_only {
            FileExt::try_lock_shared(&lock_file)
        } else {
            FileExt::try_lock_exclusive(&lock_file)
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(OpalError::Lock(format!(
                    "database is locked by another process: {}",
                    lock_path.display()
                )));
            }
            Err(e) => {
                return Err(OpalError::Lock(format!(
                    "cannot lock {}: {}",
                    lock_path.display(),
                    e
                )));
            }
        }

        Ok(DatabaseLock {
            monitor: RwLock::new(()),
            lock_file,
            lock_path,
        })
    }

    /// Monitor guard for a reading entry point.
    pub fn shared(&self) -> SharedGuard<'_> {
        SharedGuard {
            _monitor: self.monitor.read(),
        }
    }

    /// Monitor guard for a mutating entry point (add/remove/truncate,
    /// commit, rollback, close).
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        ExclusiveGuard {
            _monitor: self.monitor.write(),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

pub struct SharedGuard<'a> {
    _monitor: parking_lot::RwLockReadGuard<'a, ()>,
}

pub struct ExclusiveGuard<'a> {
    _monitor: parking_lot::RwLockWriteGuard<'a, ()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::Options;
    use crate::Database;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_second_handle_is_rejected_while_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let db = Database::create(&path, Options::default()).unwrap();

        match Database::open(&path, Options::default()) {
            Err(OpalError::Lock(message)) => {
                assert!(message.contains("locked"), "unexpected message: {}", message)
            }
            other => panic!("expected Lock error, got {:?}", other.map(|_| ())),
        }
        drop(db);
    }

    #[test]
    fn test_close_releases_the_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");

        let db = Database::create(&path, Options::default()).unwrap();
        db.close().unwrap();

        // The lock died with the handle; the store opens again.
        let db = Database::open(&path, Options::default()).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn test_read_only_handles_share_the_file_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");

        let first = DatabaseLock::acquire(&path, true).unwrap();
        let second = DatabaseLock::acquire(&path, true).unwrap();
        assert_eq!(first.lock_path(), second.lock_path());

        // A writer cannot join two live readers.
        match DatabaseLock::acquire(&path, false) {
            Err(OpalError::Lock(_)) => {}
            other => panic!("expected Lock error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_monitor_parks_readers_behind_a_writer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let lock = Arc::new(DatabaseLock::acquire(&path, false).unwrap());
        let reader_ran = Arc::new(AtomicBool::new(false));

        let guard = lock.exclusive();
        let reader = {
            let lock = lock.clone();
            let reader_ran = reader_ran.clone();
            thread::spawn(move || {
                let _shared = lock.shared();
                reader_ran.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(
            !reader_ran.load(Ordering::SeqCst),
            "reader entered the monitor while a writer held it"
        );

        drop(guard);
        reader.join().unwrap();
        assert!(reader_ran.load(Ordering::SeqCst));
    }
}
