//! Cross-process lock around a file-mode store.
//!
//! DuckDB admits a single writing process per database file. Worker
//! processes sharing one store therefore hold an `fs2` lock on a sidecar
//! `<store>.lock` file for as long as their connection is open, and wait
//! their turn instead of failing to open the store.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, trace};

const RETRY_EVERY: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for store lock: {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Cannot lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Sidecar lock file next to the store: `dash.duckdb` locks `dash.duckdb.lock`.
pub fn lock_path_for(db_path: &Path) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// An exclusive hold on a store file. Dropping it closes the handle, which
/// releases the OS lock.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
    since: Instant,
}

impl StoreLock {
    /// Block until the lock is ours or `timeout` has passed.
    ///
    /// Separate handles conflict even within one process, so threads queue
    /// here just like processes do.
    pub fn acquire(db_path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = lock_path_for(db_path);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let started = Instant::now();
        // std's File::try_lock_exclusive shadows the fs2 method on newer toolchains.
        while let Err(err) = FileExt::try_lock_exclusive(&file) {
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(io_err(err));
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: db_path.to_path_buf(),
                    waited,
                });
            }
            std::thread::sleep(RETRY_EVERY);
        }

        if started.elapsed() > RETRY_EVERY {
            debug!(
                lock = %path.display(),
                waited_ms = started.elapsed().as_millis() as u64,
                "store lock acquired after contention"
            );
        }
        Ok(Self {
            file,
            path,
            since: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!(
            lock = %self.path.display(),
            held_ms = self.since.elapsed().as_millis() as u64,
            "store lock released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            lock_path_for(Path::new("/data/dash.duckdb")),
            PathBuf::from("/data/dash.duckdb.lock")
        );
        assert_eq!(
            lock_path_for(Path::new("/data/dash")),
            PathBuf::from("/data/dash.lock")
        );
    }

    #[test]
    fn test_contended_lock_times_out() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("dash.duckdb");

        let held = StoreLock::acquire(&store, Duration::from_secs(1)).unwrap();
        assert_eq!(held.path(), lock_path_for(&store));
        let err = StoreLock::acquire(&store, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[test]
    fn test_drop_releases() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("dash.duckdb");

        drop(StoreLock::acquire(&store, Duration::from_secs(1)).unwrap());
        assert!(StoreLock::acquire(&store, Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_waiter_gets_lock_after_release() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("dash.duckdb");

        let held = StoreLock::acquire(&store, Duration::from_secs(1)).unwrap();
        let waiter = {
            let store = store.clone();
            std::thread::spawn(move || StoreLock::acquire(&store, Duration::from_secs(5)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(100));
        drop(held);
        assert!(waiter.join().unwrap());
    }
}
