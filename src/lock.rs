//! Build lock markers.
//!
//! One zero-length marker file per `(provider, org, repo)` serializes build
//! dispatches for the same repository. The marker's modification time is
//! its age; markers older than the staleness threshold are reclaimed by the
//! next caller.
//!
//! This is a single-host advisory lock. Two processes sharing the lock
//! directory on the same filesystem exclude each other; nothing is
//! coordinated across hosts.
//!
//! ```rust,ignore
//! let store = LockStore::new(lock_dir, DEFAULT_STALE_AFTER);
//! match store.try_acquire(&key)? {
//!     Acquire::Locked(lease) => {
//!         // ... dispatch ...
//!         lease.release();
//!     }
//!     Acquire::Busy { age } => { /* report conflict */ }
//! }
//! ```

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

/// Locks older than this are treated as abandoned (30 minutes).
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(1800);

/// Repository identity a lock is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LockKey {
    pub provider: String,
    pub org: String,
    pub repo: String,
}

impl LockKey {
    pub fn new(
        provider: impl Into<String>,
        org: impl Into<String>,
        repo: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            org: org.into(),
            repo: repo.into(),
        }
    }

    /// Marker filename: `<provider>_<org>_<repo>.lock`.
    pub fn file_name(&self) -> String {
        format!("{}_{}_{}.lock", self.provider, self.org, self.repo)
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    /// The caller now holds the lock.
    Locked(BuildLease),

    /// Someone else holds a fresh lock.
    Busy { age: Duration },
}

/// Directory of lock markers.
#[derive(Debug, Clone)]
pub struct LockStore {
    root: PathBuf,
    stale_after: Duration,
}

impl LockStore {
    pub fn new(root: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            root: root.into(),
            stale_after,
        }
    }

    pub fn marker_path(&self, key: &LockKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// Try to take the lock for `key` without waiting.
    pub fn try_acquire(&self, key: &LockKey) -> io::Result<Acquire> {
        fs::create_dir_all(&self.root)?;
        let path = self.marker_path(key);

        if let Some(marker) = create_marker(&path)? {
            info!(lock = %path.display(), "Build lock acquired");
            return Ok(Acquire::Locked(BuildLease::new(path, marker)));
        }

        let age = match marker_age(&path) {
            Ok(age) => age,
            // Released between our create attempt and the stat.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Duration::ZERO,
            Err(e) => return Err(e),
        };

        if age <= self.stale_after {
            debug!(lock = %path.display(), age_secs = age.as_secs(), "Build lock busy");
            return Ok(Acquire::Busy { age });
        }

        warn!(
            lock = %path.display(),
            age_secs = age.as_secs(),
            "Reclaiming stale build lock"
        );
        if !self.evict_stale(&path)? {
            return Ok(Acquire::Busy { age: Duration::ZERO });
        }

        match create_marker(&path)? {
            Some(marker) => Ok(Acquire::Locked(BuildLease::new(path, marker))),
            // Another caller reclaimed it first.
            None => Ok(Acquire::Busy { age: Duration::ZERO }),
        }
    }

    /// Move a stale marker out of the way. The marker is renamed first and
    /// its age checked again, so a marker another caller created in the
    /// meantime is put back instead of deleted. Returns false when the key
    /// turned out to be held.
    fn evict_stale(&self, path: &Path) -> io::Result<bool> {
        let evicted = path.with_extension(format!(
            "lock.stale-{}-{}",
            std::process::id(),
            unique_suffix()
        ));
        match fs::rename(path, &evicted) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        }

        if marker_age(&evicted)? > self.stale_after {
            fs::remove_file(&evicted)?;
            return Ok(true);
        }

        // A fresh marker was caught by the rename: restore it without
        // clobbering whatever may have appeared at `path` since.
        debug!(lock = %path.display(), "Marker was renewed during reclaim, restoring it");
        let restored = fs::hard_link(&evicted, path);
        fs::remove_file(&evicted)?;
        match restored {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Age of the marker for `key`, if one exists.
    pub fn age(&self, key: &LockKey) -> io::Result<Option<Duration>> {
        match marker_age(&self.marker_path(key)) {
            Ok(age) => Ok(Some(age)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Held lock. The marker is removed on [`BuildLease::release`] or on drop,
/// so every exit path (including unwinding) frees it.
///
/// The lease keeps its marker open. On release the marker at `path` is only
/// removed if it is still the same file, so a lease whose lock was
/// reclaimed as stale never deletes the new holder's marker.
#[derive(Debug)]
pub struct BuildLease {
    path: PathBuf,
    marker: File,
    released: bool,
}

impl BuildLease {
    fn new(path: PathBuf, marker: File) -> Self {
        Self {
            path,
            marker,
            released: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the marker at `path` is still the one this lease created.
    pub fn is_held(&self) -> bool {
        match (fs::metadata(&self.path), self.marker.metadata()) {
            (Ok(current), Ok(ours)) => same_file(&current, &ours),
            _ => false,
        }
    }

    /// Remove the marker now.
    pub fn release(mut self) {
        self.remove_marker();
    }

    fn remove_marker(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if !self.is_held() {
            warn!(lock = %self.path.display(), "Build lock was reclaimed by another caller, leaving it");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "Build lock released"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Failed to release build lock"),
        }
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        self.remove_marker();
    }
}

/// Create the marker exclusively. `Ok(None)` if it already exists.
fn create_marker(path: &Path) -> io::Result<Option<File>> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

/// An open marker pins its inode, so a new marker never shares it.
#[cfg(unix)]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_file(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    matches!((a.created(), b.created()), (Ok(x), Ok(y)) if x == y)
}

fn unique_suffix() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn marker_age(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> LockKey {
        LockKey::new("gh", "neurolibre", "example-book")
    }

    fn backdate(path: &Path, by: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_marker_name() {
        assert_eq!(key().file_name(), "gh_neurolibre_example-book.lock");
    }

    #[test]
    fn test_acquire_then_busy() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);

        let lease = match store.try_acquire(&key()).unwrap() {
            Acquire::Locked(lease) => lease,
            Acquire::Busy { .. } => panic!("first acquire should lock"),
        };
        assert!(lease.path().exists());
        assert_eq!(fs::metadata(lease.path()).unwrap().len(), 0);

        backdate(lease.path(), Duration::from_secs(120));
        match store.try_acquire(&key()).unwrap() {
            Acquire::Busy { age } => {
                assert!(age >= Duration::from_secs(119));
                assert!(age < Duration::from_secs(200));
            }
            Acquire::Locked(_) => panic!("second acquire should be busy"),
        }

        lease.release();
        assert!(store.age(&key()).unwrap().is_none());
        assert!(matches!(store.try_acquire(&key()).unwrap(), Acquire::Locked(_)));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);

        let path = store.marker_path(&key());
        File::create(&path).unwrap();
        backdate(&path, Duration::from_secs(1801));

        match store.try_acquire(&key()).unwrap() {
            Acquire::Locked(lease) => {
                assert!(lease.path().exists());
                let age = store.age(&key()).unwrap().unwrap();
                assert!(age < Duration::from_secs(60));
            }
            Acquire::Busy { .. } => panic!("stale lock should be reclaimed"),
        }
    }

    #[test]
    fn test_reclaimed_lease_keeps_new_marker() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);

        let first = match store.try_acquire(&key()).unwrap() {
            Acquire::Locked(lease) => lease,
            Acquire::Busy { .. } => panic!("first acquire should lock"),
        };
        backdate(first.path(), Duration::from_secs(1801));

        let second = match store.try_acquire(&key()).unwrap() {
            Acquire::Locked(lease) => lease,
            Acquire::Busy { .. } => panic!("stale lock should be reclaimed"),
        };
        assert!(!first.is_held());
        assert!(second.is_held());

        // The overrun build finishes after the reclaim.
        drop(first);
        assert!(store.marker_path(&key()).exists());
        assert!(matches!(store.try_acquire(&key()).unwrap(), Acquire::Busy { .. }));

        second.release();
        assert!(matches!(store.try_acquire(&key()).unwrap(), Acquire::Locked(_)));
    }

    #[test]
    fn test_reclaim_leaves_only_the_marker() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);

        let path = store.marker_path(&key());
        File::create(&path).unwrap();
        backdate(&path, Duration::from_secs(4000));

        let _lease = store.try_acquire(&key()).unwrap();
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![key().file_name()]);
    }

    #[test]
    fn test_fresh_marker_survives_eviction() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);

        let holder = match store.try_acquire(&key()).unwrap() {
            Acquire::Locked(lease) => lease,
            Acquire::Busy { .. } => panic!("first acquire should lock"),
        };

        // A caller that saw a stale marker races the holder's fresh one.
        assert!(!store.evict_stale(holder.path()).unwrap());
        assert!(holder.is_held());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);

        {
            let _acquired = store.try_acquire(&key()).unwrap();
            assert!(store.marker_path(&key()).exists());
        }
        assert!(!store.marker_path(&key()).exists());
    }

    #[test]
    fn test_keys_are_independent() {
        let temp = TempDir::new().unwrap();
        let store = LockStore::new(temp.path(), DEFAULT_STALE_AFTER);
        let other = LockKey::new("gh", "neurolibre", "other-book");

        let _a = store.try_acquire(&key()).unwrap();
        assert!(matches!(store.try_acquire(&other).unwrap(), Acquire::Locked(_)));
    }
}
