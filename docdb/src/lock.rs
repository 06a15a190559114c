//! Lock hierarchy primitives (spec §5).
//!
//! Grounded on `segurodb/src/database.rs`'s use of `fs2::FileExt` for its
//! own open-time advisory lock and `parking_lot` for everything else,
//! generalized into the full six-level hierarchy:
//!
//! 1. global path lock (this module's `PathLock`)
//! 2. collection method `RwLock` (owned by `Collection`)
//! 3. 256 bucket `RwLock`s (this module's `BucketLocks`)
//! 4. shared-memory `RwLock` (owned by `record::store::RecordFile`, guards
//!    `record::mapping::Mapping`)
//! 5. database-value `Mutex` (owned by `RecordFile`, guards `N`/`F`/pool)
//! 6. WAL `Mutex` (owned by `wal::Wal`)
//!
//! Acquired in this order, released in reverse; no lock upgrade.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::RwLock;

use error::{ErrorKind, Result};

/// Number of bucket locks, fixed by the spec at 256 (indexed by the low
/// byte of the bucket index).
pub const BUCKET_LOCK_COUNT: usize = 256;

/// An OS advisory lock on a file path, held for the lifetime of an open
/// database/collection handle. Prevents more than one process (or more
/// than one handle within this process) from opening the same path for
/// writing concurrently.
pub struct PathLock {
    path: PathBuf,
    file: File,
}

impl PathLock {
    /// Acquires an exclusive advisory lock on `path`, creating the lock
    /// file if necessary. Blocks unless `nonblocking` is set, in which
    /// case a held lock fails fast with `ErrorKind::Lock`.
    pub fn acquire<P: AsRef<Path>>(path: P, nonblocking: bool) -> Result<PathLock> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let locked = if nonblocking {
            file.try_lock_exclusive().is_ok()
        } else {
            file.lock_exclusive().is_ok()
        };
        if !locked {
            return Err(ErrorKind::Lock(path).into());
        }
        Ok(PathLock { path, file })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Fixed-size array of 256 reader-writer locks, one per low byte of a
/// bucket index. A single-record operation takes exactly one; a whole-file
/// operation (iteration, defragmentation) takes all 256 in ascending order.
pub struct BucketLocks {
    locks: Vec<RwLock<()>>,
}

impl BucketLocks {
    /// Builds a fresh set of unlocked bucket locks.
    pub fn new() -> BucketLocks {
        BucketLocks {
            locks: (0..BUCKET_LOCK_COUNT).map(|_| RwLock::new(())).collect(),
        }
    }

    /// The lock guarding the bucket with this index.
    pub fn for_bucket(&self, bucket_index: u64) -> &RwLock<()> {
        &self.locks[(bucket_index as usize) % BUCKET_LOCK_COUNT]
    }

    /// Acquires every bucket lock, shared, in ascending order — used by
    /// full-file iteration so it can proceed concurrently with writers to
    /// other buckets only up to the point a bucket is actually visited.
    pub fn read_all(&self) -> Vec<::parking_lot::RwLockReadGuard<()>> {
        self.locks.iter().map(|l| l.read()).collect()
    }

    /// Acquires every bucket lock, exclusive, in ascending order — used by
    /// defragmentation, which relocates records across the whole file.
    pub fn write_all(&self) -> Vec<::parking_lot::RwLockWriteGuard<()>> {
        self.locks.iter().map(|l| l.write()).collect()
    }
}

impl Default for BucketLocks {
    fn default() -> Self {
        BucketLocks::new()
    }
}
