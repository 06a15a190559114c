//! The memory-mapped prefix of a record file (spec §4.A "Memory map",
//! §5 lock #4 "shared-memory lock").
//!
//! Grounded on `segurodb/src/database.rs`'s `Mmap::open_path`/`as_slice`/
//! `as_mut_slice`/`flush` usage, wrapped here behind an explicit
//! grow-on-demand so callers never see a stale mapping after the file has
//! grown.

use std::cell::UnsafeCell;
use std::fs::File;
use std::path::Path;

use memmap::{Mmap, Protection};

use error::Result;

/// Wraps the file's current `Mmap`, remapped whenever the file grows past
/// its length. Access through the map is guarded externally by the
/// shared-memory `RwLock` in `RecordFile`: held shared for any access
/// through the map (including writes — disjoint byte ranges are protected
/// by the bucket-lock layer above this one), held exclusive only around
/// `grow_to`. The `UnsafeCell` makes that interior-mutability contract
/// explicit instead of hiding it behind raw-pointer casts.
pub struct Mapping {
    mmap: UnsafeCell<Mmap>,
    len: usize,
}

unsafe impl Sync for Mapping {}

impl Mapping {
    /// Opens a mapping over the whole of `path` (current file length).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Mapping> {
        let mmap = Mmap::open_path(path, Protection::ReadWrite)?;
        let len = mmap.len();
        Ok(Mapping {
            mmap: UnsafeCell::new(mmap),
            len,
        })
    }

    /// Current mapped length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Remaps the file if `new_len` exceeds the current mapping. Caller
    /// must hold the shared-memory lock exclusively.
    pub fn grow_to(&mut self, file: &File, new_len: usize) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        let mmap = Mmap::open(file, Protection::ReadWrite)?;
        self.len = mmap.len();
        self.mmap = UnsafeCell::new(mmap);
        Ok(())
    }

    /// Read-only view of the mapped region.
    ///
    /// # Safety
    /// Caller must hold the shared-memory lock (shared mode suffices) and
    /// must not read bytes concurrently being relocated by defragmentation
    /// without the appropriate bucket lock also held.
    pub unsafe fn as_slice(&self) -> &[u8] {
        (*self.mmap.get()).as_slice()
    }

    /// Mutable view of the mapped region.
    ///
    /// # Safety
    /// Same discipline as `as_slice`; additionally the caller must only
    /// write byte ranges it owns exclusively via the bucket-lock layer, so
    /// concurrent callers never alias the same bytes.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        (*self.mmap.get()).as_mut_slice()
    }

    /// Flushes (msyncs) the mapping to disk.
    pub fn flush(&self) -> Result<()> {
        unsafe { (*self.mmap.get()).flush()? };
        Ok(())
    }
}
