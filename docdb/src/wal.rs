//! Write-ahead log: per-collection sidecar journal of pre-images of byte
//! ranges a live transaction is about to overwrite (spec §4.A "Write-ahead
//! log").
//!
//! Grounded on `segurodb/src/journal.rs` (era-file sidecar directory,
//! checksum via `tiny_keccak`) and `segurodb/src/flush/flush.rs`
//! (checksummed mmap'd staging file), with the direction inverted: the
//! teacher's `Flush` stages idempotent *post-image* writes replayed
//! forward on recovery; this WAL stages *pre-images*, replayed in reverse
//! on abort or crash recovery (Open Question #2 in `DESIGN.md`).
//!
//! The on-disk file is append-only: a one-time header (magic + the
//! pre-transaction file size) is written at `begin`, and every later
//! `checkpoint` appends only the entries recorded since the previous one,
//! each self-checksummed. A transaction with many writes never rewrites
//! bytes it already fsynced, and a crash mid-append leaves at worst one
//! incomplete trailing entry, which recovery detects and discards rather
//! than rejecting the whole journal.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tiny_keccak::sha3_256;

use error::Result;

const MAGIC: &[u8; 4] = b"WAL2";
const HEADER_LEN: usize = 4 + 8;
const ENTRY_PREFIX_LEN: usize = 8 + 4;
const CHECKSUM_LEN: usize = 32;

struct Entry {
    offset: u64,
    original: Vec<u8>,
}

/// An open write-ahead log for one transaction.
pub struct Wal {
    path: PathBuf,
    initial_size: u64,
    file: File,
    /// Number of `entries` already appended to `file`.
    flushed: usize,
    entries: Vec<Entry>,
}

impl Wal {
    /// Starts a new WAL at `path`: truncates any stale file, writes the
    /// one-time header (magic + `initial_size`, the file size at the
    /// moment the transaction began), and keeps the file open for
    /// subsequent appends.
    pub fn begin<P: AsRef<Path>>(path: P, initial_size: u64) -> Result<Wal> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        LittleEndian::write_u64(&mut header[4..12], initial_size);
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(Wal {
            path,
            initial_size,
            file,
            flushed: 0,
            entries: Vec::new(),
        })
    }

    /// Records the current contents of `[offset, offset + original.len())`
    /// before it is overwritten. Ranges at or past `initial_size` are
    /// outside the pre-transaction universe and are not journaled; a range
    /// straddling the boundary is clipped to the part that existed at
    /// `begin`.
    pub fn record_preimage(&mut self, offset: u64, original: &[u8]) {
        if offset >= self.initial_size || original.is_empty() {
            return;
        }
        let max_len = (self.initial_size - offset) as usize;
        let len = original.len().min(max_len);
        self.entries.push(Entry {
            offset,
            original: original[..len].to_vec(),
        });
    }

    /// Appends every entry recorded since the last checkpoint, each framed
    /// as `offset(8) | len(4) | original(len) | checksum(32)` with the
    /// checksum covering the frame's own prefix and body, then fsyncs.
    fn flush_to_disk(&mut self) -> Result<()> {
        for entry in &self.entries[self.flushed..] {
            let mut prefix = [0u8; ENTRY_PREFIX_LEN];
            LittleEndian::write_u64(&mut prefix[0..8], entry.offset);
            LittleEndian::write_u32(&mut prefix[8..12], entry.original.len() as u32);
            let mut framed = Vec::with_capacity(ENTRY_PREFIX_LEN + entry.original.len());
            framed.extend_from_slice(&prefix);
            framed.extend_from_slice(&entry.original);
            let checksum = sha3_256(&framed);
            self.file.write_all(&framed)?;
            self.file.write_all(&checksum)?;
        }
        self.file.sync_all()?;
        self.flushed = self.entries.len();
        Ok(())
    }

    /// Commits the transaction: the WAL is truncated (removed). Caller is
    /// responsible for having already fsynced the data file.
    pub fn commit(self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Aborts the transaction: persists first (in case entries were only
    /// ever held in memory), replays every recorded pre-image in reverse
    /// order via `apply`, then removes the journal. Returns the recorded
    /// `initial_size` so the caller can truncate the data file back to it.
    pub fn abort<F: FnMut(u64, &[u8]) -> Result<()>>(mut self, mut apply: F) -> Result<u64> {
        self.flush_to_disk()?;
        for entry in self.entries.iter().rev() {
            apply(entry.offset, &entry.original)?;
        }
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(self.initial_size)
    }

    /// If a WAL file exists at `path` (the "opened-dirty" crash-recovery
    /// case), replays it as an abort and removes it, returning the
    /// recorded initial size the data file should be truncated to. A WAL
    /// whose header never finished writing is treated as if it were never
    /// opened: no data-file write could have happened before the header
    /// was durable, so there is nothing to roll back.
    pub fn recover_if_present<F: FnMut(u64, &[u8]) -> Result<()>>(
        path: &Path,
        apply: F,
    ) -> Result<Option<u64>> {
        if !path.exists() {
            return Ok(None);
        }
        match Self::read_from_disk(path)? {
            Some(wal) => Ok(Some(wal.abort(apply)?)),
            None => {
                fs::remove_file(path)?;
                Ok(None)
            }
        }
    }

    /// Parses the on-disk format defensively: a truncated or
    /// checksum-mismatched trailing entry (the signature of a crash
    /// mid-append) simply ends the scan rather than failing the whole
    /// recovery, so only the entries that were durably appended are
    /// replayed.
    fn read_from_disk(path: &Path) -> Result<Option<Wal>> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() < HEADER_LEN || &data[0..4] != MAGIC {
            return Ok(None);
        }
        let initial_size = LittleEndian::read_u64(&data[4..12]);

        let mut entries = Vec::new();
        let mut pos = HEADER_LEN;
        while pos + ENTRY_PREFIX_LEN <= data.len() {
            let offset = LittleEndian::read_u64(&data[pos..pos + 8]);
            let len = LittleEndian::read_u32(&data[pos + 8..pos + ENTRY_PREFIX_LEN]) as usize;
            let body_end = pos + ENTRY_PREFIX_LEN + len;
            let checksum_end = body_end + CHECKSUM_LEN;
            if checksum_end > data.len() {
                break;
            }
            let expected = sha3_256(&data[pos..body_end]);
            if expected.as_ref() != &data[body_end..checksum_end] {
                break;
            }
            entries.push(Entry {
                offset,
                original: data[pos + ENTRY_PREFIX_LEN..body_end].to_vec(),
            });
            pos = checksum_end;
        }

        let flushed = entries.len();
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Some(Wal {
            path: path.to_path_buf(),
            initial_size,
            file,
            flushed,
            entries,
        }))
    }

    /// Persists entries to disk and leaves the WAL open (used before the
    /// transaction's commit-time fsync, per spec §5 ordering guarantees:
    /// "the commit point is the truncation of the WAL and the fsync of the
    /// data file, in that order").
    pub fn checkpoint(&mut self) -> Result<()> {
        self.flush_to_disk()
    }

    /// Whether this transaction has recorded any pre-images yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
