//! Database/collection open options (spec §6 open-mode flags, §12 tuning
//! surface).

use error::{ErrorKind, Result};

/// Open-mode bit flags, passed to `Database::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reads only.
    pub const READER: OpenFlags = OpenFlags(1 << 0);
    /// Open for reads and writes.
    pub const WRITER: OpenFlags = OpenFlags(1 << 1);
    /// Create the database if it does not already exist.
    pub const CREATE: OpenFlags = OpenFlags(1 << 2);
    /// Truncate an existing database on open.
    pub const TRUNC: OpenFlags = OpenFlags(1 << 3);
    /// Skip the advisory path lock (single-process, trusted caller only).
    pub const NO_LOCK: OpenFlags = OpenFlags(1 << 4);
    /// Fail fast rather than block if the path lock is already held.
    pub const LOCK_NONBLOCK: OpenFlags = OpenFlags(1 << 5);
    /// Fsync the data file at the end of every committed transaction.
    pub const SYNC_ON_COMMIT: OpenFlags = OpenFlags(1 << 6);

    /// Whether `other` is a subset of this set of flags.
    pub fn contains(&self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The empty flag set.
    pub fn empty() -> OpenFlags {
        OpenFlags(0)
    }
}

impl ::std::ops::BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::WRITER | OpenFlags::CREATE
    }
}

/// Per-collection tuning knobs (spec §12 supplement), translated into a
/// `record::RecordFileConfig` when the collection's record file is created.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionOptions {
    /// Expected number of live records, used to size the initial bucket
    /// array (spec §12: avoids the bucket-resize-never-shrinks cost of
    /// starting too small).
    pub records: u64,
    /// Number of recently-touched records to keep mapped even past the
    /// mmap-threshold boundary. Currently advisory: the record file always
    /// maps its whole file up to `mmap_threshold`; this is recorded for the
    /// planner/stats surface rather than driving a separate LRU cache.
    pub cached_records: u64,
    /// Use 8-byte (rather than 4-byte) child/bucket offsets, required past
    /// ~4GiB of collection data.
    pub large: bool,
    /// Whether values are run through a compressing codec before storage.
    /// Plugging in an actual compressor is left to the caller via `Codec`;
    /// this flag only controls whether the option bit is set in the header.
    pub compressed: bool,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        CollectionOptions {
            records: 1_000_000,
            cached_records: 0,
            large: false,
            compressed: false,
        }
    }
}

impl CollectionOptions {
    /// Bucket count derived from `records`, matching `tchdb.c`'s rule of
    /// thumb of roughly one bucket per expected record.
    pub fn bucket_count(&self) -> u64 {
        self.records.max(1)
    }
}

/// Top-level database options.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Open-mode bit flags.
    pub flags: OpenFlags,
    /// Default `CollectionOptions` used for collections created without
    /// explicit tuning.
    pub default_collection_options: CollectionOptions,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            flags: OpenFlags::default(),
            default_collection_options: CollectionOptions::default(),
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.flags.contains(OpenFlags::READER) && self.flags.contains(OpenFlags::WRITER) {
            return Err(ErrorKind::Invalid("READER and WRITER are mutually exclusive".into()).into());
        }
        if !self.flags.contains(OpenFlags::READER) && !self.flags.contains(OpenFlags::WRITER) {
            return Err(ErrorKind::Invalid("must open with READER or WRITER".into()).into());
        }
        Ok(())
    }

    pub(crate) fn readonly(&self) -> bool {
        self.flags.contains(OpenFlags::READER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bucket_count_matches_records_hint() {
        let opts = CollectionOptions {
            records: 500,
            ..CollectionOptions::default()
        };
        assert_eq!(opts.bucket_count(), 500);
    }

    #[test]
    fn reader_and_writer_are_mutually_exclusive() {
        let opts = Options {
            flags: OpenFlags::READER | OpenFlags::WRITER,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
    }
}
