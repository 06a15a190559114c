//! The record file: bucketed hash-on-disk storage with per-bucket
//! collision trees, a free-block pool, mmap'd hot prefix and an optional
//! write-ahead log (spec §4.A, §6 header layout).
//!
//! Grounded on `segurodb/src/database.rs` for the open/create/mmap/grow
//! lifecycle and lock acquisition shape, generalized from the teacher's
//! fixed-prefix field addressing to real hash buckets plus in-place
//! collision-tree child pointers.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex, RwLock};

use codec::{Codec, DupAction, DupProc};
use error::{ErrorKind, Result};
use key;
use lock::{BucketLocks, PathLock};
use record::collision_tree::{self, NodeInfo, TreeIo};
use record::free_pool::FreePool;
use record::header::{self, FreeHeader, RecordHeader, NO_CHILD};
use record::mapping::Mapping;
use wal::Wal;

/// Fixed 256-byte record-file header (spec §6).
const HEADER_LEN: usize = 256;
const MAGIC_BANNER: &[u8] = b"docdb-record-file-format-v1\0\0\0\0";

const OPT_LARGE: u32 = 1 << 0;
#[allow(dead_code)]
const OPT_COMPRESSED: u32 = 1 << 1;

const FLAG_OPENED_DIRTY: u8 = 1 << 0;
const FLAG_FATAL: u8 = 1 << 1;

/// How `RecordFile::put` resolves a write against an existing key.
pub enum PutMode {
    /// Replace the existing value unconditionally.
    Overwrite,
    /// Fail with `ErrorKind::KeepErr` if the key already exists.
    Keep,
    /// Append `value` to the existing bytes.
    Concat,
    /// Treat both as little-endian `i64` and sum them.
    AddInt,
    /// Treat both as little-endian `f64` and sum them.
    AddDbl,
    /// Calls a user function with the old bytes (empty if absent) to
    /// decide the outcome.
    Proc(Box<dyn DupProc>),
}

/// Tuning knobs for a newly created record file. Defaults follow
/// `tchdb.c`'s own (`apow` 4, `fpow` 10) per `SPEC_FULL.md` §4.A
/// supplement.
#[derive(Debug, Clone)]
pub struct RecordFileConfig {
    /// Alignment power: every record/free block starts at a multiple of
    /// `1 << alignment_power` bytes.
    pub alignment_power: u8,
    /// Free-pool power: the in-memory free-block pool holds at most
    /// `1 << free_pool_power` entries.
    pub free_pool_power: u8,
    /// Initial bucket count. Sized from the `records` tuning hint by the
    /// collection layer.
    pub bucket_count: u64,
    /// Whether bucket/child offsets are stored as 8-byte (large) or
    /// 4-byte values.
    pub large: bool,
    /// Byte threshold below which reads/writes go through the memory map
    /// rather than `pread`/`pwrite` (spec's `xmsiz`).
    pub mmap_threshold: u64,
    /// Number of writes between incremental auto-defragmentation passes.
    /// Zero disables auto-defrag.
    pub defrag_unit: u64,
}

impl Default for RecordFileConfig {
    fn default() -> Self {
        RecordFileConfig {
            alignment_power: 4,
            free_pool_power: 10,
            bucket_count: 1024,
            large: false,
            mmap_threshold: 64 * 1024 * 1024,
            defrag_unit: 0,
        }
    }
}

struct FileState {
    record_count: u64,
    file_size: u64,
    free_pool: FreePool,
}

/// A bucketed hash-on-disk record store (spec component A).
pub struct RecordFile {
    #[allow(dead_code)]
    path_lock: PathLock,
    path: PathBuf,
    wal_path: PathBuf,
    file: File,
    mapping: RwLock<Mapping>,
    bucket_locks: BucketLocks,
    state: Mutex<FileState>,
    wal: Mutex<Option<Wal>>,
    tran_cv: Condvar,
    codec: Box<dyn Codec>,
    large: bool,
    alignment_power: u8,
    free_pool_power: u8,
    bucket_count: u64,
    first_record_offset: u64,
    mmap_threshold: u64,
    readonly: bool,
    defrag_unit: u64,
    writes_since_defrag: AtomicUsize,
}

fn align_up(value: u64, power: u8) -> u64 {
    let mask = (1u64 << power) - 1;
    (value + mask) & !mask
}

fn bucket_entry_width(large: bool) -> usize {
    if large { 8 } else { 4 }
}

fn free_pool_region_len(free_pool_power: u8) -> u64 {
    // Worst case per entry: two 10-byte varints; generous constant upper
    // bound matching `tchdb.c`'s own fixed-size free-block pool area.
    (1u64 << free_pool_power) * 20 + 16
}

impl RecordFile {
    /// Creates a new record file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, codec: Box<dyn Codec>, config: RecordFileConfig) -> Result<RecordFile> {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);
        let path_lock = PathLock::acquire(&lock_path, false)?;
        let wal_path = wal_path_for(&path);

        let bucket_bytes = config.bucket_count as usize * bucket_entry_width(config.large);
        let first_record_offset = align_up(
            HEADER_LEN as u64 + bucket_bytes as u64 + free_pool_region_len(config.free_pool_power),
            config.alignment_power,
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(first_record_offset)?;

        let mut header_buf = vec![0u8; HEADER_LEN];
        write_header(
            &mut header_buf,
            HeaderFields {
                db_type: 1,
                flags: 0,
                alignment_power: config.alignment_power,
                free_pool_power: config.free_pool_power,
                option_bits: if config.large { OPT_LARGE } else { 0 },
                bucket_count: config.bucket_count,
                record_count: 0,
                file_size: first_record_offset,
                first_record_offset,
            },
        );
        file.write_at(&header_buf, 0)?;
        file.sync_all()?;

        let mapping = Mapping::open(&path)?;

        Ok(RecordFile {
            path_lock,
            path,
            wal_path,
            file,
            mapping: RwLock::new(mapping),
            bucket_locks: BucketLocks::new(),
            state: Mutex::new(FileState {
                record_count: 0,
                file_size: first_record_offset,
                free_pool: FreePool::new(config.free_pool_power),
            }),
            wal: Mutex::new(None),
            tran_cv: Condvar::new(),
            codec,
            large: config.large,
            alignment_power: config.alignment_power,
            free_pool_power: config.free_pool_power,
            bucket_count: config.bucket_count,
            first_record_offset,
            mmap_threshold: config.mmap_threshold,
            readonly: false,
            defrag_unit: config.defrag_unit,
            writes_since_defrag: AtomicUsize::new(0),
        })
    }

    /// Opens an existing record file at `path`.
    pub fn open<P: AsRef<Path>>(path: P, codec: Box<dyn Codec>, readonly: bool, mmap_threshold: u64) -> Result<RecordFile> {
        let path = path.as_ref().to_path_buf();
        let lock_path = lock_path_for(&path);
        let path_lock = PathLock::acquire(&lock_path, false)?;

        let file = OpenOptions::new().read(true).write(!readonly).open(&path)?;
        let mut header_buf = vec![0u8; HEADER_LEN];
        file.read_at(&mut header_buf, 0)?;
        let header = read_header(&header_buf)?;

        let large = header.option_bits & OPT_LARGE != 0;
        let wal_path = wal_path_for(&path);

        let mapping = Mapping::open(&path)?;

        let mut file_size = header.file_size;

        let mut record_file = RecordFile {
            path_lock,
            path: path.clone(),
            wal_path: wal_path.clone(),
            file,
            mapping: RwLock::new(mapping),
            bucket_locks: BucketLocks::new(),
            state: Mutex::new(FileState {
                record_count: header.record_count,
                file_size,
                free_pool: FreePool::new(header.free_pool_power),
            }),
            wal: Mutex::new(None),
            tran_cv: Condvar::new(),
            codec,
            large,
            alignment_power: header.alignment_power,
            free_pool_power: header.free_pool_power,
            bucket_count: header.bucket_count,
            first_record_offset: header.first_record_offset,
            mmap_threshold,
            readonly,
            defrag_unit: 0,
            writes_since_defrag: AtomicUsize::new(0),
        };

        if header.flags & FLAG_OPENED_DIRTY != 0 && !readonly {
            let recovered = Wal::recover_if_present(&wal_path, |offset, bytes| {
                record_file.write_at_raw(offset, bytes)
            })?;
            if let Some(initial_size) = recovered {
                record_file.file.set_len(initial_size)?;
                file_size = initial_size;
            }
            let mut state = record_file.state.lock();
            state.file_size = file_size;
            drop(state);
            record_file.set_dirty_flag(false)?;
        }

        let free_pool_bytes = record_file.read_at(
            HEADER_LEN as u64 + record_file.bucket_count * bucket_entry_width(large) as u64,
            free_pool_region_len(header.free_pool_power) as usize,
        )?;
        let free_pool = FreePool::deserialize(&free_pool_bytes, header.free_pool_power);
        record_file.state.lock().free_pool = free_pool;

        Ok(record_file)
    }

    /// Closes the file: serializes the free-block pool into the header
    /// gap, writes the header, and flushes the mapping.
    pub fn close(&self) -> Result<()> {
        if self.readonly {
            return Ok(());
        }
        let state = self.state.lock();
        let pool_bytes = state.free_pool.serialize();
        let pool_offset = HEADER_LEN as u64 + self.bucket_count * bucket_entry_width(self.large) as u64;
        self.write_at_raw(pool_offset, &pool_bytes)?;

        let mut header_buf = vec![0u8; HEADER_LEN];
        self.file.read_at(&mut header_buf, 0)?;
        let mut header = read_header(&header_buf)?;
        header.record_count = state.record_count;
        header.file_size = state.file_size;
        write_header(&mut header_buf, header);
        self.write_at_raw(0, &header_buf)?;
        drop(state);

        self.mapping.read().flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Current record count.
    pub fn count(&self) -> u64 {
        self.state.lock().record_count
    }

    fn set_dirty_flag(&self, dirty: bool) -> Result<()> {
        let mut header_buf = vec![0u8; HEADER_LEN];
        self.file.read_at(&mut header_buf, 0)?;
        let mut header = read_header(&header_buf)?;
        if dirty {
            header.flags |= FLAG_OPENED_DIRTY;
        } else {
            header.flags &= !FLAG_OPENED_DIRTY;
        }
        write_header(&mut header_buf, header);
        self.write_at_raw(0, &header_buf)?;
        self.file.sync_all()?;
        Ok(())
    }

    #[allow(dead_code)]
    fn mark_fatal(&self, what: &str) -> ::error::Error {
        let _ = (|| -> Result<()> {
            let mut header_buf = vec![0u8; HEADER_LEN];
            self.file.read_at(&mut header_buf, 0)?;
            let mut header = read_header(&header_buf)?;
            header.flags |= FLAG_FATAL;
            write_header(&mut header_buf, header);
            self.write_at_raw(0, &header_buf)?;
            Ok(())
        })();
        ErrorKind::Fatal(what.to_owned()).into()
    }

    // ---- low-level byte access ----

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mapping = self.mapping.read();
        let mapped_len = self.mmap_threshold.min(mapping.len() as u64);
        if offset + len as u64 <= mapped_len {
            let slice = unsafe { mapping.as_slice() };
            Ok(slice[offset as usize..offset as usize + len].to_vec())
        } else {
            drop(mapping);
            let mut buf = vec![0u8; len];
            self.file.read_at(&mut buf, offset)?;
            Ok(buf)
        }
    }

    fn write_at_raw(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mapping = self.mapping.read();
        let mapped_len = self.mmap_threshold.min(mapping.len() as u64);
        if offset + data.len() as u64 <= mapped_len {
            let slice = unsafe { mapping.as_mut_slice() };
            slice[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        } else {
            drop(mapping);
            self.file.write_at(data, offset)?;
        }
        Ok(())
    }

    /// Writes through the WAL when a transaction is open: stages the
    /// current bytes at `offset` before overwriting them.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut wal_guard = self.wal.lock();
        if let Some(ref mut wal) = *wal_guard {
            let old = self.read_at(offset, data.len())?;
            wal.record_preimage(offset, &old);
            wal.checkpoint()?;
        }
        drop(wal_guard);
        self.write_at_raw(offset, data)
    }

    fn grow_file(&self, new_size: u64) -> Result<()> {
        self.file.set_len(new_size)?;
        let mut mapping = self.mapping.write();
        mapping.grow_to(&self.file, new_size as usize)?;
        Ok(())
    }

    fn bucket_offset(&self, bucket_index: u64) -> u64 {
        HEADER_LEN as u64 + bucket_index * bucket_entry_width(self.large) as u64
    }

    fn read_bucket(&self, bucket_index: u64) -> Result<u64> {
        let raw = self.read_at(self.bucket_offset(bucket_index), bucket_entry_width(self.large))?;
        Ok(decode_offset(&raw, self.large) << self.alignment_power)
    }

    fn write_bucket(&self, bucket_index: u64, offset: u64) -> Result<()> {
        let shifted = offset >> self.alignment_power;
        let encoded = encode_offset(shifted, self.large);
        self.write_at(self.bucket_offset(bucket_index), &encoded)
    }

    // ---- record read/write ----

    fn read_record_header(&self, offset: u64) -> Result<(RecordHeader, usize)> {
        let probe_len = header::max_fixed_header_len(self.large);
        let probe = self.read_at(offset, probe_len)?;
        RecordHeader::decode(&probe, self.large, offset)
    }

    fn read_record(&self, offset: u64) -> Result<(RecordHeader, usize, Vec<u8>, Vec<u8>)> {
        let (rh, body_start) = self.read_record_header(offset)?;
        let needed = body_start as u64 + rh.key_len + rh.value_len;
        let probe_len = header::max_fixed_header_len(self.large);
        let full = if needed as usize <= probe_len {
            self.read_at(offset, probe_len)?
        } else {
            self.read_at(offset, needed as usize)?
        };
        let key = full[body_start..body_start + rh.key_len as usize].to_vec();
        let value_start = body_start + rh.key_len as usize;
        let value = full[value_start..value_start + rh.value_len as usize].to_vec();
        Ok((rh, body_start, key, value))
    }

    fn write_record_at(&self, offset: u64, rh: &RecordHeader, key: &[u8], value: &[u8]) -> Result<()> {
        let encoded = rh.encode(self.large, key, value);
        self.write_at(offset, &encoded)
    }

    // ---- free space ----

    fn allocate_slot(&self, required: u64) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(block) = state.free_pool.allocate(required) {
            return Ok(block.offset);
        }
        state.free_pool.note_miss();
        let offset = align_up(state.file_size, self.alignment_power);
        let new_size = offset + required;
        drop(state);
        self.grow_file(new_size)?;
        let mut state = self.state.lock();
        state.file_size = new_size;
        Ok(offset)
    }

    fn free_slot(&self, offset: u64, size: u64) -> Result<()> {
        let fh = FreeHeader { size: size as u32 };
        let encoded = fh.encode();
        self.write_at(offset, &encoded)?;
        let mut state = self.state.lock();
        state.free_pool.insert(offset, size);
        Ok(())
    }

    // ---- public operations ----

    /// Point lookup. Returns the stored value bytes (post-codec-decode),
    /// or `None` if absent.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let bucket_index = key::h1(key, self.bucket_count);
        let h2 = key::h2(key);
        let _guard = self.bucket_locks.for_bucket(bucket_index).read();
        let root = self.read_bucket(bucket_index)?;
        let mut tree_io = TreeAdapter { store: self };
        match collision_tree::find(&mut tree_io, root, h2, key)? {
            None => Ok(None),
            Some(offset) => {
                let (_, _, _, value) = self.read_record(offset)?;
                Ok(Some(self.codec.decode(&value)?))
            }
        }
    }

    /// Inserts, replaces, or combines a value under `key`, per `mode`.
    pub fn put(&self, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
        if self.readonly {
            return Err(ErrorKind::Invalid("record file opened read-only".into()).into());
        }
        let bucket_index = key::h1(key, self.bucket_count);
        let h2 = key::h2(key);
        let _guard = self.bucket_locks.for_bucket(bucket_index).write();
        let root = self.read_bucket(bucket_index)?;
        let mut tree_io = TreeAdapter { store: self };
        let found = collision_tree::find(&mut tree_io, root, h2, key)?;

        let encoded_value = self.codec.encode(value)?;

        match found {
            Some(offset) => self.put_existing(bucket_index, root, offset, key, h2, &encoded_value, mode),
            None => {
                let to_insert = match mode {
                    PutMode::Proc(ref proc) => match proc.resolve(&[]) {
                        DupAction::Keep | DupAction::Drop => return Ok(()),
                        DupAction::Replace(bytes) => bytes,
                    },
                    _ => encoded_value,
                };
                self.insert_new(bucket_index, root, key, h2, &to_insert)
            }
        }
    }

    fn insert_new(&self, bucket_index: u64, root: u64, key: &[u8], h2: u8, value: &[u8]) -> Result<()> {
        let rh = RecordHeader {
            h2,
            left: NO_CHILD,
            right: NO_CHILD,
            padding: 0,
            key_len: key.len() as u64,
            value_len: value.len() as u64,
        };
        let needed = rh.encode(self.large, key, value).len() as u64;
        let slot_offset = self.allocate_slot(needed)?;
        self.write_record_at(slot_offset, &rh, key, value)?;

        let mut tree_io = TreeAdapter { store: self };
        let new_root = collision_tree::insert(&mut tree_io, root, slot_offset, h2, key)?;
        if new_root != root {
            self.write_bucket(bucket_index, new_root)?;
        }
        self.state.lock().record_count += 1;
        self.note_write();
        Ok(())
    }

    fn put_existing(
        &self,
        bucket_index: u64,
        root: u64,
        offset: u64,
        key: &[u8],
        h2: u8,
        new_value: &[u8],
        mode: PutMode,
    ) -> Result<()> {
        let (old_rh, body_start, old_key, old_value) = self.read_record(offset)?;
        let old_total = old_rh.total_len(body_start);

        let resolved: Option<Vec<u8>> = match mode {
            PutMode::Overwrite => Some(new_value.to_vec()),
            PutMode::Keep => return Err(ErrorKind::KeepErr.into()),
            PutMode::Concat => {
                let mut combined = old_value.clone();
                combined.extend_from_slice(new_value);
                Some(combined)
            }
            PutMode::AddInt => {
                if old_value.len() != 8 || new_value.len() != 8 {
                    return Err(ErrorKind::Overflow("ADDINT requires 8-byte operands".into()).into());
                }
                let a = LittleEndian::read_i64(&old_value);
                let b = LittleEndian::read_i64(new_value);
                let mut buf = [0u8; 8];
                LittleEndian::write_i64(&mut buf, a.wrapping_add(b));
                Some(buf.to_vec())
            }
            PutMode::AddDbl => {
                if old_value.len() != 8 || new_value.len() != 8 {
                    return Err(ErrorKind::Overflow("ADDDBL requires 8-byte operands".into()).into());
                }
                let a = LittleEndian::read_f64(&old_value);
                let b = LittleEndian::read_f64(new_value);
                let mut buf = [0u8; 8];
                LittleEndian::write_f64(&mut buf, a + b);
                Some(buf.to_vec())
            }
            PutMode::Proc(ref proc) => match proc.resolve(&old_value) {
                DupAction::Keep => return Err(ErrorKind::KeepErr.into()),
                DupAction::Drop => None,
                DupAction::Replace(bytes) => Some(bytes),
            },
        };

        let new_value = match resolved {
            Some(v) => v,
            None => return self.delete_at(bucket_index, root, offset, key, h2, &old_rh),
        };

        let mut new_rh = RecordHeader {
            h2: old_rh.h2,
            left: old_rh.left,
            right: old_rh.right,
            padding: 0,
            key_len: old_key.len() as u64,
            value_len: new_value.len() as u64,
        };
        let needed = new_rh.encode(self.large, &old_key, &new_value).len() as u64;

        if needed <= old_total {
            new_rh.padding = (old_total - needed) as u32;
            self.write_record_at(offset, &new_rh, &old_key, &new_value)?;
            self.note_write();
            return Ok(());
        }

        // Doesn't fit: relocate. Remove the old node, free its slot, and
        // insert a fresh node at a newly allocated offset carrying the
        // same children (delete-then-insert keeps the collision-tree
        // ordering algorithms as the single source of truth).
        let mut tree_io = TreeAdapter { store: self };
        let (root_after_delete, removed) = collision_tree::delete(&mut tree_io, root, h2, key)?;
        debug_assert!(removed.is_some());
        self.free_slot(offset, old_total)?;

        let slot_offset = self.allocate_slot(needed)?;
        new_rh.padding = 0;
        new_rh.left = NO_CHILD;
        new_rh.right = NO_CHILD;
        self.write_record_at(slot_offset, &new_rh, &old_key, &new_value)?;

        let mut tree_io = TreeAdapter { store: self };
        let new_root = collision_tree::insert(&mut tree_io, root_after_delete, slot_offset, h2, key)?;
        self.write_bucket(bucket_index, new_root)?;
        self.note_write();
        Ok(())
    }

    fn delete_at(
        &self,
        bucket_index: u64,
        root: u64,
        offset: u64,
        key: &[u8],
        h2: u8,
        old_rh: &RecordHeader,
    ) -> Result<()> {
        let (_, body_start, _, _) = self.read_record(offset)?;
        let total = old_rh.total_len(body_start);
        let mut tree_io = TreeAdapter { store: self };
        let (new_root, removed) = collision_tree::delete(&mut tree_io, root, h2, key)?;
        if removed.is_none() {
            return Ok(());
        }
        if new_root != root {
            self.write_bucket(bucket_index, new_root)?;
        }
        self.free_slot(offset, total)?;
        self.state.lock().record_count -= 1;
        self.note_write();
        Ok(())
    }

    /// Removes the record under `key`, if present. Returns whether it was
    /// removed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        if self.readonly {
            return Err(ErrorKind::Invalid("record file opened read-only".into()).into());
        }
        let bucket_index = key::h1(key, self.bucket_count);
        let h2 = key::h2(key);
        let _guard = self.bucket_locks.for_bucket(bucket_index).write();
        let root = self.read_bucket(bucket_index)?;
        let mut tree_io = TreeAdapter { store: self };
        let offset = match collision_tree::find(&mut tree_io, root, h2, key)? {
            Some(o) => o,
            None => return Ok(false),
        };
        let (rh, _, _, _) = self.read_record(offset)?;
        self.delete_at(bucket_index, root, offset, key, h2, &rh)?;
        Ok(true)
    }

    /// Iterates every live record in physical (file-offset) order, which
    /// for a store with little churn approximates insertion order (the
    /// ordering spec §4.G's "full-scan" driver relies on).
    pub fn iter_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let _guards = self.bucket_locks.read_all();
        let file_size = self.state.lock().file_size;
        let mut out = Vec::new();
        let mut offset = self.first_record_offset;
        while offset < file_size {
            let peek = self.read_at(offset, 1)?;
            if peek.is_empty() {
                break;
            }
            match peek[0] {
                header::MAGIC_RECORD => {
                    let (rh, body_start, key, value) = self.read_record(offset)?;
                    let total = rh.total_len(body_start);
                    out.push((key, self.codec.decode(&value)?));
                    offset += total;
                }
                header::MAGIC_FREE => {
                    let fh_bytes = self.read_at(offset, FreeHeader::ENCODED_LEN)?;
                    let fh = FreeHeader::decode(&fh_bytes, offset)?;
                    offset += u64::from(fh.size);
                }
                _ => break,
            }
        }
        Ok(out)
    }

    fn note_write(&self) {
        if self.defrag_unit == 0 {
            return;
        }
        let count = self.writes_since_defrag.fetch_add(1, Ordering::Relaxed) + 1;
        if count as u64 >= self.defrag_unit {
            self.writes_since_defrag.store(0, Ordering::Relaxed);
            let _ = self.defragment_step();
        }
    }

    /// Runs one defragmentation step: physically shifts every live record
    /// down to close the gaps free blocks have left, then replaces the
    /// fragmented free-block pool with a single trailing free block
    /// covering the reclaimed space (spec §4.A "defragmentation ... shifts
    /// live records downward to reclaim trailing free space ... for
    /// reuse"). Relocation touches the whole file, so every bucket lock is
    /// held exclusive for the duration.
    pub fn defragment_step(&self) -> Result<()> {
        let _guards = self.bucket_locks.write_all();
        self.compact()
    }

    fn compact(&self) -> Result<()> {
        struct Live {
            old_offset: u64,
            rh: RecordHeader,
            key: Vec<u8>,
            value: Vec<u8>,
        }

        let file_size = self.state.lock().file_size;

        let mut live = Vec::new();
        let mut offset = self.first_record_offset;
        while offset < file_size {
            let peek = self.read_at(offset, 1)?;
            if peek.is_empty() {
                break;
            }
            match peek[0] {
                header::MAGIC_RECORD => {
                    let (rh, body_start, key, value) = self.read_record(offset)?;
                    let total = rh.total_len(body_start);
                    live.push(Live { old_offset: offset, rh, key, value });
                    offset += total;
                }
                header::MAGIC_FREE => {
                    let fh_bytes = self.read_at(offset, FreeHeader::ENCODED_LEN)?;
                    let fh = FreeHeader::decode(&fh_bytes, offset)?;
                    offset += u64::from(fh.size);
                }
                _ => break,
            }
        }

        // Decide every record's new offset up front, so child pointers and
        // bucket roots (which reference old offsets) can be remapped in a
        // second pass, after the first has established the full mapping.
        let mut offset_map = ::std::collections::HashMap::with_capacity(live.len());
        let mut placements = Vec::with_capacity(live.len());
        let mut running = self.first_record_offset;
        for entry in &live {
            let unpadded_rh = RecordHeader { padding: 0, ..entry.rh };
            let unpadded = unpadded_rh.encode(self.large, &entry.key, &entry.value).len() as u64;
            let aligned_total = align_up(unpadded, self.alignment_power);
            offset_map.insert(entry.old_offset, running);
            placements.push((running, unpadded, aligned_total));
            running += aligned_total;
        }

        let remap = |child: u64| -> u64 {
            if child == NO_CHILD {
                NO_CHILD
            } else {
                *offset_map.get(&child).unwrap_or(&child)
            }
        };

        for (entry, &(new_offset, unpadded, aligned_total)) in live.iter().zip(placements.iter()) {
            let mut rh = entry.rh;
            rh.left = remap(rh.left);
            rh.right = remap(rh.right);
            rh.padding = (aligned_total - unpadded) as u32;
            self.write_record_at(new_offset, &rh, &entry.key, &entry.value)?;
        }

        for bucket_index in 0..self.bucket_count {
            let root = self.read_bucket(bucket_index)?;
            if root == NO_CHILD {
                continue;
            }
            let new_root = remap(root);
            if new_root != root {
                self.write_bucket(bucket_index, new_root)?;
            }
        }

        // The old free-block pool tracked offsets inside the region that
        // now holds tightly-packed relocated records; none of it is valid
        // any more. Live mappings can't safely shrink without a
        // close/reopen (see `Mapping::grow_to`), so the reclaimed trailing
        // span becomes one consolidated free block instead of shrinking
        // the file itself.
        {
            let mut state = self.state.lock();
            state.free_pool = FreePool::new(self.free_pool_power);
        }
        if running < file_size {
            let reclaimed = file_size - running;
            if reclaimed >= FreeHeader::ENCODED_LEN as u64 {
                self.free_slot(running, reclaimed)?;
            }
        }

        Ok(())
    }

    /// Begins a transaction: opens the WAL, recording the current file
    /// size as the pre-transaction universe boundary. A nested begin
    /// blocks until the outer transaction commits or aborts rather than
    /// erroring, matching `ejdbtranbegin`'s retry-until-free behavior.
    pub fn begin_transaction(&self) -> Result<()> {
        let mut wal_guard = self.wal.lock();
        while wal_guard.is_some() {
            self.tran_cv.wait(&mut wal_guard);
        }
        let initial_size = self.state.lock().file_size;
        *wal_guard = Some(Wal::begin(&self.wal_path, initial_size)?);
        drop(wal_guard);
        self.set_dirty_flag(true)
    }

    /// Commits the open transaction: truncates (removes) the WAL, then
    /// fsyncs the data file, per the spec's commit-point ordering.
    pub fn commit_transaction(&self) -> Result<()> {
        let mut wal_guard = self.wal.lock();
        let wal = wal_guard
            .take()
            .ok_or_else(|| -> ::error::Error { ErrorKind::Transaction("no open transaction".into()).into() })?;
        self.tran_cv.notify_all();
        drop(wal_guard);
        wal.commit()?;
        self.file.sync_all()?;
        self.set_dirty_flag(false)
    }

    /// Aborts the open transaction: replays every recorded pre-image in
    /// reverse, truncates the file back to its pre-transaction size, and
    /// reloads in-memory state from disk.
    pub fn abort_transaction(&self) -> Result<()> {
        let mut wal_guard = self.wal.lock();
        let wal = wal_guard
            .take()
            .ok_or_else(|| -> ::error::Error { ErrorKind::Transaction("no open transaction".into()).into() })?;
        self.tran_cv.notify_all();
        drop(wal_guard);
        let initial_size = wal.abort(|offset, bytes| self.write_at_raw(offset, bytes))?;
        self.file.set_len(initial_size)?;
        self.state.lock().file_size = initial_size;
        self.set_dirty_flag(false)
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        self.wal.lock().is_some()
    }

    /// Fsyncs the underlying file.
    pub fn sync(&self) -> Result<()> {
        self.mapping.read().flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

struct TreeAdapter<'a> {
    store: &'a RecordFile,
}

impl<'a> TreeIo for TreeAdapter<'a> {
    fn read_node(&mut self, offset: u64) -> Result<NodeInfo> {
        let (rh, _, key, _) = self.store.read_record(offset)?;
        Ok(NodeInfo {
            h2: rh.h2,
            key,
            left: rh.left,
            right: rh.right,
        })
    }

    fn write_children(&mut self, offset: u64, left: u64, right: u64) -> Result<()> {
        let (mut rh, body_start, key, value) = self.store.read_record(offset)?;
        rh.left = left;
        rh.right = right;
        // Children live in the fixed portion of the header; rewriting them
        // never changes the record's total length, so this is always an
        // in-place write of just the touched bytes for efficiency... but
        // for correctness (and to keep `write_at`'s WAL journaling simple)
        // we just re-encode and rewrite the whole record.
        let _ = body_start;
        self.store.write_record_at(offset, &rh, &key, &value)
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".lock");
    PathBuf::from(p)
}

fn wal_path_for(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".wal");
    PathBuf::from(p)
}

#[derive(Clone, Copy)]
struct HeaderFields {
    db_type: u8,
    flags: u8,
    alignment_power: u8,
    free_pool_power: u8,
    option_bits: u32,
    bucket_count: u64,
    record_count: u64,
    file_size: u64,
    first_record_offset: u64,
}

fn write_header(buf: &mut [u8], fields: HeaderFields) {
    for b in buf[0..32].iter_mut() {
        *b = 0;
    }
    let banner_len = MAGIC_BANNER.len().min(32);
    buf[0..banner_len].copy_from_slice(&MAGIC_BANNER[..banner_len]);
    buf[32] = fields.db_type;
    buf[33] = fields.flags;
    buf[34] = fields.alignment_power;
    buf[35] = fields.free_pool_power;
    LittleEndian::write_u32(&mut buf[36..40], fields.option_bits);
    LittleEndian::write_u64(&mut buf[40..48], fields.bucket_count);
    LittleEndian::write_u64(&mut buf[48..56], fields.record_count);
    LittleEndian::write_u64(&mut buf[56..64], fields.file_size);
    LittleEndian::write_u64(&mut buf[64..72], fields.first_record_offset);
    for b in buf[128..256].iter_mut() {
        *b = 0;
    }
}

fn read_header(buf: &[u8]) -> Result<HeaderFields> {
    if buf.len() < HEADER_LEN {
        return Err(ErrorKind::HeaderMismatch("truncated header".into()).into());
    }
    let banner_len = MAGIC_BANNER.len().min(32);
    if &buf[0..banner_len] != &MAGIC_BANNER[..banner_len] {
        return Err(ErrorKind::HeaderMismatch("magic mismatch".into()).into());
    }
    Ok(HeaderFields {
        db_type: buf[32],
        flags: buf[33],
        alignment_power: buf[34],
        free_pool_power: buf[35],
        option_bits: LittleEndian::read_u32(&buf[36..40]),
        bucket_count: LittleEndian::read_u64(&buf[40..48]),
        record_count: LittleEndian::read_u64(&buf[48..56]),
        file_size: LittleEndian::read_u64(&buf[56..64]),
        first_record_offset: LittleEndian::read_u64(&buf[64..72]),
    })
}

fn encode_offset(value: u64, large: bool) -> Vec<u8> {
    if large {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        buf.to_vec()
    } else {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value as u32);
        buf.to_vec()
    }
}

fn decode_offset(data: &[u8], large: bool) -> u64 {
    if large {
        LittleEndian::read_u64(data)
    } else {
        u64::from(LittleEndian::read_u32(data))
    }
}
