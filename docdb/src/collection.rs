//! A single collection: one record file of documents plus zero or more
//! secondary indexes over it (spec §4.C).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bson::Document;
use parking_lot::RwLock;

use codec::{Codec, NoopCodec};
use error::Result;
use fold::Fold;
use index::{IndexFile, IndexType};
use metadata::{self, MetadataCollection};
use oid::ObjectId;
use options::CollectionOptions;
use record::regions::{self, Regions};
use record::store::{PutMode, RecordFile, RecordFileConfig};
use value;

const DOC_REGION: &str = "$";

fn collection_record_path(base_path: &Path, name: &str) -> PathBuf {
    let mut s = base_path.as_os_str().to_owned();
    s.push("_");
    s.push(name);
    PathBuf::from(s)
}

fn index_file_path(base_path: &Path, name: &str, path: &str, index_type: IndexType) -> PathBuf {
    let mut s = base_path.as_os_str().to_owned();
    s.push("_");
    s.push(name);
    s.push(".idx.");
    s.push(index_type.tag());
    s.push(path);
    PathBuf::from(s)
}

fn codec_for(_options: &CollectionOptions) -> Box<dyn Codec> {
    // `CollectionOptions::compressed` reserves the option bit for a real
    // compressing codec; none is wired up yet, so values pass through
    // unchanged regardless of the flag (see DESIGN.md).
    Box::new(NoopCodec)
}

/// One named collection of documents, with its secondary indexes.
pub struct Collection {
    name: String,
    base_path: PathBuf,
    record: RecordFile,
    indexes: RwLock<HashMap<(String, IndexType), IndexFile>>,
    fold: Arc<dyn Fold>,
    options: CollectionOptions,
}

impl Collection {
    /// Creates a brand new, empty collection and records its tuning in
    /// `metadata`.
    pub fn create(
        base_path: &Path,
        name: &str,
        options: CollectionOptions,
        fold: Arc<dyn Fold>,
        metadata: &MetadataCollection,
    ) -> Result<Collection> {
        let record_path = collection_record_path(base_path, name);
        let config = RecordFileConfig {
            bucket_count: options.bucket_count(),
            large: options.large,
            ..RecordFileConfig::default()
        };
        let record = RecordFile::create(&record_path, codec_for(&options), config)?;

        let mut opts_doc = Document::new();
        opts_doc.insert("records", options.records as i64);
        opts_doc.insert("cached_records", options.cached_records as i64);
        opts_doc.insert("large", options.large);
        opts_doc.insert("compressed", options.compressed);
        metadata.put(name, "opts", opts_doc, false, true)?;

        Ok(Collection {
            name: name.to_owned(),
            base_path: base_path.to_path_buf(),
            record,
            indexes: RwLock::new(HashMap::new()),
            fold,
            options,
        })
    }

    /// Opens an existing collection, re-opening every secondary index
    /// declared for it in `metadata`.
    pub fn open(
        base_path: &Path,
        name: &str,
        options: CollectionOptions,
        fold: Arc<dyn Fold>,
        readonly: bool,
        metadata: &MetadataCollection,
    ) -> Result<Collection> {
        let record_path = collection_record_path(base_path, name);
        let record = RecordFile::open(&record_path, codec_for(&options), readonly, 64 * 1024 * 1024)?;

        let mut indexes = HashMap::new();
        for (path, doc) in metadata.indexes(name)? {
            let tag = doc.get_str("type").unwrap_or("lex");
            let index_type = IndexType::from_tag(tag).unwrap_or(IndexType::Lex);
            let index_path = index_file_path(base_path, name, &path, index_type);
            let index = IndexFile::open(&index_path, index_type, fold.clone(), readonly)?;
            indexes.insert((path, index_type), index);
        }

        Ok(Collection {
            name: name.to_owned(),
            base_path: base_path.to_path_buf(),
            record,
            indexes: RwLock::new(indexes),
            fold,
            options,
        })
    }

    /// This collection's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn decode_doc(blob: &[u8]) -> Result<Option<Document>> {
        let regions = regions::decode(blob);
        match regions.get(DOC_REGION) {
            Some(bytes) => Ok(Some(metadata::doc_from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Loads a document by id.
    pub fn load(&self, oid: ObjectId) -> Result<Option<Document>> {
        match self.record.get(oid.as_bytes())? {
            Some(blob) => Self::decode_doc(&blob),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a document. If `doc` has no `"_id"` field, a
    /// fresh `ObjectId` is generated and stored back into it. When `merge`
    /// is true and a document already exists under the id, `doc`'s
    /// top-level fields overlay the old document rather than replacing it
    /// wholesale (spec §4.C `save(doc, merge?)`). Returns the document's id.
    pub fn save(&self, mut doc: Document, merge: bool) -> Result<ObjectId> {
        let oid = match doc.get_str("_id").ok().map(|s| s.to_owned()) {
            Some(text) => ObjectId::parse_hex(&text)?,
            None => {
                let fresh = ObjectId::new();
                doc.insert("_id", fresh.to_hex());
                fresh
            }
        };
        let key = *oid.as_bytes();

        let old_doc = match self.record.get(&key)? {
            Some(old_blob) => Self::decode_doc(&old_blob)?,
            None => None,
        };
        if let Some(ref old) = old_doc {
            self.remove_from_indexes(old, oid)?;
        }

        let final_doc = if merge {
            match old_doc {
                Some(mut old) => {
                    for (k, v) in doc.into_iter() {
                        old.insert(k, v);
                    }
                    old
                }
                None => doc,
            }
        } else {
            doc
        };

        let mut regions: Regions = Regions::new();
        regions.insert(DOC_REGION.to_owned(), metadata::doc_to_bytes(&final_doc)?);
        self.record.put(&key, &regions::encode(&regions), PutMode::Overwrite)?;
        self.add_to_indexes(&final_doc, oid)?;
        Ok(oid)
    }

    /// Removes a document by id. Returns whether it was present.
    pub fn remove(&self, oid: ObjectId) -> Result<bool> {
        let key = *oid.as_bytes();
        let blob = match self.record.get(&key)? {
            Some(b) => b,
            None => return Ok(false),
        };
        if let Some(doc) = Self::decode_doc(&blob)? {
            self.remove_from_indexes(&doc, oid)?;
        }
        self.record.delete(&key)?;
        Ok(true)
    }

    fn add_to_indexes(&self, doc: &Document, oid: ObjectId) -> Result<()> {
        for ((path, _type), index) in self.indexes.read().iter() {
            for v in value::collect_values_at_path(doc, path) {
                index.add(&v, oid)?;
            }
        }
        Ok(())
    }

    fn remove_from_indexes(&self, doc: &Document, oid: ObjectId) -> Result<()> {
        for ((path, _type), index) in self.indexes.read().iter() {
            for v in value::collect_values_at_path(doc, path) {
                index.remove(&v, oid)?;
            }
        }
        Ok(())
    }

    /// Declares (and, if newly created, backfills) a secondary index on
    /// `path` using `index_type`.
    pub fn setindex(&self, path: &str, index_type: IndexType, metadata: &MetadataCollection) -> Result<()> {
        let key = (path.to_owned(), index_type);
        if self.indexes.read().contains_key(&key) {
            return Ok(());
        }
        let index_path = index_file_path(&self.base_path, &self.name, path, index_type);
        let index = IndexFile::create(&index_path, index_type, self.fold.clone())?;
        for (_, blob) in self.record.iter_all()? {
            if let Some(doc) = Self::decode_doc(&blob)? {
                if let Some(oid) = doc.get_str("_id").ok().and_then(|s| ObjectId::parse_hex(s).ok()) {
                    for v in value::collect_values_at_path(&doc, path) {
                        index.add(&v, oid)?;
                    }
                }
            }
        }
        self.indexes.write().insert(key, index);

        let mut region_doc = Document::new();
        region_doc.insert("type", index_type.tag());
        metadata.put(&self.name, &metadata::index_region(path), region_doc, false, true)?;
        Ok(())
    }

    /// Drops a previously declared secondary index.
    pub fn dropindex(&self, path: &str, index_type: IndexType, metadata: &MetadataCollection) -> Result<()> {
        let key = (path.to_owned(), index_type);
        if let Some(index) = self.indexes.write().remove(&key) {
            index.close()?;
        }
        metadata.remove_region(&self.name, &metadata::index_region(path))
    }

    /// Every `(path, type)` pair with a live secondary index, along with
    /// rough cardinality stats the planner uses for selectivity scoring.
    pub fn available_indexes(&self) -> Vec<(String, IndexType, usize, usize)> {
        self.indexes
            .read()
            .iter()
            .map(|((path, t), idx)| (path.clone(), *t, idx.key_count(), idx.entry_count()))
            .collect()
    }

    /// Exact-match lookup via a declared index.
    pub fn index_scan_eq(&self, path: &str, index_type: IndexType, key: &[u8]) -> Option<Vec<ObjectId>> {
        self.indexes
            .read()
            .get(&(path.to_owned(), index_type))
            .map(|idx| idx.scan_eq(key))
    }

    /// Range scan via a declared index, in key order (or reverse).
    pub fn index_scan_range(
        &self,
        path: &str,
        index_type: IndexType,
        lower: Option<(&[u8], bool)>,
        upper: Option<(&[u8], bool)>,
        ascending: bool,
    ) -> Option<Vec<(Vec<u8>, ObjectId)>> {
        self.indexes
            .read()
            .get(&(path.to_owned(), index_type))
            .map(|idx| idx.scan_range(lower, upper, ascending))
    }

    /// Encodes a value the same way a given index type would, so callers
    /// (the query planner) can build scan bounds without reaching into
    /// `index::file` directly.
    pub fn encode_index_key(&self, path: &str, index_type: IndexType, value: &::bson::Bson) -> Vec<Vec<u8>> {
        match self.indexes.read().get(&(path.to_owned(), index_type)) {
            Some(idx) => idx.encode_keys(value),
            None => Vec::new(),
        }
    }

    /// Number of live documents.
    pub fn count(&self) -> u64 {
        self.record.count()
    }

    /// Every document, in approximate insertion order.
    pub fn iterate(&self) -> Result<Vec<(ObjectId, Document)>> {
        let mut out = Vec::new();
        for (key, blob) in self.record.iter_all()? {
            if key.len() != 12 {
                continue;
            }
            let mut bytes = [0u8; 12];
            bytes.copy_from_slice(&key);
            if let Some(doc) = Self::decode_doc(&blob)? {
                out.push((ObjectId::from_bytes(bytes), doc));
            }
        }
        Ok(out)
    }

    /// Begins a transaction across the document store and every open
    /// index, so index postings roll back together with document writes
    /// on abort (spec §4.C: index contents must stay consistent with the
    /// documents they were derived from).
    pub fn begin_transaction(&self) -> Result<()> {
        self.record.begin_transaction()?;
        for index in self.indexes.read().values() {
            index.begin_transaction()?;
        }
        Ok(())
    }

    /// Commits the open transaction on the document store and every index.
    pub fn commit_transaction(&self) -> Result<()> {
        for index in self.indexes.read().values() {
            index.commit_transaction()?;
        }
        self.record.commit_transaction()
    }

    /// Aborts the open transaction, rolling back document writes and index
    /// postings alike.
    pub fn abort_transaction(&self) -> Result<()> {
        for index in self.indexes.read().values() {
            index.abort_transaction()?;
        }
        self.record.abort_transaction()
    }

    /// Fsyncs the collection's document store and every open index.
    pub fn sync(&self) -> Result<()> {
        self.record.sync()?;
        for index in self.indexes.read().values() {
            index.sync()?;
        }
        Ok(())
    }

    /// Closes the collection's document store and every open index.
    pub fn close(&self) -> Result<()> {
        self.record.close()?;
        for index in self.indexes.read().values() {
            index.close()?;
        }
        Ok(())
    }

    /// Removes the collection's record file and every index file from disk.
    /// Callers must have already closed this collection.
    pub fn unlink_files(&self) -> Result<()> {
        let record_path = collection_record_path(&self.base_path, &self.name);
        let _ = ::std::fs::remove_file(&record_path);
        for (path, index_type) in self.indexes.read().keys() {
            let index_path = index_file_path(&self.base_path, &self.name, path, *index_type);
            let _ = ::std::fs::remove_file(&index_path);
        }
        Ok(())
    }
}
