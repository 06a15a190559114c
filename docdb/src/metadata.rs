//! The metadata collection (spec §4.D): a single record file, shared by
//! the whole database, storing one region-blob per collection name. Each
//! collection's blob holds a `"opts"` region (its `CollectionOptions`,
//! BSON-encoded) and one `"i<path>"` region per secondary index declared
//! on it (the index's type and tuning, not its contents — the index's own
//! record file holds those). On database open, every collection name
//! present here is opened automatically (spec §4.D "enumerate and open").

use std::io::Cursor;
use std::path::Path;

use bson::{decode_document, encode_document, Document};

use codec::NoopCodec;
use error::{Error, ErrorKind, Result};
use record::regions::{self, Regions};
use record::store::{PutMode, RecordFile, RecordFileConfig};

const OPTS_REGION: &str = "opts";

/// Encodes a BSON document to bytes.
pub fn doc_to_bytes(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_document(&mut buf, doc).map_err(|_| -> Error { ErrorKind::InvalidBson.into() })?;
    Ok(buf)
}

/// Decodes bytes previously produced by `doc_to_bytes`.
pub fn doc_from_bytes(bytes: &[u8]) -> Result<Document> {
    decode_document(&mut Cursor::new(bytes)).map_err(|_| ErrorKind::InvalidBson.into())
}

/// Name of the `"i<path>"` region for a secondary index on `path`.
pub fn index_region(path: &str) -> String {
    format!("i{}", path)
}

/// Per-database collection-metadata store.
pub struct MetadataCollection {
    record: RecordFile,
}

impl MetadataCollection {
    /// Creates a fresh, empty metadata store at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<MetadataCollection> {
        let record = RecordFile::create(
            path,
            Box::new(NoopCodec),
            RecordFileConfig {
                bucket_count: 64,
                ..RecordFileConfig::default()
            },
        )?;
        Ok(MetadataCollection { record })
    }

    /// Opens an existing metadata store.
    pub fn open<P: AsRef<Path>>(path: P, readonly: bool) -> Result<MetadataCollection> {
        let record = RecordFile::open(path, Box::new(NoopCodec), readonly, 64 * 1024 * 1024)?;
        Ok(MetadataCollection { record })
    }

    /// Every collection name with metadata on file, for the
    /// enumerate-and-open-all step on database open.
    pub fn collection_names(&self) -> Result<Vec<String>> {
        let entries = self.record.iter_all()?;
        Ok(entries
            .into_iter()
            .map(|(key, _)| String::from_utf8_lossy(&key).into_owned())
            .collect())
    }

    /// Reads one region of a collection's metadata blob.
    pub fn get(&self, coll_name: &str, region_key: &str) -> Result<Option<Document>> {
        let blob = self.record.get(coll_name.as_bytes())?;
        let blob = match blob {
            Some(b) => b,
            None => return Ok(None),
        };
        let regions = regions::decode(&blob);
        match regions.get(region_key) {
            Some(bytes) => Ok(Some(doc_from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes one region of a collection's metadata blob.
    ///
    /// `merge`: if a region already exists, the new document's fields are
    /// merged into (overlaid on) the existing one rather than replacing it
    /// wholesale. `overwrite`: if false and the region already exists (after
    /// any merge), the write is rejected with `ErrorKind::KeepErr`.
    pub fn put(&self, coll_name: &str, region_key: &str, doc: Document, merge: bool, overwrite: bool) -> Result<()> {
        let existing_blob = self.record.get(coll_name.as_bytes())?;
        let mut regions: Regions = existing_blob.as_ref().map(|b| regions::decode(b)).unwrap_or_default();

        if let Some(existing_bytes) = regions.get(region_key) {
            if !overwrite {
                return Err(ErrorKind::KeepErr.into());
            }
            if merge {
                let mut merged = doc_from_bytes(existing_bytes)?;
                for (k, v) in doc {
                    merged.insert(k, v);
                }
                regions.insert(region_key.to_owned(), doc_to_bytes(&merged)?);
            } else {
                regions.insert(region_key.to_owned(), doc_to_bytes(&doc)?);
            }
        } else {
            regions.insert(region_key.to_owned(), doc_to_bytes(&doc)?);
        }

        self.record.put(coll_name.as_bytes(), &regions::encode(&regions), PutMode::Overwrite)
    }

    /// Removes one region from a collection's metadata blob. If that was
    /// the last region, the collection's metadata entry is removed too.
    pub fn remove_region(&self, coll_name: &str, region_key: &str) -> Result<()> {
        let existing_blob = match self.record.get(coll_name.as_bytes())? {
            Some(b) => b,
            None => return Ok(()),
        };
        let mut regions = regions::decode(&existing_blob);
        regions.remove(region_key);
        if regions.is_empty() {
            self.record.delete(coll_name.as_bytes())?;
        } else {
            self.record.put(coll_name.as_bytes(), &regions::encode(&regions), PutMode::Overwrite)?;
        }
        Ok(())
    }

    /// Drops a collection's metadata entirely (the collection's own files
    /// are removed by the caller).
    pub fn remove_collection(&self, coll_name: &str) -> Result<()> {
        self.record.delete(coll_name.as_bytes())?;
        Ok(())
    }

    /// Every `(path, region-doc)` pair describing secondary indexes
    /// declared on `coll_name`.
    pub fn indexes(&self, coll_name: &str) -> Result<Vec<(String, Document)>> {
        let blob = match self.record.get(coll_name.as_bytes())? {
            Some(b) => b,
            None => return Ok(Vec::new()),
        };
        let regions = regions::decode(&blob);
        let mut out = Vec::new();
        for (region_key, bytes) in regions {
            if region_key == OPTS_REGION {
                continue;
            }
            if let Some(path) = region_key.strip_prefix('i') {
                out.push((path.to_owned(), doc_from_bytes(&bytes)?));
            }
        }
        Ok(out)
    }

    /// Fsyncs the underlying record file.
    pub fn sync(&self) -> Result<()> {
        self.record.sync()
    }

    /// Closes the underlying record file.
    pub fn close(&self) -> Result<()> {
        self.record.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oid::ObjectId;

    fn temp_path() -> ::std::path::PathBuf {
        ::std::env::temp_dir().join(format!("docdb-metadata-test-{}", ObjectId::new()))
    }

    #[test]
    fn put_and_get_region_round_trips() {
        let path = temp_path();
        let meta = MetadataCollection::create(&path).unwrap();
        let mut doc = Document::new();
        doc.insert("cached_records", 1000);
        meta.put("widgets", OPTS_REGION, doc.clone(), false, true).unwrap();
        let read_back = meta.get("widgets", OPTS_REGION).unwrap().unwrap();
        assert_eq!(read_back.get_i32("cached_records").unwrap(), 1000);
        assert_eq!(meta.collection_names().unwrap(), vec!["widgets".to_owned()]);
        let _ = ::std::fs::remove_file(&path);
        let _ = ::std::fs::remove_file(path.with_extension("lock"));
    }

    #[test]
    fn merge_overlays_fields_without_dropping_others() {
        let path = temp_path();
        let meta = MetadataCollection::create(&path).unwrap();
        let mut first = Document::new();
        first.insert("a", 1);
        first.insert("b", 2);
        meta.put("widgets", OPTS_REGION, first, false, true).unwrap();

        let mut second = Document::new();
        second.insert("b", 3);
        meta.put("widgets", OPTS_REGION, second, true, true).unwrap();

        let merged = meta.get("widgets", OPTS_REGION).unwrap().unwrap();
        assert_eq!(merged.get_i32("a").unwrap(), 1);
        assert_eq!(merged.get_i32("b").unwrap(), 3);
        let _ = ::std::fs::remove_file(&path);
        let _ = ::std::fs::remove_file(path.with_extension("lock"));
    }
}
