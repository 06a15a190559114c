//! The top-level database handle (spec §4, §6 "External interfaces").
//!
//! Owns the database-wide path lock, the metadata collection, and every
//! open `Collection`. On `open`, every collection name recorded in the
//! metadata store is opened eagerly (spec §4.D "enumerate and open").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bson::Document;
use parking_lot::RwLock;

use collection::Collection;
use error::{ErrorKind, Result};
use fold::{Fold, LowercaseFold};
use lock::PathLock;
use metadata::MetadataCollection;
use options::{CollectionOptions, OpenFlags, Options};
use query::executor::ScanOutcome;
use query::{compile, executor, project};

/// An open database: the metadata store plus every collection it names.
pub struct Database {
    base_path: PathBuf,
    options: Options,
    _path_lock: Option<PathLock>,
    metadata: MetadataCollection,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    fold: Arc<dyn Fold>,
}

impl Database {
    /// Creates a brand new, empty database at `path` (the metadata
    /// record file's path; collections live alongside it as `path_<name>`).
    pub fn create<P: AsRef<Path>>(path: P, options: Options) -> Result<Database> {
        options.validate()?;
        let base_path = path.as_ref().to_path_buf();
        let path_lock = open_path_lock(&base_path, &options)?;
        let metadata = MetadataCollection::create(&base_path)?;
        Ok(Database {
            base_path,
            options,
            _path_lock: path_lock,
            metadata,
            collections: RwLock::new(HashMap::new()),
            fold: Arc::new(LowercaseFold),
        })
    }

    /// Opens an existing database, or creates one first if `options.flags`
    /// includes `CREATE` and the metadata file is absent.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Database> {
        options.validate()?;
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            if !options.flags.contains(OpenFlags::CREATE) {
                return Err(ErrorKind::Invalid(format!("database does not exist: {}", base_path.display())).into());
            }
            return Database::create(base_path, options);
        }

        let path_lock = open_path_lock(&base_path, &options)?;
        let readonly = options.readonly();
        let metadata = MetadataCollection::open(&base_path, readonly)?;
        let fold: Arc<dyn Fold> = Arc::new(LowercaseFold);

        let mut collections = HashMap::new();
        for name in metadata.collection_names()? {
            debug!("opening collection {}", name);
            let coll_options = read_collection_options(&metadata, &name)?;
            let collection = Collection::open(&base_path, &name, coll_options, fold.clone(), readonly, &metadata)?;
            collections.insert(name, Arc::new(collection));
        }

        Ok(Database {
            base_path,
            options,
            _path_lock: path_lock,
            metadata,
            collections: RwLock::new(collections),
            fold,
        })
    }

    /// Every collection name currently open.
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Looks up an already-open collection by name.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorKind::InvalidCollectionName(name.to_owned()).into())
    }

    /// Creates a new, empty collection with `options`, or returns the
    /// existing one if `name` is already open.
    pub fn create_collection(&self, name: &str, options: CollectionOptions) -> Result<Arc<Collection>> {
        if self.options.readonly() {
            return Err(ErrorKind::Invalid("database is open read-only".into()).into());
        }
        let mut collections = self.collections.write();
        if let Some(existing) = collections.get(name) {
            return Ok(existing.clone());
        }
        let collection = Collection::create(&self.base_path, name, options, self.fold.clone(), &self.metadata)?;
        info!("created collection {}", name);
        let handle = Arc::new(collection);
        collections.insert(name.to_owned(), handle.clone());
        Ok(handle)
    }

    /// Same as `collection`, but creates the collection with default
    /// tuning if it does not already exist.
    pub fn collection_or_create(&self, name: &str) -> Result<Arc<Collection>> {
        if let Ok(existing) = self.collection(name) {
            return Ok(existing);
        }
        self.create_collection(name, self.options.default_collection_options.clone())
    }

    /// Closes and forgets a collection. When `unlink_files` is set, its
    /// record file and every index file are also removed from disk.
    pub fn remove_collection(&self, name: &str, unlink_files: bool) -> Result<()> {
        let collection = {
            let mut collections = self.collections.write();
            collections.remove(name)
        };
        let collection = match collection {
            Some(c) => c,
            None => return Ok(()),
        };
        collection.close()?;
        self.metadata.remove_collection(name)?;
        if unlink_files {
            collection.unlink_files()?;
        }
        info!("removed collection {} (unlink_files={})", name, unlink_files);
        Ok(())
    }

    /// Declares (and backfills) a secondary index on `path` for
    /// `collection_name`.
    pub fn setindex(&self, collection_name: &str, path: &str, index_type: ::index::IndexType) -> Result<()> {
        let collection = self.collection(collection_name)?;
        collection.setindex(path, index_type, &self.metadata)
    }

    /// Drops a previously declared secondary index.
    pub fn dropindex(&self, collection_name: &str, path: &str, index_type: ::index::IndexType) -> Result<()> {
        let collection = self.collection(collection_name)?;
        collection.dropindex(path, index_type, &self.metadata)
    }

    /// Runs a read-only query against `collection_name`, returning the
    /// total match count (clamped to `$max` when set, but not reduced by
    /// `$skip`) and the projected page of results.
    pub fn find(&self, collection_name: &str, query_doc: &Document) -> Result<(u64, Vec<Document>)> {
        let collection = self.collection(collection_name)?;
        let compiled = compile::compile_query(query_doc)?;
        let hints = compiled.hints.clone();
        let outcome = executor::scan(&collection, compiled)?;
        finish(outcome, &hints, self)
    }

    /// Counts documents matching `query_doc` without materializing them.
    pub fn count(&self, collection_name: &str, query_doc: &Document) -> Result<u64> {
        let collection = self.collection(collection_name)?;
        let compiled = compile::compile_query(query_doc)?;
        executor::count(&collection, compiled)
    }

    /// Applies `update_doc`'s actions to every document matching
    /// `query_doc`, returning the number of documents touched and (for the
    /// documents that would be returned were this a `find`) their final
    /// state.
    pub fn update(&self, collection_name: &str, query_doc: &Document, update_doc: &Document) -> Result<(u64, Vec<Document>)> {
        let collection = self.collection(collection_name)?;
        let compiled = compile::compile_query(query_doc)?;
        let hints = compiled.hints.clone();
        let update = compile::compile_update(update_doc)?;
        if update.is_empty() {
            return Ok((0, Vec::new()));
        }
        let outcome = executor::update(&collection, compiled, &update)?;
        finish(outcome, &hints, self)
    }

    /// Fsyncs the metadata store and every open collection.
    pub fn sync(&self) -> Result<()> {
        self.metadata.sync()?;
        for collection in self.collections.read().values() {
            collection.sync()?;
        }
        Ok(())
    }

    /// Closes the metadata store and every open collection.
    pub fn close(&self) -> Result<()> {
        for collection in self.collections.read().values() {
            collection.close()?;
        }
        self.metadata.close()
    }
}

fn finish(outcome: ScanOutcome, hints: &::query::Hints, db: &Database) -> Result<(u64, Vec<Document>)> {
    let count = outcome.count;
    let docs = project::finish(outcome, hints, Some(db))?;
    Ok((count, docs))
}

fn open_path_lock(base_path: &Path, options: &Options) -> Result<Option<PathLock>> {
    if options.flags.contains(OpenFlags::NO_LOCK) {
        return Ok(None);
    }
    let lock_path = base_path.with_extension("lock");
    let nonblocking = options.flags.contains(OpenFlags::LOCK_NONBLOCK);
    Ok(Some(PathLock::acquire(lock_path, nonblocking)?))
}

fn read_collection_options(metadata: &MetadataCollection, name: &str) -> Result<CollectionOptions> {
    let doc = match metadata.get(name, "opts")? {
        Some(doc) => doc,
        None => return Ok(CollectionOptions::default()),
    };
    let default = CollectionOptions::default();
    Ok(CollectionOptions {
        records: doc.get_i64("records").map(|v| v as u64).unwrap_or(default.records),
        cached_records: doc.get_i64("cached_records").map(|v| v as u64).unwrap_or(default.cached_records),
        large: doc.get_bool("large").unwrap_or(default.large),
        compressed: doc.get_bool("compressed").unwrap_or(default.compressed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use oid::ObjectId;

    #[test]
    fn create_open_collection_and_roundtrip_save() {
        let dir = ::std::env::temp_dir().join(format!("docdb-database-test-{}", ObjectId::new()));
        let mut opts = Options::default();
        opts.flags = OpenFlags::WRITER | OpenFlags::CREATE | OpenFlags::NO_LOCK;
        let db = Database::create(&dir, opts).unwrap();

        let collection = db.create_collection("people", CollectionOptions::default()).unwrap();
        let mut doc = Document::new();
        doc.insert("name", "ada");
        let oid = collection.save(doc, false).unwrap();
        assert!(collection.load(oid).unwrap().is_some());

        db.close().unwrap();
        let _ = ::std::fs::remove_file(&dir);
        let _ = ::std::fs::remove_file(dir.with_extension("lock"));
        let _ = ::std::fs::remove_file({
            let mut p = dir.as_os_str().to_owned();
            p.push("_people");
            PathBuf::from(p)
        });
    }
}
