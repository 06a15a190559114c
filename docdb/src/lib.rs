//! Embedded, schemaless document database engine.
//!
//! A database is a directory of flat files: one record file per collection
//! (bucketed hash file with in-place collision trees, spec §4.A), one record
//! file per secondary index (spec §4.B), and a shared metadata record file
//! naming every collection and the indexes declared on it (spec §4.D).
//! `bson::Document` is the value model throughout; the query language
//! compiles into a small predicate tree (`query::compile`) before a scan
//! ever touches a document (`query::planner`, `query::executor`).
//!
//! ```text
//! Database
//!   ├── metadata (MetadataCollection)
//!   └── Collection*
//!         ├── record (RecordFile)
//!         └── IndexFile*
//! ```

#![warn(missing_docs)]

extern crate bit_vec;
extern crate bson;
extern crate byteorder;
#[macro_use]
extern crate error_chain;
extern crate fs2;
extern crate hex_slice;
extern crate itertools;
#[macro_use]
extern crate log;
extern crate memmap;
extern crate parking_lot;
extern crate regex;
extern crate tiny_keccak;
#[cfg(test)]
#[macro_use]
extern crate matches;
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

mod codec;
mod collection;
mod database;
mod error;
mod fold;
mod index;
mod key;
mod lock;
mod metadata;
mod oid;
mod options;
mod query;
mod record;
mod value;
mod wal;

pub use codec::{Codec, NoopCodec};
pub use collection::Collection;
pub use database::Database;
pub use error::{Error, ErrorKind, Result};
pub use fold::{Fold, LowercaseFold};
pub use index::IndexType;
pub use oid::ObjectId;
pub use options::{CollectionOptions, OpenFlags, Options};
pub use query::{BoolExpr, CompiledQuery, CompiledUpdate, Hints, Op, Predicate, UpdateAction};
