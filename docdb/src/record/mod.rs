//! Low-level record storage (spec §4.A).
//!
//! `store` is the public entry point; the other submodules factor out the
//! concerns it composes (header codec, free-block pool, the in-place
//! collision tree, the memory map, and the region-blob encoding the
//! collection layer uses for a document's value).

pub mod collision_tree;
pub mod free_pool;
pub mod header;
pub mod mapping;
pub mod regions;
pub mod store;

pub use self::store::{PutMode, RecordFile, RecordFileConfig};
