//! Secondary index files (spec §4.B).
//!
//! An index file is its own `record::RecordFile`, keyed not by document id
//! but by an encoding of the indexed field's value; the stored value is the
//! ordered set of object ids carrying that key. Reusing `RecordFile` here
//! means the index gets the same collision-tree ordering, free-block pool
//! and WAL journaling as the primary document store for free, rather than
//! inventing a second on-disk format.

pub mod file;

pub use self::file::{IndexFile, IndexType};
