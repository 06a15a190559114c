//! Crate-wide error taxonomy.
//!
//! Mirrors the original engine's split between usage errors (caller did
//! something invalid), state errors (handle/transaction misuse), I/O errors,
//! on-disk format errors, and the sticky fatal flag. One `ErrorKind` variant
//! per numeric error family so `errmsg(code)`-style rendering stays stable.

#![allow(unknown_lints)]
#![allow(missing_docs)]

use std::{io, num};
use std::path::PathBuf;

error_chain! {
    foreign_links {
        Io(io::Error);
        Num(num::ParseIntError);
    }

    errors {
        // --- Usage ---
        Invalid(what: String) {
            description("invalid handle or argument"),
            display("invalid: {}", what),
        }
        KeepErr {
            description("put-keep over an existing key"),
            display("key already exists (KEEP mode)"),
        }
        NoRecord {
            description("no record for key"),
            display("record not found"),
        }
        InvalidBson {
            description("invalid document encoding"),
            display("invalid document encoding"),
        }
        InvalidOid(text: String) {
            description("invalid object id"),
            display("invalid object id: {}", text),
        }
        InvalidCollectionName(name: String) {
            description("invalid collection name"),
            display("invalid collection name: {}", name),
        }
        MaxCollections {
            description("maximum collection count reached"),
            display("maximum number of open collections reached"),
        }
        InvalidQueryControl(key: String) {
            description("unrecognized query control key"),
            display("unrecognized query control key: {}", key),
        }
        QueryOpNotArray(key: String) {
            description("query operator expects an array operand"),
            display("query operator {} expects an array operand", key),
        }
        QueryInvalidRegex(pattern: String) {
            description("invalid regular expression in query"),
            display("invalid regular expression: {}", pattern),
        }
        QueryIncExcl {
            description("$fields mixes include and exclude"),
            display("$fields projection cannot mix include (1) and exclude (0)"),
        }
        QueryActionKey(key: String) {
            description("update action used outside update context"),
            display("update action key used where a predicate was expected: {}", key),
        }
        OneElemMatchOnly(path: String) {
            description("more than one $elemMatch at the same path"),
            display("at most one $elemMatch is permitted per path: {}", path),
        }

        // --- State ---
        Transaction(what: String) {
            description("transaction misuse"),
            display("transaction error: {}", what),
        }
        MetaInvalid(what: String) {
            description("corrupt metadata"),
            display("corrupt metadata: {}", what),
        }

        // --- I/O (beyond the plain io::Error foreign link) ---
        Lock(path: PathBuf) {
            description("failed to acquire advisory file lock"),
            display("failed to lock {}", path.display()),
        }
        Mmap(what: String) {
            description("memory map failure"),
            display("memory map failure: {}", what),
        }

        // --- Format ---
        RecordHeaderCorrupt(offset: u64) {
            description("record header magic mismatch"),
            display("record header corrupt at offset {}", offset),
        }
        HeaderMismatch(what: String) {
            description("record file header mismatch on open"),
            display("record file header mismatch: {}", what),
        }
        MissingCodec {
            description("value is compressed but no codec was configured"),
            display("missing codec for compressed value"),
        }

        // --- Fatal ---
        Fatal(what: String) {
            description("fatal, sticky error"),
            display("fatal: {} (handle must be closed)", what),
        }

        // --- arithmetic / encoding ---
        Overflow(what: String) {
            description("in-place numeric update would change the encoded width"),
            display("overflow: {}", what),
        }
    }
}
