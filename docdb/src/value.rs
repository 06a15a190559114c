//! Dotted-path access over `bson::Document`/`bson::Bson`.
//!
//! The document format itself is out of scope (spec §1): the core consumes
//! `bson::Document` as the "existing third-party library" and only needs a
//! field-path accessor on top of it. Grounded on the general shape of the
//! path-indexed accessors in `examples/other_examples` document stores,
//! reimplemented against `bson` instead of `serde_json::Value`.

use bson::{Array, Bson, Document};

/// Splits a dotted path into its segments. `a.b.2.c` -> `["a", "b", "2", "c"]`.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

/// Joins path segments back into a dotted path.
pub fn join_path(segments: &[&str]) -> String {
    segments.join(".")
}

/// Looks up a single value at `path`, descending into arrays only when a
/// path segment parses as an index. Does not auto-expand arrays: a path
/// that crosses an array without a numeric next segment returns `None`.
/// Used by index-key extraction for non-array-aware index types and by
/// `$set`/`$inc` target resolution.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let segments = split_path(path);
    let (head, tail) = (segments[0], &segments[1..]);
    doc.get(head).and_then(|v| get_path_segments(v, tail))
}

fn get_path_segments<'a>(value: &'a Bson, segments: &[&str]) -> Option<&'a Bson> {
    if segments.is_empty() {
        return Some(value);
    }
    let (head, tail) = (segments[0], &segments[1..]);
    match *value {
        Bson::Document(ref d) => d.get(head).and_then(|v| get_path_segments(v, tail)),
        Bson::Array(ref arr) => {
            head.parse::<usize>()
                .ok()
                .and_then(|idx| arr.get(idx))
                .and_then(|v| get_path_segments(v, tail))
        }
        _ => None,
    }
}

/// Visits every leaf value reachable at `path`, auto-expanding arrays: if a
/// path segment does not parse as an index but the current value is an
/// array, every element of the array is visited with the same remaining
/// path. This is the traversal residual predicates and index population
/// use (spec §4.G "array auto-expansion").
pub fn for_each_value_at_path<'a, F: FnMut(&'a Bson)>(doc: &'a Document, path: &str, mut visit: F) {
    let segments = split_path(path);
    if segments.is_empty() {
        return;
    }
    visit_in_doc(doc, &segments, &mut visit);
}

fn visit_in_doc<'a, F: FnMut(&'a Bson)>(doc: &'a Document, segments: &[&str], visit: &mut F) {
    let (head, tail) = (segments[0], &segments[1..]);
    if let Some(value) = doc.get(head) {
        visit_value(value, tail, visit);
    }
}

fn visit_value<'a, F: FnMut(&'a Bson)>(value: &'a Bson, segments: &[&str], visit: &mut F) {
    if segments.is_empty() {
        visit(value);
        return;
    }
    match *value {
        Bson::Document(ref d) => visit_in_doc(d, segments, visit),
        Bson::Array(ref arr) => {
            let head = segments[0];
            if let Ok(idx) = head.parse::<usize>() {
                if let Some(elem) = arr.get(idx) {
                    visit_value(elem, &segments[1..], visit);
                }
            } else {
                // auto-expand: try the same remaining path in every element
                for elem in arr {
                    visit_value(elem, segments, visit);
                }
            }
        }
        _ => {}
    }
}

/// Collects every leaf value at `path` into a `Vec` (owned clones).
pub fn collect_values_at_path(doc: &Document, path: &str) -> Vec<Bson> {
    let mut out = Vec::new();
    for_each_value_at_path(doc, path, |v| out.push(v.clone()));
    out
}

/// Sets a value at a dotted path, creating intermediate documents (and, for
/// numeric segments on an existing array, extending the array) as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) {
    set_segments(doc, &split_path(path), value);
}

fn set_segments(doc: &mut Document, segments: &[&str], value: Bson) {
    let head = segments[0];
    if segments.len() == 1 {
        doc.insert(head.to_owned(), value);
        return;
    }
    let rest = &segments[1..];
    let entry = doc
        .entry(head.to_owned())
        .or_insert_with(|| Bson::Document(Document::new()));
    set_in_value(entry, rest, value);
}

fn set_in_value(entry: &mut Bson, segments: &[&str], value: Bson) {
    if !matches!(*entry, Bson::Document(_) | Bson::Array(_)) {
        *entry = Bson::Document(Document::new());
    }
    match *entry {
        Bson::Document(ref mut d) => set_segments(d, segments, value),
        Bson::Array(ref mut arr) => {
            let head = segments[0];
            if let Ok(idx) = head.parse::<usize>() {
                while arr.len() <= idx {
                    arr.push(Bson::Null);
                }
                if segments.len() == 1 {
                    arr[idx] = value;
                } else {
                    set_in_value(&mut arr[idx], &segments[1..], value);
                }
            }
        }
        _ => unreachable!(),
    }
}

/// Removes the value at a dotted path, if present. Returns whether anything
/// was removed.
pub fn remove_path(doc: &mut Document, path: &str) -> bool {
    remove_segments(doc, &split_path(path))
}

fn remove_segments(doc: &mut Document, segments: &[&str]) -> bool {
    let head = segments[0];
    if segments.len() == 1 {
        return doc.remove(head).is_some();
    }
    match doc.get_mut(head) {
        Some(&mut Bson::Document(ref mut d)) => remove_segments(d, &segments[1..]),
        Some(&mut Bson::Array(ref mut arr)) => {
            let rest = &segments[1..];
            if let Ok(idx) = rest[0].parse::<usize>() {
                if idx < arr.len() {
                    if rest.len() == 1 {
                        arr.remove(idx);
                        return true;
                    }
                    if let Bson::Document(ref mut d) = arr[idx] {
                        return remove_segments(d, &rest[1..]);
                    }
                }
            }
            false
        }
        _ => false,
    }
}

/// Ensures an array exists at `path`, returning a mutable reference to it.
pub fn ensure_array<'a>(doc: &'a mut Document, path: &str) -> &'a mut Array {
    let segments = split_path(path);
    ensure_array_segments(doc, &segments)
}

fn ensure_array_segments<'a>(doc: &'a mut Document, segments: &[&str]) -> &'a mut Array {
    let head = segments[0];
    if segments.len() == 1 {
        let entry = doc
            .entry(head.to_owned())
            .or_insert_with(|| Bson::Array(Array::new()));
        if !matches!(*entry, Bson::Array(_)) {
            *entry = Bson::Array(Array::new());
        }
        if let Bson::Array(ref mut arr) = *entry {
            return arr;
        }
        unreachable!()
    }
    let entry = doc
        .entry(head.to_owned())
        .or_insert_with(|| Bson::Document(Document::new()));
    if !matches!(*entry, Bson::Document(_)) {
        *entry = Bson::Document(Document::new());
    }
    match *entry {
        Bson::Document(ref mut d) => ensure_array_segments(d, &segments[1..]),
        _ => unreachable!(),
    }
}

/// A numeric `Bson` value, keeping native integers as `i64` rather than
/// funneling everything through `f64`: `f64`'s 53-bit mantissa cannot
/// represent every `i64`, so comparisons, `$inc`, and NUM index keys all
/// need the exact integer when both sides have one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericValue {
    Int(i64),
    Float(f64),
}

impl NumericValue {
    pub fn as_f64(self) -> f64 {
        match self {
            NumericValue::Int(v) => v as f64,
            NumericValue::Float(v) => v,
        }
    }

    /// Orders two numeric values, comparing exactly when both are integers
    /// so magnitudes beyond 2^53 still compare correctly.
    pub fn cmp_numeric(&self, other: &NumericValue) -> Option<::std::cmp::Ordering> {
        match (*self, *other) {
            (NumericValue::Int(a), NumericValue::Int(b)) => Some(a.cmp(&b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

/// Numeric value of a `Bson`, for NUM index keys and numeric comparisons.
pub fn numeric_value(value: &Bson) -> Option<NumericValue> {
    match *value {
        Bson::I32(v) => Some(NumericValue::Int(i64::from(v))),
        Bson::I64(v) => Some(NumericValue::Int(v)),
        Bson::FloatingPoint(v) => Some(NumericValue::Float(v)),
        Bson::TimeStamp(v) => Some(NumericValue::Int(v as i64)),
        Bson::UtcDatetime(ref dt) => Some(NumericValue::Int(dt.timestamp_millis())),
        Bson::Boolean(b) => Some(NumericValue::Int(if b { 1 } else { 0 })),
        _ => None,
    }
}

/// String value of a `Bson` for LEX/ILEX key extraction; only `String`
/// carries lexical semantics.
pub fn string_value(value: &Bson) -> Option<&str> {
    match *value {
        Bson::String(ref s) => Some(s.as_str()),
        _ => None,
    }
}

/// Mutable access to an existing array at `path`, without creating one.
/// Returns `None` if the path is absent or not an array (used by `$pull`,
/// which is a no-op against a missing target rather than creating it).
pub fn get_array_mut<'a>(doc: &'a mut Document, path: &str) -> Option<&'a mut Array> {
    let segments = split_path(path);
    get_array_mut_segments(doc, &segments)
}

fn get_array_mut_segments<'a>(doc: &'a mut Document, segments: &[&str]) -> Option<&'a mut Array> {
    let head = segments[0];
    if segments.len() == 1 {
        return match doc.get_mut(head) {
            Some(&mut Bson::Array(ref mut arr)) => Some(arr),
            _ => None,
        };
    }
    match doc.get_mut(head) {
        Some(&mut Bson::Document(ref mut d)) => get_array_mut_segments(d, &segments[1..]),
        _ => None,
    }
}

/// Whether a value is present and is not `Null`/missing, for `$exists`.
pub fn is_present(value: Option<&Bson>) -> bool {
    match value {
        None => false,
        Some(&Bson::Null) => false,
        Some(_) => true,
    }
}
