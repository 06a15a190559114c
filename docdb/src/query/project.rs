//! Final sort, skip/limit, field projection and `$do.$join` (spec §4.H).
//!
//! Runs after `::executor::scan`/`::executor::update` on the raw
//! `(oid, doc)` pairs they collected.

use std::cmp::Ordering;

use bson::{Bson, Document};

use database::Database;
use error::Result;
use oid::ObjectId;
use query::executor::{compare, ScanOutcome};
use query::Hints;
use value;

/// Applies sort, skip/limit and projection to a scan's raw results,
/// returning the final document list (sans oid; `_id` stays in the doc).
pub fn finish(outcome: ScanOutcome, hints: &Hints, db: Option<&Database>) -> Result<Vec<Document>> {
    let mut pairs = outcome.matches;

    if !hints.orderby.is_empty() {
        sort_by_orderby(&mut pairs, &hints.orderby);
    }

    let skip = hints.skip as usize;
    let limit = hints.max.map(|m| m as usize);
    let end = match limit {
        Some(l) => skip.saturating_add(l).min(pairs.len()),
        None => pairs.len(),
    };
    let windowed: Vec<(ObjectId, Document)> = if skip >= pairs.len() {
        Vec::new()
    } else {
        pairs.drain(skip..end).collect()
    };

    let mut docs: Vec<Document> = windowed.into_iter().map(|(_, doc)| doc).collect();

    if let Some(&(include, ref paths)) = hints.fields.as_ref() {
        for doc in docs.iter_mut() {
            project_fields(doc, include, paths);
        }
    }

    if let (Some(do_doc), Some(db)) = (hints.do_doc.as_ref(), db) {
        if let Some(join) = do_doc.get_document("$join").ok() {
            apply_join(&mut docs, join, db)?;
        }
    }

    Ok(docs)
}

/// Stable multi-key sort: numeric comparison when both sides are numeric,
/// else byte-wise string; a field absent on one side sorts before a
/// present one.
fn sort_by_orderby(pairs: &mut Vec<(ObjectId, Document)>, orderby: &[(String, bool)]) {
    pairs.sort_by(|a, b| {
        for &(ref path, ascending) in orderby {
            let va = value::get_path(&a.1, path);
            let vb = value::get_path(&b.1, path);
            let ord = compare_optional(va, vb);
            let ord = if ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

fn compare_optional(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(va), Some(vb)) => compare(va, vb, false).unwrap_or(Ordering::Equal),
    }
}

/// Keeps only fields matching `paths` (include mode: exact or prefix
/// matches survive; exclude mode: exact matches are dropped).
fn project_fields(doc: &mut Document, include: bool, paths: &[String]) {
    if include {
        let kept = filter_include(doc, "", paths);
        *doc = kept;
    } else {
        for path in paths {
            value::remove_path(doc, path);
        }
    }
}

fn filter_include(doc: &Document, prefix: &str, paths: &[String]) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        let full_path = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
        if paths.iter().any(|p| *p == full_path) {
            out.insert(key.clone(), value.clone());
            continue;
        }
        if paths.iter().any(|p| p.starts_with(&format!("{}.", full_path))) {
            if let Bson::Document(ref sub) = *value {
                out.insert(key.clone(), Bson::Document(filter_include(sub, &full_path, paths)));
                continue;
            }
        }
        if key == "_id" && paths.iter().any(|p| p == "_id") {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// `$do.$join {field: collection, …}`: replaces an oid (or array of oids)
/// field with the loaded document(s) from the named collection. A
/// reference that doesn't resolve is left untouched.
fn apply_join(docs: &mut [Document], join: &Document, db: &Database) -> Result<()> {
    for (field, target) in join.iter() {
        let collection_name = match target.as_str() {
            Some(name) => name,
            None => continue,
        };
        let collection = match db.collection(collection_name) {
            Ok(c) => c,
            Err(_) => continue,
        };
        for doc in docs.iter_mut() {
            let resolved = match doc.get(field) {
                Some(&Bson::String(ref s)) => resolve_one(&collection, s).map(Bson::Document),
                Some(&Bson::Array(ref arr)) => {
                    let mut joined = Vec::new();
                    for elem in arr {
                        if let Bson::String(ref s) = *elem {
                            if let Some(loaded) = resolve_one(&collection, s) {
                                joined.push(Bson::Document(loaded));
                                continue;
                            }
                        }
                        joined.push(elem.clone());
                    }
                    Some(Bson::Array(joined))
                }
                _ => None,
            };
            if let Some(value) = resolved {
                doc.insert(field.clone(), value);
            }
        }
    }
    Ok(())
}

fn resolve_one(collection: &::collection::Collection, text: &str) -> Option<Document> {
    let oid = ObjectId::parse_hex(text).ok()?;
    collection.load(oid).ok()?
}
