//! Runs a planned scan: materializes the driver's candidate ids, filters
//! residual predicates, applies update actions, and hands the surviving
//! `(oid, doc)` pairs to `::project` (spec §4.G).
//!
//! The driver's candidate sequence is always fully materialized up front
//! (index files already keep their whole key -> postings map in memory,
//! see `index::file::IndexFile`), so a mutation made mid-scan (an update
//! action touching the very index driving the scan) can never invalidate
//! the cursor the way a live on-disk iterator could. That removes the
//! need for the deferred per-scan index-update queue a streaming executor
//! would require: updates apply immediately, through the same path
//! `Collection::save`/`Collection::remove` already use.

use std::cmp::Ordering;
use std::collections::HashSet;

use bson::{Array, Bson, Document};
use regex::Regex;

use collection::Collection;
use error::Result;
use index::IndexType;
use oid::ObjectId;
use query::planner::{self, Driver};
use query::{BoolExpr, CompiledQuery, CompiledUpdate, Op, Predicate, UpdateAction};
use value;
use value::NumericValue;

/// The raw result of running a scan, before sort/skip/limit/projection.
pub struct ScanOutcome {
    /// Number of documents that matched the filter (capped at `skip+max`
    /// when the scan could stop early).
    pub count: u64,
    /// Matching `(oid, doc)` pairs, already updated if this was an
    /// update-mode scan. In driver order; `::project` sorts when needed.
    pub matches: Vec<(ObjectId, Document)>,
}

/// Runs a read-only (`find`-style) scan.
pub fn scan(collection: &Collection, query: CompiledQuery) -> Result<ScanOutcome> {
    run(collection, query, None, false)
}

/// Runs a count-only scan: evaluates the filter but never materializes
/// matching documents.
pub fn count(collection: &Collection, query: CompiledQuery) -> Result<u64> {
    Ok(run(collection, query, None, true)?.count)
}

/// Runs an update-mode scan, applying `update` to every matching document.
pub fn update(collection: &Collection, query: CompiledQuery, update: &CompiledUpdate) -> Result<ScanOutcome> {
    run(collection, query, Some(update), false)
}

fn run(collection: &Collection, query: CompiledQuery, update: Option<&CompiledUpdate>, count_only: bool) -> Result<ScanOutcome> {
    let plan = planner::plan(query, collection);
    let filter = plan.query.filter;
    let hints = plan.query.hints;

    // An update-mode scan always needs every matching doc in hand before it
    // can report a stable count; a read scan needs every candidate only
    // when it must be fully re-sorted (spec §4.G `need_all`).
    let need_all = update.is_some() || !hints.orderby.is_empty();

    let skip = hints.skip;
    let max = hints.max.unwrap_or(u64::MAX);
    let target = skip.saturating_add(max);

    let mut count: u64 = 0;
    let mut matches: Vec<(ObjectId, Document)> = Vec::new();

    for candidate in gather(collection, &plan.driver)? {
        let (oid, mut doc) = match candidate {
            Candidate::Loaded(oid, doc) => (oid, doc),
            Candidate::Id(oid) => match collection.load(oid)? {
                Some(doc) => (oid, doc),
                None => continue,
            },
        };

        if !eval(&doc, &filter) {
            continue;
        }

        count += 1;

        if let Some(u) = update {
            apply_update(&mut doc, u);
            collection.save(doc.clone(), false)?;
        }

        if !count_only && (need_all || count > skip) {
            matches.push((oid, doc));
        }

        if !need_all && count >= target {
            break;
        }
    }

    if let Some(u) = update {
        if count == 0 {
            if let Some(ref payload) = u.upsert {
                let oid = collection.save(payload.clone(), false)?;
                if let Some(doc) = collection.load(oid)? {
                    count = 1;
                    if !count_only {
                        matches.push((oid, doc));
                    }
                }
            }
        }
    }

    Ok(ScanOutcome {
        count: count.min(hints.max.unwrap_or(count)),
        matches,
    })
}

enum Candidate {
    Id(ObjectId),
    Loaded(ObjectId, Document),
}

fn gather(collection: &Collection, driver: &Driver) -> Result<Vec<Candidate>> {
    Ok(match *driver {
        Driver::None => collection
            .iterate()?
            .into_iter()
            .map(|(oid, doc)| Candidate::Loaded(oid, doc))
            .collect(),
        Driver::PkEq(oid) => vec![Candidate::Id(oid)],
        Driver::PkIn(ref oids) => oids.iter().map(|&oid| Candidate::Id(oid)).collect(),
        Driver::IndexEq { ref path, index_type, ref key } => collection
            .index_scan_eq(path, index_type, key)
            .unwrap_or_default()
            .into_iter()
            .map(Candidate::Id)
            .collect(),
        Driver::IndexRange { ref path, index_type, ref lower, ref upper, ascending } => collection
            .index_scan_range(
                path,
                index_type,
                lower.as_ref().map(|&(ref k, inc)| (k.as_slice(), inc)),
                upper.as_ref().map(|&(ref k, inc)| (k.as_slice(), inc)),
                ascending,
            )
            .unwrap_or_default()
            .into_iter()
            .map(|(_, oid)| Candidate::Id(oid))
            .collect(),
        Driver::IndexIn { ref path, index_type, ref keys } => {
            let mut seen = HashSet::new();
            let mut out = Vec::new();
            for key in keys {
                for oid in collection.index_scan_eq(path, index_type, key).unwrap_or_default() {
                    if seen.insert(oid) {
                        out.push(Candidate::Id(oid));
                    }
                }
            }
            out
        }
        Driver::ArrTokens { ref path, ref tokens, all } => arr_token_oids(collection, path, tokens, all)
            .into_iter()
            .map(Candidate::Id)
            .collect(),
    })
}

fn arr_token_oids(collection: &Collection, path: &str, tokens: &[Vec<u8>], all: bool) -> Vec<ObjectId> {
    let postings: Vec<Vec<ObjectId>> = tokens
        .iter()
        .map(|t| collection.index_scan_eq(path, IndexType::Arr, t).unwrap_or_default())
        .collect();

    if postings.is_empty() {
        return Vec::new();
    }

    if !all {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for list in &postings {
            for &oid in list {
                if seen.insert(oid) {
                    out.push(oid);
                }
            }
        }
        return out;
    }

    let mut intersection: HashSet<ObjectId> = postings[0].iter().cloned().collect();
    for list in &postings[1..] {
        let set: HashSet<ObjectId> = list.iter().cloned().collect();
        intersection = intersection.intersection(&set).cloned().collect();
    }
    postings[0].iter().cloned().filter(|oid| intersection.contains(oid)).collect()
}

/// Evaluates a compiled filter against a candidate document.
pub fn eval(doc: &Document, expr: &BoolExpr) -> bool {
    match *expr {
        BoolExpr::And(ref parts) => parts.iter().all(|p| eval(doc, p)),
        BoolExpr::Or(ref branches) => branches.iter().any(|b| eval(doc, b)),
        BoolExpr::Pred(ref p) => eval_predicate(doc, p),
    }
}

fn eval_predicate(doc: &Document, pred: &Predicate) -> bool {
    if pred.excluded {
        return true;
    }
    let verdict = raw_verdict(doc, pred);
    if pred.negate {
        !verdict
    } else {
        verdict
    }
}

fn raw_verdict(doc: &Document, pred: &Predicate) -> bool {
    match pred.op {
        Op::True => true,
        Op::Exists(want) => value::is_present(value::get_path(doc, &pred.path)) == want,
        Op::ElemMatch(ref subs) => match value::get_path(doc, &pred.path) {
            Some(&Bson::Array(ref arr)) => arr.iter().any(|elem| match *elem {
                Bson::Document(ref d) => subs.iter().all(|sp| eval_predicate(d, sp)),
                _ => false,
            }),
            _ => false,
        },
        Op::StrAnd(ref tokens) => array_tokens_at(doc, &pred.path).map(|present| tokens.iter().all(|t| present.contains(t))).unwrap_or(false),
        Op::StrOr(ref tokens) => array_tokens_at(doc, &pred.path).map(|present| tokens.iter().any(|t| present.contains(t))).unwrap_or(false),
        _ => {
            let values = value::collect_values_at_path(doc, &pred.path);
            values.iter().any(|v| leaf_match(pred, v))
        }
    }
}

fn array_tokens_at(doc: &Document, path: &str) -> Option<Vec<String>> {
    match value::get_path(doc, path) {
        Some(&Bson::Array(ref arr)) => Some(arr.iter().filter_map(value::string_value).map(str::to_owned).collect()),
        Some(&Bson::String(ref s)) => Some(s.split_whitespace().map(str::to_owned).collect()),
        _ => None,
    }
}

fn leaf_match(pred: &Predicate, value: &Bson) -> bool {
    match pred.op {
        Op::Eq(ref rhs) => bson_eq(value, rhs, pred.icase),
        Op::Ne(ref rhs) => !bson_eq(value, rhs, pred.icase),
        Op::Gt(ref rhs) => compare(value, rhs, pred.icase) == Some(Ordering::Greater),
        Op::Gte(ref rhs) => matches_ge(value, rhs, pred.icase),
        Op::Lt(ref rhs) => compare(value, rhs, pred.icase) == Some(Ordering::Less),
        Op::Lte(ref rhs) => matches_le(value, rhs, pred.icase),
        Op::Between(ref lo, ref hi) => matches_ge(value, lo, pred.icase) && matches_le(value, hi, pred.icase),
        Op::StartsWith(ref prefix) => match value::string_value(value) {
            Some(s) => {
                if pred.icase {
                    s.to_lowercase().starts_with(&prefix.to_lowercase())
                } else {
                    s.starts_with(prefix.as_str())
                }
            }
            None => false,
        },
        Op::In(ref list) => list.iter().any(|rhs| bson_eq(value, rhs, pred.icase)),
        Op::Nin(ref list) => !list.iter().any(|rhs| bson_eq(value, rhs, pred.icase)),
        Op::Regex(ref re) => matches_regex(re, value),
        Op::StrAnd(_) | Op::StrOr(_) | Op::Exists(_) | Op::ElemMatch(_) | Op::True => false,
    }
}

fn matches_ge(value: &Bson, rhs: &Bson, icase: bool) -> bool {
    matches!(compare(value, rhs, icase), Some(Ordering::Greater) | Some(Ordering::Equal))
}

fn matches_le(value: &Bson, rhs: &Bson, icase: bool) -> bool {
    matches!(compare(value, rhs, icase), Some(Ordering::Less) | Some(Ordering::Equal))
}

fn matches_regex(re: &Regex, value: &Bson) -> bool {
    value::string_value(value).map(|s| re.is_match(s)).unwrap_or(false)
}

fn bson_eq(a: &Bson, b: &Bson, icase: bool) -> bool {
    if icase {
        if let (Some(sa), Some(sb)) = (value::string_value(a), value::string_value(b)) {
            return sa.to_lowercase() == sb.to_lowercase();
        }
    }
    match (value::numeric_value(a), value::numeric_value(b)) {
        (Some(NumericValue::Int(x)), Some(NumericValue::Int(y))) => x == y,
        (Some(na), Some(nb)) => (na.as_f64() - nb.as_f64()).abs() < ::std::f64::EPSILON,
        _ => a == b,
    }
}

/// Orders two values the way the spec's comparison ops do: numeric if both
/// sides carry a numeric value, else byte-wise string, else incomparable.
pub fn compare(a: &Bson, b: &Bson, icase: bool) -> Option<Ordering> {
    match (value::numeric_value(a), value::numeric_value(b)) {
        (Some(na), Some(nb)) => na.cmp_numeric(&nb),
        _ => match (value::string_value(a), value::string_value(b)) {
            (Some(sa), Some(sb)) => {
                if icase {
                    Some(sa.to_lowercase().cmp(&sb.to_lowercase()))
                } else {
                    Some(sa.cmp(sb))
                }
            }
            _ => None,
        },
    }
}

fn apply_update(doc: &mut Document, update: &CompiledUpdate) {
    for action in &update.actions {
        match *action {
            UpdateAction::Set(ref path, ref val) => value::set_path(doc, path, val.clone()),
            UpdateAction::Inc(ref path, amount) => {
                let current = value::get_path(doc, path).and_then(value::numeric_value);
                let result = match current {
                    Some(NumericValue::Int(v)) if amount.fract() == 0.0 => {
                        NumericValue::Int(v.wrapping_add(amount as i64))
                    }
                    Some(nv) => NumericValue::Float(nv.as_f64() + amount),
                    None if amount.fract() == 0.0 => NumericValue::Int(amount as i64),
                    None => NumericValue::Float(amount),
                };
                value::set_path(doc, path, numeric_bson(result));
            }
            UpdateAction::AddToSet(ref path, ref val) => {
                let arr = value::ensure_array(doc, path);
                if !arr.contains(val) {
                    arr.push(val.clone());
                }
            }
            UpdateAction::AddToSetAll(ref path, ref vals) => {
                let arr = value::ensure_array(doc, path);
                for v in vals {
                    if !arr.contains(v) {
                        arr.push(v.clone());
                    }
                }
            }
            UpdateAction::Pull(ref path, ref val) => {
                if let Some(arr) = value::get_array_mut(doc, path) {
                    retain_not_eq(arr, &[val.clone()]);
                }
            }
            UpdateAction::PullAll(ref path, ref vals) => {
                if let Some(arr) = value::get_array_mut(doc, path) {
                    retain_not_eq(arr, vals);
                }
            }
            UpdateAction::DropAll => {
                let id = doc.get("_id").cloned();
                doc.clear();
                if let Some(id) = id {
                    doc.insert("_id", id);
                }
            }
        }
    }
}

fn retain_not_eq(arr: &mut Array, targets: &[Bson]) {
    arr.retain(|v| !targets.iter().any(|t| bson_eq(v, t, false)));
}

fn numeric_bson(n: NumericValue) -> Bson {
    match n {
        NumericValue::Int(v) => Bson::I64(v),
        NumericValue::Float(v) => Bson::FloatingPoint(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query::Predicate;

    #[test]
    fn eq_matches_across_numeric_types() {
        let mut doc = Document::new();
        doc.insert("n", 3i32);
        let pred = Predicate::simple("n".to_owned(), Op::Eq(Bson::I64(3)), false);
        assert!(eval_predicate(&doc, &pred));
    }

    #[test]
    fn negate_on_missing_field_matches() {
        let doc = Document::new();
        let pred = Predicate {
            negate: true,
            ..Predicate::simple("missing".to_owned(), Op::Eq(Bson::I32(1)), false)
        };
        assert!(eval_predicate(&doc, &pred));
    }

    #[test]
    fn elem_match_requires_joint_satisfaction_in_one_element() {
        let mut elem_a = Document::new();
        elem_a.insert("color", "red");
        elem_a.insert("size", "s");
        let mut elem_b = Document::new();
        elem_b.insert("color", "red");
        elem_b.insert("size", "m");
        let mut doc = Document::new();
        doc.insert("variants", vec![Bson::Document(elem_a), Bson::Document(elem_b)]);

        let subs = vec![
            Predicate::simple("color".to_owned(), Op::Eq(Bson::String("red".into())), false),
            Predicate::simple("size".to_owned(), Op::Eq(Bson::String("m".into())), false),
        ];
        let pred = Predicate::simple("variants".to_owned(), Op::ElemMatch(subs), false);
        assert!(eval_predicate(&doc, &pred));
    }

    #[test]
    fn apply_set_and_inc() {
        let mut doc = Document::new();
        doc.insert("n", 1i32);
        let update = CompiledUpdate {
            actions: vec![UpdateAction::Set("name".to_owned(), Bson::String("ada".into())), UpdateAction::Inc("n".to_owned(), 4.0)],
            upsert: None,
        };
        apply_update(&mut doc, &update);
        assert_eq!(doc.get_str("name").unwrap(), "ada");
        assert_eq!(value::numeric_value(doc.get("n").unwrap()), Some(NumericValue::Int(5)));
    }
}
