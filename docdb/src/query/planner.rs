//! Index selection (spec §4.F): picks at most one "driver" predicate per
//! scan and resolves it to a concrete candidate-id sequence, leaving every
//! other predicate for the executor's residual filter.
//!
//! Grounded on `examples/other_examples/19d98f37_gabrielelanaro-wrongodb__src-index-mod.rs`'s
//! `IndexCatalog::lookup`/`add_index` (a name -> index lookup table scored
//! by what's actually declared), extended with the spec's selectivity/bonus
//! scoring formula since the teacher and that reference both pick the
//! first matching index rather than ranking candidates.

use bson::Bson;

use collection::Collection;
use index::IndexType;
use oid::ObjectId;
use query::{BoolExpr, CompiledQuery, Op, Predicate};
use value;

/// Below this selectivity percentage an index is considered worse than a
/// full scan and skipped (spec §4.F).
const MIN_SELECTIVITY_PCT: f64 = 20.0;

/// A concrete way to generate the candidate-id sequence for a scan.
pub enum Driver {
    /// Full scan of the record file, in insertion order.
    None,
    /// Direct get on the primary key.
    PkEq(ObjectId),
    /// Deduplicated direct get across several primary keys.
    PkIn(Vec<ObjectId>),
    /// Exact-match lookup on a single encoded key.
    IndexEq { path: String, index_type: IndexType, key: Vec<u8> },
    /// Range lookup (inclusive/exclusive bounds, ascending or descending).
    IndexRange {
        path: String,
        index_type: IndexType,
        lower: Option<(Vec<u8>, bool)>,
        upper: Option<(Vec<u8>, bool)>,
        ascending: bool,
    },
    /// Sorted, deduplicated list of literal keys, each scanned in turn
    /// (LEX/NUM one-of, and LEX one-of-starts when every key is a prefix
    /// bound rather than an exact one).
    IndexIn { path: String, index_type: IndexType, keys: Vec<Vec<u8>> },
    /// Token-index aggregate lookup (`$strand`/`$stror`, or a LEX `$in`
    /// rewritten onto an ARR-only path).
    ArrTokens { path: String, tokens: Vec<Vec<u8>>, all: bool },
}

/// The chosen driver plus the (possibly mutated) compiled query: the
/// winning predicate is marked `excluded` in place.
pub struct Plan {
    pub driver: Driver,
    pub query: CompiledQuery,
}

/// Chooses a driver for `query` against `collection`'s available indexes.
pub fn plan(mut query: CompiledQuery, collection: &Collection) -> Plan {
    let indexes = collection.available_indexes();
    let total_docs = collection.count() as f64;

    let candidates = top_level_predicate_indices(&query.filter);
    let mut best: Option<(usize, f64, Driver)> = None;

    for idx in candidates {
        let pred = match predicate_at(&query.filter, idx) {
            Some(p) => p,
            None => continue,
        };
        if pred.path == "_id" {
            if let Some(driver) = pk_driver(pred) {
                // Primary-key equality bypasses scoring entirely (spec
                // §4.F "matches the record file directly without an index").
                best = Some((idx, f64::INFINITY, driver));
                break;
            }
        }
        if let Some((score, driver)) = score_predicate(pred, &indexes, total_docs, &query.hints.orderby) {
            let better = match best {
                Some((_, best_score, _)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((idx, score, driver));
            }
        }
    }

    let driver = match best {
        Some((idx, _, driver)) => {
            mark_excluded(&mut query.filter, idx);
            driver
        }
        None => Driver::None,
    };

    Plan { driver, query }
}

/// Indices (into the top-level `And` list) of predicates eligible to drive
/// the scan: plain `Pred` entries are eligible, `Or` branches are not (spec
/// §4.F: exactly one driver, chosen among top-level predicates).
fn top_level_predicate_indices(filter: &BoolExpr) -> Vec<usize> {
    match *filter {
        BoolExpr::And(ref parts) => parts
            .iter()
            .enumerate()
            .filter_map(|(i, p)| match *p {
                BoolExpr::Pred(_) => Some(i),
                _ => None,
            })
            .collect(),
        BoolExpr::Pred(_) => vec![0],
        BoolExpr::Or(_) => Vec::new(),
    }
}

fn predicate_at(filter: &BoolExpr, idx: usize) -> Option<&Predicate> {
    match *filter {
        BoolExpr::And(ref parts) => match parts[idx] {
            BoolExpr::Pred(ref p) => Some(p),
            _ => None,
        },
        BoolExpr::Pred(ref p) if idx == 0 => Some(p),
        _ => None,
    }
}

fn mark_excluded(filter: &mut BoolExpr, idx: usize) {
    match *filter {
        BoolExpr::And(ref mut parts) => {
            if let BoolExpr::Pred(ref mut p) = parts[idx] {
                p.excluded = true;
            }
        }
        BoolExpr::Pred(ref mut p) if idx == 0 => p.excluded = true,
        _ => {}
    }
}

fn pk_driver(pred: &Predicate) -> Option<Driver> {
    match pred.op {
        Op::Eq(ref v) => oid_of(v).map(Driver::PkEq),
        Op::In(ref vs) => {
            let mut oids: Vec<ObjectId> = vs.iter().filter_map(oid_of).collect();
            oids.sort();
            oids.dedup();
            if oids.len() == vs.len() {
                Some(Driver::PkIn(oids))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn oid_of(value: &Bson) -> Option<ObjectId> {
    value::string_value(value).and_then(|s| ObjectId::parse_hex(s).ok())
}

/// The index type(s) a predicate's op family can be served by, in
/// preference order (spec §4.F required-type table).
fn required_types(pred: &Predicate) -> Vec<IndexType> {
    match pred.op {
        Op::Eq(_) | Op::Ne(_) | Op::StartsWith(_) | Op::In(_) | Op::Nin(_) => {
            if pred.icase {
                vec![IndexType::Ilex, IndexType::Lex]
            } else {
                vec![IndexType::Lex, IndexType::Ilex]
            }
        }
        Op::Gt(_) | Op::Gte(_) | Op::Lt(_) | Op::Lte(_) | Op::Between(_, _) => vec![IndexType::Num],
        Op::StrAnd(_) | Op::StrOr(_) => vec![IndexType::Arr],
        Op::Exists(_) | Op::True => vec![IndexType::Lex, IndexType::Ilex, IndexType::Num, IndexType::Arr],
        Op::Regex(_) | Op::ElemMatch(_) => Vec::new(),
    }
}

fn score_predicate(
    pred: &Predicate,
    indexes: &[(String, IndexType, usize, usize)],
    total_docs: f64,
    orderby: &[(String, bool)],
) -> Option<(f64, Driver)> {
    let wanted = required_types(pred);
    if wanted.is_empty() {
        return None;
    }

    // LEX `$in` on an ARR-only path rewrites to STR-OR (spec §4.F special
    // case) so the ARR index can serve it.
    if let Op::In(ref values) = pred.op {
        if !indexes.iter().any(|&(ref p, t, _, _)| p == &pred.path && (t == IndexType::Lex || t == IndexType::Ilex)) {
            if let Some(&(_, _, key_count, entry_count)) = indexes.iter().find(|&&(ref p, t, _, _)| p == &pred.path && t == IndexType::Arr) {
                let tokens: Vec<Vec<u8>> = values.iter().filter_map(value::string_value).map(|s| s.as_bytes().to_vec()).collect();
                if !tokens.is_empty() {
                    let selectivity = selectivity_pct(key_count, entry_count, total_docs);
                    if selectivity >= MIN_SELECTIVITY_PCT {
                        let score = selectivity + 100.0 + order_bonus(pred, orderby);
                        return Some((score, Driver::ArrTokens { path: pred.path.clone(), tokens, all: false }));
                    }
                }
            }
        }
    }

    let mut best: Option<(f64, Driver)> = None;
    for index_type in wanted {
        let entry = indexes.iter().find(|&&(ref p, t, _, _)| p == &pred.path && t == index_type);
        let (key_count, entry_count) = match entry {
            Some(&(_, _, k, e)) => (k, e),
            None => continue,
        };
        let selectivity = selectivity_pct(key_count, entry_count, total_docs);
        if selectivity < MIN_SELECTIVITY_PCT {
            continue;
        }
        let bonus = exact_match_bonus(pred, index_type) + order_bonus(pred, orderby);
        let score = selectivity + bonus;
        if let Some(driver) = build_driver(pred, index_type) {
            let better = match best {
                Some((best_score, _)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((score, driver));
            }
        }
    }
    best
}

fn selectivity_pct(key_count: usize, entry_count: usize, total_docs: f64) -> f64 {
    if entry_count == 0 || total_docs <= 0.0 {
        return 0.0;
    }
    // Fraction of documents a single key's postings represent, inverted so
    // a more selective index (fewer postings per key) scores higher.
    let avg_postings_per_key = entry_count as f64 / key_count.max(1) as f64;
    100.0 * (1.0 - (avg_postings_per_key / total_docs).min(1.0))
}

fn exact_match_bonus(pred: &Predicate, index_type: IndexType) -> f64 {
    match pred.op {
        Op::Eq(_) | Op::In(_) => 100.0,
        Op::StartsWith(ref prefix) => {
            if prefix.len() >= 8 {
                100.0
            } else {
                50.0
            }
        }
        Op::Gt(_) | Op::Gte(_) | Op::Lt(_) | Op::Lte(_) if index_type == IndexType::Num => 50.0,
        _ => 0.0,
    }
}

fn order_bonus(pred: &Predicate, orderby: &[(String, bool)]) -> f64 {
    match orderby.first() {
        Some(&(ref path, _)) if *path == pred.path => 25.0,
        _ => 0.0,
    }
}

fn build_driver(pred: &Predicate, index_type: IndexType) -> Option<Driver> {
    let path = pred.path.clone();
    match pred.op {
        Op::Eq(ref v) => encode_one(v, index_type, &path).map(|key| Driver::IndexEq { path, index_type, key }),
        Op::StartsWith(ref prefix) => {
            let lower = prefix.as_bytes().to_vec();
            let mut upper = lower.clone();
            upper.push(0xff);
            Some(Driver::IndexRange {
                path,
                index_type,
                lower: Some((lower, true)),
                upper: Some((upper, false)),
                ascending: true,
            })
        }
        Op::Gt(ref v) => encode_one(v, index_type, &path).map(|key| Driver::IndexRange {
            path,
            index_type,
            lower: Some((key, false)),
            upper: None,
            ascending: true,
        }),
        Op::Gte(ref v) => encode_one(v, index_type, &path).map(|key| Driver::IndexRange {
            path,
            index_type,
            lower: Some((key, true)),
            upper: None,
            ascending: true,
        }),
        Op::Lt(ref v) => encode_one(v, index_type, &path).map(|key| Driver::IndexRange {
            path,
            index_type,
            lower: None,
            upper: Some((key, false)),
            ascending: true,
        }),
        Op::Lte(ref v) => encode_one(v, index_type, &path).map(|key| Driver::IndexRange {
            path,
            index_type,
            lower: None,
            upper: Some((key, true)),
            ascending: true,
        }),
        Op::Between(ref lo, ref hi) => {
            let lo_key = encode_one(lo, index_type, &path)?;
            let hi_key = encode_one(hi, index_type, &path)?;
            Some(Driver::IndexRange {
                path,
                index_type,
                lower: Some((lo_key, true)),
                upper: Some((hi_key, true)),
                ascending: true,
            })
        }
        Op::In(ref values) => {
            let mut keys: Vec<Vec<u8>> = values.iter().filter_map(|v| encode_one(v, index_type, &path)).collect();
            keys.sort();
            keys.dedup();
            Some(Driver::IndexIn { path, index_type, keys })
        }
        Op::StrAnd(ref tokens) => Some(Driver::ArrTokens {
            path,
            tokens: tokens.iter().map(|t| t.as_bytes().to_vec()).collect(),
            all: true,
        }),
        Op::StrOr(ref tokens) => Some(Driver::ArrTokens {
            path,
            tokens: tokens.iter().map(|t| t.as_bytes().to_vec()).collect(),
            all: false,
        }),
        _ => None,
    }
}

fn encode_one(value: &Bson, index_type: IndexType, _path: &str) -> Option<Vec<u8>> {
    match index_type {
        IndexType::Lex => value::string_value(value).map(|s| s.as_bytes().to_vec()),
        IndexType::Ilex => value::string_value(value).map(|s| s.to_lowercase().into_bytes()),
        IndexType::Num => value::numeric_value(value).map(::index::file::num_sort_key),
        IndexType::Arr => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query::{BoolExpr, CompiledQuery, Hints, Op, Predicate};

    #[test]
    fn pk_equality_takes_priority_over_everything() {
        let oid = ObjectId::new();
        let pred = Predicate::simple("_id".to_owned(), Op::Eq(Bson::String(oid.to_hex())), false);
        assert!(pk_driver(&pred).is_some());
    }

    #[test]
    fn full_scan_when_no_index_available() {
        let filter = BoolExpr::And(vec![BoolExpr::Pred(Predicate::simple(
            "name".to_owned(),
            Op::Eq(Bson::String("ada".into())),
            false,
        ))]);
        let query = CompiledQuery { filter, hints: Hints::default() };
        let indices = top_level_predicate_indices(&query.filter);
        assert_eq!(indices, vec![0]);
    }
}
