//! Compiles a raw BSON query/update document into the typed form in
//! `query::{CompiledQuery, CompiledUpdate}` (spec §4.E).

use std::collections::HashSet;

use bson::{Bson, Document};
use regex::Regex;

use error::{ErrorKind, Result};
use query::{BoolExpr, CompiledQuery, CompiledUpdate, Hints, Op, Predicate, UpdateAction};

/// Compiles a query document into its predicate tree and hints.
///
/// `$orderby` paths that carry no predicate of their own get a synthetic
/// `Op::True` predicate inserted so the planner can see them (spec §4.E
/// "Hints", `$orderby`).
pub fn compile_query(doc: &Document) -> Result<CompiledQuery> {
    let icase = doc.get("$icase").and_then(Bson::as_bool).unwrap_or(false);
    let mut hints = Hints::default();
    let mut seen_elem_match = HashSet::new();
    let mut preds = Vec::new();
    let mut seen_paths = HashSet::new();

    for (k, v) in doc.iter() {
        match k.as_str() {
            "$icase" => continue,
            "$orderby" => hints.orderby = parse_orderby(v)?,
            "$skip" => hints.skip = bson_as_u64(v)?,
            "$max" => hints.max = Some(bson_as_u64(v)?),
            "$fields" => hints.fields = Some(parse_fields(v)?),
            "$do" => hints.do_doc = v.as_document().cloned(),
            "$or" => {
                let arr = v.as_array().ok_or_else(|| -> ::error::Error { ErrorKind::QueryOpNotArray("$or".into()).into() })?;
                let mut branches = Vec::new();
                for item in arr {
                    let sub = item
                        .as_document()
                        .ok_or_else(|| -> ::error::Error { ErrorKind::QueryOpNotArray("$or".into()).into() })?;
                    branches.push(compile_and_group(sub, icase, &mut HashSet::new())?);
                }
                preds.push(BoolExpr::Or(branches));
            }
            _ if k.starts_with('$') => {
                return Err(ErrorKind::InvalidQueryControl(k.clone()).into());
            }
            _ => {
                seen_paths.insert(k.clone());
                preds.push(compile_field(k, v, icase, &mut seen_elem_match)?);
            }
        }
    }

    for &(ref path, _) in &hints.orderby {
        if seen_paths.contains(path) {
            continue;
        }
        preds.push(BoolExpr::Pred(Predicate {
            excluded: true,
            ..Predicate::simple(path.clone(), Op::True, icase)
        }));
    }

    Ok(CompiledQuery {
        filter: BoolExpr::And(preds),
        hints,
    })
}

fn compile_and_group(doc: &Document, icase: bool, seen_elem_match: &mut HashSet<String>) -> Result<BoolExpr> {
    let mut preds = Vec::new();
    for (k, v) in doc.iter() {
        if k.starts_with('$') {
            return Err(ErrorKind::QueryActionKey(k.clone()).into());
        }
        preds.push(compile_field(k, v, icase, seen_elem_match)?);
    }
    Ok(BoolExpr::And(preds))
}

fn compile_field(path: &str, value: &Bson, icase: bool, seen_elem_match: &mut HashSet<String>) -> Result<BoolExpr> {
    match *value {
        Bson::Document(ref ops) if is_operator_doc(ops) => {
            let field_icase = ops.get("$icase").and_then(Bson::as_bool).unwrap_or(icase);
            let negate = ops.contains_key("$not");
            let mut preds = Vec::new();
            for (op_key, operand) in ops.iter() {
                if op_key == "$icase" {
                    continue;
                }
                if op_key == "$not" {
                    // `$not` wraps either a nested operator document or a
                    // plain literal (equality).
                    if let Some(sub_ops) = operand.as_document() {
                        if is_operator_doc(sub_ops) {
                            for (sub_key, sub_operand) in sub_ops.iter() {
                                let mut p = compile_operator(path, sub_key, sub_operand, field_icase, seen_elem_match)?;
                                p.negate = true;
                                preds.push(p);
                            }
                            continue;
                        }
                    }
                    preds.push(Predicate {
                        negate: true,
                        ..Predicate::simple(path.to_owned(), Op::Eq(operand.clone()), field_icase)
                    });
                    continue;
                }
                let mut predicate = compile_operator(path, op_key, operand, field_icase, seen_elem_match)?;
                predicate.negate = negate && op_key != "$not";
                preds.push(predicate);
            }
            Ok(BoolExpr::And(preds.into_iter().map(BoolExpr::Pred).collect()))
        }
        ref literal => Ok(BoolExpr::Pred(Predicate::simple(path.to_owned(), Op::Eq(literal.clone()), icase))),
    }
}

fn is_operator_doc(doc: &Document) -> bool {
    !doc.is_empty() && doc.keys().all(|k| k.starts_with('$'))
}

fn compile_operator(
    path: &str,
    op_key: &str,
    operand: &Bson,
    icase: bool,
    seen_elem_match: &mut HashSet<String>,
) -> Result<Predicate> {
    let op = match op_key {
        "$eq" => Op::Eq(operand.clone()),
        "$ne" => Op::Ne(operand.clone()),
        "$gt" => Op::Gt(operand.clone()),
        "$gte" => Op::Gte(operand.clone()),
        "$lt" => Op::Lt(operand.clone()),
        "$lte" => Op::Lte(operand.clone()),
        "$bt" => {
            let bounds = as_array(operand, "$bt")?;
            if bounds.len() != 2 {
                return Err(ErrorKind::QueryOpNotArray("$bt".into()).into());
            }
            Op::Between(bounds[0].clone(), bounds[1].clone())
        }
        "$begin" => {
            let prefix = operand
                .as_str()
                .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$begin expects a string operand".into()).into() })?;
            Op::StartsWith(prefix.to_owned())
        }
        "$in" => Op::In(as_array(operand, "$in")?),
        "$nin" => Op::Nin(as_array(operand, "$nin")?),
        "$strand" => Op::StrAnd(as_string_array(operand, "$strand")?),
        "$stror" => Op::StrOr(as_string_array(operand, "$stror")?),
        "$exists" => Op::Exists(operand.as_bool().unwrap_or(true)),
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| -> ::error::Error { ErrorKind::QueryInvalidRegex(format!("{:?}", operand)).into() })?;
            let regex = Regex::new(pattern).map_err(|_| -> ::error::Error { ErrorKind::QueryInvalidRegex(pattern.to_owned()).into() })?;
            Op::Regex(regex)
        }
        "$elemMatch" => {
            if !seen_elem_match.insert(path.to_owned()) {
                return Err(ErrorKind::OneElemMatchOnly(path.to_owned()).into());
            }
            let sub = operand
                .as_document()
                .ok_or_else(|| -> ::error::Error { ErrorKind::QueryOpNotArray("$elemMatch".into()).into() })?;
            let mut preds = Vec::new();
            for (k, v) in sub.iter() {
                if k.starts_with('$') {
                    return Err(ErrorKind::QueryActionKey(k.clone()).into());
                }
                preds.extend(flatten_and(compile_field(k, v, icase, &mut HashSet::new())?)?);
            }
            Op::ElemMatch(preds)
        }
        other => return Err(ErrorKind::InvalidQueryControl(other.to_owned()).into()),
    };
    Ok(Predicate::simple(path.to_owned(), op, icase))
}

fn flatten_and(expr: BoolExpr) -> Result<Vec<Predicate>> {
    match expr {
        BoolExpr::And(parts) => {
            let mut out = Vec::new();
            for part in parts {
                out.extend(flatten_and(part)?);
            }
            Ok(out)
        }
        BoolExpr::Pred(p) => Ok(vec![p]),
        BoolExpr::Or(_) => Err(ErrorKind::Invalid("$elemMatch does not support $or".into()).into()),
    }
}

fn as_array(value: &Bson, key: &str) -> Result<Vec<Bson>> {
    value
        .as_array()
        .cloned()
        .ok_or_else(|| ErrorKind::QueryOpNotArray(key.to_owned()).into())
}

fn as_string_array(value: &Bson, key: &str) -> Result<Vec<String>> {
    let arr = as_array(value, key)?;
    arr.iter()
        .map(|b| {
            b.as_str()
                .map(str::to_owned)
                .ok_or_else(|| ErrorKind::QueryOpNotArray(key.to_owned()).into())
        })
        .collect()
}

fn bson_as_u64(value: &Bson) -> Result<u64> {
    match *value {
        Bson::I32(v) if v >= 0 => Ok(v as u64),
        Bson::I64(v) if v >= 0 => Ok(v as u64),
        Bson::FloatingPoint(v) if v >= 0.0 => Ok(v as u64),
        _ => Err(ErrorKind::Invalid(format!("expected a non-negative integer, got {:?}", value)).into()),
    }
}

fn parse_orderby(value: &Bson) -> Result<Vec<(String, bool)>> {
    let doc = value
        .as_document()
        .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$orderby must be a document".into()).into() })?;
    let mut out = Vec::new();
    for (k, v) in doc.iter() {
        let dir = bson_as_i64(v)?;
        out.push((k.clone(), dir >= 0));
    }
    Ok(out)
}

fn bson_as_i64(value: &Bson) -> Result<i64> {
    match *value {
        Bson::I32(v) => Ok(v as i64),
        Bson::I64(v) => Ok(v),
        Bson::FloatingPoint(v) => Ok(v as i64),
        _ => Err(ErrorKind::Invalid(format!("expected an integer, got {:?}", value)).into()),
    }
}

fn parse_fields(value: &Bson) -> Result<(bool, Vec<String>)> {
    let doc = value
        .as_document()
        .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$fields must be a document".into()).into() })?;
    let mut include: Option<bool> = None;
    let mut paths = Vec::new();
    for (k, v) in doc.iter() {
        let flag = bson_as_i64(v)? != 0;
        if k != "_id" {
            match include {
                None => include = Some(flag),
                Some(existing) if existing != flag => return Err(ErrorKind::QueryIncExcl.into()),
                Some(_) => {}
            }
        }
        if flag {
            paths.push(k.clone());
        } else if k == "_id" {
            paths.push(k.clone());
        }
    }
    let include = include.unwrap_or(true);
    // An include-mode projection with no field other than an excluded `_id`
    // would otherwise select nothing (spec §4.E: empty include set forced to
    // `{_id: 1}`).
    if include && !paths.iter().any(|p| p != "_id") && !paths.iter().any(|p| p == "_id") {
        paths.push("_id".to_owned());
    }
    Ok((include, paths))
}

/// Compiles an update document into its action list.
pub fn compile_update(doc: &Document) -> Result<CompiledUpdate> {
    let mut update = CompiledUpdate::default();
    for (k, v) in doc.iter() {
        match k.as_str() {
            "$upsert" => {
                let sub = v
                    .as_document()
                    .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$upsert must be a document".into()).into() })?;
                update.upsert = Some(sub.clone());
            }
            "$dropall" => {
                if v.as_bool().unwrap_or(false) {
                    update.actions.push(UpdateAction::DropAll);
                }
            }
            "$set" => {
                let sub = v
                    .as_document()
                    .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$set must be a document".into()).into() })?;
                for (path, value) in sub.iter() {
                    update.actions.push(UpdateAction::Set(path.clone(), value.clone()));
                }
            }
            "$inc" => {
                let sub = v
                    .as_document()
                    .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$inc must be a document".into()).into() })?;
                for (path, value) in sub.iter() {
                    let amount = bson_as_f64(value)?;
                    update.actions.push(UpdateAction::Inc(path.clone(), amount));
                }
            }
            "$addToSet" | "$addToSetAll" => {
                let sub = v
                    .as_document()
                    .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$addToSet must be a document".into()).into() })?;
                for (path, value) in sub.iter() {
                    if let Bson::Document(ref inner) = *value {
                        if let Some(each) = inner.get("$each") {
                            let arr = as_array(each, "$each")?;
                            update.actions.push(UpdateAction::AddToSetAll(path.clone(), arr));
                            continue;
                        }
                    }
                    if k == "$addToSetAll" {
                        let arr = as_array(value, "$addToSetAll")?;
                        update.actions.push(UpdateAction::AddToSetAll(path.clone(), arr));
                    } else {
                        update.actions.push(UpdateAction::AddToSet(path.clone(), value.clone()));
                    }
                }
            }
            "$pull" | "$pullAll" => {
                let sub = v
                    .as_document()
                    .ok_or_else(|| -> ::error::Error { ErrorKind::Invalid("$pull must be a document".into()).into() })?;
                for (path, value) in sub.iter() {
                    if let Bson::Document(ref inner) = *value {
                        if let Some(each) = inner.get("$each") {
                            let arr = as_array(each, "$each")?;
                            update.actions.push(UpdateAction::PullAll(path.clone(), arr));
                            continue;
                        }
                    }
                    if k == "$pullAll" {
                        let arr = as_array(value, "$pullAll")?;
                        update.actions.push(UpdateAction::PullAll(path.clone(), arr));
                    } else {
                        update.actions.push(UpdateAction::Pull(path.clone(), value.clone()));
                    }
                }
            }
            other => return Err(ErrorKind::InvalidQueryControl(other.to_owned()).into()),
        }
    }
    Ok(update)
}

fn bson_as_f64(value: &Bson) -> Result<f64> {
    match *value {
        Bson::I32(v) => Ok(v as f64),
        Bson::I64(v) => Ok(v as f64),
        Bson::FloatingPoint(v) => Ok(v),
        _ => Err(ErrorKind::Invalid(format!("expected a number, got {:?}", value)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_equality_and_range() {
        let mut age = Document::new();
        age.insert("$gte", 18);
        age.insert("$lt", 65);
        let mut doc = Document::new();
        doc.insert("age", age);
        doc.insert("name", "ada");

        let compiled = compile_query(&doc).unwrap();
        match compiled.filter {
            BoolExpr::And(ref parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn compiles_or_branches() {
        let mut a = Document::new();
        a.insert("a", 1);
        let mut b = Document::new();
        b.insert("b", 2);
        let mut doc = Document::new();
        doc.insert("$or", vec![Bson::Document(a), Bson::Document(b)]);

        let compiled = compile_query(&doc).unwrap();
        match compiled.filter {
            BoolExpr::And(ref parts) => match parts[0] {
                BoolExpr::Or(ref branches) => assert_eq!(branches.len(), 2),
                _ => panic!("expected Or"),
            },
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn compiles_not_over_comparison() {
        let mut gt = Document::new();
        gt.insert("$gt", 7);
        let mut not_doc = Document::new();
        not_doc.insert("$not", gt);
        let mut doc = Document::new();
        doc.insert("age", not_doc);

        let compiled = compile_query(&doc).unwrap();
        match compiled.filter {
            BoolExpr::And(ref parts) => match parts[0] {
                BoolExpr::Pred(ref p) => assert!(p.negate),
                _ => panic!("expected Pred"),
            },
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn orderby_path_without_predicate_gets_synthetic_true() {
        let mut orderby = Document::new();
        orderby.insert("age", 1);
        let mut doc = Document::new();
        doc.insert("$orderby", orderby);

        let compiled = compile_query(&doc).unwrap();
        match compiled.filter {
            BoolExpr::And(ref parts) => {
                assert_eq!(parts.len(), 1);
                match parts[0] {
                    BoolExpr::Pred(ref p) => {
                        assert_eq!(p.path, "age");
                        assert!(p.excluded);
                        match p.op {
                            Op::True => {}
                            _ => panic!("expected True"),
                        }
                    }
                    _ => panic!("expected Pred"),
                }
            }
            _ => panic!("expected And"),
        }
    }

    #[test]
    fn rejects_duplicate_elem_match_on_same_path() {
        let mut elem1 = Document::new();
        elem1.insert("color", "red");
        let mut op1 = Document::new();
        op1.insert("$elemMatch", elem1);

        let mut seen = HashSet::new();
        assert!(compile_field("tags", &Bson::Document(op1.clone()), false, &mut seen).is_ok());
        assert!(compile_field("tags", &Bson::Document(op1), false, &mut seen).is_err());
    }

    #[test]
    fn unknown_control_key_is_rejected() {
        let mut doc = Document::new();
        doc.insert("$bogus", 1);
        assert!(compile_query(&doc).is_err());
    }

    #[test]
    fn compiles_upsert_as_document_payload() {
        let mut payload = Document::new();
        payload.insert("_id", "x");
        payload.insert("n", 9);
        let mut doc = Document::new();
        doc.insert("$upsert", payload);

        let update = compile_update(&doc).unwrap();
        assert!(update.upsert.is_some());
        assert_eq!(update.upsert.unwrap().get_i32("n").unwrap(), 9);
    }
}
