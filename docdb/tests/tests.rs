extern crate bson;
extern crate docdb;
extern crate tempdir;

use bson::Document;
use docdb::{CollectionOptions, Database, IndexType, Options};
use tempdir::TempDir;

fn open(dir: &TempDir) -> Database {
    Database::open(dir.path().join("db"), Options::default()).unwrap()
}

/// Expands a short label into a valid 24-character hex oid string (e.g.
/// `"O1"` -> 23 zeroes followed by `1`), so scenario tests can use the
/// spec's short oid names while still round-tripping through `parse_hex`.
fn oid_hex(label: &str) -> String {
    format!("{:0>24}", label.trim_start_matches('O'))
}

fn doc(id: &str, pairs: &[(&str, bson::Bson)]) -> Document {
    let mut d = Document::new();
    d.insert("_id", oid_hex(id));
    for &(k, ref v) in pairs {
        d.insert(k.to_owned(), v.clone());
    }
    d
}

#[test]
fn scenario_1_insert_and_query_by_equality() {
    let temp = TempDir::new("docdb-s1").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("people", CollectionOptions::default()).unwrap();

    coll.save(doc("O1", &[("name", "ada".into()), ("age", 36.into())]), false).unwrap();
    coll.save(doc("O2", &[("name", "bob".into()), ("age", 41.into())]), false).unwrap();

    let mut q = Document::new();
    q.insert("name", "ada");
    let (count, docs) = db.find("people", &q).unwrap();
    assert_eq!(count, 1);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get_str("name").unwrap(), "ada");
    assert_eq!(docs[0].get_i32("age").unwrap(), 36);
}

#[test]
fn scenario_2_indexed_range_with_orderby() {
    let temp = TempDir::new("docdb-s2").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("people", CollectionOptions::default()).unwrap();
    db.setindex("people", "age", IndexType::Num).unwrap();

    coll.save(doc("O1", &[("name", "ada".into()), ("age", 36.into())]), false).unwrap();
    coll.save(doc("O2", &[("name", "bob".into()), ("age", 41.into())]), false).unwrap();
    coll.save(doc("O3", &[("name", "cal".into()), ("age", 28.into())]), false).unwrap();

    let mut q = Document::new();
    let mut gt = Document::new();
    gt.insert("$gt", 30);
    q.insert("age", gt);
    let mut orderby = Document::new();
    orderby.insert("age", 1);
    q.insert("$orderby", orderby);

    let (count, docs) = db.find("people", &q).unwrap();
    assert_eq!(count, 2);
    let names: Vec<&str> = docs.iter().map(|d| d.get_str("name").unwrap()).collect();
    assert_eq!(names, vec!["ada", "bob"]);
}

#[test]
fn scenario_3_elem_match() {
    let temp = TempDir::new("docdb-s3").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("orders", CollectionOptions::default()).unwrap();

    let mut item_a = Document::new();
    item_a.insert("sku", "A");
    item_a.insert("qty", 2);
    let mut item_b = Document::new();
    item_b.insert("sku", "B");
    item_b.insert("qty", 5);
    coll.save(doc("O4", &[("items", bson::Bson::Array(vec![item_a.into(), item_b.into()]))]), false).unwrap();

    let mut elem = Document::new();
    elem.insert("sku", "B");
    let mut gt = Document::new();
    gt.insert("$gt", 3);
    elem.insert("qty", gt);
    let mut elem_match = Document::new();
    elem_match.insert("$elemMatch", elem);
    let mut q = Document::new();
    q.insert("items", elem_match);
    let (count, _) = db.find("orders", &q).unwrap();
    assert_eq!(count, 1);

    let mut elem2 = Document::new();
    elem2.insert("sku", "B");
    let mut gt2 = Document::new();
    gt2.insert("$gt", 9);
    elem2.insert("qty", gt2);
    let mut elem_match2 = Document::new();
    elem_match2.insert("$elemMatch", elem2);
    let mut q2 = Document::new();
    q2.insert("items", elem_match2);
    let (count2, _) = db.find("orders", &q2).unwrap();
    assert_eq!(count2, 0);
}

#[test]
fn scenario_4_set_and_upsert() {
    let temp = TempDir::new("docdb-s4").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("counters", CollectionOptions::default()).unwrap();
    coll.save(doc("O5", &[("n", 1.into())]), false).unwrap();

    let mut q = Document::new();
    q.insert("n", 1);
    let mut set = Document::new();
    set.insert("n", 2);
    let mut update = Document::new();
    update.insert("$set", set);
    let (count, _) = db.update("counters", &q, &update).unwrap();
    assert_eq!(count, 1);

    let mut q_after = Document::new();
    q_after.insert("n", 2);
    let (_, docs) = db.find("counters", &q_after).unwrap();
    assert_eq!(docs.len(), 1);

    let mut q_miss = Document::new();
    q_miss.insert("n", 9);
    let mut upsert_payload = Document::new();
    upsert_payload.insert("_id", oid_hex("O6"));
    upsert_payload.insert("n", 9);
    upsert_payload.insert("tag", "x");
    let mut update2 = Document::new();
    update2.insert("$upsert", upsert_payload);
    let (count2, _) = db.update("counters", &q_miss, &update2).unwrap();
    assert_eq!(count2, 1);

    let mut q_new = Document::new();
    q_new.insert("tag", "x");
    let (_, docs_new) = db.find("counters", &q_new).unwrap();
    assert_eq!(docs_new.len(), 1);
    assert_eq!(docs_new[0].get_i32("n").unwrap(), 9);
}

#[test]
fn scenario_5_transaction_rollback() {
    let temp = TempDir::new("docdb-s5").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("events", CollectionOptions::default()).unwrap();
    let before = coll.count();

    coll.begin_transaction().unwrap();
    coll.save(doc("O7", &[("v", "a".into())]), false).unwrap();
    coll.abort_transaction().unwrap();

    assert_eq!(coll.count(), before);
}

#[test]
fn scenario_5b_transaction_rollback_also_rolls_back_index_postings() {
    let temp = TempDir::new("docdb-s5b").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("events", CollectionOptions::default()).unwrap();
    db.setindex("events", "v", IndexType::Lex).unwrap();

    coll.begin_transaction().unwrap();
    coll.save(doc("O7", &[("v", "a".into())]), false).unwrap();
    coll.abort_transaction().unwrap();

    let postings = coll.index_scan_eq("v", IndexType::Lex, b"a").unwrap_or_default();
    assert!(postings.is_empty(), "aborted transaction left a stale index posting: {:?}", postings);
}

#[test]
fn scenario_6_or_across_branches_dedups() {
    let temp = TempDir::new("docdb-s6").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("items", CollectionOptions::default()).unwrap();
    coll.save(doc("O8", &[("a", 1.into())]), false).unwrap();
    coll.save(doc("O9", &[("a", 2.into()), ("b", 3.into())]), false).unwrap();

    let mut branch_a = Document::new();
    branch_a.insert("a", 1);
    let mut branch_b = Document::new();
    branch_b.insert("b", 3);
    let mut q = Document::new();
    q.insert("$or", bson::Bson::Array(vec![branch_a.into(), branch_b.into()]));

    let (count, docs) = db.find("items", &q).unwrap();
    assert_eq!(count, 2);
    assert_eq!(docs.len(), 2);
}

#[test]
fn max_zero_yields_empty() {
    let temp = TempDir::new("docdb-max0").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("things", CollectionOptions::default()).unwrap();
    coll.save(doc("O1", &[("v", 1.into())]), false).unwrap();

    let mut q = Document::new();
    q.insert("$max", 0);
    let (count, docs) = db.find("things", &q).unwrap();
    assert_eq!(count, 0);
    assert!(docs.is_empty());
}

#[test]
fn skip_past_total_yields_empty() {
    let temp = TempDir::new("docdb-skip").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("things", CollectionOptions::default()).unwrap();
    coll.save(doc("O1", &[("v", 1.into())]), false).unwrap();

    let mut q = Document::new();
    q.insert("$skip", 5);
    let (_, docs) = db.find("things", &q).unwrap();
    assert!(docs.is_empty());
}

#[test]
fn in_empty_array_matches_nothing() {
    let temp = TempDir::new("docdb-in-empty").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("things", CollectionOptions::default()).unwrap();
    coll.save(doc("O1", &[("v", 1.into())]), false).unwrap();

    let mut in_op = Document::new();
    in_op.insert("$in", bson::Bson::Array(Vec::new()));
    let mut q = Document::new();
    q.insert("v", in_op);
    let (count, _) = db.find("things", &q).unwrap();
    assert_eq!(count, 0);
}

#[test]
fn save_replaces_in_non_merge_mode_and_overlays_in_merge_mode() {
    let temp = TempDir::new("docdb-merge").unwrap();
    let db = open(&temp);
    let coll = db.create_collection("things", CollectionOptions::default()).unwrap();

    let mut d1 = Document::new();
    d1.insert("_id", "O1");
    d1.insert("a", 1);
    d1.insert("b", 2);
    let oid = coll.save(d1, false).unwrap();

    let mut d2 = Document::new();
    d2.insert("_id", "O1");
    d2.insert("a", 9);
    coll.save(d2, true).unwrap();

    let loaded = coll.load(oid).unwrap().unwrap();
    assert_eq!(loaded.get_i32("a").unwrap(), 9);
    assert_eq!(loaded.get_i32("b").unwrap(), 2);
}

#[test]
fn remove_and_reopen_enumerates_remaining_collections() {
    let temp = TempDir::new("docdb-reopen").unwrap();
    {
        let db = open(&temp);
        db.create_collection("keepers", CollectionOptions::default()).unwrap();
        db.create_collection("droppers", CollectionOptions::default()).unwrap();
        db.remove_collection("droppers", true).unwrap();
        db.close().unwrap();
    }

    let db2 = open(&temp);
    let names = db2.collection_names();
    assert!(names.contains(&"keepers".to_owned()));
    assert!(!names.contains(&"droppers".to_owned()));
}
