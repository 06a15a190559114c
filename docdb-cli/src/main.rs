extern crate bson;
extern crate clap;
extern crate docdb;
extern crate env_logger;

use bson::{Bson, Document};
use clap::{App, Arg, ArgMatches, SubCommand};
use docdb::{Database, IndexType, ObjectId, OpenFlags, Options};

fn open_db(path: &str) -> Result<Database, docdb::Error> {
    let mut options = Options::default();
    options.flags = OpenFlags::WRITER | OpenFlags::CREATE;
    Database::open(path, options)
}

/// Parses repeated `-f key=value` arguments into a document. Every value is
/// stored as a string; numeric/boolean typing is left to `put --int`/`put
/// --float` style follow-up flags, which this CLI does not need for a demo
/// tool.
fn parse_fields(matches: &ArgMatches) -> Document {
    let mut doc = Document::new();
    if let Some(values) = matches.values_of("FIELD") {
        for pair in values {
            if let Some(eq) = pair.find('=') {
                let (key, value) = pair.split_at(eq);
                doc.insert(key.to_owned(), Bson::String(value[1..].to_owned()));
            }
        }
    }
    doc
}

fn do_put(db_path: &str, collection: &str, id: Option<&str>, fields: Document) {
    let db = match open_db(db_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("open error: {}", err);
            return;
        }
    };
    let coll = match db.collection_or_create(collection) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("collection error: {}", err);
            return;
        }
    };
    let mut doc = fields;
    if let Some(id) = id {
        doc.insert("_id", id.to_owned());
    }
    match coll.save(doc, false) {
        Ok(oid) => println!("saved: {}", oid.to_hex()),
        Err(err) => eprintln!("put error: {}", err),
    }
}

fn do_get(db_path: &str, collection: &str, id: &str) {
    let db = match open_db(db_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("open error: {}", err);
            return;
        }
    };
    let oid = match ObjectId::parse_hex(id) {
        Ok(oid) => oid,
        Err(err) => {
            eprintln!("bad id: {}", err);
            return;
        }
    };
    match db.collection(collection).and_then(|c| c.load(oid)) {
        Ok(Some(doc)) => println!("{:?}", doc),
        Ok(None) => println!("not found"),
        Err(err) => eprintln!("get error: {}", err),
    }
}

fn do_del(db_path: &str, collection: &str, id: &str) {
    let db = match open_db(db_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("open error: {}", err);
            return;
        }
    };
    let oid = match ObjectId::parse_hex(id) {
        Ok(oid) => oid,
        Err(err) => {
            eprintln!("bad id: {}", err);
            return;
        }
    };
    match db.collection(collection).and_then(|c| c.remove(oid)) {
        Ok(true) => println!("removed"),
        Ok(false) => println!("not found"),
        Err(err) => eprintln!("delete error: {}", err),
    }
}

fn do_find(db_path: &str, collection: &str, fields: Document) {
    let db = match open_db(db_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("open error: {}", err);
            return;
        }
    };
    match db.find(collection, &fields) {
        Ok((count, docs)) => {
            println!("{} match(es)", count);
            for doc in docs {
                println!("{:?}", doc);
            }
        }
        Err(err) => eprintln!("find error: {}", err),
    }
}

fn do_index(db_path: &str, collection: &str, path: &str, index_type: &str) {
    let db = match open_db(db_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("open error: {}", err);
            return;
        }
    };
    let index_type = match index_type {
        "lex" => IndexType::Lex,
        "ilex" => IndexType::Ilex,
        "num" => IndexType::Num,
        "arr" => IndexType::Arr,
        other => {
            eprintln!("unknown index type: {}", other);
            return;
        }
    };
    if let Err(err) = db.collection_or_create(collection) {
        eprintln!("collection error: {}", err);
        return;
    }
    match db.setindex(collection, path, index_type) {
        Ok(()) => println!("index created on {}", path),
        Err(err) => eprintln!("index error: {}", err),
    }
}

fn main() {
    env_logger::init();

    let matches = App::new("docdb-cli")
        .version("0.1.0")
        .author("Embedded document database")
        .about("A simple command line interface for docdb")
        .arg(Arg::with_name("DB").short("d").long("db").takes_value(true).global(true))
        .arg(Arg::with_name("COLLECTION").short("c").long("collection").takes_value(true).global(true))
        .subcommand(
            SubCommand::with_name("put")
                .about("Insert or replace a document")
                .arg(Arg::with_name("ID").short("i").long("id").takes_value(true))
                .arg(Arg::with_name("FIELD").short("f").long("field").takes_value(true).multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("get")
                .about("Load a document by id")
                .arg(Arg::with_name("ID").short("i").long("id").takes_value(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("del")
                .about("Remove a document by id")
                .arg(Arg::with_name("ID").short("i").long("id").takes_value(true).required(true)),
        )
        .subcommand(
            SubCommand::with_name("find")
                .about("Find documents by equality on the given fields")
                .arg(Arg::with_name("FIELD").short("f").long("field").takes_value(true).multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("index")
                .about("Declare a secondary index")
                .arg(Arg::with_name("PATH").short("p").long("path").takes_value(true).required(true))
                .arg(Arg::with_name("TYPE").short("t").long("type").takes_value(true).required(true)),
        )
        .get_matches();

    let db_path = matches.value_of("DB").unwrap_or("docdb.data");
    let collection = matches.value_of("COLLECTION").unwrap_or("default");

    match matches.subcommand() {
        ("put", Some(sub_m)) => do_put(db_path, collection, sub_m.value_of("ID"), parse_fields(sub_m)),
        ("get", Some(sub_m)) => do_get(db_path, collection, sub_m.value_of("ID").unwrap()),
        ("del", Some(sub_m)) => do_del(db_path, collection, sub_m.value_of("ID").unwrap()),
        ("find", Some(sub_m)) => do_find(db_path, collection, parse_fields(sub_m)),
        ("index", Some(sub_m)) => do_index(
            db_path,
            collection,
            sub_m.value_of("PATH").unwrap(),
            sub_m.value_of("TYPE").unwrap(),
        ),
        _ => println!("no subcommand given, see --help"),
    }
}
