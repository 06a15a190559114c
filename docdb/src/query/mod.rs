//! The query language: predicate/update compilation (spec §4.E).
//!
//! A query document is compiled once, up front, into a small `BoolExpr`
//! tree of `Predicate`s plus a `Hints` struct for the non-predicate control
//! keys (`$orderby`/`$skip`/`$max`/`$fields`/`$icase`/`$do`). The planner
//! (`::planner`) and executor (`::executor`) then work off the compiled
//! form rather than re-walking the raw BSON on every document.

pub mod compile;
pub mod executor;
pub mod planner;
pub mod project;

use bson::Bson;
use regex::Regex;

/// A single field-path comparison.
#[derive(Debug, Clone)]
pub struct Predicate {
    /// Dotted field path the predicate reads (spec §4.E `path`).
    pub path: String,
    /// The comparison itself.
    pub op: Op,
    /// Whether string comparisons should fold case (`$icase`).
    pub icase: bool,
    /// `$not`: flips the leaf verdict. A missing field still counts as a
    /// match under negation (spec §8 "NEGATE on a missing field succeeds").
    pub negate: bool,
    /// Set by the planner when this predicate is served by the driver
    /// index and should not be re-evaluated during residual filtering
    /// (spec §4.F "mark it EXCLUDED").
    pub excluded: bool,
}

impl Predicate {
    /// Builds a plain, non-excluded predicate.
    pub fn simple(path: String, op: Op, icase: bool) -> Predicate {
        Predicate {
            path,
            op,
            icase,
            negate: false,
            excluded: false,
        }
    }
}

/// The comparison a `Predicate` performs (spec §4.E `op`/`operand`).
#[derive(Debug, Clone)]
pub enum Op {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    /// `$bt: [lo, hi]`, inclusive on both ends.
    Between(Bson, Bson),
    /// `$begin: "prefix"` (spec op family STR-STARTS-WITH).
    StartsWith(String),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    /// `$strand: [tok, …]` — array/token-index AND membership.
    StrAnd(Vec<String>),
    /// `$stror: [tok, …]` — array/token-index OR membership.
    StrOr(Vec<String>),
    Exists(bool),
    Regex(Regex),
    /// At most one per path (spec invariant, `ErrorKind::OneElemMatchOnly`):
    /// matches if some array element at `path` satisfies every nested
    /// predicate simultaneously.
    ElemMatch(Vec<Predicate>),
    /// Synthetic always-true marker (spec op `TRUE`), used for `$orderby`
    /// paths that carry no predicate of their own, and for pure-update
    /// queries.
    True,
}

/// A compiled boolean combination of predicates.
#[derive(Debug, Clone)]
pub enum BoolExpr {
    And(Vec<BoolExpr>),
    Or(Vec<BoolExpr>),
    Pred(Predicate),
}

/// Non-predicate query hints (spec §4.E "hints").
#[derive(Debug, Clone, Default)]
pub struct Hints {
    /// `$orderby`: `(path, ascending)` pairs, applied in order, stable.
    pub orderby: Vec<(String, bool)>,
    /// `$skip`.
    pub skip: u64,
    /// `$max` (result-count limit).
    pub max: Option<u64>,
    /// `$fields`: `(include?, paths)`. All paths share the same
    /// include/exclude sense (`ErrorKind::QueryIncExcl` otherwise), except
    /// `"_id"` which may always be excluded alongside an include list.
    pub fields: Option<(bool, Vec<String>)>,
    /// `$do`: opaque post-processing document (`$join` etc), interpreted
    /// by `::project`.
    pub do_doc: Option<::bson::Document>,
}

/// A compiled query: predicate tree plus hints.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub filter: BoolExpr,
    pub hints: Hints,
}

/// A single update action (spec §4.G update actions).
#[derive(Debug, Clone)]
pub enum UpdateAction {
    Set(String, Bson),
    Inc(String, f64),
    AddToSet(String, Bson),
    AddToSetAll(String, Vec<Bson>),
    Pull(String, Bson),
    PullAll(String, Vec<Bson>),
    /// Clears every field not named `_id`.
    DropAll,
}

/// A compiled update document.
#[derive(Debug, Clone, Default)]
pub struct CompiledUpdate {
    pub actions: Vec<UpdateAction>,
    /// `$upsert: {…}` payload: inserted with a freshly generated oid if the
    /// query matched nothing by the end of the scan (spec §4.G `$upsert`).
    pub upsert: Option<::bson::Document>,
}

impl CompiledUpdate {
    /// Whether this update carries any action at all (an update-mode scan
    /// is only entered when this is true).
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.upsert.is_none()
    }
}
