//! # Query Engine
//!
//! Evaluates conjunctive predicates over one table, choosing an index
//! scan when a declared index covers them and falling back to a full
//! table scan otherwise.
//!
//! ## Planning
//!
//! The best index is the one whose column tuple covers the most
//! predicates along a prefix: any number of equality predicates may
//! match consecutive key positions, then at most one ordered comparison,
//! then matching stops. With no usable prefix the plan is a full scan in
//! row-id (= physical) order.
//!
//! An index walk starts at the smallest key assembled from the equality
//! values (plus a `>`/`>=` bound, when one participates) and terminates
//! as soon as a key leaves the range where matches are possible: when an
//! equality component of the prefix stops holding, or a `<`/`<=` bound
//! stops holding. Every surviving candidate is still checked against
//! *all* predicates, so `>` bounds and unindexed columns filter
//! correctly.
//!
//! ## Laziness
//!
//! [`run`] produces a lazy iterator over matching row ids. It borrows
//! the table's in-memory state, so results reflect unsaved creations,
//! mutations, and destructions (read-your-writes). The sequence is
//! restartable by calling `run` again with the same [`Query`]; each run
//! re-executes the plan against current state.

use std::collections::btree_set;
use std::collections::BTreeSet;

use eyre::Result;

use crate::error::StoreError;
use crate::index::{IndexKey, IndexManager, TableIndex};
use crate::store::RowStore;
use crate::types::Value;

/// Per-column comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn matches(&self, lhs: &Value, rhs: &Value) -> bool {
        match self {
            Op::Eq => lhs == rhs,
            Op::Lt => lhs < rhs,
            Op::Le => lhs <= rhs,
            Op::Gt => lhs > rhs,
            Op::Ge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Predicate {
    column: String,
    op: Op,
    value: Value,
}

impl Predicate {
    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// A reusable conjunctive filter. Build once, run as often as needed.
#[derive(Debug, Clone, Default)]
pub struct Query {
    predicates: Vec<Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, column: impl Into<String>, op: Op, value: Value) -> Self {
        self.predicates.push(Predicate {
            column: column.into(),
            op,
            value,
        });
        self
    }

    pub fn eq(self, column: impl Into<String>, value: Value) -> Self {
        self.filter(column, Op::Eq, value)
    }

    pub fn lt(self, column: impl Into<String>, value: Value) -> Self {
        self.filter(column, Op::Lt, value)
    }

    pub fn le(self, column: impl Into<String>, value: Value) -> Self {
        self.filter(column, Op::Le, value)
    }

    pub fn gt(self, column: impl Into<String>, value: Value) -> Self {
        self.filter(column, Op::Gt, value)
    }

    pub fn ge(self, column: impl Into<String>, value: Value) -> Self {
        self.filter(column, Op::Ge, value)
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }
}

/// A predicate resolved against the table: `None` is the implicit `id`
/// pseudo-column, `Some(i)` a declared column position.
struct Test<'a> {
    position: Option<usize>,
    predicate: &'a Predicate,
}

/// A range-termination check evaluated against index keys.
struct Stop<'a> {
    slot: usize,
    op: Op,
    value: &'a Value,
}

enum Scan<'a> {
    ById(std::option::IntoIter<u64>),
    Table(Box<dyn Iterator<Item = u64> + 'a>),
    Index {
        entries: Box<dyn Iterator<Item = (&'a IndexKey, &'a BTreeSet<u64>)> + 'a>,
        current: Option<btree_set::Iter<'a, u64>>,
        stops: Vec<Stop<'a>>,
        done: bool,
    },
}

/// Lazy sequence of matching row ids, as returned by
/// [`crate::Table::search`].
pub struct Matches<'a> {
    store: &'a RowStore,
    scan: Scan<'a>,
    tests: Vec<Test<'a>>,
}

impl std::fmt::Debug for Matches<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matches").finish_non_exhaustive()
    }
}

/// Plans and starts one execution of `query` against a table.
pub(crate) fn run<'a>(
    store: &'a RowStore,
    indexes: &'a IndexManager,
    query: &'a Query,
) -> Result<Matches<'a>> {
    let def = store.def();

    let mut tests = Vec::with_capacity(query.predicates().len());
    for predicate in query.predicates() {
        let position = if predicate.column() == "id" {
            None
        } else {
            Some(def.column_index(predicate.column()).ok_or_else(|| {
                eyre::Report::new(StoreError::UnknownColumn {
                    table: def.name().to_string(),
                    column: predicate.column().to_string(),
                })
            })?)
        };
        tests.push(Test {
            position,
            predicate,
        });
    }

    // exact-id fast path: the row map is the implicit primary index
    if let Some(test) = tests
        .iter()
        .find(|t| t.position.is_none() && t.predicate.op() == Op::Eq)
    {
        let id = test.predicate.value().as_id()?;
        let candidate = id.filter(|id| store.contains(*id));
        return Ok(Matches {
            store,
            scan: Scan::ById(candidate.into_iter()),
            tests,
        });
    }

    let scan = match best_index(indexes, query) {
        Some(index) => {
            let mut start = IndexKey::new();
            let mut stops = Vec::new();
            for (slot, column) in index.columns().iter().enumerate() {
                if let Some(p) = query
                    .predicates()
                    .iter()
                    .find(|p| p.column() == column && p.op() == Op::Eq)
                {
                    start.push(p.value().clone());
                    stops.push(Stop {
                        slot,
                        op: Op::Eq,
                        value: p.value(),
                    });
                } else if let Some(p) = query
                    .predicates()
                    .iter()
                    .find(|p| p.column() == column && p.op() != Op::Eq)
                {
                    match p.op() {
                        // a < bound starts from the very beginning and
                        // terminates the walk once it stops holding
                        Op::Lt | Op::Le => stops.push(Stop {
                            slot,
                            op: p.op(),
                            value: p.value(),
                        }),
                        // a > bound only positions the start of the walk;
                        // the boundary keys are filtered by the full test
                        _ => start.push(p.value().clone()),
                    }
                    break;
                } else {
                    break;
                }
            }
            let start = if start.is_empty() { None } else { Some(start) };
            Scan::Index {
                entries: Box::new(index.scan_from(start)),
                current: None,
                stops,
                done: false,
            }
        }
        None => Scan::Table(Box::new(store.ids())),
    };

    Ok(Matches { store, scan, tests })
}

/// The original prefix-strength rule: walk an index's columns, counting
/// equality predicates, allowing a single comparison predicate, stopping
/// at the first uncovered column. The strongest index wins.
fn best_index<'a>(indexes: &'a IndexManager, query: &Query) -> Option<&'a TableIndex> {
    let mut best: Option<&TableIndex> = None;
    let mut best_strength = 0usize;
    for index in indexes.indices() {
        let mut strength = 0;
        for column in index.columns() {
            let eq = query
                .predicates()
                .iter()
                .any(|p| p.column() == column && p.op() == Op::Eq);
            let cmp = query
                .predicates()
                .iter()
                .any(|p| p.column() == column && p.op() != Op::Eq);
            if eq {
                strength += 1;
            } else if cmp {
                strength += 1;
                break;
            } else {
                break;
            }
        }
        if strength > best_strength {
            best_strength = strength;
            best = Some(index);
        }
    }
    best
}

impl<'a> Matches<'a> {
    fn candidate(&mut self) -> Option<u64> {
        match &mut self.scan {
            Scan::ById(ids) => ids.next(),
            Scan::Table(ids) => ids.next(),
            Scan::Index {
                entries,
                current,
                stops,
                done,
            } => loop {
                if *done {
                    return None;
                }
                if let Some(ids) = current {
                    if let Some(id) = ids.next() {
                        return Some(*id);
                    }
                    *current = None;
                }
                match entries.next() {
                    Some((key, ids)) => {
                        if stops.iter().any(|s| !s.op.matches(&key[s.slot], s.value)) {
                            *done = true;
                            return None;
                        }
                        *current = Some(ids.iter());
                    }
                    None => {
                        *done = true;
                        return None;
                    }
                }
            },
        }
    }

    fn passes(&self, id: u64) -> Result<bool> {
        for test in &self.tests {
            let actual = match test.position {
                None => Value::Id(id),
                Some(position) => self.store.get(id, position)?,
            };
            if !test.predicate.op().matches(&actual, test.predicate.value()) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<'a> Iterator for Matches<'a> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let id = self.candidate()?;
            match self.passes(id) {
                Ok(true) => return Some(Ok(id)),
                Ok(false) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
