//! # Virtual Column Resolution
//!
//! Virtual columns are computed at read time from foreign references;
//! nothing about them is stored. `Belongs` inverts a foreign key: the
//! rows of another table whose `Foreign` column points at this row,
//! found through that column's index when one is declared. `Through`
//! projects a column across the rows another virtual produced, so
//! declarations chain:
//!
//! ```text
//! human.tribbles       = Belongs(tribble, owner)      -> tribble rows
//! human.tribble_names  = Through(tribbles, name)      -> strings
//! human.tribble_breeds = Through(tribbles, breed)     -> breed rows
//! ```
//!
//! Projecting a `Foreign` column yields the referenced rows; null and
//! dangling references are skipped rather than reported, since a
//! destroyed row must not poison every chain that once reached it.

use eyre::{bail, Result};

use crate::database::Database;
use crate::error::StoreError;
use crate::query::Query;
use crate::schema::{ColumnKind, VirtualDef};
use crate::types::Value;

/// What a virtual column resolved to.
///
/// Resolution is materialized: both forms hold the complete id or value
/// list, collected while the resolver still holds the database borrow.
/// A `Resolved` therefore stays valid however the tables change
/// afterwards; re-resolve to observe later mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Rows of `table`, in the order the resolution produced them.
    Rows { table: String, ids: Vec<u64> },
    /// Scalar projection, one entry per underlying row.
    Values(Vec<Value>),
}

impl Resolved {
    pub fn rows(&self) -> Option<(&str, &[u64])> {
        match self {
            Resolved::Rows { table, ids } => Some((table, ids)),
            Resolved::Values(_) => None,
        }
    }

    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Resolved::Values(values) => Some(values),
            Resolved::Rows { .. } => None,
        }
    }
}

pub(crate) fn resolve(db: &Database, table: &str, id: u64, name: &str) -> Result<Resolved> {
    let source = db.table(table)?;
    if !source.contains(id) {
        return Err(eyre::Report::new(StoreError::RowNotFound {
            table: table.to_string(),
            id,
        }));
    }
    let vd = source.def().virtual_def(name).ok_or_else(|| {
        eyre::Report::new(StoreError::UnknownColumn {
            table: table.to_string(),
            column: name.to_string(),
        })
    })?;

    match vd.clone() {
        VirtualDef::Belongs {
            table: target,
            column,
        } => {
            let query = Query::new().eq(column, Value::Id(id));
            let ids = db
                .table(&target)?
                .search(&query)?
                .collect::<Result<Vec<_>>>()?;
            Ok(Resolved::Rows { table: target, ids })
        }
        VirtualDef::Through { via, column } => {
            let inner = resolve(db, table, id, &via)?;
            let Resolved::Rows {
                table: inner_table,
                ids,
            } = inner
            else {
                bail!(
                    "virtual '{}' of table '{}' projects a scalar and cannot be chained",
                    via,
                    table
                );
            };
            project(db, &inner_table, &ids, &column)
        }
    }
}

/// Projects one column across a resolved row set. A `Foreign` column
/// keeps the result in row space; anything else flattens to values.
fn project(db: &Database, table: &str, ids: &[u64], column: &str) -> Result<Resolved> {
    let source = db.table(table)?;
    let def = source.def().get_column(column).ok_or_else(|| {
        eyre::Report::new(StoreError::UnknownColumn {
            table: table.to_string(),
            column: column.to_string(),
        })
    })?;

    if let ColumnKind::Foreign { table: target } = def.kind().clone() {
        let target_table = db.table(&target)?;
        let mut out = Vec::new();
        for &id in ids {
            match source.get(id, column)? {
                Value::Null => {}
                Value::Id(referenced) if target_table.contains(referenced) => {
                    out.push(referenced);
                }
                Value::Id(_) => {} // dangling reference reads as absent
                other => bail!(
                    "foreign column '{}.{}' holds {}",
                    table,
                    column,
                    other.kind_name()
                ),
            }
        }
        return Ok(Resolved::Rows {
            table: target,
            ids: out,
        });
    }

    let mut out = Vec::with_capacity(ids.len());
    for &id in ids {
        out.push(source.get(id, column)?);
    }
    Ok(Resolved::Values(out))
}
