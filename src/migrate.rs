//! # Migration Engine
//!
//! Reconciles a table's declared definition with what its files hold.
//! Each table carries a `.schema` descriptor recording the definition it
//! was last written under; at connect time the descriptor is compared to
//! the declaration and, when they differ, the table is rewritten.
//!
//! ## What a rewrite does
//!
//! Column names are identity. For every live row:
//!
//! - a column present under the same name has its value carried over,
//!   re-validated against the new kind (length bounds included);
//! - a newly added column starts at its kind's blank;
//! - a column absent from the new definition is dropped, along with its
//!   blob directory if it had one;
//! - inline/blob conversions follow from the kinds: payloads move
//!   between record slots and blob files as needed.
//!
//! Row ids, the id counter, and tombstone semantics survive: no id is
//! ever reissued because a migration ran.
//!
//! ## Failure model
//!
//! Migration is all-or-nothing per table. Every row is converted in
//! memory first; any value the new definition cannot hold (an oversized
//! string, an incompatible kind change) aborts with
//! [`StoreError::Migration`] before anything is written. The record file
//! and descriptor are then each replaced through a temp sibling +
//! rename, so a crash leaves the table wholly old or wholly new.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::codec;
use crate::config::SCHEMA_EXT;
use crate::error::StoreError;
use crate::schema::{load_descriptor, store_descriptor, TableDef};
use crate::store::{MigratedRow, RowStore};

pub(crate) fn schema_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{}.{}", table, SCHEMA_EXT))
}

/// Opens a table's row store, migrating its files first if the declared
/// definition no longer matches the persisted descriptor. Returns the
/// store and whether a rewrite happened.
pub(crate) fn reconcile(dir: &Path, def: &TableDef) -> Result<(RowStore, bool)> {
    let path = schema_path(dir, def.name());
    match load_descriptor(&path)? {
        None => {
            // first connect: adopt the declaration as the stored shape
            let store = RowStore::open(dir, def.clone())?;
            store_descriptor(&path, def)?;
            Ok((store, false))
        }
        Some(stored) if stored.storage_eq(def) => {
            let store = RowStore::open(dir, def.clone())?;
            Ok((store, false))
        }
        Some(stored) => {
            let store = rewrite(dir, stored, def)
                .wrap_err_with(|| format!("failed to migrate table '{}'", def.name()))?;
            store_descriptor(&path, def)?;
            Ok((store, true))
        }
    }
}

fn rewrite(dir: &Path, stored: TableDef, def: &TableDef) -> Result<RowStore> {
    let old = RowStore::open(dir, stored)?;

    // new column position -> old column position, matched by name
    let sources: Vec<Option<usize>> = def
        .columns()
        .iter()
        .map(|c| old.def().column_index(c.name()))
        .collect();

    let ids: Vec<u64> = old.ids().collect();
    let mut rows = Vec::with_capacity(ids.len());
    for id in ids {
        let mut values = Vec::with_capacity(def.columns().len());
        for (column, source) in def.columns().iter().zip(&sources) {
            let value = match source {
                Some(position) => old.get(id, *position)?,
                None => column.kind().blank(),
            };
            codec::validate(column.name(), column.kind(), &value).map_err(|e| {
                eyre::Report::new(StoreError::Migration {
                    table: def.name().to_string(),
                    column: column.name().to_string(),
                    reason: e.to_string(),
                })
            })?;
            values.push(value);
        }
        rows.push(MigratedRow {
            id,
            values,
            blob_present: 0,
            // every value sits in memory, so write_full flushes them all
            blob_loaded: u64::MAX,
        });
    }

    // blob directories that the new definition no longer feeds
    let stale: Vec<String> = old
        .def()
        .columns()
        .iter()
        .filter(|c| c.kind().is_blob())
        .filter(|c| {
            def.get_column(c.name())
                .map_or(true, |new| !new.kind().is_blob())
        })
        .map(|c| c.name().to_string())
        .collect();

    let row_count = rows.len();
    let next_row_id = old.next_row_id();
    // carried so index files written before the migration can never
    // match the rewritten table's generation
    let generation = old.generation();
    drop(old);

    let mut store = RowStore::from_rows(dir, def.clone(), rows, next_row_id, generation);
    store.write_full()?;
    for column in &stale {
        store.blobs().remove_column(column)?;
    }

    debug!(table = def.name(), rows = row_count, "table migrated");
    Ok(store)
}
