//! # Database Handle
//!
//! The owning entry point: one [`Database`] per data directory, holding
//! one [`Table`] per declared [`TableDef`]. Connecting validates the
//! declarations as a set (foreign targets, index columns, virtual
//! chains), reconciles each table's files through the migration engine,
//! and brings secondary indices up.
//!
//! ```text
//! Database
//! ├── Table "human"            RowStore + IndexManager
//! │     human.tbl              fixed-width records
//! │     human.schema           persisted definition
//! │     human.0.idx            one file per declared index
//! └── Table "tribble"
//!       tribble.tbl
//!       tribble.schema
//!       tribble_notes/         blob directory, one file per row
//! ```
//!
//! A `Table` coordinates its row store and indices so the two never
//! drift: every create, set, and destroy updates both, which is what
//! lets a query in the same session see unsaved changes. Nothing reaches
//! disk before [`Table::save`] / [`Database::save`].

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use tracing::debug;

use crate::config::MAX_COLUMNS;
use crate::error::StoreError;
use crate::index::IndexManager;
use crate::migrate;
use crate::query::{self, Matches, Query};
use crate::relation::{self, Resolved};
use crate::schema::{ColumnKind, TableDef, VirtualDef};
use crate::store::RowStore;
use crate::types::{Serializable, Value};

#[derive(Debug)]
pub struct Table {
    dir: PathBuf,
    store: RowStore,
    indexes: IndexManager,
}

impl Table {
    pub fn name(&self) -> &str {
        self.store.def().name()
    }

    pub fn def(&self) -> &TableDef {
        self.store.def()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.store.contains(id)
    }

    /// Live row ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.store.ids()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.store.has_unsaved_changes()
    }

    /// Creates a blank row and returns its freshly allocated id.
    pub fn create(&mut self) -> u64 {
        let id = self.store.create();
        let values = self.store.values(id).expect("created row must be live");
        self.indexes.add_row(id, values);
        id
    }

    /// Writes one column of a live row. The value is validated against
    /// the column's kind and length before anything changes; affected
    /// indices are updated in the same step.
    pub fn set(&mut self, id: u64, column: &str, value: Value) -> Result<()> {
        if column == "id" {
            bail!("column 'id' of table '{}' is read-only", self.name());
        }
        let position = self.column_position(column)?;
        let indexed = !self.store.def().columns()[position].kind().is_blob();
        let old = self.store.set(id, position, value)?;
        if indexed {
            let values = self.store.values(id).expect("written row must be live");
            self.indexes.update_column(id, position, &old, values);
        }
        Ok(())
    }

    /// Reads one column of a live row. `"id"` reads the row id itself.
    pub fn get(&self, id: u64, column: &str) -> Result<Value> {
        if column == "id" {
            if !self.store.contains(id) {
                return Err(eyre::Report::new(StoreError::RowNotFound {
                    table: self.name().to_string(),
                    id,
                }));
            }
            return Ok(Value::Id(id));
        }
        let position = self.column_position(column)?;
        self.store.get(id, position)
    }

    /// Typed read of a `Pickle`/`PickleBlob` column; `None` when blank.
    pub fn get_as<T: Serializable>(&self, id: u64, column: &str) -> Result<Option<T>> {
        match self.get(id, column)? {
            Value::Null => Ok(None),
            Value::Bytes(bytes) => Ok(Some(T::from_bytes(&bytes)?)),
            other => bail!(
                "column '{}' of table '{}' holds {}, not a serialized payload",
                column,
                self.name(),
                other.kind_name()
            ),
        }
    }

    /// Typed write of a `Pickle`/`PickleBlob` column.
    pub fn set_as<T: Serializable>(&mut self, id: u64, column: &str, value: &T) -> Result<()> {
        let bytes = value.to_bytes()?;
        self.set(id, column, Value::Bytes(bytes))
    }

    /// Removes a row. The change is in-memory until the next save; the
    /// id is never reissued.
    pub fn destroy(&mut self, id: u64) -> Result<()> {
        let values = self.store.destroy(id)?;
        self.indexes.remove_row(id, &values);
        Ok(())
    }

    /// Runs a query, returning a lazy iterator over matching row ids.
    /// Results reflect current in-memory state, saved or not; rerunning
    /// the same query restarts it against whatever state holds then.
    pub fn search<'a>(&'a self, query: &'a Query) -> Result<Matches<'a>> {
        query::run(&self.store, &self.indexes, query)
    }

    /// First matching row id, if any.
    pub fn find_first(&self, query: &Query) -> Result<Option<u64>> {
        match self.search(query)?.next() {
            Some(id) => Ok(Some(id?)),
            None => Ok(None),
        }
    }

    /// Flushes pending row changes, then rewrites this table's index
    /// files to match.
    pub fn save(&mut self) -> Result<()> {
        if !self.store.has_unsaved_changes() {
            return Ok(());
        }
        self.store.save()?;
        self.indexes
            .persist(&self.dir, self.store.def().name(), self.store.generation())?;
        Ok(())
    }

    fn column_position(&self, column: &str) -> Result<usize> {
        self.store.def().column_index(column).ok_or_else(|| {
            eyre::Report::new(StoreError::UnknownColumn {
                table: self.name().to_string(),
                column: column.to_string(),
            })
        })
    }
}

#[derive(Debug)]
pub struct Database {
    dir: PathBuf,
    tables: Vec<Table>,
    by_name: HashMap<String, usize>,
}

impl Database {
    /// Opens (creating if needed) the database at `dir` under the given
    /// table declarations. Tables whose files no longer match their
    /// declaration are migrated here; a migration failure aborts the
    /// connect and leaves every table's files untouched.
    pub fn connect(dir: impl AsRef<Path>, defs: Vec<TableDef>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create data directory '{}'", dir.display()))?;
        validate_defs(&defs)?;

        let mut tables = Vec::with_capacity(defs.len());
        let mut by_name = HashMap::with_capacity(defs.len());
        for def in defs {
            let (store, migrated) = migrate::reconcile(&dir, &def)
                .wrap_err_with(|| format!("failed to open table '{}'", def.name()))?;
            let mut indexes = IndexManager::new(store.def())?;
            if migrated {
                indexes.rebuild(&store);
                indexes.persist(&dir, store.def().name(), store.generation())?;
            } else {
                indexes.load_or_rebuild(&dir, store.def().name(), &store);
            }
            debug!(
                table = store.def().name(),
                rows = store.len(),
                migrated,
                "table opened"
            );
            by_name.insert(store.def().name().to_string(), tables.len());
            tables.push(Table {
                dir: dir.clone(),
                store,
                indexes,
            });
        }

        Ok(Self {
            dir,
            tables,
            by_name,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.tables.iter().map(|t| t.name())
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        let index = self.table_position(name)?;
        Ok(&self.tables[index])
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        let index = self.table_position(name)?;
        Ok(&mut self.tables[index])
    }

    /// Resolves a virtual column of one row: the rows that point back at
    /// it, or a projection over them.
    pub fn related(&self, table: &str, id: u64, name: &str) -> Result<Resolved> {
        relation::resolve(self, table, id, name)
    }

    /// Saves every table in declaration order, stopping at the first
    /// failure. Tables already saved stay saved; there is no cross-table
    /// atomicity.
    pub fn save(&mut self) -> Result<()> {
        for table in &mut self.tables {
            table
                .save()
                .wrap_err_with(|| format!("failed to save table '{}'", table.name()))?;
        }
        Ok(())
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.tables.iter().any(|t| t.has_unsaved_changes())
    }

    fn table_position(&self, name: &str) -> Result<usize> {
        self.by_name.get(name).copied().ok_or_else(|| {
            eyre::Report::new(StoreError::UnknownTable {
                name: name.to_string(),
            })
        })
    }
}

/// Cross-table validation of the declared set, before any file is
/// touched.
fn validate_defs(defs: &[TableDef]) -> Result<()> {
    let mut names = HashSet::with_capacity(defs.len());
    for def in defs {
        ensure!(
            names.insert(def.name()),
            "table '{}' is declared twice",
            def.name()
        );
    }

    for def in defs {
        ensure!(
            def.columns().len() <= MAX_COLUMNS,
            "table '{}' declares {} columns, limit is {}",
            def.name(),
            def.columns().len(),
            MAX_COLUMNS
        );

        let mut columns = HashSet::with_capacity(def.columns().len());
        for column in def.columns() {
            ensure!(
                column.name() != "id",
                "table '{}': 'id' is the implicit primary column",
                def.name()
            );
            ensure!(
                columns.insert(column.name()),
                "table '{}' declares column '{}' twice",
                def.name(),
                column.name()
            );
            if let ColumnKind::Foreign { table } = column.kind() {
                ensure!(
                    names.contains(table.as_str()),
                    "table '{}', column '{}': foreign target '{}' is not declared",
                    def.name(),
                    column.name(),
                    table
                );
            }
        }

        for index in def.indices() {
            ensure!(
                !index.columns().is_empty(),
                "table '{}' declares an empty index",
                def.name()
            );
            for column in index.columns() {
                let found = def.get_column(column).ok_or_else(|| {
                    eyre::eyre!(
                        "table '{}': index column '{}' does not exist",
                        def.name(),
                        column
                    )
                })?;
                ensure!(
                    !found.kind().is_blob(),
                    "table '{}': blob column '{}' cannot be indexed",
                    def.name(),
                    column
                );
            }
        }

        let mut virtuals = HashSet::with_capacity(def.virtuals().len());
        for (name, _) in def.virtuals() {
            ensure!(
                name != "id" && def.get_column(name).is_none(),
                "table '{}': virtual '{}' shadows a column",
                def.name(),
                name
            );
            ensure!(
                virtuals.insert(name.as_str()),
                "table '{}' declares virtual '{}' twice",
                def.name(),
                name
            );
        }
        for (name, _) in def.virtuals() {
            let mut visited = HashSet::new();
            validate_virtual(defs, def, name, &mut visited)?;
        }
    }
    Ok(())
}

/// Checks one virtual chain and reports the table its rows come from
/// (`None` when it projects a scalar column).
fn validate_virtual<'a>(
    defs: &'a [TableDef],
    def: &'a TableDef,
    name: &str,
    visited: &mut HashSet<(String, String)>,
) -> Result<Option<&'a str>> {
    ensure!(
        visited.insert((def.name().to_string(), name.to_string())),
        "table '{}': virtual '{}' is part of a cycle",
        def.name(),
        name
    );
    let vd = def.virtual_def(name).ok_or_else(|| {
        eyre::eyre!("table '{}': virtual '{}' is not declared", def.name(), name)
    })?;
    match vd {
        VirtualDef::Belongs { table, column } => {
            let target = defs.iter().find(|d| d.name() == table).ok_or_else(|| {
                eyre::eyre!(
                    "table '{}', virtual '{}': table '{}' is not declared",
                    def.name(),
                    name,
                    table
                )
            })?;
            let found = target.get_column(column).ok_or_else(|| {
                eyre::eyre!(
                    "table '{}', virtual '{}': table '{}' has no column '{}'",
                    def.name(),
                    name,
                    table,
                    column
                )
            })?;
            match found.kind() {
                ColumnKind::Foreign { table: back } if back == def.name() => {
                    Ok(Some(target.name()))
                }
                _ => bail!(
                    "table '{}', virtual '{}': column '{}.{}' does not reference '{}'",
                    def.name(),
                    name,
                    table,
                    column,
                    def.name()
                ),
            }
        }
        VirtualDef::Through { via, column } => {
            let inner = validate_virtual(defs, def, via, visited)?.ok_or_else(|| {
                eyre::eyre!(
                    "table '{}', virtual '{}': '{}' projects a scalar and cannot be chained",
                    def.name(),
                    name,
                    via
                )
            })?;
            let target = defs
                .iter()
                .find(|d| d.name() == inner)
                .ok_or_else(|| eyre::eyre!("table '{}' is not declared", inner))?;
            let found = target.get_column(column).ok_or_else(|| {
                eyre::eyre!(
                    "table '{}', virtual '{}': table '{}' has no column '{}'",
                    def.name(),
                    name,
                    inner,
                    column
                )
            })?;
            match found.kind() {
                ColumnKind::Foreign { table } => Ok(Some(table.as_str())),
                _ => Ok(None),
            }
        }
    }
}
