//! # Schema Definitions
//!
//! The static per-table configuration consumed at connect time: column
//! kinds, declared indices, and virtual (derived) columns. A [`TableDef`]
//! is built once at startup with the builder methods and handed to
//! [`crate::Database::connect`]; it is immutable while the database is
//! running and only changes across a migration.
//!
//! Column names are the identity that survives migrations: a column that
//! keeps its name keeps its data, whatever happens to its kind or length.

mod persistence;

pub(crate) use persistence::{load_descriptor, store_descriptor};

use crate::types::Value;

/// Storage kind of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    /// 64-bit signed integer, 8-byte inline slot.
    Int,
    /// UTF-8 string, inline, at most `len` encoded bytes.
    Str { len: u32 },
    /// Opaque serialized payload, inline, at most `len` bytes.
    Pickle { len: u32 },
    /// Unbounded string stored in a per-row blob file.
    StrBlob,
    /// Unbounded serialized payload stored in a per-row blob file.
    PickleBlob,
    /// Reference to a row of `table` (which may be this table), or null.
    Foreign { table: String },
}

impl ColumnKind {
    /// Single-byte discriminant used by the descriptor file.
    pub(crate) fn discriminant(&self) -> u8 {
        match self {
            ColumnKind::Int => 0,
            ColumnKind::Str { .. } => 1,
            ColumnKind::Pickle { .. } => 2,
            ColumnKind::StrBlob => 3,
            ColumnKind::PickleBlob => 4,
            ColumnKind::Foreign { .. } => 5,
        }
    }

    /// Value a freshly created or newly added column holds.
    pub fn blank(&self) -> Value {
        match self {
            ColumnKind::Int => Value::Int(0),
            ColumnKind::Str { .. } | ColumnKind::StrBlob => Value::Str(String::new()),
            ColumnKind::Pickle { .. } | ColumnKind::PickleBlob | ColumnKind::Foreign { .. } => {
                Value::Null
            }
        }
    }

    /// Blob kinds keep their payload in an out-of-line file.
    pub fn is_blob(&self) -> bool {
        matches!(self, ColumnKind::StrBlob | ColumnKind::PickleBlob)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    name: String,
    kind: ColumnKind,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }
}

/// A declared index: an ordered tuple of column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    columns: Vec<String>,
}

impl IndexDef {
    pub fn new(columns: Vec<impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(|c| c.into()).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// A derived, never-persisted accessor computed from foreign-key
/// relations at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VirtualDef {
    /// Rows of `table` whose `column` (a `Foreign` column) points at this
    /// row. The inverse of a foreign key.
    Belongs { table: String, column: String },
    /// Projects `column` across the rows produced by `via`, another
    /// virtual column on the same table. Projecting a `Foreign` column
    /// yields the referenced rows, so chains compose.
    Through { via: String, column: String },
}

impl VirtualDef {
    pub fn belongs(table: impl Into<String>, column: impl Into<String>) -> Self {
        VirtualDef::Belongs {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn through(via: impl Into<String>, column: impl Into<String>) -> Self {
        VirtualDef::Through {
            via: via.into(),
            column: column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    name: String,
    columns: Vec<ColumnDef>,
    indices: Vec<IndexDef>,
    virtuals: Vec<(String, VirtualDef)>,
}

impl TableDef {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            indices: Vec::new(),
            virtuals: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indices.push(index);
        self
    }

    pub fn with_virtual(mut self, name: impl Into<String>, def: VirtualDef) -> Self {
        self.virtuals.push((name.into(), def));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn indices(&self) -> &[IndexDef] {
        &self.indices
    }

    pub fn virtuals(&self) -> &[(String, VirtualDef)] {
        &self.virtuals
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn virtual_def(&self, name: &str) -> Option<&VirtualDef> {
        self.virtuals
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }

    /// Persisted identity: columns and indices. Virtual columns are
    /// read-time constructs and do not participate in migration.
    pub(crate) fn storage_eq(&self, other: &TableDef) -> bool {
        self.name == other.name && self.columns == other.columns && self.indices == other.indices
    }
}
