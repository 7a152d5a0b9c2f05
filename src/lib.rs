//! # shelfdb
//!
//! An embedded, file-backed store of typed tables: fixed-width records,
//! per-column dirty tracking with incremental saves, ordered secondary
//! indexes, automatic schema migration, and derived relation columns.
//! One process owns a data directory at a time; there is no server, no
//! SQL, and no cross-table transaction.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         Database                             |
//! |   connect-time validation, per-table handles, save fan-out   |
//! +-------------------+---------------------+--------------------+
//! | Query Engine      | Virtual Columns     | Migration Engine   |
//! | index selection,  | Belongs / Through   | descriptor diff,   |
//! | lazy row matches  | resolution          | rewrite + rename   |
//! +-------------------+---------------------+--------------------+
//! | RowStore                        | IndexManager               |
//! | records, dirty masks, blobs     | BTreeMap per index, CRC64  |
//! +---------------------------------+----------------------------+
//! | Column Codec: fixed slots, validation, tagged values         |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Data directory
//!
//! | File               | Contents                                  |
//! |--------------------|-------------------------------------------|
//! | `<table>.tbl`      | header + fixed-width records              |
//! | `<table>.schema`   | persisted table definition                |
//! | `<table>.<n>.idx`  | nth declared index, CRC64-checksummed     |
//! | `<table>_<col>/`   | blob payloads, one `<row id>.blob` each   |
//!
//! Records and descriptors are the source of truth; index files are a
//! cache and are rebuilt whenever they cannot be trusted.
//!
//! ## Example
//!
//! ```
//! use shelfdb::{ColumnDef, ColumnKind, Database, IndexDef, Query, TableDef, Value};
//!
//! # fn main() -> eyre::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let tribble = TableDef::new(
//!     "tribble",
//!     vec![
//!         ColumnDef::new("name", ColumnKind::Str { len: 32 }),
//!         ColumnDef::new("age", ColumnKind::Int),
//!     ],
//! )
//! .with_index(IndexDef::new(vec!["age"]));
//!
//! let mut db = Database::connect(dir.path(), vec![tribble])?;
//! let tribbles = db.table_mut("tribble")?;
//! let id = tribbles.create();
//! tribbles.set(id, "name", Value::str("Fuzzy"))?;
//! tribbles.set(id, "age", Value::Int(3))?;
//! db.save()?;
//!
//! let query = Query::new().eq("age", Value::Int(3));
//! assert_eq!(db.table("tribble")?.find_first(&query)?, Some(id));
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod database;
mod error;
mod index;
mod migrate;
mod query;
mod relation;
mod schema;
mod store;
mod types;

pub use database::{Database, Table};
pub use error::StoreError;
pub use query::{Matches, Op, Predicate, Query};
pub use relation::Resolved;
pub use schema::{ColumnDef, ColumnKind, IndexDef, TableDef, VirtualDef};
pub use types::{Serializable, Value};
