//! # Descriptor Persistence
//!
//! Serializes a [`TableDef`]'s storage identity (columns and declared
//! indices, in declaration order) to the per-table `.schema` file. The
//! migration engine compares the loaded descriptor against the current
//! definition to decide whether the table's data must be rewritten.
//!
//! ## File format
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "shelfdb schema\0\0"
//! 16      4     Format version (u32 LE)
//! 20      ...   Table name (u16 LE length + UTF-8 bytes)
//!         4     Column count (u32 LE)
//!         For each column:
//!           - name: u16 LE length + UTF-8 bytes
//!           - kind: u8 discriminant
//!           - length: u32 LE (Str/Pickle slot bound, else 0)
//!           - target table (Foreign only): u16 LE length + UTF-8 bytes
//!         4     Index count (u32 LE)
//!         For each index:
//!           - column count: u16 LE
//!           - per column: u16 LE length + UTF-8 bytes
//! ```
//!
//! Virtual columns are read-time constructs and are never persisted.
//!
//! The file is replaced atomically (write to a temp sibling, then rename)
//! so a crash during migration leaves either the old or the new
//! descriptor, never a torn one.

use std::fs;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};

use crate::config::{FORMAT_VERSION, SCHEMA_MAGIC};
use crate::schema::{ColumnDef, ColumnKind, IndexDef, TableDef};

pub(crate) fn store_descriptor(path: &Path, def: &TableDef) -> Result<()> {
    let buf = serialize(def)?;
    let tmp = path.with_extension("schema.tmp");
    fs::write(&tmp, &buf)
        .wrap_err_with(|| format!("failed to write descriptor '{}'", tmp.display()))?;
    fs::rename(&tmp, path)
        .wrap_err_with(|| format!("failed to replace descriptor '{}'", path.display()))?;
    Ok(())
}

/// Loads the persisted descriptor, or `None` on first connect.
pub(crate) fn load_descriptor(path: &Path) -> Result<Option<TableDef>> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .wrap_err_with(|| format!("failed to read descriptor '{}'", path.display()))
        }
    };
    deserialize(&buf)
        .wrap_err_with(|| format!("malformed descriptor '{}'", path.display()))
        .map(Some)
}

fn serialize(def: &TableDef) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(SCHEMA_MAGIC);
    buf.extend(FORMAT_VERSION.to_le_bytes());
    write_str(&mut buf, def.name())?;

    buf.extend((def.columns().len() as u32).to_le_bytes());
    for column in def.columns() {
        write_str(&mut buf, column.name())?;
        buf.push(column.kind().discriminant());
        let len = match column.kind() {
            ColumnKind::Str { len } | ColumnKind::Pickle { len } => *len,
            _ => 0,
        };
        buf.extend(len.to_le_bytes());
        if let ColumnKind::Foreign { table } = column.kind() {
            write_str(&mut buf, table)?;
        }
    }

    buf.extend((def.indices().len() as u32).to_le_bytes());
    for index in def.indices() {
        buf.extend((index.columns().len() as u16).to_le_bytes());
        for column in index.columns() {
            write_str(&mut buf, column)?;
        }
    }

    Ok(buf)
}

fn deserialize(buf: &[u8]) -> Result<TableDef> {
    let mut cur = Cursor { buf, pos: 0 };

    let magic = cur.take(SCHEMA_MAGIC.len())?;
    ensure!(magic == SCHEMA_MAGIC, "bad descriptor magic");
    let version = cur.read_u32()?;
    ensure!(
        version == FORMAT_VERSION,
        "unsupported descriptor version {}",
        version
    );

    let name = cur.read_str()?;

    let column_count = cur.read_u32()?;
    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let col_name = cur.read_str()?;
        let discriminant = cur.read_u8()?;
        let len = cur.read_u32()?;
        let kind = match discriminant {
            0 => ColumnKind::Int,
            1 => ColumnKind::Str { len },
            2 => ColumnKind::Pickle { len },
            3 => ColumnKind::StrBlob,
            4 => ColumnKind::PickleBlob,
            5 => ColumnKind::Foreign {
                table: cur.read_str()?,
            },
            other => bail!("invalid column kind discriminant: {}", other),
        };
        columns.push(ColumnDef::new(col_name, kind));
    }

    let mut def = TableDef::new(name, columns);

    let index_count = cur.read_u32()?;
    for _ in 0..index_count {
        let column_count = cur.read_u16()?;
        let mut index_columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            index_columns.push(cur.read_str()?);
        }
        def = def.with_index(IndexDef::new(index_columns));
    }

    ensure!(cur.pos == buf.len(), "trailing bytes in descriptor");
    Ok(def)
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    ensure!(
        s.len() <= u16::MAX as usize,
        "name '{}' is too long (max {} bytes)",
        s,
        u16::MAX
    );
    buf.extend((s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.buf.len(),
            "descriptor truncated at offset {}",
            self.pos
        );
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)
            .wrap_err("descriptor string is not UTF-8")?
            .to_string())
    }
}
