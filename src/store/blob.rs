//! # Blob Files
//!
//! Out-of-line storage for `StrBlob`/`PickleBlob` columns. Each blob
//! column owns one directory, `<table>_<column>/`, holding one
//! `<row_id>.blob` file per row that has ever held non-blank data. Row
//! ids are stable across saves and migrations, so the path is a
//! deterministic function of (table, row id, column).
//!
//! Reads go through a lazy cache: a row's blob payload is fetched from
//! disk at most once per session and then served from memory. Writes and
//! removals invalidate the cached entry.
//!
//! Each payload is written to its own file in one call, so a failure on
//! one row/column cannot corrupt blobs already flushed.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::BLOB_EXT;
use crate::types::Value;

#[derive(Debug)]
pub(crate) struct BlobStore {
    root: PathBuf,
    table: String,
    cache: Mutex<HashMap<(u64, usize), Value>>,
}

impl BlobStore {
    pub fn new(root: &Path, table: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            table: table.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn column_dir(&self, column: &str) -> PathBuf {
        self.root.join(format!("{}_{}", self.table, column))
    }

    fn payload_path(&self, column: &str, row_id: u64) -> PathBuf {
        self.column_dir(column)
            .join(format!("{}.{}", row_id, BLOB_EXT))
    }

    pub fn write(&self, column: &str, column_index: usize, row_id: u64, bytes: &[u8]) -> Result<()> {
        let dir = self.column_dir(column);
        fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create blob directory '{}'", dir.display()))?;
        let path = self.payload_path(column, row_id);
        fs::write(&path, bytes)
            .wrap_err_with(|| format!("failed to write blob '{}'", path.display()))?;
        self.cache.lock().remove(&(row_id, column_index));
        Ok(())
    }

    pub fn read(&self, column: &str, row_id: u64) -> Result<Option<Vec<u8>>> {
        let path = self.payload_path(column, row_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).wrap_err_with(|| format!("failed to read blob '{}'", path.display()))
            }
        }
    }

    /// Removes one row's payload; absent files are fine.
    pub fn remove(&self, column: &str, column_index: usize, row_id: u64) -> Result<()> {
        let path = self.payload_path(column, row_id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .wrap_err_with(|| format!("failed to remove blob '{}'", path.display()))
            }
        }
        self.cache.lock().remove(&(row_id, column_index));
        Ok(())
    }

    /// Removes a dropped blob column's whole directory.
    pub fn remove_column(&self, column: &str) -> Result<()> {
        let dir = self.column_dir(column);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .wrap_err_with(|| format!("failed to remove blob directory '{}'", dir.display())),
        }
    }

    pub fn cached(&self, row_id: u64, column_index: usize) -> Option<Value> {
        self.cache.lock().get(&(row_id, column_index)).cloned()
    }

    pub fn cache_insert(&self, row_id: u64, column_index: usize, value: Value) {
        self.cache.lock().insert((row_id, column_index), value);
    }

    pub fn invalidate(&self, row_id: u64, column_index: usize) {
        self.cache.lock().remove(&(row_id, column_index));
    }
}
