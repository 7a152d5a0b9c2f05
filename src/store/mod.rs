//! # Row Store
//!
//! Per-table manager of row records: allocates ids, tracks per-column
//! dirty state, and applies create/update/destroy to the on-disk record
//! file and blob files.
//!
//! ## Record file layout (`<table>.tbl`)
//!
//! ```text
//! +--------------------+ Offset 0
//! | TableFileHeader    |  64 bytes
//! +--------------------+ Offset 64
//! | Record slot 0      |  fixed width
//! | Record slot 1      |
//! | ...                |
//! +--------------------+
//! ```
//!
//! Each record is `flag (1) + row id (8) + one fixed slot per column` in
//! declaration order. A flag of zero is a tombstone; tombstones are
//! marked, never removed, and slots are never reused after destroy. A
//! slot that was allocated but never flushed reads back as zeroes, which
//! is itself a valid tombstone, so incremental saves never have to
//! backfill gaps.
//!
//! ## Mutation model
//!
//! Rows live in memory, decoded, keyed by id. `set` validates through the
//! column codec and only marks dirty state; nothing reaches disk before
//! [`RowStore::save`]. Save seeks to each dirty row's slot and rewrites
//! just that record, flushes changed blob payloads to their own files,
//! tombstones destroyed rows, then rewrites the header and syncs.
//!
//! Connect-time loading maps the file read-only and decodes every live
//! record; blob payloads stay on disk until first read.

mod blob;
mod dirty;

pub(crate) use blob::BlobStore;
use dirty::DirtyTracker;

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, eyre, Result, WrapErr};
use memmap2::Mmap;
use tracing::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::codec;
use crate::config::{
    FIRST_ROW_ID, FORMAT_VERSION, RECORD_LIVE, RECORD_PREFIX_SIZE, TABLE_EXT, TABLE_HEADER_SIZE,
    TABLE_MAGIC,
};
use crate::error::StoreError;
use crate::schema::{ColumnKind, TableDef};
use crate::types::Value;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct TableFileHeader {
    magic: [u8; 16],
    version: U32,
    record_size: U32,
    column_count: U32,
    _pad: U32,
    next_row_id: U64,
    record_count: U64,
    /// Bumped by every flush; index files echo the generation they were
    /// written against, so a stale index cannot be mistaken for current.
    generation: U64,
    _reserved: [u8; 8],
}

impl TableFileHeader {
    fn new(
        record_size: usize,
        column_count: usize,
        next_row_id: u64,
        record_count: u64,
        generation: u64,
    ) -> Self {
        Self {
            magic: *TABLE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            record_size: U32::new(record_size as u32),
            column_count: U32::new(column_count as u32),
            _pad: U32::new(0),
            next_row_id: U64::new(next_row_id),
            record_count: U64::new(record_count),
            generation: U64::new(generation),
            _reserved: [0; 8],
        }
    }

    fn validate(&self, layout: &Layout, column_count: usize) -> Result<()> {
        ensure!(self.magic == *TABLE_MAGIC, "bad record file magic");
        ensure!(
            self.version.get() == FORMAT_VERSION,
            "unsupported record file version {}",
            self.version.get()
        );
        ensure!(
            self.record_size.get() as usize == layout.record_size,
            "record size {} does not match schema ({} expected)",
            self.record_size.get(),
            layout.record_size
        );
        ensure!(
            self.column_count.get() as usize == column_count,
            "column count {} does not match schema ({} expected)",
            self.column_count.get(),
            column_count
        );
        Ok(())
    }
}

/// Precomputed slot offsets within a record.
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    record_size: usize,
    offsets: Vec<usize>,
    sizes: Vec<usize>,
}

impl Layout {
    pub fn new(def: &TableDef) -> Self {
        let mut offsets = Vec::with_capacity(def.columns().len());
        let mut sizes = Vec::with_capacity(def.columns().len());
        let mut offset = RECORD_PREFIX_SIZE;
        for column in def.columns() {
            let size = codec::slot_size(column.kind());
            offsets.push(offset);
            sizes.push(size);
            offset += size;
        }
        Self {
            record_size: offset,
            offsets,
            sizes,
        }
    }

    fn slot<'a>(&self, record: &'a [u8], column: usize) -> &'a [u8] {
        &record[self.offsets[column]..self.offsets[column] + self.sizes[column]]
    }

    fn slot_mut<'a>(&self, record: &'a mut [u8], column: usize) -> &'a mut [u8] {
        &mut record[self.offsets[column]..self.offsets[column] + self.sizes[column]]
    }
}

#[derive(Debug, Clone)]
struct RowState {
    slot: u64,
    /// Decoded inline values. For blob columns this is authoritative only
    /// when the matching `blob_loaded` bit is set; otherwise the payload
    /// is still on disk (or absent).
    values: Vec<Value>,
    blob_present: u64,
    blob_loaded: u64,
}

#[derive(Debug)]
struct Doomed {
    id: u64,
    slot: u64,
}

/// One rewritten row handed to [`RowStore::from_rows`] by the migration
/// engine.
pub(crate) struct MigratedRow {
    pub id: u64,
    pub values: Vec<Value>,
    pub blob_present: u64,
    pub blob_loaded: u64,
}

#[derive(Debug)]
pub(crate) struct RowStore {
    def: TableDef,
    layout: Layout,
    path: PathBuf,
    rows: BTreeMap<u64, RowState>,
    doomed: Vec<Doomed>,
    next_row_id: u64,
    next_slot: u64,
    generation: u64,
    dirty: DirtyTracker,
    blobs: BlobStore,
}

impl RowStore {
    pub fn table_path(dir: &Path, table: &str) -> PathBuf {
        dir.join(format!("{}.{}", table, TABLE_EXT))
    }

    /// Opens the table's record file and decodes every live record. A
    /// missing file is an empty table.
    pub fn open(dir: &Path, def: TableDef) -> Result<Self> {
        let layout = Layout::new(&def);
        let path = Self::table_path(dir, def.name());
        let blobs = BlobStore::new(dir, def.name());

        let mut store = Self {
            layout,
            path,
            rows: BTreeMap::new(),
            doomed: Vec::new(),
            next_row_id: FIRST_ROW_ID,
            next_slot: 0,
            generation: 0,
            dirty: DirtyTracker::new(),
            blobs,
            def,
        };

        let file = match fs::File::open(&store.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => {
                return Err(e).wrap_err_with(|| {
                    format!("failed to open record file '{}'", store.path.display())
                })
            }
        };

        // SAFETY: the map is read-only and dropped before this function
        // returns; the single-writer model means no other process mutates
        // the file while we hold it.
        let mmap = unsafe {
            Mmap::map(&file).wrap_err_with(|| {
                format!("failed to memory-map record file '{}'", store.path.display())
            })?
        };
        store
            .load_records(&mmap)
            .wrap_err_with(|| format!("corrupt record file '{}'", store.path.display()))?;

        debug!(
            table = store.def.name(),
            rows = store.rows.len(),
            slots = store.next_slot,
            "record file loaded"
        );
        Ok(store)
    }

    fn load_records(&mut self, data: &[u8]) -> Result<()> {
        ensure!(data.len() >= TABLE_HEADER_SIZE, "record file truncated");
        let header = TableFileHeader::read_from_bytes(&data[..TABLE_HEADER_SIZE])
            .map_err(|_| eyre!("record file header truncated"))?;
        header.validate(&self.layout, self.def.columns().len())?;

        let record_count = header.record_count.get();
        let needed = TABLE_HEADER_SIZE + record_count as usize * self.layout.record_size;
        ensure!(
            data.len() >= needed,
            "record file holds {} bytes, {} expected for {} records",
            data.len(),
            needed,
            record_count
        );

        let mut max_id = 0;
        for slot in 0..record_count {
            let start = TABLE_HEADER_SIZE + slot as usize * self.layout.record_size;
            let record = &data[start..start + self.layout.record_size];
            if record[0] != RECORD_LIVE {
                continue;
            }
            let id = u64::from_le_bytes(record[1..9].try_into()?);
            ensure!(id >= FIRST_ROW_ID, "record slot {} has invalid row id 0", slot);

            let mut values = Vec::with_capacity(self.def.columns().len());
            let mut blob_present = 0u64;
            for (i, column) in self.def.columns().iter().enumerate() {
                let slot_bytes = self.layout.slot(record, i);
                if column.kind().is_blob() {
                    let (present, _token) = codec::decode_blob_ref(slot_bytes)?;
                    if present {
                        blob_present |= 1 << i;
                    }
                    values.push(Value::Null);
                } else {
                    values.push(codec::decode_inline(column.kind(), slot_bytes)?);
                }
            }

            self.rows.insert(
                id,
                RowState {
                    slot,
                    values,
                    blob_present,
                    blob_loaded: 0,
                },
            );
            max_id = max_id.max(id);
        }

        self.next_slot = record_count;
        self.next_row_id = header.next_row_id.get().max(max_id + 1);
        self.generation = header.generation.get();
        Ok(())
    }

    /// Builds a store over freshly migrated rows. Slots are renumbered
    /// contiguously (migration is the one point where tombstones are
    /// dropped); nothing is considered dirty because the caller rewrites
    /// the whole file with [`RowStore::write_full`].
    ///
    /// Each row carries two masks: `blob_present` bits for payloads that
    /// already sit on disk, and `blob_loaded` bits for blob values held
    /// in `values` that `write_full` must still flush.
    pub fn from_rows(
        dir: &Path,
        def: TableDef,
        rows: Vec<MigratedRow>,
        next_row_id: u64,
        generation: u64,
    ) -> Self {
        let layout = Layout::new(&def);
        let path = Self::table_path(dir, def.name());
        let blobs = BlobStore::new(dir, def.name());
        let mut map = BTreeMap::new();
        let mut slot = 0u64;
        let mut max_id = 0u64;
        for row in rows {
            max_id = max_id.max(row.id);
            map.insert(
                row.id,
                RowState {
                    slot,
                    values: row.values,
                    blob_present: row.blob_present,
                    blob_loaded: row.blob_loaded,
                },
            );
            slot += 1;
        }
        Self {
            def,
            layout,
            path,
            rows: map,
            doomed: Vec::new(),
            next_row_id: next_row_id.max(max_id + 1),
            next_slot: slot,
            generation,
            dirty: DirtyTracker::new(),
            blobs,
        }
    }

    pub fn def(&self) -> &TableDef {
        &self.def
    }

    pub fn next_row_id(&self) -> u64 {
        self.next_row_id
    }

    /// Flush generation of the on-disk record file.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.rows.contains_key(&id)
    }

    /// Live row ids in ascending (= physical) order.
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.rows.keys().copied()
    }

    pub fn has_unsaved_changes(&self) -> bool {
        !self.dirty.is_empty() || !self.doomed.is_empty()
    }

    /// In-memory values of a live row. Blob slots may hold placeholders;
    /// use [`RowStore::get`] for authoritative per-column reads.
    pub fn values(&self, id: u64) -> Option<&[Value]> {
        self.rows.get(&id).map(|row| row.values.as_slice())
    }

    /// Allocates the next id and creates a fully blank, fully dirty row.
    pub fn create(&mut self) -> u64 {
        let id = self.next_row_id;
        self.next_row_id += 1;
        let values = self
            .def
            .columns()
            .iter()
            .map(|c| c.kind().blank())
            .collect();
        let row = RowState {
            slot: self.next_slot,
            values,
            blob_present: 0,
            blob_loaded: u64::MAX,
        };
        self.next_slot += 1;
        self.rows.insert(id, row);
        self.dirty.mark_all(id, self.def.columns().len());
        id
    }

    fn not_found(&self, id: u64) -> eyre::Report {
        eyre::Report::new(StoreError::RowNotFound {
            table: self.def.name().to_string(),
            id,
        })
    }

    /// Validates and applies one column write, returning the previous
    /// in-memory value. For an unloaded blob column the previous value is
    /// reported as its blank; blob columns are never index keys, so the
    /// delta is not used there.
    pub fn set(&mut self, id: u64, column: usize, value: Value) -> Result<Value> {
        let kind = self.def.columns()[column].kind().clone();
        codec::validate(self.def.columns()[column].name(), &kind, &value)
            .map_err(eyre::Report::new)?;

        let row = self.rows.get_mut(&id).ok_or_else(|| {
            eyre::Report::new(StoreError::RowNotFound {
                table: self.def.name().to_string(),
                id,
            })
        })?;

        let old = std::mem::replace(&mut row.values[column], value);
        if kind.is_blob() {
            row.blob_loaded |= 1 << column;
            self.blobs.invalidate(id, column);
        }
        self.dirty.mark(id, column);
        Ok(old)
    }

    /// Reads one column of a live row. Blob payloads are fetched from
    /// disk on first read and cached for the rest of the session.
    pub fn get(&self, id: u64, column: usize) -> Result<Value> {
        let row = self.rows.get(&id).ok_or_else(|| self.not_found(id))?;
        let kind = self.def.columns()[column].kind();
        if !kind.is_blob() || row.blob_loaded & (1 << column) != 0 {
            return Ok(row.values[column].clone());
        }
        if row.blob_present & (1 << column) == 0 {
            return Ok(kind.blank());
        }
        if let Some(value) = self.blobs.cached(id, column) {
            return Ok(value);
        }
        let name = self.def.columns()[column].name();
        let bytes = self
            .blobs
            .read(name, id)?
            .ok_or_else(|| eyre!("blob for row {} column '{}' is missing", id, name))?;
        let value = match kind {
            ColumnKind::StrBlob => Value::Str(String::from_utf8(bytes)?),
            ColumnKind::PickleBlob => Value::Bytes(bytes),
            _ => unreachable!(),
        };
        self.blobs.cache_insert(id, column, value.clone());
        Ok(value)
    }

    /// Removes a row from the in-memory store. Its record slot is
    /// tombstoned and its blob files deleted on the next save.
    pub fn destroy(&mut self, id: u64) -> Result<Vec<Value>> {
        let row = self.rows.remove(&id).ok_or_else(|| self.not_found(id))?;
        self.dirty.forget(id);
        self.doomed.push(Doomed { id, slot: row.slot });
        Ok(row.values)
    }

    fn encode_record(&self, id: u64, row: &RowState, record: &mut [u8]) -> Result<()> {
        record[0] = RECORD_LIVE;
        record[1..9].copy_from_slice(&id.to_le_bytes());
        for (i, column) in self.def.columns().iter().enumerate() {
            let slot = self.layout.slot_mut(record, i);
            if column.kind().is_blob() {
                codec::encode_blob_ref(row.blob_present & (1 << i) != 0, id, slot);
            } else {
                codec::encode_inline(column.kind(), &row.values[i], slot).wrap_err_with(|| {
                    format!(
                        "failed to encode column '{}' of row {} in table '{}'",
                        column.name(),
                        id,
                        self.def.name()
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Writes a dirty row's changed blob payloads and updates its
    /// presence bits. Blank values remove the payload file.
    fn flush_blobs(&mut self, id: u64, mask: u64) -> Result<()> {
        let columns: Vec<usize> = self
            .def
            .columns()
            .iter()
            .enumerate()
            .filter(|(i, c)| c.kind().is_blob() && mask & (1 << i) != 0)
            .map(|(i, _)| i)
            .collect();
        for i in columns {
            let name = self.def.columns()[i].name().to_string();
            let row = self.rows.get(&id).expect("dirty row must be live");
            let present = match &row.values[i] {
                Value::Null => {
                    self.blobs.remove(&name, i, id)?;
                    false
                }
                Value::Str(s) if s.is_empty() => {
                    self.blobs.remove(&name, i, id)?;
                    false
                }
                Value::Str(s) => {
                    self.blobs.write(&name, i, id, s.as_bytes())?;
                    true
                }
                Value::Bytes(b) => {
                    self.blobs.write(&name, i, id, b)?;
                    true
                }
                other => {
                    eyre::bail!(
                        "blob column '{}' holds {}; validation was skipped",
                        name,
                        other.kind_name()
                    )
                }
            };
            let row = self.rows.get_mut(&id).expect("dirty row must be live");
            if present {
                row.blob_present |= 1 << i;
            } else {
                row.blob_present &= !(1 << i);
            }
        }
        Ok(())
    }

    fn remove_row_blobs(&self, id: u64) -> Result<()> {
        for (i, column) in self.def.columns().iter().enumerate() {
            if column.kind().is_blob() {
                self.blobs.remove(column.name(), i, id)?;
            }
        }
        Ok(())
    }

    /// Flushes every pending creation, mutation, and destruction.
    ///
    /// Destroyed rows are tombstoned first, then each dirty row's record
    /// is rewritten in ascending slot order (extending the file for new
    /// rows), then the header is updated and the file synced. A crash
    /// mid-save leaves records either at their pre-save or post-save
    /// content; the header is written last so the record count only grows
    /// once the records behind it exist.
    ///
    /// Pending state is cleared only after the sync: a failed save keeps
    /// every un-flushed row dirty and every destruction doomed, so
    /// retrying picks up exactly where the failure left off. Writes that
    /// did land before the failure are idempotent to repeat.
    pub fn save(&mut self) -> Result<()> {
        if !self.has_unsaved_changes() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .wrap_err_with(|| format!("failed to open record file '{}'", self.path.display()))?;

        let file_len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", self.path.display()))?
            .len();
        if file_len < TABLE_HEADER_SIZE as u64 {
            // fresh file: put a header in place before any record write
            let header = TableFileHeader::new(
                self.layout.record_size,
                self.def.columns().len(),
                self.next_row_id,
                0,
                self.generation,
            );
            file.seek(SeekFrom::Start(0))?;
            file.write_all(header.as_bytes())?;
        }

        let record_size = self.layout.record_size as u64;
        let record_offset = move |slot: u64| TABLE_HEADER_SIZE as u64 + slot * record_size;

        let mut tombstone = vec![0u8; self.layout.record_size];
        for doom in &self.doomed {
            tombstone.fill(0);
            tombstone[1..9].copy_from_slice(&doom.id.to_le_bytes());
            file.seek(SeekFrom::Start(record_offset(doom.slot)))?;
            file.write_all(&tombstone).wrap_err_with(|| {
                format!(
                    "failed to tombstone row {} in table '{}'",
                    doom.id,
                    self.def.name()
                )
            })?;
            self.remove_row_blobs(doom.id)?;
        }

        let pending = self.dirty.pending();
        let mut record = vec![0u8; self.layout.record_size];
        for (id, mask) in &pending {
            self.flush_blobs(*id, *mask)?;
            let row = self.rows.get(id).expect("dirty row must be live");
            let slot = row.slot;
            self.encode_record(*id, row, &mut record)?;
            file.seek(SeekFrom::Start(record_offset(slot)))?;
            file.write_all(&record).wrap_err_with(|| {
                format!(
                    "failed to write row {} of table '{}'",
                    id,
                    self.def.name()
                )
            })?;
        }

        self.generation += 1;
        let header = TableFileHeader::new(
            self.layout.record_size,
            self.def.columns().len(),
            self.next_row_id,
            self.next_slot,
            self.generation,
        );
        file.seek(SeekFrom::Start(0))?;
        file.write_all(header.as_bytes())?;
        file.sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))?;

        let tombstoned = self.doomed.len();
        self.doomed.clear();
        self.dirty.clear();

        debug!(
            table = self.def.name(),
            written = pending.len(),
            tombstoned,
            "table saved"
        );
        Ok(())
    }

    /// Rewrites the whole record file through a temp sibling + rename.
    /// Used by migration; every in-memory row is written, tombstone gaps
    /// are preserved as zeroed slots.
    pub fn write_full(&mut self) -> Result<()> {
        let mut buf =
            vec![0u8; TABLE_HEADER_SIZE + self.next_slot as usize * self.layout.record_size];
        self.generation += 1;
        let header = TableFileHeader::new(
            self.layout.record_size,
            self.def.columns().len(),
            self.next_row_id,
            self.next_slot,
            self.generation,
        );
        buf[..TABLE_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let ids: Vec<u64> = self.rows.keys().copied().collect();
        for id in ids {
            // only blob values actually held in memory are flushed;
            // untouched payloads stay where they are on disk
            let mask = self.rows.get(&id).expect("row must be live").blob_loaded;
            self.flush_blobs(id, mask)?;
            let row = self.rows.get(&id).expect("row must be live");
            let start = TABLE_HEADER_SIZE + row.slot as usize * self.layout.record_size;
            let end = start + self.layout.record_size;
            self.encode_record(id, row, &mut buf[start..end])?;
        }

        let tmp = self.path.with_extension("tbl.tmp");
        fs::write(&tmp, &buf)
            .wrap_err_with(|| format!("failed to write record file '{}'", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("failed to replace record file '{}'", self.path.display()))?;

        self.dirty = DirtyTracker::new();
        self.doomed.clear();
        Ok(())
    }
}
