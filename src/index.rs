//! # Index Manager
//!
//! One ordered structure per declared index: a `BTreeMap` from the
//! index's key tuple to the set of row ids sharing that key. Keys are
//! `SmallVec<[Value; 2]>` — almost every declared index covers one or two
//! columns — and order lexicographically via [`Value`]'s total order, so
//! a key that is a strict prefix sorts immediately before the keys that
//! extend it. The query engine leans on that for range scans.
//!
//! Indices are pure acceleration: the record file is always the source
//! of truth and [`IndexManager::rebuild`] reconstructs everything from
//! it. In-memory entries are maintained eagerly on every create, set,
//! and destroy so queries in the same session see current state; `save`
//! persists each index to its `.idx` file with a CRC64 trailer. Each
//! file also records the record file's flush generation at the moment it
//! was written. On connect the files are trusted only if the schema did
//! not change, the generation matches the record file's, and the
//! checksum verifies; anything else triggers a silent rebuild. The
//! generation check is what catches an index left behind by a failure
//! between flushing rows and rewriting the index files.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;
use tracing::debug;

use crate::codec;
use crate::config::{FORMAT_VERSION, INDEX_EXT, INDEX_MAGIC};
use crate::error::StoreError;
use crate::schema::TableDef;
use crate::store::RowStore;
use crate::types::Value;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub(crate) type IndexKey = SmallVec<[Value; 2]>;

#[derive(Debug)]
pub(crate) struct TableIndex {
    columns: Vec<String>,
    positions: Vec<usize>,
    map: BTreeMap<IndexKey, BTreeSet<u64>>,
}

impl TableIndex {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn key_for(&self, values: &[Value]) -> IndexKey {
        self.positions.iter().map(|&p| values[p].clone()).collect()
    }

    fn add(&mut self, id: u64, key: IndexKey) {
        self.map.entry(key).or_default().insert(id);
    }

    fn remove(&mut self, id: u64, key: &IndexKey) {
        if let Some(ids) = self.map.get_mut(key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.map.remove(key);
            }
        }
    }

    /// Ordered walk of entries with keys >= `start` (everything when
    /// `start` is `None`).
    pub fn scan_from(
        &self,
        start: Option<IndexKey>,
    ) -> impl Iterator<Item = (&IndexKey, &BTreeSet<u64>)> {
        use std::ops::Bound;
        let lower = match start {
            Some(key) => Bound::Included(key),
            None => Bound::Unbounded,
        };
        self.map.range((lower, Bound::Unbounded))
    }

    fn serialize(&self, generation: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(INDEX_MAGIC);
        buf.extend(FORMAT_VERSION.to_le_bytes());
        buf.extend(generation.to_le_bytes());
        buf.extend((self.columns.len() as u16).to_le_bytes());
        for column in &self.columns {
            buf.extend((column.len() as u16).to_le_bytes());
            buf.extend_from_slice(column.as_bytes());
        }
        buf.extend((self.map.len() as u64).to_le_bytes());
        for (key, ids) in &self.map {
            buf.extend((key.len() as u16).to_le_bytes());
            for value in key {
                codec::encode_value(value, &mut buf);
            }
            buf.extend((ids.len() as u32).to_le_bytes());
            for id in ids {
                buf.extend(id.to_le_bytes());
            }
        }
        let checksum = CRC64.checksum(&buf);
        buf.extend(checksum.to_le_bytes());
        buf
    }

    fn deserialize(&mut self, buf: &[u8], generation: u64) -> Result<()> {
        ensure!(
            buf.len() >= INDEX_MAGIC.len() + 4 + 8 + 8,
            "index file truncated"
        );
        let (payload, trailer) = buf.split_at(buf.len() - 8);
        let stored = u64::from_le_bytes(trailer.try_into()?);
        let computed = CRC64.checksum(payload);
        if stored != computed {
            return Err(eyre::Report::new(StoreError::ChecksumMismatch {
                stored,
                computed,
            }));
        }

        let mut pos = 0;
        let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
            ensure!(*pos + n <= payload.len(), "index file truncated at {}", *pos);
            let slice = &payload[*pos..*pos + n];
            *pos += n;
            Ok(slice)
        };

        ensure!(
            take(&mut pos, INDEX_MAGIC.len())? == INDEX_MAGIC,
            "bad index file magic"
        );
        let version = u32::from_le_bytes(take(&mut pos, 4)?.try_into()?);
        ensure!(version == FORMAT_VERSION, "unsupported index version {}", version);
        let stamped = u64::from_le_bytes(take(&mut pos, 8)?.try_into()?);
        ensure!(
            stamped == generation,
            "index written at generation {}, record file is at {}",
            stamped,
            generation
        );

        let column_count = u16::from_le_bytes(take(&mut pos, 2)?.try_into()?) as usize;
        ensure!(
            column_count == self.columns.len(),
            "index covers {} columns, {} expected",
            column_count,
            self.columns.len()
        );
        for expected in &self.columns {
            let len = u16::from_le_bytes(take(&mut pos, 2)?.try_into()?) as usize;
            let name = std::str::from_utf8(take(&mut pos, len)?)?;
            ensure!(
                name == expected,
                "index column '{}' does not match declared '{}'",
                name,
                expected
            );
        }

        let entry_count = u64::from_le_bytes(take(&mut pos, 8)?.try_into()?);
        let mut map = BTreeMap::new();
        for _ in 0..entry_count {
            let key_len = u16::from_le_bytes(take(&mut pos, 2)?.try_into()?) as usize;
            let mut key = IndexKey::new();
            for _ in 0..key_len {
                key.push(codec::decode_value(payload, &mut pos)?);
            }
            let id_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into()?) as usize;
            let mut ids = BTreeSet::new();
            for _ in 0..id_count {
                ids.insert(u64::from_le_bytes(take(&mut pos, 8)?.try_into()?));
            }
            map.insert(key, ids);
        }
        ensure!(pos == payload.len(), "trailing bytes in index file");

        self.map = map;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct IndexManager {
    indices: Vec<TableIndex>,
}

impl IndexManager {
    /// Builds empty index structures from a table definition. Index
    /// columns are resolved to positions; the definition is validated at
    /// connect time, so unresolved names are an internal error here.
    pub fn new(def: &TableDef) -> Result<Self> {
        let mut indices = Vec::with_capacity(def.indices().len());
        for index in def.indices() {
            let mut positions = Vec::with_capacity(index.columns().len());
            for column in index.columns() {
                let position = def.column_index(column).ok_or_else(|| {
                    eyre::Report::new(StoreError::UnknownColumn {
                        table: def.name().to_string(),
                        column: column.clone(),
                    })
                })?;
                positions.push(position);
            }
            indices.push(TableIndex {
                columns: index.columns().to_vec(),
                positions,
                map: BTreeMap::new(),
            });
        }
        Ok(Self { indices })
    }

    pub fn indices(&self) -> &[TableIndex] {
        &self.indices
    }

    /// Drops all entries and re-adds every live row.
    pub fn rebuild(&mut self, store: &RowStore) {
        for index in &mut self.indices {
            index.map.clear();
        }
        let ids: Vec<u64> = store.ids().collect();
        for id in ids {
            if let Some(values) = store.values(id) {
                for index in &mut self.indices {
                    let key = index.key_for(values);
                    index.add(id, key);
                }
            }
        }
    }

    pub fn add_row(&mut self, id: u64, values: &[Value]) {
        for index in &mut self.indices {
            let key = index.key_for(values);
            index.add(id, key);
        }
    }

    pub fn remove_row(&mut self, id: u64, values: &[Value]) {
        for index in &mut self.indices {
            let key = index.key_for(values);
            index.remove(id, &key);
        }
    }

    /// Applies an old→new key delta for one changed column. `values` are
    /// the row's values after the change.
    pub fn update_column(&mut self, id: u64, column: usize, old: &Value, values: &[Value]) {
        for index in &mut self.indices {
            if !index.positions.contains(&column) {
                continue;
            }
            let new_key = index.key_for(values);
            let mut old_key = new_key.clone();
            for (slot, &position) in index.positions.iter().enumerate() {
                if position == column {
                    old_key[slot] = old.clone();
                }
            }
            index.remove(id, &old_key);
            index.add(id, new_key);
        }
    }

    fn index_path(dir: &Path, table: &str, ordinal: usize) -> PathBuf {
        dir.join(format!("{}.{}.{}", table, ordinal, INDEX_EXT))
    }

    /// Persists every index file (temp sibling + rename), stamped with
    /// the record file's flush generation.
    pub fn persist(&self, dir: &Path, table: &str, generation: u64) -> Result<()> {
        for (ordinal, index) in self.indices.iter().enumerate() {
            let path = Self::index_path(dir, table, ordinal);
            let tmp = path.with_extension("idx.tmp");
            fs::write(&tmp, index.serialize(generation))
                .wrap_err_with(|| format!("failed to write index file '{}'", tmp.display()))?;
            fs::rename(&tmp, &path)
                .wrap_err_with(|| format!("failed to replace index file '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Attempts to load every index from disk. Any missing, corrupt,
    /// mismatched, or stale-generation file fails the whole load; the
    /// caller rebuilds.
    pub fn load(&mut self, dir: &Path, table: &str, generation: u64) -> Result<()> {
        for (ordinal, index) in self.indices.iter_mut().enumerate() {
            let path = Self::index_path(dir, table, ordinal);
            let buf = fs::read(&path)
                .wrap_err_with(|| format!("failed to read index file '{}'", path.display()))?;
            index
                .deserialize(&buf, generation)
                .wrap_err_with(|| format!("unusable index file '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Loads persisted indices when possible, rebuilding from the row
    /// store otherwise.
    pub fn load_or_rebuild(&mut self, dir: &Path, table: &str, store: &RowStore) {
        if self.indices.is_empty() {
            return;
        }
        if let Err(e) = self.load(dir, table, store.generation()) {
            debug!(table, reason = %e, "rebuilding indices from record file");
            self.rebuild(store);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnKind, IndexDef};

    fn indexed_def() -> TableDef {
        TableDef::new(
            "tribble",
            vec![
                ColumnDef::new("name", ColumnKind::Str { len: 8 }),
                ColumnDef::new("age", ColumnKind::Int),
            ],
        )
        .with_index(IndexDef::new(vec!["age"]))
        .with_index(IndexDef::new(vec!["name", "age"]))
    }

    fn values(name: &str, age: i64) -> Vec<Value> {
        vec![Value::str(name), Value::Int(age)]
    }

    #[test]
    fn add_and_remove_maintain_entries() {
        let mut manager = IndexManager::new(&indexed_def()).unwrap();
        manager.add_row(1, &values("a", 10));
        manager.add_row(2, &values("b", 10));

        let age_index = &manager.indices()[0];
        let key: IndexKey = smallvec::smallvec![Value::Int(10)];
        let ids = age_index.map.get(&key).unwrap();
        assert_eq!(ids.iter().copied().collect::<Vec<_>>(), vec![1, 2]);

        manager.remove_row(1, &values("a", 10));
        let age_index = &manager.indices()[0];
        assert_eq!(age_index.map.get(&key).unwrap().len(), 1);

        manager.remove_row(2, &values("b", 10));
        assert!(manager.indices()[0].map.is_empty());
    }

    #[test]
    fn update_column_moves_id_between_keys() {
        let mut manager = IndexManager::new(&indexed_def()).unwrap();
        manager.add_row(1, &values("a", 10));

        // age changed 10 -> 20; values reflect the new state
        manager.update_column(1, 1, &Value::Int(10), &values("a", 20));

        let age_index = &manager.indices()[0];
        let old_key: IndexKey = smallvec::smallvec![Value::Int(10)];
        let new_key: IndexKey = smallvec::smallvec![Value::Int(20)];
        assert!(age_index.map.get(&old_key).is_none());
        assert!(age_index.map.get(&new_key).unwrap().contains(&1));

        // the composite index moved too
        let composite = &manager.indices()[1];
        let key: IndexKey = smallvec::smallvec![Value::str("a"), Value::Int(20)];
        assert!(composite.map.get(&key).unwrap().contains(&1));
    }

    #[test]
    fn scan_from_walks_in_key_order() {
        let mut manager = IndexManager::new(&indexed_def()).unwrap();
        for (id, age) in [(1u64, 30i64), (2, 10), (3, 20)] {
            manager.add_row(id, &values("x", age));
        }
        let start: IndexKey = smallvec::smallvec![Value::Int(15)];
        let ages: Vec<i64> = manager.indices()[0]
            .scan_from(Some(start))
            .map(|(key, _)| key[0].as_int().unwrap())
            .collect();
        assert_eq!(ages, vec![20, 30]);
    }

    #[test]
    fn persist_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let def = indexed_def();
        let mut manager = IndexManager::new(&def).unwrap();
        manager.add_row(1, &values("a", 10));
        manager.add_row(2, &values("b", 20));
        manager.persist(dir.path(), "tribble", 3).unwrap();

        let mut loaded = IndexManager::new(&def).unwrap();
        loaded.load(dir.path(), "tribble", 3).unwrap();
        let key: IndexKey = smallvec::smallvec![Value::Int(20)];
        assert!(loaded.indices()[0].map.get(&key).unwrap().contains(&2));
    }

    #[test]
    fn corrupted_index_file_is_rejected_by_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let def = indexed_def();
        let mut manager = IndexManager::new(&def).unwrap();
        manager.add_row(1, &values("a", 10));
        manager.persist(dir.path(), "tribble", 1).unwrap();

        let path = dir.path().join("tribble.0.idx");
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let mut loaded = IndexManager::new(&def).unwrap();
        let err = loaded.load(dir.path(), "tribble", 1).unwrap_err();
        let root = err.root_cause().to_string();
        assert!(root.contains("checksum mismatch"), "got: {}", root);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let def = indexed_def();
        let mut manager = IndexManager::new(&def).unwrap();
        manager.add_row(1, &values("a", 10));
        manager.persist(dir.path(), "tribble", 1).unwrap();

        // the record file moved on; the file is intact but out of date
        let mut loaded = IndexManager::new(&def).unwrap();
        let err = loaded.load(dir.path(), "tribble", 2).unwrap_err();
        let root = err.root_cause().to_string();
        assert!(root.contains("generation"), "got: {}", root);
    }

    #[test]
    fn load_or_rebuild_falls_back_to_rows() {
        let dir = tempfile::tempdir().unwrap();
        let def = indexed_def();
        let mut store = RowStore::open(dir.path(), def.clone()).unwrap();
        let id = store.create();
        store.set(id, 0, Value::str("a")).unwrap();
        store.set(id, 1, Value::Int(42)).unwrap();

        // no index files on disk at all
        let mut manager = IndexManager::new(&def).unwrap();
        manager.load_or_rebuild(dir.path(), "tribble", &store);
        let key: IndexKey = smallvec::smallvec![Value::Int(42)];
        assert!(manager.indices()[0].map.get(&key).unwrap().contains(&id));
    }
}
