//! Secondary indexes over hash fields.
//!
//! An index maps `(table, field value, primary key)` to an empty marker in the
//! index partition. Entries are written into the same [`WriteBatch`] as the
//! primary mutation that produced them, so the two never diverge on disk.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::codec::{self, IndexValueLayout};
use crate::engine::{KvStore, Partition, WriteBatch};
use crate::error::KvError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexValueType {
    String,
    Int64,
}

impl IndexValueType {
    fn layout(self) -> IndexValueLayout {
        match self {
            IndexValueType::String => IndexValueLayout::Bytes,
            IndexValueType::Int64 => IndexValueLayout::Int64,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsetIndex {
    pub table: String,
    pub name: String,
    pub index_field: String,
    pub unique: bool,
    pub value_type: IndexValueType,
}

impl HsetIndex {
    fn encode_value(&self, value: &[u8]) -> Result<Vec<u8>, KvError> {
        match self.value_type {
            IndexValueType::String => {
                let mut out = Vec::with_capacity(value.len() + 2);
                codec::encode_ordered_bytes(value, &mut out);
                Ok(out)
            }
            IndexValueType::Int64 => {
                let parsed = std::str::from_utf8(value)
                    .ok()
                    .and_then(|s| s.trim().parse::<i64>().ok())
                    .ok_or_else(|| {
                        KvError::IndexValueType(format!(
                            "{}.{} expects int64, got {:?}",
                            self.table,
                            self.index_field,
                            String::from_utf8_lossy(value)
                        ))
                    })?;
                Ok(codec::encode_ordered_i64(parsed).to_vec())
            }
        }
    }

    fn entry_key(&self, value: &[u8], pk: &[u8]) -> Result<Vec<u8>, KvError> {
        let encoded = self.encode_value(value)?;
        Ok(codec::encode_index_entry_key(&self.table, &self.name, &encoded, pk))
    }

    fn prefix(&self) -> Vec<u8> {
        codec::index_prefix(&self.table, &self.name)
    }
}

/// Range query over one index. `None` bounds are open-ended; `limit < 0`
/// means unbounded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexCondition {
    pub start_key: Option<Vec<u8>>,
    pub include_start: bool,
    pub end_key: Option<Vec<u8>>,
    pub include_end: bool,
    pub offset: usize,
    pub limit: i64,
}

impl Default for IndexCondition {
    fn default() -> Self {
        Self {
            start_key: None,
            include_start: false,
            end_key: None,
            include_end: false,
            offset: 0,
            limit: -1,
        }
    }
}

/// Table name of a primary key: everything before the first `:`.
pub fn table_of(pk: &[u8]) -> Option<&str> {
    let pos = pk.iter().position(|&b| b == b':')?;
    std::str::from_utf8(&pk[..pos]).ok()
}

/// Index definitions keyed by table, then by indexed field.
type IndexDefs = HashMap<String, BTreeMap<String, HsetIndex>>;

pub struct IndexManager {
    store: Arc<KvStore>,
    defs: RwLock<IndexDefs>,
}

impl IndexManager {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            defs: RwLock::new(HashMap::new()),
        }
    }

    fn read_defs(&self) -> std::sync::RwLockReadGuard<'_, IndexDefs> {
        self.defs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_defs(&self) -> std::sync::RwLockWriteGuard<'_, IndexDefs> {
        self.defs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Rebuild the in-memory definitions from the meta partition. Returns the
    /// number of tables carrying at least one index.
    pub fn load_indexes(&self) -> anyhow::Result<usize> {
        let mut loaded: IndexDefs = HashMap::new();
        for (_, value) in self.store.prefix(Partition::Meta, &codec::index_def_prefix())? {
            let def: HsetIndex = serde_json::from_slice(&value)?;
            loaded
                .entry(def.table.clone())
                .or_default()
                .insert(def.index_field.clone(), def);
        }
        let tables = loaded.len();
        *self.write_defs() = loaded;
        tracing::info!(tables, "loaded index definitions");
        Ok(tables)
    }

    pub fn table_count(&self) -> usize {
        self.read_defs().len()
    }

    pub fn get_index(&self, table: &str, field: &str) -> Option<HsetIndex> {
        self.read_defs().get(table)?.get(field).cloned()
    }

    pub fn table_indexes(&self, table: &str) -> Vec<HsetIndex> {
        self.read_defs()
            .get(table)
            .map(|fields| fields.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Persist and register a new definition. Existing records are not
    /// back-filled.
    pub fn add_index(&self, def: HsetIndex) -> Result<(), KvError> {
        if self.get_index(&def.table, &def.index_field).is_some() {
            return Err(KvError::IndexExists {
                table: def.table,
                field: def.index_field,
            });
        }
        let value = serde_json::to_vec(&def).map_err(|err| KvError::Decode(err.to_string()))?;
        let mut batch = WriteBatch::new();
        batch.put(
            Partition::Meta,
            codec::encode_index_def_key(&def.table, &def.index_field),
            value,
        );
        self.store.commit(batch)?;
        tracing::info!(table = %def.table, field = %def.index_field, name = %def.name, "index added");
        self.write_defs()
            .entry(def.table.clone())
            .or_default()
            .insert(def.index_field.clone(), def);
        Ok(())
    }

    /// Drop a definition together with every entry it owns.
    pub fn remove_index(&self, table: &str, field: &str) -> Result<(), KvError> {
        let def = self.get_index(table, field).ok_or(KvError::NoSuchIndex)?;
        let mut batch = WriteBatch::new();
        batch.delete(Partition::Meta, codec::encode_index_def_key(table, field));
        for (key, _) in self.store.prefix(Partition::Index, &def.prefix())? {
            batch.delete(Partition::Index, key);
        }
        let removed = batch.len() - 1;
        self.store.commit(batch)?;
        tracing::info!(table, field, removed, "index removed");

        let mut defs = self.write_defs();
        if let Some(fields) = defs.get_mut(table) {
            fields.remove(field);
            if fields.is_empty() {
                defs.remove(table);
            }
        }
        Ok(())
    }

    pub fn add_index_record(
        &self,
        pk: &[u8],
        field: &str,
        value: &[u8],
        batch: &mut WriteBatch,
    ) -> Result<(), KvError> {
        let def = self.lookup(pk, field)?;
        let key = def.entry_key(value, pk)?;
        if def.unique {
            let encoded = def.encode_value(value)?;
            let mut value_prefix = def.prefix();
            value_prefix.extend_from_slice(&encoded);
            let holders = self.store.prefix_in(batch, Partition::Index, &value_prefix)?;
            if holders.iter().any(|(existing, _)| existing != &key) {
                return Err(KvError::UniqueViolation {
                    table: def.table,
                    field: def.index_field,
                });
            }
        }
        batch.put(Partition::Index, key, Vec::new());
        Ok(())
    }

    pub fn remove_index_record(
        &self,
        pk: &[u8],
        field: &str,
        value: &[u8],
        batch: &mut WriteBatch,
    ) -> Result<(), KvError> {
        let def = self.lookup(pk, field)?;
        // A value that no longer parses was never indexed under this type.
        match def.entry_key(value, pk) {
            Ok(key) => batch.delete(Partition::Index, key),
            Err(KvError::IndexValueType(_)) => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn lookup(&self, pk: &[u8], field: &str) -> Result<HsetIndex, KvError> {
        let table = table_of(pk).ok_or(KvError::NoSuchIndex)?;
        self.get_index(table, field).ok_or(KvError::NoSuchIndex)
    }

    /// Ordered range search. Returns the number of primary keys produced and
    /// the keys themselves, ordered by value then primary key (or the exact
    /// reverse).
    pub fn search(
        &self,
        table: &str,
        field: &str,
        cond: &IndexCondition,
        reverse: bool,
    ) -> Result<(usize, Vec<Vec<u8>>), KvError> {
        let def = self.get_index(table, field).ok_or(KvError::NoSuchIndex)?;
        let prefix = def.prefix();

        let start = match &cond.start_key {
            None => prefix.clone(),
            Some(value) => {
                let mut key = prefix.clone();
                key.extend_from_slice(&def.encode_value(value)?);
                if cond.include_start {
                    key
                } else {
                    match codec::prefix_successor(&key) {
                        Some(next) => next,
                        None => return Ok((0, Vec::new())),
                    }
                }
            }
        };
        let end = match &cond.end_key {
            None => codec::prefix_successor(&prefix),
            Some(value) => {
                let mut key = prefix.clone();
                key.extend_from_slice(&def.encode_value(value)?);
                if cond.include_end {
                    codec::prefix_successor(&key)
                } else {
                    Some(key)
                }
            }
        };
        if let Some(end) = &end {
            if start >= *end {
                return Ok((0, Vec::new()));
            }
        }

        let layout = def.value_type.layout();
        let limit = usize::try_from(cond.limit).ok();
        let mut skipped = 0usize;
        let mut pks = Vec::new();
        if limit == Some(0) {
            return Ok((0, pks));
        }
        self.store
            .scan(Partition::Index, &start, end.as_deref(), reverse, |key, _| {
                if skipped < cond.offset {
                    skipped += 1;
                    return Ok(true);
                }
                let entry = codec::decode_index_entry_key(key, layout)?;
                pks.push(entry.pk);
                Ok(limit.map_or(true, |limit| pks.len() < limit))
            })?;
        Ok((pks.len(), pks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_manager() -> (tempfile::TempDir, Arc<KvStore>, IndexManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(KvStore::open(dir.path().join("ns")).expect("open store"));
        let manager = IndexManager::new(store.clone());
        (dir, store, manager)
    }

    fn index(table: &str, name: &str, field: &str, value_type: IndexValueType) -> HsetIndex {
        HsetIndex {
            table: table.to_string(),
            name: name.to_string(),
            index_field: field.to_string(),
            unique: false,
            value_type,
        }
    }

    fn put_records(store: &KvStore, manager: &IndexManager, field: &str, rows: &[(&str, &str)]) {
        let mut batch = WriteBatch::new();
        for (pk, value) in rows {
            manager
                .add_index_record(pk.as_bytes(), field, value.as_bytes(), &mut batch)
                .expect("add record");
        }
        store.commit(batch).expect("commit");
    }

    fn cond(start: Option<&str>, include_start: bool, end: Option<&str>, include_end: bool) -> IndexCondition {
        IndexCondition {
            start_key: start.map(|s| s.as_bytes().to_vec()),
            include_start,
            end_key: end.map(|s| s.as_bytes().to_vec()),
            include_end,
            offset: 0,
            limit: -1,
        }
    }

    fn keys(pks: &[Vec<u8>]) -> Vec<String> {
        pks.iter().map(|k| String::from_utf8_lossy(k).to_string()).collect()
    }

    #[test]
    fn load_indexes_restores_definitions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("ns");
        {
            let store = Arc::new(KvStore::open(&root).expect("open"));
            let manager = IndexManager::new(store);
            manager.add_index(index("test", "index1", "field1", IndexValueType::String)).expect("add");
            manager.add_index(index("test", "index2", "field2", IndexValueType::Int64)).expect("add");
            manager.add_index(index("test2", "index1", "field1", IndexValueType::String)).expect("add");
            assert_eq!(manager.table_count(), 2);
        }
        let store = Arc::new(KvStore::open(&root).expect("reopen"));
        let manager = IndexManager::new(store);
        assert_eq!(manager.table_count(), 0);
        assert_eq!(manager.load_indexes().expect("load"), 2);
        assert_eq!(manager.table_indexes("test").len(), 2);
        assert_eq!(
            manager.get_index("test", "field2").map(|d| d.value_type),
            Some(IndexValueType::Int64)
        );
    }

    #[test]
    fn duplicate_definition_conflicts() {
        let (_dir, _store, manager) = open_manager();
        manager.add_index(index("test", "index1", "field1", IndexValueType::String)).expect("add");
        let err = manager
            .add_index(index("test", "other", "field1", IndexValueType::Int64))
            .expect_err("duplicate");
        assert!(matches!(err, KvError::IndexExists { .. }));
    }

    #[test]
    fn undefined_index_is_reported() {
        let (_dir, _store, manager) = open_manager();
        let err = manager.search("test", "missing", &IndexCondition::default(), false).expect_err("search");
        assert_eq!(err, KvError::NoSuchIndex);
        let mut batch = WriteBatch::new();
        let err = manager
            .add_index_record(b"test:key1", "missing", b"v", &mut batch)
            .expect_err("record");
        assert_eq!(err, KvError::NoSuchIndex);
        assert_eq!(manager.remove_index("test", "missing"), Err(KvError::NoSuchIndex));
    }

    #[test]
    fn string_index_range_search() {
        let (_dir, store, manager) = open_manager();
        manager.add_index(index("test", "index1", "field1", IndexValueType::String)).expect("add");
        put_records(
            &store,
            &manager,
            "field1",
            &[("test:key1", "fv1"), ("test:key2", "fv2"), ("test:key3", "fv3")],
        );

        let (count, pks) = manager.search("test", "field1", &IndexCondition::default(), false).expect("all");
        assert_eq!(count, 3);
        assert_eq!(keys(&pks), vec!["test:key1", "test:key2", "test:key3"]);

        let (_, pks) = manager.search("test", "field1", &cond(None, false, Some("fv2"), true), false).expect("le");
        assert_eq!(keys(&pks), vec!["test:key1", "test:key2"]);
        let (_, pks) = manager.search("test", "field1", &cond(None, false, Some("fv2"), false), false).expect("lt");
        assert_eq!(keys(&pks), vec!["test:key1"]);
        let (_, pks) = manager.search("test", "field1", &cond(Some("fv1"), false, None, false), false).expect("gt");
        assert_eq!(keys(&pks), vec!["test:key2", "test:key3"]);
        let (_, pks) = manager.search("test", "field1", &cond(Some("fv1"), true, None, false), false).expect("ge");
        assert_eq!(keys(&pks), vec!["test:key1", "test:key2", "test:key3"]);
        let (_, pks) = manager.search("test", "field1", &cond(Some("fv2"), true, Some("fv2"), true), false).expect("eq");
        assert_eq!(keys(&pks), vec!["test:key2"]);

        let mut batch = WriteBatch::new();
        manager
            .remove_index_record(b"test:key1", "field1", b"fv1", &mut batch)
            .expect("remove");
        store.commit(batch).expect("commit");

        let (count, pks) = manager.search("test", "field1", &cond(Some("fv1"), true, None, false), false).expect("ge");
        assert_eq!(count, 2);
        assert_eq!(keys(&pks), vec!["test:key2", "test:key3"]);
    }

    #[test]
    fn int64_index_orders_numerically() {
        let (_dir, store, manager) = open_manager();
        manager.add_index(index("test", "index2", "field2", IndexValueType::Int64)).expect("add");
        put_records(
            &store,
            &manager,
            "field2",
            &[("test:key1", "1"), ("test:key2", "2"), ("test:key3", "11")],
        );

        let (_, pks) = manager.search("test", "field2", &IndexCondition::default(), false).expect("all");
        assert_eq!(keys(&pks), vec!["test:key1", "test:key2", "test:key3"]);
        let (_, pks) = manager.search("test", "field2", &cond(Some("2"), false, None, false), false).expect("gt");
        assert_eq!(keys(&pks), vec!["test:key3"]);
        let (_, pks) = manager.search("test", "field2", &cond(None, false, Some("11"), false), false).expect("lt");
        assert_eq!(keys(&pks), vec!["test:key1", "test:key2"]);

        let mut batch = WriteBatch::new();
        let err = manager
            .add_index_record(b"test:key4", "field2", b"abc", &mut batch)
            .expect_err("type mismatch");
        assert!(matches!(err, KvError::IndexValueType(_)));
    }

    #[test]
    fn reverse_offset_and_limit() {
        let (_dir, store, manager) = open_manager();
        manager.add_index(index("test", "index1", "field1", IndexValueType::String)).expect("add");
        put_records(
            &store,
            &manager,
            "field1",
            &[("test:a", "same"), ("test:b", "same"), ("test:c", "x"), ("test:d", "y")],
        );

        let (_, forward) = manager.search("test", "field1", &IndexCondition::default(), false).expect("fwd");
        let (_, mut backward) = manager.search("test", "field1", &IndexCondition::default(), true).expect("rev");
        backward.reverse();
        assert_eq!(forward, backward);
        assert_eq!(keys(&forward), vec!["test:a", "test:b", "test:c", "test:d"]);

        let paged = IndexCondition {
            offset: 1,
            limit: 2,
            ..IndexCondition::default()
        };
        let (count, pks) = manager.search("test", "field1", &paged, false).expect("page");
        assert_eq!(count, 2);
        assert_eq!(keys(&pks), vec!["test:b", "test:c"]);
        let (_, pks) = manager.search("test", "field1", &paged, true).expect("page rev");
        assert_eq!(keys(&pks), vec!["test:c", "test:b"]);
    }

    #[test]
    fn unique_index_rejects_second_holder() {
        let (_dir, store, manager) = open_manager();
        let mut def = index("user", "email_idx", "email", IndexValueType::String);
        def.unique = true;
        manager.add_index(def).expect("add");

        let mut batch = WriteBatch::new();
        manager
            .add_index_record(b"user:1", "email", b"a@x", &mut batch)
            .expect("first");
        let err = manager
            .add_index_record(b"user:2", "email", b"a@x", &mut batch)
            .expect_err("pending holder");
        assert!(matches!(err, KvError::UniqueViolation { .. }));
        store.commit(batch).expect("commit");

        let mut batch = WriteBatch::new();
        manager
            .add_index_record(b"user:1", "email", b"a@x", &mut batch)
            .expect("same pk rewrite");
        assert!(manager
            .add_index_record(b"user:2", "email", b"a@x", &mut batch)
            .is_err());
    }

    #[test]
    fn remove_index_drops_entries() {
        let (_dir, store, manager) = open_manager();
        manager.add_index(index("test", "index1", "field1", IndexValueType::String)).expect("add");
        put_records(&store, &manager, "field1", &[("test:key1", "fv1")]);
        manager.remove_index("test", "field1").expect("remove");
        assert!(store.prefix(Partition::Index, &codec::index_prefix("test", "index1")).expect("scan").is_empty());
        manager.add_index(index("test", "index1", "field1", IndexValueType::String)).expect("re-add");
        let (count, _) = manager.search("test", "field1", &IndexCondition::default(), false).expect("search");
        assert_eq!(count, 0);
    }
}
