//! Versioned table storage
//!
//! Each primary key owns a chain of row versions tagged with
//! `(create_xid, delete_xid)`. Chains live in a BTreeMap so multi-row writes
//! can take effect in primary-key order.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::storage::memory::txn::VisibilityView;
use crate::storage::schema::{IndexDescriptor, IndexKind, TableDescriptor};
use crate::storage::value::{Row, Value};

/// One version of a row.
#[derive(Debug, Clone)]
pub struct VersionedRow {
    pub row: Row,
    pub create_xid: u64,
    pub delete_xid: Option<u64>,
    /// Wall-clock stamp used by the age-based GC threshold.
    pub stamp: Instant,
}

/// Secondary index: value key -> set of primary keys. Entries may point at
/// chains whose visible version no longer carries the value; lookups re-check
/// against the chain.
#[derive(Debug)]
pub struct SecondaryIndex {
    pub desc: IndexDescriptor,
    map: IndexMap,
}

#[derive(Debug)]
enum IndexMap {
    Hash(HashMap<Vec<u8>, BTreeSet<Vec<u8>>>),
    Ordered(BTreeMap<Vec<u8>, BTreeSet<Vec<u8>>>),
}

impl SecondaryIndex {
    pub fn new(desc: IndexDescriptor) -> Self {
        let map = match desc.kind {
            IndexKind::Hash => IndexMap::Hash(HashMap::new()),
            IndexKind::Ordered => IndexMap::Ordered(BTreeMap::new()),
        };
        Self { desc, map }
    }

    pub fn add(&mut self, value_key: Vec<u8>, pk: Vec<u8>) {
        match &mut self.map {
            IndexMap::Hash(m) => m.entry(value_key).or_default().insert(pk),
            IndexMap::Ordered(m) => m.entry(value_key).or_default().insert(pk),
        };
    }

    pub fn remove(&mut self, value_key: &[u8], pk: &[u8]) {
        let empty = match &mut self.map {
            IndexMap::Hash(m) => m.get_mut(value_key).map(|s| {
                s.remove(pk);
                s.is_empty()
            }),
            IndexMap::Ordered(m) => m.get_mut(value_key).map(|s| {
                s.remove(pk);
                s.is_empty()
            }),
        };
        if empty == Some(true) {
            match &mut self.map {
                IndexMap::Hash(m) => {
                    m.remove(value_key);
                }
                IndexMap::Ordered(m) => {
                    m.remove(value_key);
                }
            }
        }
    }

    pub fn lookup(&self, value_key: &[u8]) -> Vec<Vec<u8>> {
        match &self.map {
            IndexMap::Hash(m) => m
                .get(value_key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
            IndexMap::Ordered(m) => m
                .get(value_key)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// Table contents plus secondary indexes, guarded by one RwLock in the
/// engine. Schema changes take the same lock exclusively.
#[derive(Debug)]
pub struct TableData {
    pub desc: TableDescriptor,
    pub chains: BTreeMap<Vec<u8>, Vec<VersionedRow>>,
    pub indexes: HashMap<String, SecondaryIndex>,
    pub auto_inc: i64,
}

impl TableData {
    pub fn new(desc: TableDescriptor) -> Self {
        let mut indexes = HashMap::new();
        for idx in &desc.indexes {
            indexes.insert(idx.name.clone(), SecondaryIndex::new(idx.clone()));
        }
        Self {
            desc,
            chains: BTreeMap::new(),
            indexes,
            auto_inc: 0,
        }
    }

    /// Primary-key bytes for a row.
    pub fn pk_of(&self, row: &Row) -> Vec<u8> {
        row.key_for(&self.desc.primary_key)
    }

    /// Latest version visible to the view, if any.
    pub fn visible_version<'a>(
        &'a self,
        pk: &[u8],
        view: &VisibilityView,
    ) -> Option<&'a VersionedRow> {
        self.chains
            .get(pk)?
            .iter()
            .rev()
            .find(|v| view.visible(v.create_xid, v.delete_xid))
    }

    /// Write-write conflict test against every version another transaction
    /// currently has in flight or committed past the view's snapshot.
    pub fn write_conflict(&self, pk: &[u8], view: &VisibilityView) -> bool {
        self.chains.get(pk).is_some_and(|chain| {
            chain.iter().any(|v| {
                view.conflicts(v.create_xid)
                    || v.delete_xid.is_some_and(|d| view.conflicts(d))
            })
        })
    }

    /// Install a new version and maintain secondary indexes. The index write
    /// shares the caller's table lock, so data and index move together.
    pub fn install_version(&mut self, pk: Vec<u8>, row: Row, create_xid: u64) {
        for index in self.indexes.values_mut() {
            let value_key = row.key_for(&index.desc.columns);
            index.add(value_key, pk.clone());
        }
        self.chains.entry(pk).or_default().push(VersionedRow {
            row,
            create_xid,
            delete_xid: None,
            stamp: Instant::now(),
        });
    }

    /// Tombstone the visible version for this transaction.
    pub fn mark_deleted(&mut self, pk: &[u8], view: &VisibilityView) -> bool {
        if let Some(chain) = self.chains.get_mut(pk) {
            if let Some(v) = chain
                .iter_mut()
                .rev()
                .find(|v| view.visible(v.create_xid, v.delete_xid))
            {
                v.delete_xid = Some(view.xid);
                v.stamp = Instant::now();
                return true;
            }
        }
        false
    }

    /// Undo the effects of an aborted transaction on one chain.
    pub fn undo_writes(&mut self, pk: &[u8], xid: u64) {
        if let Some(chain) = self.chains.get_mut(pk) {
            chain.retain(|v| v.create_xid != xid);
            for v in chain.iter_mut() {
                if v.delete_xid == Some(xid) {
                    v.delete_xid = None;
                }
            }
            if chain.is_empty() {
                self.chains.remove(pk);
            }
        }
    }

    /// Fill defaults and the auto-increment column, then verify NOT NULL
    /// constraints. Returns the completed row in schema column order.
    pub fn complete_row(&mut self, row: Row) -> Result<Row> {
        let mut values = Vec::with_capacity(self.desc.columns.len());
        for col in &self.desc.columns {
            let mut v = row.get(&col.name).cloned().unwrap_or(Value::Null);
            if v.is_null() {
                if col.auto_increment {
                    self.auto_inc += 1;
                    v = Value::Int(self.auto_inc);
                } else if let Some(default) = &col.default {
                    v = default.clone();
                }
            }
            if v.is_null() && !col.nullable {
                return Err(Error::Storage(format!(
                    "column '{}' cannot be null",
                    col.name
                )));
            }
            if let Value::Int(i) = v {
                if col.auto_increment && i > self.auto_inc {
                    self.auto_inc = i;
                }
            }
            values.push(v);
        }
        Ok(Row::new(
            std::sync::Arc::new(self.desc.column_names()),
            values,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::txn::TransactionManager;
    use crate::storage::engine::Isolation;
    use crate::storage::schema::{ColumnDescriptor, PersistencePolicy, SemanticType, TableEngine};

    fn desc() -> TableDescriptor {
        TableDescriptor {
            name: "users".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".into(),
                    data_type: SemanticType::Int,
                    nullable: false,
                    primary_key: true,
                    auto_increment: true,
                    default: None,
                },
                ColumnDescriptor::new("name", SemanticType::String),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![IndexDescriptor {
                name: "idx_name".into(),
                columns: vec!["name".into()],
                unique: false,
                kind: IndexKind::Hash,
            }],
            persistence: PersistencePolicy::MemoryOnly,
            engine: TableEngine::Hybrid,
            fulltext: vec![],
        }
    }

    #[test]
    fn test_auto_increment_fills_missing_pk() {
        let mut table = TableData::new(desc());
        let row = Row::from_pairs(vec![
            ("id".into(), Value::Null),
            ("name".into(), Value::Str("Alice".into())),
        ]);
        let completed = table.complete_row(row).unwrap();
        assert_eq!(completed.get("id"), Some(&Value::Int(1)));
        let row = Row::from_pairs(vec![("name".into(), Value::Str("Bob".into()))]);
        let completed = table.complete_row(row).unwrap();
        assert_eq!(completed.get("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_not_null_enforced() {
        let mut desc = desc();
        desc.columns[1].nullable = false;
        let mut table = TableData::new(desc);
        let row = Row::from_pairs(vec![("id".into(), Value::Int(1))]);
        assert!(table.complete_row(row).is_err());
    }

    #[test]
    fn test_version_chain_visibility() {
        let m = TransactionManager::new(8);
        let mut table = TableData::new(desc());

        let writer = m.begin(Isolation::Snapshot).unwrap();
        let row = Row::from_pairs(vec![
            ("id".into(), Value::Int(1)),
            ("name".into(), Value::Str("Alice".into())),
        ]);
        let row = table.complete_row(row).unwrap();
        let pk = table.pk_of(&row);
        table.install_version(pk.clone(), row, writer.xid);

        // Another snapshot cannot see the uncommitted row.
        let reader = m.begin(Isolation::Snapshot).unwrap();
        assert!(table.visible_version(&pk, &m.view(&reader)).is_none());

        m.mark_committed(writer.xid);
        let reader2 = m.begin(Isolation::Snapshot).unwrap();
        assert!(table.visible_version(&pk, &m.view(&reader2)).is_some());
    }

    #[test]
    fn test_delete_tombstone_and_undo() {
        let m = TransactionManager::new(8);
        let mut table = TableData::new(desc());
        let writer = m.begin(Isolation::Snapshot).unwrap();
        let row = table
            .complete_row(Row::from_pairs(vec![
                ("id".into(), Value::Int(1)),
                ("name".into(), Value::Str("Alice".into())),
            ]))
            .unwrap();
        let pk = table.pk_of(&row);
        table.install_version(pk.clone(), row, writer.xid);
        m.mark_committed(writer.xid);

        let deleter = m.begin(Isolation::Snapshot).unwrap();
        assert!(table.mark_deleted(&pk, &m.view(&deleter)));
        // The deleter no longer sees the row; a fresh snapshot still does.
        assert!(table.visible_version(&pk, &m.view(&deleter)).is_none());
        let other = m.begin(Isolation::Snapshot).unwrap();
        assert!(table.visible_version(&pk, &m.view(&other)).is_some());

        // Abort restores it for everyone.
        m.mark_aborted(deleter.xid);
        table.undo_writes(&pk, deleter.xid);
        let after = m.begin(Isolation::Snapshot).unwrap();
        assert!(table.visible_version(&pk, &m.view(&after)).is_some());
    }

    #[test]
    fn test_index_lookup_add_remove() {
        let mut index = SecondaryIndex::new(IndexDescriptor {
            name: "idx".into(),
            columns: vec!["name".into()],
            unique: false,
            kind: IndexKind::Ordered,
        });
        index.add(b"alice".to_vec(), b"pk1".to_vec());
        index.add(b"alice".to_vec(), b"pk2".to_vec());
        assert_eq!(index.lookup(b"alice").len(), 2);
        index.remove(b"alice", b"pk1");
        assert_eq!(index.lookup(b"alice").len(), 1);
        index.remove(b"alice", b"pk2");
        assert!(index.lookup(b"alice").is_empty());
    }
}
