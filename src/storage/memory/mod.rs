//! In-memory MVCC table engine
//!
//! Snapshot isolation over versioned rows, optimistic write validation, and
//! a periodic GC that also handles XID wrap remapping.

pub mod gc;
pub mod table;
pub mod txn;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::rowset;
use crate::sql::ast::Expr;
use crate::storage::engine::{Isolation, ScanRequest, StorageEngine, TxnContext};
use crate::storage::schema::TableDescriptor;
use crate::storage::value::{Row, Value};

use table::TableData;
use txn::{ReadEntry, TransactionManager, WriteEntry};

/// The memory-resident MVCC engine.
pub struct MemoryEngine {
    tables: RwLock<HashMap<String, Arc<RwLock<TableData>>>>,
    pub txns: Arc<TransactionManager>,
    xid_wrap_threshold: u64,
}

impl MemoryEngine {
    pub fn new(max_active_txns: usize, xid_wrap_threshold: u64) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            txns: Arc::new(TransactionManager::new(max_active_txns)),
            xid_wrap_threshold,
        }
    }

    pub fn begin(&self, isolation: Isolation) -> Result<TxnContext> {
        self.txns.begin(isolation)
    }

    /// Commit: validate the read set (rows read for update must not have
    /// gained a newer committed version), then advance the watermark.
    pub fn commit(&self, txn: &TxnContext) -> Result<()> {
        let read_set = self.txns.take_read_set(txn.xid);
        for entry in &read_set {
            if !self.read_entry_stable(txn, entry)? {
                self.rollback(txn);
                return Err(Error::Serialization(format!(
                    "row in table '{}' changed under transaction {}",
                    entry.table, txn.xid
                )));
            }
        }
        self.txns.mark_committed(txn.xid);
        Ok(())
    }

    /// Roll back: remove this transaction's versions and clear its delete
    /// marks.
    pub fn rollback(&self, txn: &TxnContext) {
        let writes = self.txns.mark_aborted(txn.xid);
        for WriteEntry { table, pk } in writes {
            if let Some(data) = self.table_handle_opt(&table) {
                data.write().unwrap().undo_writes(&pk, txn.xid);
            }
        }
    }

    fn read_entry_stable(&self, txn: &TxnContext, entry: &ReadEntry) -> Result<bool> {
        let data = self.table_handle(&entry.table)?;
        let data = data.read().unwrap();
        let current = data
            .chains
            .get(&entry.pk)
            .into_iter()
            .flatten()
            .filter(|v| v.create_xid != txn.xid)
            .map(|v| v.create_xid)
            .max();
        Ok(current == Some(entry.create_xid))
    }

    fn table_handle(&self, table: &str) -> Result<Arc<RwLock<TableData>>> {
        self.table_handle_opt(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    fn table_handle_opt(&self, table: &str) -> Option<Arc<RwLock<TableData>>> {
        self.tables.read().unwrap().get(table).cloned()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.read().unwrap().contains_key(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().unwrap().keys().cloned().collect()
    }

    /// All rows visible to the context, bypassing filters; used by the
    /// migration copy and the statistics collector.
    pub fn snapshot_rows(&self, txn: &TxnContext, table: &str) -> Result<Vec<Row>> {
        let data = self.table_handle(table)?;
        let data = data.read().unwrap();
        let view = self.txns.view(txn);
        Ok(data
            .chains
            .values()
            .filter_map(|chain| {
                chain
                    .iter()
                    .rev()
                    .find(|v| view.visible(v.create_xid, v.delete_xid))
            })
            .map(|v| v.row.clone())
            .collect())
    }

    fn apply_request(rows: Vec<Row>, request: &ScanRequest) -> Result<Vec<Row>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(filter) = &request.filter {
                if !rowset::eval_predicate(filter, &row)? {
                    continue;
                }
            }
            out.push(match &request.projection {
                Some(cols) => row.project(cols),
                None => row,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_table(&self, desc: &TableDescriptor) -> Result<()> {
        desc.validate()?;
        let mut tables = self.tables.write().unwrap();
        if tables.contains_key(&desc.name) {
            return Err(Error::Storage(format!("table '{}' already exists", desc.name)));
        }
        tables.insert(
            desc.name.clone(),
            Arc::new(RwLock::new(TableData::new(desc.clone()))),
        );
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.tables
            .write()
            .unwrap()
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    async fn insert(&self, txn: &TxnContext, table: &str, rows: Vec<Row>) -> Result<u64> {
        let data = self.table_handle(table)?;
        let mut data = data.write().unwrap();
        let view = self.txns.view(txn);

        // Complete rows first, then apply in primary-key order.
        let mut completed: Vec<(Vec<u8>, Row)> = Vec::with_capacity(rows.len());
        for row in rows {
            let row = data.complete_row(row)?;
            let pk = data.pk_of(&row);
            completed.push((pk, row));
        }
        completed.sort_by(|a, b| a.0.cmp(&b.0));

        for (pk, row) in &completed {
            if data.visible_version(pk, &view).is_some() {
                return Err(Error::Storage(format!(
                    "duplicate primary key in table '{table}'"
                )));
            }
            if data.write_conflict(pk, &view) {
                return Err(Error::Serialization(format!(
                    "concurrent write on table '{table}'"
                )));
            }
        }
        let count = completed.len() as u64;
        for (pk, row) in completed {
            self.txns.record_write(
                txn.xid,
                WriteEntry {
                    table: table.to_string(),
                    pk: pk.clone(),
                },
            );
            data.install_version(pk, row, txn.xid);
        }
        Ok(count)
    }

    async fn update(
        &self,
        txn: &TxnContext,
        table: &str,
        assignments: &[(String, Value)],
        filter: Option<&Expr>,
    ) -> Result<u64> {
        let data = self.table_handle(table)?;
        let mut data = data.write().unwrap();
        let view = self.txns.view(txn);

        // Collect targets in chain (primary-key) order, then mutate.
        let mut targets: Vec<(Vec<u8>, Row, u64)> = Vec::new();
        for (pk, chain) in data.chains.iter() {
            if let Some(v) = chain
                .iter()
                .rev()
                .find(|v| view.visible(v.create_xid, v.delete_xid))
            {
                if let Some(f) = filter {
                    if !rowset::eval_predicate(f, &v.row)? {
                        continue;
                    }
                }
                targets.push((pk.clone(), v.row.clone(), v.create_xid));
            }
        }

        for (pk, _, _) in &targets {
            if data.write_conflict(pk, &view) {
                return Err(Error::Serialization(format!(
                    "concurrent write on table '{table}'"
                )));
            }
        }

        let count = targets.len() as u64;
        for (pk, old_row, create_xid) in targets {
            self.txns.record_read(
                txn.xid,
                ReadEntry {
                    table: table.to_string(),
                    pk: pk.clone(),
                    create_xid,
                },
            );
            let mut pairs: Vec<(String, Value)> = old_row
                .columns()
                .iter()
                .cloned()
                .zip(old_row.values().iter().cloned())
                .collect();
            for (col, value) in assignments {
                match pairs.iter_mut().find(|(c, _)| c == col) {
                    Some((_, slot)) => *slot = value.clone(),
                    None => return Err(Error::UnknownColumn(col.clone())),
                }
            }
            let new_row = data.complete_row(Row::from_pairs(pairs))?;
            let new_pk = data.pk_of(&new_row);

            data.mark_deleted(&pk, &view);
            self.txns.record_write(
                txn.xid,
                WriteEntry {
                    table: table.to_string(),
                    pk: pk.clone(),
                },
            );
            if new_pk != pk {
                self.txns.record_write(
                    txn.xid,
                    WriteEntry {
                        table: table.to_string(),
                        pk: new_pk.clone(),
                    },
                );
            }
            data.install_version(new_pk, new_row, txn.xid);
        }
        Ok(count)
    }

    async fn delete(&self, txn: &TxnContext, table: &str, filter: Option<&Expr>) -> Result<u64> {
        let data = self.table_handle(table)?;
        let mut data = data.write().unwrap();
        let view = self.txns.view(txn);

        let mut targets: Vec<(Vec<u8>, u64)> = Vec::new();
        for (pk, chain) in data.chains.iter() {
            if let Some(v) = chain
                .iter()
                .rev()
                .find(|v| view.visible(v.create_xid, v.delete_xid))
            {
                if let Some(f) = filter {
                    if !rowset::eval_predicate(f, &v.row)? {
                        continue;
                    }
                }
                targets.push((pk.clone(), v.create_xid));
            }
        }
        for (pk, _) in &targets {
            if data.write_conflict(pk, &view) {
                return Err(Error::Serialization(format!(
                    "concurrent write on table '{table}'"
                )));
            }
        }
        let count = targets.len() as u64;
        for (pk, create_xid) in targets {
            self.txns.record_read(
                txn.xid,
                ReadEntry {
                    table: table.to_string(),
                    pk: pk.clone(),
                    create_xid,
                },
            );
            data.mark_deleted(&pk, &view);
            self.txns.record_write(
                txn.xid,
                WriteEntry {
                    table: table.to_string(),
                    pk,
                },
            );
        }
        Ok(count)
    }

    async fn scan(&self, txn: &TxnContext, table: &str, request: &ScanRequest) -> Result<Vec<Row>> {
        let data = self.table_handle(table)?;
        let data = data.read().unwrap();
        let view = self.txns.view(txn);

        let rows: Vec<Row> = data
            .chains
            .values()
            .enumerate()
            .filter(|(i, _)| match request.partition {
                Some((index, total)) if total > 1 => i % total == index,
                _ => true,
            })
            .filter_map(|(_, chain)| {
                chain
                    .iter()
                    .rev()
                    .find(|v| view.visible(v.create_xid, v.delete_xid))
            })
            .map(|v| v.row.clone())
            .collect();
        Self::apply_request(rows, request)
    }

    async fn index_lookup(
        &self,
        txn: &TxnContext,
        table: &str,
        index: &str,
        key: &Value,
    ) -> Result<Vec<Row>> {
        let data = self.table_handle(table)?;
        let data = data.read().unwrap();
        let view = self.txns.view(txn);

        let idx = data
            .indexes
            .get(index)
            .ok_or_else(|| Error::Storage(format!("index '{index}' not found on '{table}'")))?;
        let mut value_key = Vec::new();
        key.encode_key(&mut value_key);

        let mut rows = Vec::new();
        for pk in idx.lookup(&value_key) {
            if let Some(v) = data.visible_version(&pk, &view) {
                // The entry may be stale; confirm the visible version still
                // carries the indexed value.
                let current = v.row.key_for(&idx.desc.columns);
                if current == value_key {
                    rows.push(v.row.clone());
                }
            }
        }
        Ok(rows)
    }

    async fn table_rows(&self, txn: &TxnContext, table: &str) -> Result<u64> {
        Ok(self.snapshot_rows(txn, table)?.len() as u64)
    }
}

impl MemoryEngine {
    /// Run one autocommit operation under a throwaway transaction.
    pub async fn autocommit<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TxnContext) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let txn = self.begin(Isolation::Snapshot)?;
        match f(txn).await {
            Ok(v) => {
                self.commit(&txn)?;
                Ok(v)
            }
            Err(e) => {
                self.rollback(&txn);
                Err(e)
            }
        }
    }

    /// Add a secondary index and backfill it from existing versions.
    pub fn create_index(
        &self,
        table: &str,
        desc: crate::storage::schema::IndexDescriptor,
    ) -> Result<()> {
        let handle = self.table_handle(table)?;
        let mut data = handle.write().unwrap();
        if data.indexes.contains_key(&desc.name) {
            return Err(Error::Storage(format!(
                "index '{}' already exists on '{table}'",
                desc.name
            )));
        }
        let mut index = table::SecondaryIndex::new(desc.clone());
        for (pk, chain) in &data.chains {
            for v in chain {
                index.add(v.row.key_for(&desc.columns), pk.clone());
            }
        }
        data.indexes.insert(desc.name.clone(), index);
        data.desc.indexes.push(desc);
        Ok(())
    }

    pub(crate) fn tables_snapshot(&self) -> Vec<(String, Arc<RwLock<TableData>>)> {
        self.tables
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub(crate) fn wrap_threshold(&self) -> u64 {
        self.xid_wrap_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::BinOp;
    use crate::storage::schema::{ColumnDescriptor, PersistencePolicy, SemanticType, TableEngine};

    fn users_desc() -> TableDescriptor {
        TableDescriptor {
            name: "users".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".into(),
                    data_type: SemanticType::Int,
                    nullable: false,
                    primary_key: true,
                    auto_increment: false,
                    default: None,
                },
                ColumnDescriptor::new("name", SemanticType::String),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
            persistence: PersistencePolicy::MemoryOnly,
            engine: TableEngine::Hybrid,
            fulltext: vec![],
        }
    }

    fn row(id: i64, name: &str) -> Row {
        Row::from_pairs(vec![
            ("id".into(), Value::Int(id)),
            ("name".into(), Value::Str(name.into())),
        ])
    }

    async fn engine_with_rows() -> MemoryEngine {
        let engine = MemoryEngine::new(64, 100_000);
        engine.create_table(&users_desc()).await.unwrap();
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine
            .insert(&txn, "users", vec![row(1, "Alice"), row(2, "Bob")])
            .await
            .unwrap();
        engine.commit(&txn).unwrap();
        engine
    }

    #[tokio::test]
    async fn test_insert_then_scan() {
        let engine = engine_with_rows().await;
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        let request = ScanRequest {
            filter: Some(Expr::binary(
                Expr::column("id"),
                BinOp::Gt,
                Expr::Literal(Value::Int(1)),
            )),
            ..Default::default()
        };
        let rows = engine.scan(&txn, "users", &request).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Str("Bob".into())));
    }

    #[tokio::test]
    async fn test_duplicate_pk_rejected() {
        let engine = engine_with_rows().await;
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        let err = engine
            .insert(&txn, "users", vec![row(1, "Mallory")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        engine.rollback(&txn);
    }

    #[tokio::test]
    async fn test_snapshot_does_not_see_later_commit() {
        let engine = engine_with_rows().await;
        let early = engine.begin(Isolation::Snapshot).unwrap();

        let writer = engine.begin(Isolation::Snapshot).unwrap();
        engine
            .insert(&writer, "users", vec![row(3, "Carol")])
            .await
            .unwrap();
        engine.commit(&writer).unwrap();

        let rows = engine
            .scan(&early, "users", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2, "snapshot predates Carol");

        let late = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine
            .scan(&late, "users", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_update_produces_new_version() {
        let engine = engine_with_rows().await;
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        let n = engine
            .update(
                &txn,
                "users",
                &[("name".into(), Value::Str("Bobby".into()))],
                Some(&Expr::binary(
                    Expr::column("id"),
                    BinOp::Eq,
                    Expr::Literal(Value::Int(2)),
                )),
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
        engine.commit(&txn).unwrap();

        let reader = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine
            .scan(&reader, "users", &ScanRequest::default())
            .await
            .unwrap();
        let bob = rows
            .iter()
            .find(|r| r.get("id") == Some(&Value::Int(2)))
            .unwrap();
        assert_eq!(bob.get("name"), Some(&Value::Str("Bobby".into())));
    }

    #[tokio::test]
    async fn test_concurrent_update_conflict() {
        let engine = engine_with_rows().await;
        let a = engine.begin(Isolation::Snapshot).unwrap();
        let b = engine.begin(Isolation::Snapshot).unwrap();
        let filter = Expr::binary(Expr::column("id"), BinOp::Eq, Expr::Literal(Value::Int(1)));

        engine
            .update(&a, "users", &[("name".into(), Value::Str("A".into()))], Some(&filter))
            .await
            .unwrap();
        let err = engine
            .update(&b, "users", &[("name".into(), Value::Str("B".into()))], Some(&filter))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
        assert_eq!(err.mysql_code(), 1213);
        engine.rollback(&b);
        engine.commit(&a).unwrap();
    }

    #[tokio::test]
    async fn test_rollback_undoes_insert() {
        let engine = engine_with_rows().await;
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        engine
            .insert(&txn, "users", vec![row(9, "Ghost")])
            .await
            .unwrap();
        engine.rollback(&txn);

        let reader = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine
            .scan(&reader, "users", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_is_tombstone_not_noop() {
        let engine = engine_with_rows().await;
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        let n = engine
            .delete(
                &txn,
                "users",
                Some(&Expr::binary(
                    Expr::column("id"),
                    BinOp::Eq,
                    Expr::Literal(Value::Int(1)),
                )),
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
        engine.commit(&txn).unwrap();

        let reader = engine.begin(Isolation::Snapshot).unwrap();
        let rows = engine
            .scan(&reader, "users", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        // The tombstoned version is still in the chain until GC runs.
        let handle = engine.table_handle("users").unwrap();
        let data = handle.read().unwrap();
        let total_versions: usize = data.chains.values().map(|c| c.len()).sum();
        assert_eq!(total_versions, 2);
    }

    #[tokio::test]
    async fn test_partitioned_scan_covers_all_rows() {
        let engine = engine_with_rows().await;
        let txn = engine.begin(Isolation::Snapshot).unwrap();
        let mut all = Vec::new();
        for p in 0..2 {
            let request = ScanRequest {
                partition: Some((p, 2)),
                ..Default::default()
            };
            all.extend(engine.scan(&txn, "users", &request).await.unwrap());
        }
        assert_eq!(all.len(), 2);
    }
}
