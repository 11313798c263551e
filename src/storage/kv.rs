//! Persistent KV backend
//!
//! Wraps an embedded store (SQLite used as an opaque ordered KV: one
//! `kv(key BLOB PRIMARY KEY, value BLOB)` table). Rows are bincode-encoded;
//! keys are `{table}:{pk-bytes}` and secondary index entries are
//! `{table}:idx:{name}:{value-bytes}:{pk-bytes}`. Primary-key bytes always
//! start with a value-tag byte below 0x08, so they can never collide with
//! the literal `idx:` namespace. Scans are prefix iterations; transactions
//! defer to the embedded store.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::rowset;
use crate::sql::ast::Expr;
use crate::storage::engine::{ScanRequest, StorageEngine, TxnContext};
use crate::storage::schema::TableDescriptor;
use crate::storage::value::{Row, Value};

const SCHEMA_PREFIX: &str = "__schema__:";

/// Ordered KV store over an embedded SQLite file.
pub struct KvStore {
    conn: Mutex<Connection>,
}

impl KvStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key BLOB PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |r| {
                r.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Apply a batch of deletes and puts atomically. Deletes run first so
    /// an entry both removed and re-added in one batch survives.
    pub fn apply(&self, puts: &[(Vec<u8>, Vec<u8>)], deletes: &[Vec<u8>]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let txn = conn.transaction()?;
        for key in deletes {
            txn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
        for (key, value) in puts {
            txn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All `(key, value)` pairs under a prefix, in key order.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = prefix_upper_bound(prefix);
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match upper {
            Some(upper) => {
                let mut stmt = conn
                    .prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
                let rows = stmt.query_map(params![prefix, upper], |r| {
                    Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key")?;
                let rows = stmt.query_map(params![prefix], |r| {
                    Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Push the WAL to the main file; used for tables with sync-on-write.
    pub fn flush(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

/// Smallest byte string strictly greater than every key with this prefix.
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(upper);
        }
        upper.pop();
    }
    None
}

/// SQL row engine over the KV store.
pub struct KvEngine {
    store: KvStore,
}

impl KvEngine {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            store: KvStore::open(path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            store: KvStore::open_in_memory()?,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    fn schema_key(table: &str) -> Vec<u8> {
        format!("{SCHEMA_PREFIX}{table}").into_bytes()
    }

    fn row_key(table: &str, pk: &[u8]) -> Vec<u8> {
        let mut key = format!("{table}:").into_bytes();
        key.extend_from_slice(pk);
        key
    }

    fn row_prefix(table: &str) -> Vec<u8> {
        format!("{table}:").into_bytes()
    }

    fn index_prefix(table: &str, index: &str) -> Vec<u8> {
        format!("{table}:idx:{index}:").into_bytes()
    }

    fn index_key(table: &str, index: &str, value_key: &[u8], pk: &[u8]) -> Vec<u8> {
        let mut key = Self::index_prefix(table, index);
        key.extend_from_slice(value_key);
        key.push(b':');
        key.extend_from_slice(pk);
        key
    }

    fn is_index_key(table: &str, key: &[u8]) -> bool {
        let marker = format!("{table}:idx:");
        key.starts_with(marker.as_bytes())
    }

    pub fn descriptor(&self, table: &str) -> Result<TableDescriptor> {
        let raw = self
            .store
            .get(&Self::schema_key(table))?
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        Ok(bincode::deserialize(&raw)?)
    }

    pub fn has_table(&self, table: &str) -> bool {
        matches!(self.store.get(&Self::schema_key(table)), Ok(Some(_)))
    }

    /// Table descriptors present in the backing file; drives catalog
    /// recovery after a restart.
    pub fn stored_tables(&self) -> Result<Vec<TableDescriptor>> {
        let mut out = Vec::new();
        for (_, raw) in self.store.prefix_scan(SCHEMA_PREFIX.as_bytes())? {
            out.push(bincode::deserialize(&raw)?);
        }
        Ok(out)
    }

    fn load_rows(&self, table: &str) -> Result<Vec<(Vec<u8>, Row)>> {
        let prefix = Self::row_prefix(table);
        let mut rows = Vec::new();
        for (key, raw) in self.store.prefix_scan(&prefix)? {
            if Self::is_index_key(table, &key) {
                continue;
            }
            let row: Row = bincode::deserialize(&raw)?;
            rows.push((key, row));
        }
        Ok(rows)
    }

    fn encode_row(row: &Row) -> Result<Vec<u8>> {
        Ok(bincode::serialize(row)?)
    }

    fn complete_row(&self, desc: &TableDescriptor, row: Row, auto_inc: &mut i64) -> Result<Row> {
        let mut values = Vec::with_capacity(desc.columns.len());
        for col in &desc.columns {
            let mut v = row.get(&col.name).cloned().unwrap_or(Value::Null);
            if v.is_null() {
                if col.auto_increment {
                    *auto_inc += 1;
                    v = Value::Int(*auto_inc);
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
            values.push(v);
        }
        Ok(Row::new(std::sync::Arc::new(desc.column_names()), values))
    }

    fn auto_inc_key(table: &str) -> Vec<u8> {
        format!("__meta__:{table}:auto_inc").into_bytes()
    }

    fn load_auto_inc(&self, table: &str) -> Result<i64> {
        Ok(self
            .store
            .get(&Self::auto_inc_key(table))?
            .and_then(|raw| raw.try_into().ok().map(i64::from_le_bytes))
            .unwrap_or(0))
    }

    fn index_mutations(
        desc: &TableDescriptor,
        row: &Row,
        pk: &[u8],
        puts: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) {
        for idx in &desc.indexes {
            let value_key = row.key_for(&idx.columns);
            puts.push((Self::index_key(&desc.name, &idx.name, &value_key, pk), Vec::new()));
        }
    }

    fn index_removals(desc: &TableDescriptor, row: &Row, pk: &[u8], deletes: &mut Vec<Vec<u8>>) {
        for idx in &desc.indexes {
            let value_key = row.key_for(&idx.columns);
            deletes.push(Self::index_key(&desc.name, &idx.name, &value_key, pk));
        }
    }
}

#[async_trait]
impl StorageEngine for KvEngine {
    fn name(&self) -> &'static str {
        "persistent"
    }

    async fn create_table(&self, desc: &TableDescriptor) -> Result<()> {
        desc.validate()?;
        if self.has_table(&desc.name) {
            return Err(Error::Storage(format!(
                "table '{}' already exists",
                desc.name
            )));
        }
        self.store
            .put(&Self::schema_key(&desc.name), &bincode::serialize(desc)?)
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        if !self.has_table(table) {
            return Err(Error::TableNotFound(table.to_string()));
        }
        let mut deletes: Vec<Vec<u8>> = self
            .store
            .prefix_scan(&Self::row_prefix(table))?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        deletes.push(Self::schema_key(table));
        deletes.push(Self::auto_inc_key(table));
        self.store.apply(&[], &deletes)
    }

    async fn insert(&self, _txn: &TxnContext, table: &str, rows: Vec<Row>) -> Result<u64> {
        let desc = self.descriptor(table)?;
        let mut auto_inc = self.load_auto_inc(table)?;

        let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for row in rows {
            let row = self.complete_row(&desc, row, &mut auto_inc)?;
            let pk = row.key_for(&desc.primary_key);
            let key = Self::row_key(table, &pk);
            if self.store.get(&key)?.is_some() {
                return Err(Error::Storage(format!(
                    "duplicate primary key in table '{table}'"
                )));
            }
            Self::index_mutations(&desc, &row, &pk, &mut puts);
            puts.push((key, Self::encode_row(&row)?));
        }
        let count = puts
            .iter()
            .filter(|(k, _)| !Self::is_index_key(table, k))
            .count() as u64;
        puts.push((Self::auto_inc_key(table), auto_inc.to_le_bytes().to_vec()));
        self.store.apply(&puts, &[])?;
        Ok(count)
    }

    async fn update(
        &self,
        _txn: &TxnContext,
        table: &str,
        assignments: &[(String, Value)],
        filter: Option<&Expr>,
    ) -> Result<u64> {
        let desc = self.descriptor(table)?;
        let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut deletes: Vec<Vec<u8>> = Vec::new();
        let mut count = 0u64;

        for (key, row) in self.load_rows(table)? {
            if let Some(f) = filter {
                if !rowset::eval_predicate(f, &row)? {
                    continue;
                }
            }
            let mut pairs: Vec<(String, Value)> = row
                .columns()
                .iter()
                .cloned()
                .zip(row.values().iter().cloned())
                .collect();
            for (col, value) in assignments {
                match pairs.iter_mut().find(|(c, _)| c == col) {
                    Some((_, slot)) => *slot = value.clone(),
                    None => return Err(Error::UnknownColumn(col.clone())),
                }
            }
            let new_row = Row::from_pairs(pairs);
            let old_pk = row.key_for(&desc.primary_key);
            let new_pk = new_row.key_for(&desc.primary_key);
            Self::index_removals(&desc, &row, &old_pk, &mut deletes);
            Self::index_mutations(&desc, &new_row, &new_pk, &mut puts);
            if new_pk != old_pk {
                deletes.push(key);
            }
            puts.push((Self::row_key(table, &new_pk), Self::encode_row(&new_row)?));
            count += 1;
        }
        self.store.apply(&puts, &deletes)?;
        Ok(count)
    }

    async fn delete(&self, _txn: &TxnContext, table: &str, filter: Option<&Expr>) -> Result<u64> {
        let desc = self.descriptor(table)?;
        let mut deletes: Vec<Vec<u8>> = Vec::new();
        let mut count = 0u64;
        for (key, row) in self.load_rows(table)? {
            if let Some(f) = filter {
                if !rowset::eval_predicate(f, &row)? {
                    continue;
                }
            }
            let pk = row.key_for(&desc.primary_key);
            Self::index_removals(&desc, &row, &pk, &mut deletes);
            deletes.push(key);
            count += 1;
        }
        self.store.apply(&[], &deletes)?;
        Ok(count)
    }

    async fn scan(&self, _txn: &TxnContext, table: &str, request: &ScanRequest) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        for (i, (_, row)) in self.load_rows(table)?.into_iter().enumerate() {
            if let Some((index, total)) = request.partition {
                if total > 1 && i % total != index {
                    continue;
                }
            }
            if let Some(f) = &request.filter {
                if !rowset::eval_predicate(f, &row)? {
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

    async fn index_lookup(
        &self,
        _txn: &TxnContext,
        table: &str,
        index: &str,
        key: &Value,
    ) -> Result<Vec<Row>> {
        let desc = self.descriptor(table)?;
        let _ = desc
            .indexes
            .iter()
            .find(|i| i.name == index)
            .ok_or_else(|| Error::Storage(format!("index '{index}' not found on '{table}'")))?;

        let mut value_key = Vec::new();
        key.encode_key(&mut value_key);
        let mut prefix = Self::index_prefix(table, index);
        prefix.extend_from_slice(&value_key);
        prefix.push(b':');

        let mut rows = Vec::new();
        for (entry_key, _) in self.store.prefix_scan(&prefix)? {
            let pk = &entry_key[prefix.len()..];
            if let Some(raw) = self.store.get(&Self::row_key(table, pk))? {
                rows.push(bincode::deserialize(&raw)?);
            }
        }
        Ok(rows)
    }

    async fn table_rows(&self, _txn: &TxnContext, table: &str) -> Result<u64> {
        Ok(self.load_rows(table)?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::BinOp;
    use crate::storage::engine::Isolation;
    use crate::storage::schema::{
        ColumnDescriptor, IndexDescriptor, IndexKind, PersistencePolicy, SemanticType, TableEngine,
    };

    fn txn() -> TxnContext {
        TxnContext {
            xid: 2,
            snapshot: 1,
            isolation: Isolation::Snapshot,
        }
    }

    fn products_desc() -> TableDescriptor {
        TableDescriptor {
            name: "products".into(),
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
                ColumnDescriptor::new("price", SemanticType::Float),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![IndexDescriptor {
                name: "idx_name".into(),
                columns: vec!["name".into()],
                unique: false,
                kind: IndexKind::Ordered,
            }],
            persistence: PersistencePolicy::Persistent {
                sync_on_write: false,
                cache_in_memory: false,
            },
            engine: TableEngine::Hybrid,
            fulltext: vec![],
        }
    }

    fn product(id: i64, name: &str, price: f64) -> Row {
        Row::from_pairs(vec![
            ("id".into(), Value::Int(id)),
            ("name".into(), Value::Str(name.into())),
            ("price".into(), Value::Float(price)),
        ])
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_upper_bound(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_upper_bound(b"\xff\xff"), None);
    }

    #[tokio::test]
    async fn test_insert_scan_round_trip() {
        let engine = KvEngine::open_in_memory().unwrap();
        engine.create_table(&products_desc()).await.unwrap();
        engine
            .insert(&txn(), "products", vec![product(1, "anvil", 9.5)])
            .await
            .unwrap();
        let rows = engine
            .scan(&txn(), "products", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("name"), Some(&Value::Str("anvil".into())));
        assert_eq!(rows[0].get("price"), Some(&Value::Float(9.5)));
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let engine = KvEngine::open(&path).unwrap();
            engine.create_table(&products_desc()).await.unwrap();
            engine
                .insert(&txn(), "products", vec![product(1, "anvil", 9.5)])
                .await
                .unwrap();
        }
        // Fresh handle over the same file: schema and rows are recovered.
        let engine = KvEngine::open(&path).unwrap();
        let tables = engine.stored_tables().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "products");
        let rows = engine
            .scan(&txn(), "products", &ScanRequest::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete_with_filter() {
        let engine = KvEngine::open_in_memory().unwrap();
        engine.create_table(&products_desc()).await.unwrap();
        engine
            .insert(
                &txn(),
                "products",
                vec![product(1, "anvil", 9.5), product(2, "rope", 3.0)],
            )
            .await
            .unwrap();

        let filter = Expr::binary(Expr::column("id"), BinOp::Eq, Expr::Literal(Value::Int(2)));
        let n = engine
            .update(
                &txn(),
                "products",
                &[("price".into(), Value::Float(4.0))],
                Some(&filter),
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        let rows = engine
            .scan(
                &txn(),
                "products",
                &ScanRequest {
                    filter: Some(filter.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get("price"), Some(&Value::Float(4.0)));

        let n = engine.delete(&txn(), "products", Some(&filter)).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(engine.table_rows(&txn(), "products").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_lookup() {
        let engine = KvEngine::open_in_memory().unwrap();
        engine.create_table(&products_desc()).await.unwrap();
        engine
            .insert(
                &txn(),
                "products",
                vec![product(1, "anvil", 9.5), product(2, "anvil", 12.0)],
            )
            .await
            .unwrap();
        let rows = engine
            .index_lookup(&txn(), "products", "idx_name", &Value::Str("anvil".into()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let rows = engine
            .index_lookup(&txn(), "products", "idx_name", &Value::Str("rope".into()))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_drop_table_clears_prefix() {
        let engine = KvEngine::open_in_memory().unwrap();
        engine.create_table(&products_desc()).await.unwrap();
        engine
            .insert(&txn(), "products", vec![product(1, "anvil", 9.5)])
            .await
            .unwrap();
        engine.drop_table("products").await.unwrap();
        assert!(!engine.has_table("products"));
        assert!(engine.stored_tables().unwrap().is_empty());
    }
}
