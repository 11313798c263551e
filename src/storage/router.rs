//! Hybrid storage router
//!
//! Per-table persistence policies decide whether an operation lands on the
//! memory MVCC engine, the persistent KV backend, or both. DDL is routed
//! exactly like writes. Dual-write goes memory first; a persistent-side
//! failure after memory success is retried once, then recorded as a repair
//! marker while the memory state stays consistent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::sql::ast::Expr;
use crate::storage::engine::{ScanRequest, StorageEngine, TxnContext};
use crate::storage::kv::KvEngine;
use crate::storage::memory::MemoryEngine;
use crate::storage::schema::{PersistencePolicy, TableDescriptor};
use crate::storage::value::{Row, Value};

/// Operation classes for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Ddl,
}

/// Routing verdict for `(table, op)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Memory,
    Persistent,
    Both,
}

/// Per-table persistence policies, settable before the table exists.
#[derive(Default)]
pub struct TableConfigManager {
    policies: RwLock<HashMap<String, PersistencePolicy>>,
}

impl TableConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route future writes for `table` to the persistent backend.
    pub fn enable_persistence(&self, table: &str, sync_on_write: bool, cache_in_memory: bool) {
        self.policies.write().unwrap().insert(
            table.to_string(),
            PersistencePolicy::Persistent {
                sync_on_write,
                cache_in_memory,
            },
        );
    }

    pub fn disable_persistence(&self, table: &str) {
        self.policies
            .write()
            .unwrap()
            .insert(table.to_string(), PersistencePolicy::MemoryOnly);
    }

    pub fn policy(&self, table: &str) -> PersistencePolicy {
        self.policies
            .read()
            .unwrap()
            .get(table)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_policy(&self, table: &str, policy: PersistencePolicy) {
        self.policies
            .write()
            .unwrap()
            .insert(table.to_string(), policy);
    }
}

/// Divergence record left behind when the persistent side of a dual write
/// could not be repaired.
#[derive(Debug, Clone)]
pub struct RepairMarker {
    pub table: String,
    pub operation: &'static str,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Routes table operations to backends according to policy. Remote tables
/// registered from data-source plugins bypass the policy and go straight to
/// their external engine.
pub struct Router {
    pub memory: Arc<MemoryEngine>,
    persistent: Option<Arc<KvEngine>>,
    pub config: Arc<TableConfigManager>,
    external: RwLock<HashMap<String, Arc<dyn StorageEngine>>>,
    migrating: Mutex<HashSet<String>>,
    repair_markers: Mutex<Vec<RepairMarker>>,
}

impl Router {
    pub fn new(
        memory: Arc<MemoryEngine>,
        persistent: Option<Arc<KvEngine>>,
        config: Arc<TableConfigManager>,
    ) -> Self {
        Self {
            memory,
            persistent,
            config,
            external: RwLock::new(HashMap::new()),
            migrating: Mutex::new(HashSet::new()),
            repair_markers: Mutex::new(Vec::new()),
        }
    }

    pub fn has_persistent_backend(&self) -> bool {
        self.persistent.is_some()
    }

    /// Bind a table to an external engine (HTTP data source).
    pub fn register_external(&self, table: &str, engine: Arc<dyn StorageEngine>) {
        self.external
            .write()
            .unwrap()
            .insert(table.to_string(), engine);
    }

    pub fn unregister_external(&self, table: &str) {
        self.external.write().unwrap().remove(table);
    }

    fn external_engine(&self, table: &str) -> Option<Arc<dyn StorageEngine>> {
        self.external.read().unwrap().get(table).cloned()
    }

    /// Routing decision for `(table, op)`.
    pub fn route(&self, table: &str, op: OpKind) -> RouteTarget {
        let policy = self.config.policy(table);
        if !policy.is_persistent() || self.persistent.is_none() {
            return RouteTarget::Memory;
        }
        match op {
            OpKind::Read => {
                if policy.dual_write() {
                    RouteTarget::Memory
                } else {
                    RouteTarget::Persistent
                }
            }
            OpKind::Write | OpKind::Ddl => {
                if policy.dual_write() {
                    RouteTarget::Both
                } else {
                    RouteTarget::Persistent
                }
            }
        }
    }

    fn persistent_engine(&self) -> Result<&Arc<KvEngine>> {
        self.persistent
            .as_ref()
            .ok_or_else(|| Error::Storage("no persistent backend configured".into()))
    }

    fn check_migrating(&self, table: &str) -> Result<()> {
        if self.migrating.lock().unwrap().contains(table) {
            return Err(Error::Migrating(table.to_string()));
        }
        Ok(())
    }

    pub fn repair_markers(&self) -> Vec<RepairMarker> {
        self.repair_markers.lock().unwrap().clone()
    }

    fn record_repair(&self, table: &str, operation: &'static str, error: &Error) {
        tracing::warn!(table, operation, %error, "Persistent side of dual write diverged");
        self.repair_markers.lock().unwrap().push(RepairMarker {
            table: table.to_string(),
            operation,
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    /// Run the persistent half of a dual write: one retry, then record the
    /// divergence and surface the error. Memory state is already committed
    /// and stays authoritative.
    async fn dual_write_persistent<F, Fut>(
        &self,
        table: &str,
        operation: &'static str,
        f: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        match f().await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::debug!(table, %first, "Dual write persistent side failed, retrying once");
                match f().await {
                    Ok(()) => Ok(()),
                    Err(second) => {
                        self.record_repair(table, operation, &second);
                        Err(second)
                    }
                }
            }
        }
    }

    fn maybe_sync(&self, table: &str) {
        if let PersistencePolicy::Persistent {
            sync_on_write: true,
            ..
        } = self.config.policy(table)
        {
            if let Some(kv) = &self.persistent {
                if let Err(e) = kv.flush() {
                    tracing::warn!(table, %e, "sync-on-write flush failed");
                }
            }
        }
    }

    /// Move an existing memory table to the persistent backend, copying its
    /// visible rows under the migrating flag: concurrent writers observe a
    /// migrating error until the copy finishes. The descriptor comes from
    /// the catalog, which stays authoritative for schemas.
    pub async fn migrate_to_persistent(
        &self,
        txn: &TxnContext,
        desc: &TableDescriptor,
    ) -> Result<()> {
        let table = desc.name.as_str();
        let kv = Arc::clone(self.persistent_engine()?);
        if !self.memory.has_table(table) {
            return Err(Error::TableNotFound(table.to_string()));
        }
        self.migrating.lock().unwrap().insert(table.to_string());
        let result = async {
            let rows = self.memory.snapshot_rows(txn, table)?;
            let mut desc = desc.clone();
            desc.persistence = self.config.policy(table);
            if !kv.has_table(table) {
                kv.create_table(&desc).await?;
            }
            if !rows.is_empty() {
                kv.insert(txn, table, rows).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        self.migrating.lock().unwrap().remove(table);
        result?;

        if !self.config.policy(table).dual_write() {
            self.memory.drop_table(table).await?;
        }
        tracing::info!(table, "Migrated table to persistent backend");
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for Router {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn create_table(&self, desc: &TableDescriptor) -> Result<()> {
        let mut desc = desc.clone();
        desc.persistence = self.config.policy(&desc.name);
        match self.route(&desc.name, OpKind::Ddl) {
            RouteTarget::Memory => self.memory.create_table(&desc).await,
            RouteTarget::Persistent => self.persistent_engine()?.create_table(&desc).await,
            RouteTarget::Both => {
                self.memory.create_table(&desc).await?;
                let kv = Arc::clone(self.persistent_engine()?);
                let result = self
                    .dual_write_persistent(&desc.name, "create_table", || {
                        let kv = Arc::clone(&kv);
                        let desc = desc.clone();
                        async move { kv.create_table(&desc).await }
                    })
                    .await;
                result
            }
        }
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.check_migrating(table)?;
        match self.route(table, OpKind::Ddl) {
            RouteTarget::Memory => self.memory.drop_table(table).await,
            RouteTarget::Persistent => self.persistent_engine()?.drop_table(table).await,
            RouteTarget::Both => {
                self.memory.drop_table(table).await?;
                let kv = Arc::clone(self.persistent_engine()?);
                self.dual_write_persistent(table, "drop_table", || {
                    let kv = Arc::clone(&kv);
                    let table = table.to_string();
                    async move { kv.drop_table(&table).await }
                })
                .await
            }
        }
    }

    async fn insert(&self, txn: &TxnContext, table: &str, rows: Vec<Row>) -> Result<u64> {
        if let Some(engine) = self.external_engine(table) {
            return engine.insert(txn, table, rows).await;
        }
        self.check_migrating(table)?;
        let result = match self.route(table, OpKind::Write) {
            RouteTarget::Memory => self.memory.insert(txn, table, rows).await,
            RouteTarget::Persistent => self.persistent_engine()?.insert(txn, table, rows).await,
            RouteTarget::Both => {
                let count = self.memory.insert(txn, table, rows.clone()).await?;
                let kv = Arc::clone(self.persistent_engine()?);
                self.dual_write_persistent(table, "insert", || {
                    let kv = Arc::clone(&kv);
                    let rows = rows.clone();
                    let txn = *txn;
                    let table = table.to_string();
                    async move { kv.insert(&txn, &table, rows).await.map(|_| ()) }
                })
                .await?;
                Ok(count)
            }
        };
        if result.is_ok() {
            self.maybe_sync(table);
        }
        result
    }

    async fn update(
        &self,
        txn: &TxnContext,
        table: &str,
        assignments: &[(String, Value)],
        filter: Option<&Expr>,
    ) -> Result<u64> {
        if let Some(engine) = self.external_engine(table) {
            return engine.update(txn, table, assignments, filter).await;
        }
        self.check_migrating(table)?;
        let result = match self.route(table, OpKind::Write) {
            RouteTarget::Memory => self.memory.update(txn, table, assignments, filter).await,
            RouteTarget::Persistent => {
                self.persistent_engine()?
                    .update(txn, table, assignments, filter)
                    .await
            }
            RouteTarget::Both => {
                let count = self.memory.update(txn, table, assignments, filter).await?;
                let kv = Arc::clone(self.persistent_engine()?);
                let assignments = assignments.to_vec();
                let filter = filter.cloned();
                self.dual_write_persistent(table, "update", || {
                    let kv = Arc::clone(&kv);
                    let assignments = assignments.clone();
                    let filter = filter.clone();
                    let txn = *txn;
                    let table = table.to_string();
                    async move {
                        kv.update(&txn, &table, &assignments, filter.as_ref())
                            .await
                            .map(|_| ())
                    }
                })
                .await?;
                Ok(count)
            }
        };
        if result.is_ok() {
            self.maybe_sync(table);
        }
        result
    }

    async fn delete(&self, txn: &TxnContext, table: &str, filter: Option<&Expr>) -> Result<u64> {
        if let Some(engine) = self.external_engine(table) {
            return engine.delete(txn, table, filter).await;
        }
        self.check_migrating(table)?;
        let result = match self.route(table, OpKind::Write) {
            RouteTarget::Memory => self.memory.delete(txn, table, filter).await,
            RouteTarget::Persistent => self.persistent_engine()?.delete(txn, table, filter).await,
            RouteTarget::Both => {
                let count = self.memory.delete(txn, table, filter).await?;
                let kv = Arc::clone(self.persistent_engine()?);
                let filter = filter.cloned();
                self.dual_write_persistent(table, "delete", || {
                    let kv = Arc::clone(&kv);
                    let filter = filter.clone();
                    let txn = *txn;
                    let table = table.to_string();
                    async move { kv.delete(&txn, &table, filter.as_ref()).await.map(|_| ()) }
                })
                .await?;
                Ok(count)
            }
        };
        if result.is_ok() {
            self.maybe_sync(table);
        }
        result
    }

    async fn scan(&self, txn: &TxnContext, table: &str, request: &ScanRequest) -> Result<Vec<Row>> {
        if let Some(engine) = self.external_engine(table) {
            return engine.scan(txn, table, request).await;
        }
        match self.route(table, OpKind::Read) {
            RouteTarget::Memory | RouteTarget::Both => self.memory.scan(txn, table, request).await,
            RouteTarget::Persistent => self.persistent_engine()?.scan(txn, table, request).await,
        }
    }

    async fn index_lookup(
        &self,
        txn: &TxnContext,
        table: &str,
        index: &str,
        key: &Value,
    ) -> Result<Vec<Row>> {
        if let Some(engine) = self.external_engine(table) {
            return engine.index_lookup(txn, table, index, key).await;
        }
        match self.route(table, OpKind::Read) {
            RouteTarget::Memory | RouteTarget::Both => {
                self.memory.index_lookup(txn, table, index, key).await
            }
            RouteTarget::Persistent => {
                self.persistent_engine()?
                    .index_lookup(txn, table, index, key)
                    .await
            }
        }
    }

    async fn table_rows(&self, txn: &TxnContext, table: &str) -> Result<u64> {
        if let Some(engine) = self.external_engine(table) {
            return engine.table_rows(txn, table).await;
        }
        match self.route(table, OpKind::Read) {
            RouteTarget::Memory | RouteTarget::Both => self.memory.table_rows(txn, table).await,
            RouteTarget::Persistent => self.persistent_engine()?.table_rows(txn, table).await,
        }
    }
}
