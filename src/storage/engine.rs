//! Storage engine seam
//!
//! Every backend (memory MVCC, persistent KV, remote HTTP tables) implements
//! the same object-safe trait; the router dispatches per table.

use async_trait::async_trait;

use crate::error::Result;
use crate::sql::ast::Expr;
use crate::storage::schema::TableDescriptor;
use crate::storage::value::{Row, Value};

/// Transaction context threaded through storage calls. Autocommit statements
/// run under a one-shot context created and committed by the caller.
#[derive(Debug, Clone, Copy)]
pub struct TxnContext {
    pub xid: u64,
    /// Highest committed XID visible to this transaction.
    pub snapshot: u64,
    pub isolation: Isolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadCommitted,
    Snapshot,
}

/// Scan parameters shared by all backends.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Columns to materialize; `None` means all.
    pub projection: Option<Vec<String>>,
    /// Pushed-down filter; backends may apply it partially as long as the
    /// returned superset is filtered again upstream.
    pub filter: Option<Expr>,
    /// `(index, total)` partition of the table for parallel scans.
    pub partition: Option<(usize, usize)>,
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_table(&self, desc: &TableDescriptor) -> Result<()>;

    async fn drop_table(&self, table: &str) -> Result<()>;

    async fn insert(&self, txn: &TxnContext, table: &str, rows: Vec<Row>) -> Result<u64>;

    async fn update(
        &self,
        txn: &TxnContext,
        table: &str,
        assignments: &[(String, Value)],
        filter: Option<&Expr>,
    ) -> Result<u64>;

    async fn delete(&self, txn: &TxnContext, table: &str, filter: Option<&Expr>) -> Result<u64>;

    async fn scan(&self, txn: &TxnContext, table: &str, request: &ScanRequest) -> Result<Vec<Row>>;

    /// Point/equality lookup through a secondary index. Backends without the
    /// index fall back to a filtered scan.
    async fn index_lookup(
        &self,
        txn: &TxnContext,
        table: &str,
        index: &str,
        key: &Value,
    ) -> Result<Vec<Row>>;

    /// Approximate row count for the statistics collector.
    async fn table_rows(&self, txn: &TxnContext, table: &str) -> Result<u64>;
}
