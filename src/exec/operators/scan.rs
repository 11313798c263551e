//! Scan operators
//!
//! Sequential scans fan out to parallel worker tasks over table partitions
//! when the statement's parallelism allows, producing an unordered
//! interleaved stream through a fan-in channel. Cancellation is checked per
//! batch of rows.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::exec::{conform, schema_names, ExecContext, Operator};
use crate::plan::logical::Schema;
use crate::rowset;
use crate::sql::ast::Expr;
use crate::storage::engine::{ScanRequest, StorageEngine};
use crate::storage::value::{Row, Value};

const BATCH_SIZE: usize = 256;

/// Sequential scan, optionally parallel over table partitions.
pub struct SeqScanOp {
    table: String,
    projection: Option<Vec<String>>,
    filter: Option<Expr>,
    schema: Schema,
    names: Arc<Vec<String>>,
    state: ScanState,
}

enum ScanState {
    Closed,
    Buffered(std::vec::IntoIter<Row>),
    Streaming {
        rx: ReceiverStream<Result<Vec<Row>>>,
        pending: std::vec::IntoIter<Row>,
    },
}

impl SeqScanOp {
    pub fn new(
        table: String,
        projection: Option<Vec<String>>,
        filter: Option<Expr>,
        schema: Schema,
    ) -> Self {
        let names = schema_names(&schema);
        Self {
            table,
            projection,
            filter,
            schema,
            names,
            state: ScanState::Closed,
        }
    }

    fn request(&self, partition: Option<(usize, usize)>) -> ScanRequest {
        ScanRequest {
            // Storage sees unqualified column names.
            projection: self.projection.as_ref().map(|cols| {
                cols.iter()
                    .map(|c| c.rsplit('.').next().unwrap_or(c).to_string())
                    .collect()
            }),
            filter: self.filter.clone(),
            partition,
        }
    }
}

#[async_trait]
impl Operator for SeqScanOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        ctx.check()?;
        let workers = ctx.parallelism.max(1);
        if workers <= 1 {
            let rows = ctx
                .router
                .scan(&ctx.txn, &self.table, &self.request(None))
                .await?;
            self.state = ScanState::Buffered(rows.into_iter());
            return Ok(());
        }

        // Fan out one task per partition; results interleave unordered.
        let (tx, rx) = mpsc::channel::<Result<Vec<Row>>>(workers * 2);
        for partition in 0..workers {
            let tx = tx.clone();
            let router = Arc::clone(&ctx.router);
            let cancel = Arc::clone(&ctx.cancel);
            let txn = ctx.txn;
            let table = self.table.clone();
            let request = self.request(Some((partition, workers)));
            tokio::spawn(async move {
                let result = router.scan(&txn, &table, &request).await;
                match result {
                    Ok(rows) => {
                        for batch in rows.chunks(BATCH_SIZE) {
                            if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                                let _ = tx.send(Err(Error::Cancelled)).await;
                                return;
                            }
                            if tx.send(Ok(batch.to_vec())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                    }
                }
            });
        }
        self.state = ScanState::Streaming {
            rx: ReceiverStream::new(rx),
            pending: Vec::new().into_iter(),
        };
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        loop {
            match &mut self.state {
                ScanState::Closed => return Ok(None),
                ScanState::Buffered(iter) => {
                    return Ok(iter.next().map(|r| conform(&r, &self.names)));
                }
                ScanState::Streaming { rx, pending } => {
                    if let Some(row) = pending.next() {
                        return Ok(Some(conform(&row, &self.names)));
                    }
                    match rx.next().await {
                        Some(Ok(batch)) => *pending = batch.into_iter(),
                        Some(Err(e)) => return Err(e),
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.state = ScanState::Closed;
    }
}

/// Equality lookup through a secondary index, with a residual filter.
pub struct IndexScanOp {
    table: String,
    index: String,
    key: Expr,
    residual: Option<Expr>,
    schema: Schema,
    names: Arc<Vec<String>>,
    rows: std::vec::IntoIter<Row>,
}

impl IndexScanOp {
    pub fn new(
        table: String,
        index: String,
        key: Expr,
        residual: Option<Expr>,
        schema: Schema,
    ) -> Self {
        let names = schema_names(&schema);
        Self {
            table,
            index,
            key,
            residual,
            schema,
            names,
            rows: Vec::new().into_iter(),
        }
    }
}

#[async_trait]
impl Operator for IndexScanOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        ctx.check()?;
        let key = match &self.key {
            Expr::Literal(v) => v.clone(),
            other => rowset::eval_expr(other, &Row::from_pairs(vec![]))?,
        };
        let mut rows = ctx
            .router
            .index_lookup(&ctx.txn, &self.table, &self.index, &key)
            .await?;
        if let Some(residual) = &self.residual {
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows {
                if rowset::eval_predicate(residual, &row)? {
                    kept.push(row);
                }
            }
            rows = kept;
        }
        self.rows = rows.into_iter();
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        Ok(self.rows.next().map(|r| conform(&r, &self.names)))
    }

    async fn close(&mut self) {
        self.rows = Vec::new().into_iter();
    }
}

/// Full-text retrieval: ranked doc ids from the FTS registry, then row
/// fetch in relevance order.
pub struct FtsScanOp {
    table: String,
    query: String,
    residual: Option<Expr>,
    schema: Schema,
    names: Arc<Vec<String>>,
    rows: std::vec::IntoIter<Row>,
}

impl FtsScanOp {
    pub fn new(table: String, query: String, residual: Option<Expr>, schema: Schema) -> Self {
        let names = schema_names(&schema);
        Self {
            table,
            query,
            residual,
            schema,
            names,
            rows: Vec::new().into_iter(),
        }
    }
}

#[async_trait]
impl Operator for FtsScanOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        ctx.check()?;
        ctx.metrics
            .fts_searches
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let ranked = ctx.fts.search(&self.table, &self.query)?;

        let desc = ctx.catalog.table(&ctx.database, &self.table)?;
        let pk_column = desc
            .primary_key
            .first()
            .ok_or_else(|| Error::Unsupported("FULLTEXT requires a primary key".into()))?
            .clone();

        let all = ctx
            .router
            .scan(&ctx.txn, &self.table, &ScanRequest::default())
            .await?;
        let mut by_id: std::collections::HashMap<u64, Row> = std::collections::HashMap::new();
        for row in all {
            if let Ok(id) = crate::fts::doc_id_from_row(&row, &pk_column) {
                by_id.insert(id, row);
            }
        }

        let mut rows = Vec::with_capacity(ranked.len());
        for (doc_id, score) in ranked {
            let Some(row) = by_id.remove(&doc_id) else {
                continue;
            };
            if let Some(residual) = &self.residual {
                if !rowset::eval_predicate(residual, &row)? {
                    continue;
                }
            }
            // Relevance is observable through output order; the score itself
            // is not projected.
            let _ = score;
            rows.push(row);
        }
        self.rows = rows.into_iter();
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        Ok(self.rows.next().map(|r| conform(&r, &self.names)))
    }

    async fn close(&mut self) {
        self.rows = Vec::new().into_iter();
    }
}

/// Literal rows; SELECT without FROM.
pub struct ValuesOp {
    rows: Vec<Vec<Expr>>,
    schema: Schema,
    names: Arc<Vec<String>>,
    cursor: usize,
}

impl ValuesOp {
    pub fn new(rows: Vec<Vec<Expr>>, schema: Schema) -> Self {
        let names = schema_names(&schema);
        Self {
            rows,
            schema,
            names,
            cursor: 0,
        }
    }
}

#[async_trait]
impl Operator for ValuesOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        ctx.check()?;
        self.cursor = 0;
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        let Some(exprs) = self.rows.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let empty = Row::from_pairs(vec![]);
        let mut values = Vec::with_capacity(exprs.len());
        for e in exprs {
            values.push(match e {
                Expr::Literal(v) => v.clone(),
                other => rowset::eval_expr(other, &empty).unwrap_or(Value::Null),
            });
        }
        Ok(Some(Row::new(Arc::clone(&self.names), values)))
    }

    async fn close(&mut self) {}
}
