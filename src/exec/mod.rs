//! Executor runtime
//!
//! Pull-based operator tree: every operator exposes `open`, `next`, `close`.
//! Parents pull from children; scans pull from the storage router. Every
//! `next` call checkpoints the cancellation context.

pub mod operators;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::fts::FtsRegistry;
use crate::metrics::Metrics;
use crate::plan::logical::Schema;
use crate::plan::physical::PhysicalPlan;
use crate::storage::engine::TxnContext;
use crate::storage::router::Router;
use crate::storage::schema::Catalog;
use crate::storage::value::Row;

/// Everything an operator needs at runtime. Cancellation and deadline are
/// checkpointed on every pulled row.
#[derive(Clone)]
pub struct ExecContext {
    pub txn: TxnContext,
    pub database: String,
    pub router: Arc<Router>,
    pub fts: Arc<FtsRegistry>,
    pub catalog: Arc<Catalog>,
    pub metrics: Arc<Metrics>,
    pub cancel: Arc<AtomicBool>,
    pub deadline: Option<Instant>,
    /// Per-statement scan fan-out, already bounded by the worker-pool
    /// ceiling.
    pub parallelism: usize,
}

impl ExecContext {
    pub fn check(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}

/// Pull-based physical operator.
#[async_trait]
pub trait Operator: Send {
    fn schema(&self) -> &Schema;
    async fn open(&mut self, ctx: &ExecContext) -> Result<()>;
    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>>;
    async fn close(&mut self);
}

/// Build the operator tree for a physical plan.
pub fn build(plan: &PhysicalPlan) -> Box<dyn Operator> {
    use operators::aggregate::{HashAggregateOp, StreamAggregateOp};
    use operators::basic::{AppendOp, FilterOp, LimitOp, ProjectOp, SortOp};
    use operators::join::{HashJoinOp, NestedLoopJoinOp};
    use operators::scan::{FtsScanOp, IndexScanOp, SeqScanOp, ValuesOp};

    match plan {
        PhysicalPlan::SeqScan {
            table,
            projection,
            filter,
            schema,
            ..
        } => Box::new(SeqScanOp::new(
            table.clone(),
            projection.clone(),
            filter.clone(),
            schema.clone(),
        )),
        PhysicalPlan::IndexScan {
            table,
            index,
            key,
            residual,
            schema,
            ..
        } => Box::new(IndexScanOp::new(
            table.clone(),
            index.clone(),
            key.clone(),
            residual.clone(),
            schema.clone(),
        )),
        PhysicalPlan::FtsScan {
            table,
            query,
            residual,
            schema,
            ..
        } => Box::new(FtsScanOp::new(
            table.clone(),
            query.clone(),
            residual.clone(),
            schema.clone(),
        )),
        PhysicalPlan::Values { rows, schema } => {
            Box::new(ValuesOp::new(rows.clone(), schema.clone()))
        }
        PhysicalPlan::Filter {
            input, predicate, schema, ..
        } => Box::new(FilterOp::new(build(input), predicate.clone(), schema.clone())),
        PhysicalPlan::Project {
            input, items, schema, ..
        } => Box::new(ProjectOp::new(build(input), items.clone(), schema.clone())),
        PhysicalPlan::HashJoin {
            left,
            right,
            left_keys,
            right_keys,
            residual,
            kind,
            schema,
            ..
        } => Box::new(HashJoinOp::new(
            build(left),
            build(right),
            left_keys.clone(),
            right_keys.clone(),
            residual.clone(),
            *kind,
            schema.clone(),
        )),
        PhysicalPlan::NestedLoopJoin {
            left,
            right,
            on,
            kind,
            schema,
            ..
        } => Box::new(NestedLoopJoinOp::new(
            build(left),
            build(right),
            on.clone(),
            *kind,
            schema.clone(),
        )),
        PhysicalPlan::HashAggregate {
            input,
            group_by,
            aggregates,
            schema,
            ..
        } => Box::new(HashAggregateOp::new(
            build(input),
            group_by.clone(),
            aggregates.clone(),
            schema.clone(),
        )),
        PhysicalPlan::StreamAggregate {
            input,
            group_by,
            aggregates,
            schema,
            ..
        } => Box::new(StreamAggregateOp::new(
            build(input),
            group_by.clone(),
            aggregates.clone(),
            schema.clone(),
        )),
        PhysicalPlan::Sort {
            input, keys, schema, ..
        } => Box::new(SortOp::new(build(input), keys.clone(), schema.clone())),
        PhysicalPlan::Limit {
            input,
            limit,
            offset,
            schema,
            ..
        } => Box::new(LimitOp::new(build(input), *limit, *offset, schema.clone())),
        PhysicalPlan::Append {
            inputs, all, schema, ..
        } => Box::new(AppendOp::new(
            inputs.iter().map(build).collect(),
            *all,
            schema.clone(),
        )),
    }
}

/// Drive a plan to completion and collect every row. The operator tree is
/// released on both the success and the error path.
pub async fn collect(plan: &PhysicalPlan, ctx: &ExecContext) -> Result<Vec<Row>> {
    let mut op = build(plan);
    let result = drive(op.as_mut(), ctx).await;
    op.close().await;
    result
}

async fn drive(op: &mut dyn Operator, ctx: &ExecContext) -> Result<Vec<Row>> {
    op.open(ctx).await?;
    let mut rows = Vec::new();
    while let Some(row) = op.next(ctx).await? {
        rows.push(row);
    }
    Ok(rows)
}

/// Rebind a storage row onto an operator schema: values are looked up by
/// trailing column name, so bare storage names satisfy qualified schemas.
pub(crate) fn conform(row: &Row, names: &Arc<Vec<String>>) -> Row {
    let values = names
        .iter()
        .map(|n| {
            row.get(n)
                .cloned()
                .unwrap_or(crate::storage::value::Value::Null)
        })
        .collect();
    Row::new(Arc::clone(names), values)
}

pub(crate) fn schema_names(schema: &Schema) -> Arc<Vec<String>> {
    Arc::new(schema.iter().map(|c| c.name.clone()).collect())
}
