//! Filter, project, sort, limit, append

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::{schema_names, ExecContext, Operator};
use crate::plan::logical::Schema;
use crate::rowset;
use crate::sql::ast::{Expr, OrderItem};
use crate::storage::value::Row;

pub struct FilterOp {
    input: Box<dyn Operator>,
    predicate: Expr,
    schema: Schema,
}

impl FilterOp {
    pub fn new(input: Box<dyn Operator>, predicate: Expr, schema: Schema) -> Self {
        Self {
            input,
            predicate,
            schema,
        }
    }
}

#[async_trait]
impl Operator for FilterOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.input.open(ctx).await
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            match self.input.next(ctx).await? {
                Some(row) => {
                    if rowset::eval_predicate(&self.predicate, &row)? {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.input.close().await;
    }
}

pub struct ProjectOp {
    input: Box<dyn Operator>,
    items: Vec<(Expr, String)>,
    schema: Schema,
    names: Arc<Vec<String>>,
}

impl ProjectOp {
    pub fn new(input: Box<dyn Operator>, items: Vec<(Expr, String)>, schema: Schema) -> Self {
        let names = schema_names(&schema);
        Self {
            input,
            items,
            schema,
            names,
        }
    }
}

#[async_trait]
impl Operator for ProjectOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.input.open(ctx).await
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        match self.input.next(ctx).await? {
            Some(row) => {
                let mut values = Vec::with_capacity(self.items.len());
                for (expr, _) in &self.items {
                    values.push(rowset::eval_expr(expr, &row)?);
                }
                Ok(Some(Row::new(Arc::clone(&self.names), values)))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.input.close().await;
    }
}

/// Materializing sort. When a parallel scan feeds it, this is the merge
/// stage that restores a deterministic order.
pub struct SortOp {
    input: Box<dyn Operator>,
    keys: Vec<OrderItem>,
    schema: Schema,
    sorted: std::vec::IntoIter<Row>,
}

impl SortOp {
    pub fn new(input: Box<dyn Operator>, keys: Vec<OrderItem>, schema: Schema) -> Self {
        Self {
            input,
            keys,
            schema,
            sorted: Vec::new().into_iter(),
        }
    }
}

#[async_trait]
impl Operator for SortOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.input.open(ctx).await?;
        let mut rows = Vec::new();
        while let Some(row) = self.input.next(ctx).await? {
            ctx.check()?;
            rows.push(row);
        }
        rowset::sort_rows(&mut rows, &self.keys)?;
        self.sorted = rows.into_iter();
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        Ok(self.sorted.next())
    }

    async fn close(&mut self) {
        self.sorted = Vec::new().into_iter();
        self.input.close().await;
    }
}

pub struct LimitOp {
    input: Box<dyn Operator>,
    limit: Option<u64>,
    offset: Option<u64>,
    schema: Schema,
    skipped: u64,
    taken: u64,
}

impl LimitOp {
    pub fn new(
        input: Box<dyn Operator>,
        limit: Option<u64>,
        offset: Option<u64>,
        schema: Schema,
    ) -> Self {
        Self {
            input,
            limit,
            offset,
            schema,
            skipped: 0,
            taken: 0,
        }
    }
}

#[async_trait]
impl Operator for LimitOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.skipped = 0;
        self.taken = 0;
        self.input.open(ctx).await
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            if let Some(limit) = self.limit {
                if self.taken >= limit {
                    return Ok(None);
                }
            }
            match self.input.next(ctx).await? {
                Some(row) => {
                    if self.skipped < self.offset.unwrap_or(0) {
                        self.skipped += 1;
                        continue;
                    }
                    self.taken += 1;
                    return Ok(Some(row));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.input.close().await;
    }
}

/// UNION: drain inputs in order; the distinct form deduplicates on the
/// encoded row value.
pub struct AppendOp {
    inputs: Vec<Box<dyn Operator>>,
    all: bool,
    schema: Schema,
    names: Arc<Vec<String>>,
    current: usize,
    seen: HashSet<Vec<u8>>,
}

impl AppendOp {
    pub fn new(inputs: Vec<Box<dyn Operator>>, all: bool, schema: Schema) -> Self {
        let names = schema_names(&schema);
        Self {
            inputs,
            all,
            schema,
            names,
            current: 0,
            seen: HashSet::new(),
        }
    }
}

#[async_trait]
impl Operator for AppendOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.current = 0;
        self.seen.clear();
        for input in &mut self.inputs {
            input.open(ctx).await?;
        }
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            let Some(input) = self.inputs.get_mut(self.current) else {
                return Ok(None);
            };
            match input.next(ctx).await? {
                Some(row) => {
                    // Branch column names may differ; rebind positionally.
                    let row = Row::new(Arc::clone(&self.names), row.into_values());
                    if !self.all {
                        let mut key = Vec::new();
                        for v in row.values() {
                            v.encode_key(&mut key);
                        }
                        if !self.seen.insert(key) {
                            continue;
                        }
                    }
                    return Ok(Some(row));
                }
                None => self.current += 1,
            }
        }
    }

    async fn close(&mut self) {
        for input in &mut self.inputs {
            input.close().await;
        }
    }
}
