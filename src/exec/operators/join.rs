//! Join operators
//!
//! Hash join builds on the left input and probes with the right, matching
//! the cost model's `left × build + right × probe` shape. The nested-loop
//! join materializes its right side once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::{schema_names, ExecContext, Operator};
use crate::plan::logical::Schema;
use crate::rowset;
use crate::sql::ast::{Expr, JoinKind};
use crate::storage::value::{Row, Value};

fn key_of(exprs: &[Expr], row: &Row) -> Result<Option<Vec<u8>>> {
    let mut key = Vec::new();
    for e in exprs {
        let v = rowset::eval_expr(e, row)?;
        if v.is_null() {
            // NULL keys never join.
            return Ok(None);
        }
        v.encode_key(&mut key);
    }
    Ok(Some(key))
}

fn concat(names: &Arc<Vec<String>>, left: &Row, right: Option<&Row>, right_width: usize) -> Row {
    let mut values = left.values().to_vec();
    match right {
        Some(r) => values.extend(r.values().iter().cloned()),
        None => values.extend(std::iter::repeat(Value::Null).take(right_width)),
    }
    Row::new(Arc::clone(names), values)
}

pub struct HashJoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    residual: Option<Expr>,
    kind: JoinKind,
    schema: Schema,
    names: Arc<Vec<String>>,
    // Build state
    build: HashMap<Vec<u8>, Vec<usize>>,
    build_rows: Vec<Row>,
    matched: Vec<bool>,
    right_width: usize,
    pending: std::vec::IntoIter<Row>,
    probing_done: bool,
    flush: std::vec::IntoIter<Row>,
}

impl HashJoinOp {
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Option<Expr>,
        kind: JoinKind,
        schema: Schema,
    ) -> Self {
        let names = schema_names(&schema);
        Self {
            left,
            right,
            left_keys,
            right_keys,
            residual,
            kind,
            schema,
            names,
            build: HashMap::new(),
            build_rows: Vec::new(),
            matched: Vec::new(),
            right_width: 0,
            pending: Vec::new().into_iter(),
            probing_done: false,
            flush: Vec::new().into_iter(),
        }
    }

    fn row_passes_residual(&self, row: &Row) -> Result<bool> {
        match &self.residual {
            Some(r) => rowset::eval_predicate(r, row),
            None => Ok(true),
        }
    }
}

#[async_trait]
impl Operator for HashJoinOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.left.open(ctx).await?;
        self.right.open(ctx).await?;
        self.right_width = self.right.schema().len();

        while let Some(row) = self.left.next(ctx).await? {
            ctx.check()?;
            if let Some(key) = key_of(&self.left_keys, &row)? {
                let idx = self.build_rows.len();
                self.build.entry(key).or_default().push(idx);
                self.build_rows.push(row);
                self.matched.push(false);
            } else if self.kind == JoinKind::Left {
                // Left rows with NULL keys still appear, unmatched.
                let idx = self.build_rows.len();
                self.build_rows.push(row);
                self.matched.push(false);
            }
        }
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            if let Some(row) = self.pending.next() {
                return Ok(Some(row));
            }
            if self.probing_done {
                return Ok(self.flush.next());
            }
            match self.right.next(ctx).await? {
                Some(right_row) => {
                    let Some(key) = key_of(&self.right_keys, &right_row)? else {
                        continue;
                    };
                    let Some(indices) = self.build.get(&key) else {
                        continue;
                    };
                    let mut out = Vec::new();
                    for &idx in indices {
                        let left_row = &self.build_rows[idx];
                        match self.kind {
                            JoinKind::Semi => {
                                if !self.matched[idx] {
                                    self.matched[idx] = true;
                                    out.push(left_row.clone());
                                }
                            }
                            _ => {
                                let joined = concat(
                                    &self.names,
                                    left_row,
                                    Some(&right_row),
                                    self.right_width,
                                );
                                if self.row_passes_residual(&joined)? {
                                    self.matched[idx] = true;
                                    out.push(joined);
                                }
                            }
                        }
                    }
                    self.pending = out.into_iter();
                }
                None => {
                    self.probing_done = true;
                    if self.kind == JoinKind::Left {
                        let unmatched: Vec<Row> = self
                            .build_rows
                            .iter()
                            .zip(self.matched.iter())
                            .filter(|(_, m)| !**m)
                            .map(|(row, _)| concat(&self.names, row, None, self.right_width))
                            .collect();
                        self.flush = unmatched.into_iter();
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.build.clear();
        self.build_rows.clear();
        self.left.close().await;
        self.right.close().await;
    }
}

pub struct NestedLoopJoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    on: Option<Expr>,
    kind: JoinKind,
    schema: Schema,
    names: Arc<Vec<String>>,
    right_rows: Vec<Row>,
    right_matched: Vec<bool>,
    right_width: usize,
    current_left: Option<Row>,
    right_cursor: usize,
    left_matched: bool,
    left_done: bool,
    flush: std::vec::IntoIter<Row>,
}

impl NestedLoopJoinOp {
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        on: Option<Expr>,
        kind: JoinKind,
        schema: Schema,
    ) -> Self {
        let names = schema_names(&schema);
        Self {
            left,
            right,
            on,
            kind,
            schema,
            names,
            right_rows: Vec::new(),
            right_matched: Vec::new(),
            right_width: 0,
            current_left: None,
            right_cursor: 0,
            left_matched: false,
            left_done: false,
            flush: Vec::new().into_iter(),
        }
    }
}

#[async_trait]
impl Operator for NestedLoopJoinOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.left.open(ctx).await?;
        self.right.open(ctx).await?;
        self.right_width = self.right.schema().len();
        while let Some(row) = self.right.next(ctx).await? {
            ctx.check()?;
            self.right_rows.push(row);
        }
        self.right_matched = vec![false; self.right_rows.len()];
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            if let Some(row) = self.flush.next() {
                return Ok(Some(row));
            }
            if self.left_done {
                return Ok(None);
            }

            if self.current_left.is_none() {
                match self.left.next(ctx).await? {
                    Some(row) => {
                        self.current_left = Some(row);
                        self.right_cursor = 0;
                        self.left_matched = false;
                    }
                    None => {
                        self.left_done = true;
                        if self.kind == JoinKind::Right {
                            // Unmatched right rows pad the left side with NULLs.
                            let left_width = self.left.schema().len();
                            let unmatched: Vec<Row> = self
                                .right_rows
                                .iter()
                                .zip(self.right_matched.iter())
                                .filter(|(_, m)| !**m)
                                .map(|(r, _)| {
                                    let mut values =
                                        vec![Value::Null; left_width];
                                    values.extend(r.values().iter().cloned());
                                    Row::new(Arc::clone(&self.names), values)
                                })
                                .collect();
                            self.flush = unmatched.into_iter();
                        }
                        continue;
                    }
                }
            }

            let left_row = self.current_left.clone().expect("set above");
            while self.right_cursor < self.right_rows.len() {
                let idx = self.right_cursor;
                self.right_cursor += 1;
                let right_row = &self.right_rows[idx];
                let joined = concat(&self.names, &left_row, Some(right_row), self.right_width);
                let passes = match &self.on {
                    Some(on) => rowset::eval_predicate(on, &joined)?,
                    None => true,
                };
                if !passes {
                    continue;
                }
                self.left_matched = true;
                self.right_matched[idx] = true;
                match self.kind {
                    JoinKind::Semi => {
                        self.current_left = None;
                        return Ok(Some(left_row));
                    }
                    _ => return Ok(Some(joined)),
                }
            }

            // Left row exhausted the right side.
            let was_matched = self.left_matched;
            self.current_left = None;
            if self.kind == JoinKind::Left && !was_matched {
                return Ok(Some(concat(&self.names, &left_row, None, self.right_width)));
            }
        }
    }

    async fn close(&mut self) {
        self.right_rows.clear();
        self.left.close().await;
        self.right.close().await;
    }
}
