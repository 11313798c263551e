//! Aggregation operators
//!
//! Hash aggregation groups by encoded key values; stream aggregation relies
//! on sorted input and emits a group as soon as its key changes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::exec::{schema_names, ExecContext, Operator};
use crate::plan::logical::{AggExpr, AggFunc, Schema};
use crate::rowset;
use crate::sql::ast::Expr;
use crate::storage::value::{Row, Value};

/// Accumulator state for one aggregate in one group.
#[derive(Debug, Clone)]
enum Acc {
    Count(u64),
    Sum { sum: f64, seen: bool },
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl Acc {
    fn new(func: AggFunc) -> Self {
        match func {
            AggFunc::Count => Acc::Count(0),
            AggFunc::Sum => Acc::Sum {
                sum: 0.0,
                seen: false,
            },
            AggFunc::Avg => Acc::Avg { sum: 0.0, count: 0 },
            AggFunc::Min => Acc::Min(None),
            AggFunc::Max => Acc::Max(None),
        }
    }

    /// `value` is `None` for COUNT(*).
    fn update(&mut self, value: Option<&Value>) {
        match self {
            Acc::Count(n) => match value {
                None => *n += 1,
                Some(v) if !v.is_null() => *n += 1,
                Some(_) => {}
            },
            Acc::Sum { sum, seen } => {
                if let Some(f) = value.and_then(Value::as_f64) {
                    *sum += f;
                    *seen = true;
                }
            }
            Acc::Avg { sum, count } => {
                if let Some(f) = value.and_then(Value::as_f64) {
                    *sum += f;
                    *count += 1;
                }
            }
            Acc::Min(best) => {
                if let Some(v) = value.filter(|v| !v.is_null()) {
                    let replace = match best {
                        Some(b) => v.sql_cmp(b) == Some(std::cmp::Ordering::Less),
                        None => true,
                    };
                    if replace {
                        *best = Some(v.clone());
                    }
                }
            }
            Acc::Max(best) => {
                if let Some(v) = value.filter(|v| !v.is_null()) {
                    let replace = match best {
                        Some(b) => v.sql_cmp(b) == Some(std::cmp::Ordering::Greater),
                        None => true,
                    };
                    if replace {
                        *best = Some(v.clone());
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            Acc::Count(n) => Value::Int(n as i64),
            Acc::Sum { sum, seen } => {
                if seen {
                    Value::Float(sum)
                } else {
                    Value::Null
                }
            }
            Acc::Avg { sum, count } => {
                if count > 0 {
                    Value::Float(sum / count as f64)
                } else {
                    Value::Null
                }
            }
            Acc::Min(v) | Acc::Max(v) => v.unwrap_or(Value::Null),
        }
    }
}

struct GroupState {
    keys: Vec<Value>,
    accs: Vec<Acc>,
}

fn update_group(state: &mut GroupState, aggregates: &[AggExpr], row: &Row) -> Result<()> {
    for (acc, agg) in state.accs.iter_mut().zip(aggregates) {
        match &agg.arg {
            Some(expr) => {
                let v = rowset::eval_expr(expr, row)?;
                acc.update(Some(&v));
            }
            None => acc.update(None),
        }
    }
    Ok(())
}

fn finish_group(state: GroupState, names: &Arc<Vec<String>>) -> Row {
    let mut values = state.keys;
    values.extend(state.accs.into_iter().map(Acc::finish));
    Row::new(Arc::clone(names), values)
}

pub struct HashAggregateOp {
    input: Box<dyn Operator>,
    group_by: Vec<Expr>,
    aggregates: Vec<AggExpr>,
    schema: Schema,
    names: Arc<Vec<String>>,
    output: std::vec::IntoIter<Row>,
}

impl HashAggregateOp {
    pub fn new(
        input: Box<dyn Operator>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        schema: Schema,
    ) -> Self {
        let names = schema_names(&schema);
        Self {
            input,
            group_by,
            aggregates,
            schema,
            names,
            output: Vec::new().into_iter(),
        }
    }
}

#[async_trait]
impl Operator for HashAggregateOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.input.open(ctx).await?;
        let mut groups: HashMap<Vec<u8>, GroupState> = HashMap::new();
        let mut order: Vec<Vec<u8>> = Vec::new();

        while let Some(row) = self.input.next(ctx).await? {
            ctx.check()?;
            let mut key = Vec::new();
            let mut key_values = Vec::with_capacity(self.group_by.len());
            for g in &self.group_by {
                let v = rowset::eval_expr(g, &row)?;
                v.encode_key(&mut key);
                key_values.push(v);
            }
            let state = match groups.entry(key) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    order.push(e.key().clone());
                    e.insert(GroupState {
                        keys: key_values,
                        accs: self.aggregates.iter().map(|a| Acc::new(a.func)).collect(),
                    })
                }
            };
            update_group(state, &self.aggregates, &row)?;
        }

        // A global aggregate over zero rows still yields one group.
        if groups.is_empty() && self.group_by.is_empty() && !self.aggregates.is_empty() {
            order.push(Vec::new());
            groups.insert(
                Vec::new(),
                GroupState {
                    keys: Vec::new(),
                    accs: self.aggregates.iter().map(|a| Acc::new(a.func)).collect(),
                },
            );
        }

        let rows: Vec<Row> = order
            .into_iter()
            .filter_map(|k| groups.remove(&k))
            .map(|state| finish_group(state, &self.names))
            .collect();
        self.output = rows.into_iter();
        Ok(())
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        ctx.check()?;
        Ok(self.output.next())
    }

    async fn close(&mut self) {
        self.output = Vec::new().into_iter();
        self.input.close().await;
    }
}

/// Stream aggregation over input already sorted on the group-by columns.
pub struct StreamAggregateOp {
    input: Box<dyn Operator>,
    group_by: Vec<Expr>,
    aggregates: Vec<AggExpr>,
    schema: Schema,
    names: Arc<Vec<String>>,
    current: Option<(Vec<u8>, GroupState)>,
    input_done: bool,
    emitted_global: bool,
}

impl StreamAggregateOp {
    pub fn new(
        input: Box<dyn Operator>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        schema: Schema,
    ) -> Self {
        let names = schema_names(&schema);
        Self {
            input,
            group_by,
            aggregates,
            schema,
            names,
            current: None,
            input_done: false,
            emitted_global: false,
        }
    }
}

#[async_trait]
impl Operator for StreamAggregateOp {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&mut self, ctx: &ExecContext) -> Result<()> {
        self.current = None;
        self.input_done = false;
        self.emitted_global = false;
        self.input.open(ctx).await
    }

    async fn next(&mut self, ctx: &ExecContext) -> Result<Option<Row>> {
        loop {
            ctx.check()?;
            if self.input_done {
                if let Some((_, state)) = self.current.take() {
                    return Ok(Some(finish_group(state, &self.names)));
                }
                // Global aggregate over an empty input emits one row.
                if self.group_by.is_empty()
                    && !self.aggregates.is_empty()
                    && !self.emitted_global
                {
                    self.emitted_global = true;
                    let state = GroupState {
                        keys: Vec::new(),
                        accs: self.aggregates.iter().map(|a| Acc::new(a.func)).collect(),
                    };
                    return Ok(Some(finish_group(state, &self.names)));
                }
                return Ok(None);
            }

            match self.input.next(ctx).await? {
                Some(row) => {
                    let mut key = Vec::new();
                    let mut key_values = Vec::with_capacity(self.group_by.len());
                    for g in &self.group_by {
                        let v = rowset::eval_expr(g, &row)?;
                        v.encode_key(&mut key);
                        key_values.push(v);
                    }
                    match &mut self.current {
                        Some((current_key, state)) if *current_key == key => {
                            update_group(state, &self.aggregates, &row)?;
                        }
                        Some(_) => {
                            let (_, finished) = self.current.take().expect("checked above");
                            let mut state = GroupState {
                                keys: key_values,
                                accs: self
                                    .aggregates
                                    .iter()
                                    .map(|a| Acc::new(a.func))
                                    .collect(),
                            };
                            update_group(&mut state, &self.aggregates, &row)?;
                            self.current = Some((key, state));
                            self.emitted_global = true;
                            return Ok(Some(finish_group(finished, &self.names)));
                        }
                        None => {
                            let mut state = GroupState {
                                keys: key_values,
                                accs: self
                                    .aggregates
                                    .iter()
                                    .map(|a| Acc::new(a.func))
                                    .collect(),
                            };
                            update_group(&mut state, &self.aggregates, &row)?;
                            self.current = Some((key, state));
                            self.emitted_global = true;
                        }
                    }
                }
                None => self.input_done = true,
            }
        }
    }

    async fn close(&mut self) {
        self.current = None;
        self.input.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_ignores_null_with_arg() {
        let mut acc = Acc::new(AggFunc::Count);
        acc.update(Some(&Value::Int(1)));
        acc.update(Some(&Value::Null));
        acc.update(None); // COUNT(*) semantics
        assert_eq!(acc.finish(), Value::Int(2));
    }

    #[test]
    fn test_sum_avg_min_max() {
        let mut sum = Acc::new(AggFunc::Sum);
        let mut avg = Acc::new(AggFunc::Avg);
        let mut min = Acc::new(AggFunc::Min);
        let mut max = Acc::new(AggFunc::Max);
        for v in [Value::Int(3), Value::Int(1), Value::Null, Value::Int(2)] {
            sum.update(Some(&v));
            avg.update(Some(&v));
            min.update(Some(&v));
            max.update(Some(&v));
        }
        assert_eq!(sum.finish(), Value::Float(6.0));
        assert_eq!(avg.finish(), Value::Float(2.0));
        assert_eq!(min.finish(), Value::Int(1));
        assert_eq!(max.finish(), Value::Int(3));
    }

    #[test]
    fn test_empty_aggregates_are_null_except_count() {
        assert_eq!(Acc::new(AggFunc::Count).finish(), Value::Int(0));
        assert_eq!(Acc::new(AggFunc::Sum).finish(), Value::Null);
        assert_eq!(Acc::new(AggFunc::Avg).finish(), Value::Null);
        assert_eq!(Acc::new(AggFunc::Min).finish(), Value::Null);
    }
}
