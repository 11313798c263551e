//! Cost-based optimizer
//!
//! Converts rewritten logical trees into physical trees: scan method
//! selection, hash vs nested-loop joins, DP join ordering for flattened
//! join sets, and hash vs stream aggregation. Statistics are injected at
//! construction; operators never reach back into the optimizer.

pub mod cost;
pub mod index_select;
pub mod join_reorder;
pub mod stats;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::plan::logical::{LogicalPlan, Schema};
use crate::plan::physical::PhysicalPlan;
use crate::sql::ast::{BinOp, Expr, JoinKind};
use crate::storage::schema::Catalog;

use cost::{CostModel, JoinAlgorithm};
use join_reorder::{JoinEdge, JoinRelation, JoinTree};
use stats::StatisticsCache;

pub struct Optimizer {
    pub cost: Arc<CostModel>,
    pub stats: Arc<StatisticsCache>,
    catalog: Arc<Catalog>,
    /// Equality predicates seen on unindexed columns, with accumulated
    /// benefit estimates; the index advisor's workload.
    workload: std::sync::Mutex<std::collections::HashMap<(String, String), f64>>,
}

impl Optimizer {
    pub fn new(cost: Arc<CostModel>, stats: Arc<StatisticsCache>, catalog: Arc<Catalog>) -> Self {
        Self {
            cost,
            stats,
            catalog,
            workload: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn record_index_opportunity(&self, table: &str, column: &str, benefit: f64) {
        if benefit <= 0.0 {
            return;
        }
        let mut workload = self.workload.lock().unwrap();
        *workload
            .entry((table.to_string(), column.to_string()))
            .or_insert(0.0) += benefit;
    }

    /// Run the genetic index selector over the recorded workload.
    pub fn advise_indexes(
        &self,
        constraints: &index_select::Constraints,
        cancel: &std::sync::atomic::AtomicBool,
    ) -> Vec<index_select::IndexCandidate> {
        let candidates: Vec<index_select::IndexCandidate> = {
            let workload = self.workload.lock().unwrap();
            workload
                .iter()
                .map(|((table, column), benefit)| index_select::IndexCandidate {
                    table: table.clone(),
                    columns: vec![column.clone()],
                    benefit: *benefit,
                })
                .collect()
        };
        let result = index_select::select_indexes(
            &candidates,
            constraints,
            &index_select::GaConfig::default(),
            cancel,
        );
        result
            .selected
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect()
    }

    pub fn optimize(&self, plan: LogicalPlan, database: &str) -> Result<PhysicalPlan> {
        match plan {
            LogicalPlan::Scan {
                table,
                binding,
                qualify,
                projection,
                filter,
                schema,
                est_rows,
            } => self.optimize_scan(
                table, binding, qualify, projection, filter, schema, est_rows, database,
            ),
            LogicalPlan::FtsScan {
                table,
                columns,
                query,
                residual,
                schema,
                est_rows,
            } => Ok(PhysicalPlan::FtsScan {
                cost: est_rows,
                table,
                columns,
                query,
                residual,
                schema,
                est_rows,
            }),
            LogicalPlan::Values { rows, schema } => Ok(PhysicalPlan::Values { rows, schema }),
            LogicalPlan::Filter {
                input,
                predicate,
                schema,
                est_rows,
            } => {
                let input = self.optimize(*input, database)?;
                let in_rows = input.est_rows();
                let selectivity = if in_rows > 0.0 {
                    (est_rows / in_rows).clamp(0.0, 1.0)
                } else {
                    stats::DEFAULT_SELECTIVITY
                };
                let cost = input.cost() + self.cost.filter_cost(in_rows, selectivity);
                Ok(PhysicalPlan::Filter {
                    input: Box::new(input),
                    predicate,
                    schema,
                    est_rows,
                    cost,
                })
            }
            LogicalPlan::Project {
                input,
                items,
                schema,
                est_rows,
            } => {
                let input = self.optimize(*input, database)?;
                let cost = input.cost() + input.est_rows() * self.cost.constants().cpu_factor;
                Ok(PhysicalPlan::Project {
                    input: Box::new(input),
                    items,
                    schema,
                    est_rows,
                    cost,
                })
            }
            LogicalPlan::Join {
                left,
                right,
                kind,
                on,
                schema,
                est_rows,
            } => {
                let left = self.optimize(*left, database)?;
                let right = self.optimize(*right, database)?;
                self.build_join(left, right, kind, on, schema, est_rows)
            }
            LogicalPlan::MultiJoin {
                inputs,
                predicates,
                schema,
                est_rows,
            } => self.optimize_multi_join(inputs, predicates, schema, est_rows, database),
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
                schema,
                est_rows,
            } => {
                let input = self.optimize(*input, database)?;
                let cost = input.cost() + self.cost.aggregate_cost(input.est_rows(), est_rows);
                // Stream aggregation is valid when the child already delivers
                // rows sorted on the group-by columns.
                let sorted = match &input {
                    PhysicalPlan::Sort { keys, .. } => {
                        group_by.len() <= keys.len()
                            && group_by.iter().zip(keys.iter()).all(|(g, k)| *g == k.expr)
                    }
                    _ => group_by.is_empty(),
                };
                if sorted {
                    Ok(PhysicalPlan::StreamAggregate {
                        input: Box::new(input),
                        group_by,
                        aggregates,
                        schema,
                        est_rows,
                        cost,
                    })
                } else {
                    Ok(PhysicalPlan::HashAggregate {
                        input: Box::new(input),
                        group_by,
                        aggregates,
                        schema,
                        est_rows,
                        cost,
                    })
                }
            }
            LogicalPlan::Sort {
                input,
                keys,
                schema,
                est_rows,
            } => {
                let input = self.optimize(*input, database)?;
                let cost = input.cost() + self.cost.sort_cost(input.est_rows());
                Ok(PhysicalPlan::Sort {
                    input: Box::new(input),
                    keys,
                    schema,
                    est_rows,
                    cost,
                })
            }
            LogicalPlan::Limit {
                input,
                limit,
                offset,
                schema,
                est_rows,
            } => {
                let input = self.optimize(*input, database)?;
                let cost = input.cost();
                Ok(PhysicalPlan::Limit {
                    input: Box::new(input),
                    limit,
                    offset,
                    schema,
                    est_rows,
                    cost,
                })
            }
            LogicalPlan::Union {
                inputs,
                all,
                schema,
                est_rows,
            } => {
                let inputs: Vec<PhysicalPlan> = inputs
                    .into_iter()
                    .map(|i| self.optimize(i, database))
                    .collect::<Result<_>>()?;
                let cost = inputs.iter().map(PhysicalPlan::cost).sum();
                Ok(PhysicalPlan::Append {
                    inputs,
                    all,
                    schema,
                    est_rows,
                    cost,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn optimize_scan(
        &self,
        table: String,
        binding: String,
        qualify: bool,
        projection: Option<Vec<String>>,
        filter: Option<Expr>,
        schema: Schema,
        est_rows: f64,
        database: &str,
    ) -> Result<PhysicalPlan> {
        let table_rows = self.stats.table_rows(&table);
        let seq_cost = self.cost.scan_cost(table_rows, false);

        // Look for an equality factor covered by a secondary index.
        if let (Some(filter), Ok(desc)) = (&filter, self.catalog.table(database, &table)) {
            let mut factors = Vec::new();
            filter.clone().split_conjunction(&mut factors);
            for (i, factor) in factors.iter().enumerate() {
                if let Expr::Binary { left, op, right } = factor {
                    if *op != BinOp::Eq {
                        continue;
                    }
                    let (column, key) = match (left.as_ref(), right.as_ref()) {
                        (Expr::Column { name, .. }, Expr::Literal(_)) => (name, right),
                        (Expr::Literal(_), Expr::Column { name, .. }) => (name, left),
                        _ => continue,
                    };
                    let unqualified = column.rsplit('.').next().unwrap_or(column);
                    let ndv = self.stats.column_ndv(&table, unqualified);
                    let index_rows = (table_rows / ndv).max(1.0);
                    let index_cost = self.cost.scan_cost(index_rows, true);
                    if desc.index_covering(unqualified).is_none() {
                        // No index yet: remember what one would have saved.
                        self.record_index_opportunity(
                            &table,
                            unqualified,
                            seq_cost - index_cost,
                        );
                    }
                    if let Some(index) = desc.index_covering(unqualified) {
                        if index_cost < seq_cost {
                            let mut residual = factors.clone();
                            residual.remove(i);
                            return Ok(PhysicalPlan::IndexScan {
                                table,
                                binding,
                                qualify,
                                index: index.name.clone(),
                                key: (**key).clone(),
                                residual: Expr::conjoin(residual),
                                schema,
                                est_rows: index_rows,
                                cost: index_cost,
                            });
                        }
                    }
                }
            }
        }

        Ok(PhysicalPlan::SeqScan {
            table,
            binding,
            qualify,
            projection,
            filter,
            schema,
            est_rows,
            cost: seq_cost,
        })
    }

    fn optimize_multi_join(
        &self,
        inputs: Vec<LogicalPlan>,
        predicates: Vec<Expr>,
        schema: Schema,
        est_rows: f64,
        database: &str,
    ) -> Result<PhysicalPlan> {
        let children: Vec<PhysicalPlan> = inputs
            .into_iter()
            .map(|i| self.optimize(i, database))
            .collect::<Result<_>>()?;

        let relations: Vec<JoinRelation> = children
            .iter()
            .map(|c| {
                let mut order = Vec::new();
                c.scan_order(&mut order);
                JoinRelation {
                    name: order.first().cloned().unwrap_or_else(|| "?".into()),
                    rows: c.est_rows(),
                }
            })
            .collect();

        let mut edges = Vec::new();
        for p in &predicates {
            if let Expr::Binary { left, op, right } = p {
                if *op == BinOp::Eq {
                    let l = side_of(left, &children);
                    let r = side_of(right, &children);
                    if let (Some(li), Some(ri)) = (l, r) {
                        if li != ri {
                            let sel = self.equi_selectivity(left, right, &children, li, ri);
                            edges.push(JoinEdge {
                                left: li,
                                right: ri,
                                selectivity: sel,
                            });
                        }
                    }
                }
            }
        }

        let result = join_reorder::reorder(&relations, &edges, &self.cost);
        let mut slots: Vec<Option<PhysicalPlan>> = children.into_iter().map(Some).collect();
        let mut used = vec![false; predicates.len()];
        let built = self.build_from_tree(&result.tree, &mut slots, &predicates, &mut used)?;

        // Any predicate not consumed by a join becomes a residual filter.
        let leftover: Vec<Expr> = predicates
            .into_iter()
            .zip(used)
            .filter_map(|(p, u)| (!u).then_some(p))
            .collect();
        let built = match Expr::conjoin(leftover) {
            Some(p) => {
                let cost = built.cost() + self.cost.filter_cost(built.est_rows(), 0.5);
                PhysicalPlan::Filter {
                    predicate: p,
                    schema: built.schema().clone(),
                    est_rows: est_rows.min(built.est_rows()),
                    cost,
                    input: Box::new(built),
                }
            }
            None => built,
        };

        // Column order downstream expects the original join schema; no
        // physical reorder is needed because rows resolve columns by name,
        // but the node's declared schema keeps the logical shape.
        Ok(reschema(built, schema))
    }

    fn equi_selectivity(
        &self,
        left: &Expr,
        right: &Expr,
        children: &[PhysicalPlan],
        li: usize,
        ri: usize,
    ) -> f64 {
        let ndv_of = |expr: &Expr, child: &PhysicalPlan| -> f64 {
            if let Expr::Column { name, .. } = expr {
                let mut tables = Vec::new();
                child.scan_order(&mut tables);
                if let Some(t) = tables.first() {
                    return self.stats.column_ndv(t, name);
                }
            }
            stats::DEFAULT_NDV
        };
        let ndv = ndv_of(left, &children[li]).max(ndv_of(right, &children[ri]));
        1.0 / ndv.max(1.0)
    }

    fn build_from_tree(
        &self,
        tree: &JoinTree,
        slots: &mut Vec<Option<PhysicalPlan>>,
        predicates: &[Expr],
        used: &mut [bool],
    ) -> Result<PhysicalPlan> {
        match tree {
            JoinTree::Leaf(i) => slots[*i]
                .take()
                .ok_or_else(|| Error::Internal("join input consumed twice".into())),
            JoinTree::Node {
                left,
                right,
                algorithm,
            } => {
                let left_plan = self.build_from_tree(left, slots, predicates, used)?;
                let right_plan = self.build_from_tree(right, slots, predicates, used)?;

                let mut left_keys = Vec::new();
                let mut right_keys = Vec::new();
                let mut residual = Vec::new();
                for (i, p) in predicates.iter().enumerate() {
                    if used[i] {
                        continue;
                    }
                    if let Expr::Binary { left: l, op, right: r } = p {
                        let l_in_left = expr_covered(l, &left_plan);
                        let l_in_right = expr_covered(l, &right_plan);
                        let r_in_left = expr_covered(r, &left_plan);
                        let r_in_right = expr_covered(r, &right_plan);
                        if *op == BinOp::Eq && l_in_left && r_in_right && !l_in_right && !r_in_left
                        {
                            left_keys.push((**l).clone());
                            right_keys.push((**r).clone());
                            used[i] = true;
                            continue;
                        }
                        if *op == BinOp::Eq && r_in_left && l_in_right && !r_in_right && !l_in_left
                        {
                            left_keys.push((**r).clone());
                            right_keys.push((**l).clone());
                            used[i] = true;
                            continue;
                        }
                    }
                    // Non-key predicate that crosses the two sides but is
                    // fully resolvable once they are joined.
                    let joint = {
                        let mut cols = Vec::new();
                        p.referenced_columns(&mut cols);
                        let both: Vec<_> = left_plan
                            .schema()
                            .iter()
                            .chain(right_plan.schema().iter())
                            .cloned()
                            .collect();
                        cols.iter().all(|c| {
                            if c.contains('.') {
                                both.iter().any(|s| s.name == *c)
                            } else {
                                both.iter().any(|s| {
                                    s.name == *c
                                        || s.name.rsplit('.').next() == Some(c.as_str())
                                })
                            }
                        })
                    };
                    if joint
                        && !expr_covered(p, &left_plan)
                        && !expr_covered(p, &right_plan)
                    {
                        residual.push(p.clone());
                        used[i] = true;
                    }
                }

                let mut schema = left_plan.schema().clone();
                schema.extend(right_plan.schema().iter().cloned());
                let selectivity = if left_keys.is_empty() { 1.0 } else { 0.01 };
                let est_rows =
                    (left_plan.est_rows() * right_plan.est_rows() * selectivity).max(1.0);
                let join_cost = self.cost.join_cost(
                    left_plan.est_rows(),
                    right_plan.est_rows(),
                    *algorithm,
                );
                let cost = left_plan.cost() + right_plan.cost() + join_cost;

                Ok(match algorithm {
                    JoinAlgorithm::Hash if !left_keys.is_empty() => PhysicalPlan::HashJoin {
                        left: Box::new(left_plan),
                        right: Box::new(right_plan),
                        left_keys,
                        right_keys,
                        residual: Expr::conjoin(residual),
                        kind: JoinKind::Inner,
                        schema,
                        est_rows,
                        cost,
                    },
                    _ => {
                        let mut on = residual;
                        for (l, r) in left_keys.into_iter().zip(right_keys) {
                            on.push(Expr::binary(l, BinOp::Eq, r));
                        }
                        PhysicalPlan::NestedLoopJoin {
                            left: Box::new(left_plan),
                            right: Box::new(right_plan),
                            on: Expr::conjoin(on),
                            kind: JoinKind::Inner,
                            schema,
                            est_rows,
                            cost,
                        }
                    }
                })
            }
        }
    }

    /// Physical join construction for explicit (non-reordered) joins.
    fn build_join(
        &self,
        left: PhysicalPlan,
        right: PhysicalPlan,
        kind: JoinKind,
        on: Option<Expr>,
        schema: Schema,
        est_rows: f64,
    ) -> Result<PhysicalPlan> {
        let mut left_keys = Vec::new();
        let mut right_keys = Vec::new();
        let mut residual = Vec::new();
        if let Some(on) = on.clone() {
            let mut factors = Vec::new();
            on.split_conjunction(&mut factors);
            for f in factors {
                if let Expr::Binary {
                    left: l,
                    op: BinOp::Eq,
                    right: r,
                } = &f
                {
                    let l_left = expr_covered(l, &left);
                    let r_right = expr_covered(r, &right);
                    let l_right = expr_covered(l, &right);
                    let r_left = expr_covered(r, &left);
                    if l_left && r_right && !l_right && !r_left {
                        left_keys.push((**l).clone());
                        right_keys.push((**r).clone());
                        continue;
                    }
                    if r_left && l_right && !r_right && !l_left {
                        left_keys.push((**r).clone());
                        right_keys.push((**l).clone());
                        continue;
                    }
                }
                residual.push(f);
            }
        }

        let hash_cost = self
            .cost
            .join_cost(left.est_rows(), right.est_rows(), JoinAlgorithm::Hash);
        let nl_cost =
            self.cost
                .join_cost(left.est_rows(), right.est_rows(), JoinAlgorithm::NestedLoop);

        // The hash join implements inner/left/semi shapes; right outer joins
        // keep the nested-loop form, which tracks unmatched probe rows.
        if !left_keys.is_empty() && hash_cost <= nl_cost && kind != JoinKind::Right {
            let cost = left.cost() + right.cost() + hash_cost;
            Ok(PhysicalPlan::HashJoin {
                left: Box::new(left),
                right: Box::new(right),
                left_keys,
                right_keys,
                residual: Expr::conjoin(residual),
                kind,
                schema,
                est_rows,
                cost,
            })
        } else {
            let cost = left.cost() + right.cost() + nl_cost;
            let mut on_parts = residual;
            for (l, r) in left_keys.into_iter().zip(right_keys) {
                on_parts.push(Expr::binary(l, BinOp::Eq, r));
            }
            Ok(PhysicalPlan::NestedLoopJoin {
                left: Box::new(left),
                right: Box::new(right),
                on: Expr::conjoin(on_parts),
                kind,
                schema,
                est_rows,
                cost,
            })
        }
    }
}

/// Which child (by index) fully covers the expression, if exactly one does.
fn side_of(expr: &Expr, children: &[PhysicalPlan]) -> Option<usize> {
    let mut found = None;
    for (i, c) in children.iter().enumerate() {
        if expr_covered(expr, c) {
            if found.is_some() {
                return None;
            }
            found = Some(i);
        }
    }
    found
}

fn expr_covered(expr: &Expr, plan: &PhysicalPlan) -> bool {
    let mut cols = Vec::new();
    expr.referenced_columns(&mut cols);
    let schema = plan.schema();
    cols.iter().all(|c| {
        if c.contains('.') {
            schema.iter().any(|s| s.name == *c)
        } else {
            schema
                .iter()
                .any(|s| s.name == *c || s.name.rsplit('.').next() == Some(c.as_str()))
        }
    })
}

/// Replace a node's declared schema, keeping everything else.
fn reschema(plan: PhysicalPlan, schema: Schema) -> PhysicalPlan {
    match plan {
        PhysicalPlan::HashJoin {
            left,
            right,
            left_keys,
            right_keys,
            residual,
            kind,
            est_rows,
            cost,
            ..
        } => PhysicalPlan::HashJoin {
            left,
            right,
            left_keys,
            right_keys,
            residual,
            kind,
            schema,
            est_rows,
            cost,
        },
        PhysicalPlan::NestedLoopJoin {
            left,
            right,
            on,
            kind,
            est_rows,
            cost,
            ..
        } => PhysicalPlan::NestedLoopJoin {
            left,
            right,
            on,
            kind,
            schema,
            est_rows,
            cost,
        },
        PhysicalPlan::Filter {
            input,
            predicate,
            est_rows,
            cost,
            ..
        } => PhysicalPlan::Filter {
            input,
            predicate,
            schema,
            est_rows,
            cost,
        },
        other => other,
    }
}
