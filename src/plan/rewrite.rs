//! Logical rewrite passes
//!
//! Applied in order: predicate push-down, projection push-down, constant
//! folding, subquery unnesting, join re-association. Every pass preserves
//! semantics and keeps node schemas consistent.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::plan::logical::{LogicalPlan, LogicalPlanner};
use crate::rowset;
use crate::sql::ast::{BinOp, Expr, JoinKind};
use crate::storage::value::Row;

/// Run all rewrite passes.
pub fn rewrite(plan: LogicalPlan, planner: &LogicalPlanner) -> Result<LogicalPlan> {
    let plan = push_down_predicates(plan)?;
    let plan = push_down_projections(plan, None)?;
    let plan = fold_constants(plan)?;
    let plan = unnest_subqueries(plan, planner)?;
    let plan = reassociate_joins(plan)?;
    Ok(plan)
}

/// Does the expression only reference columns present in the schema?
/// Qualified references must match their binding exactly; unqualified ones
/// match any column with that trailing name.
fn covered_by(expr: &Expr, schema: &[crate::storage::schema::ColumnDescriptor]) -> bool {
    let mut cols = Vec::new();
    expr.referenced_columns(&mut cols);
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

fn contains_subquery(expr: &Expr) -> bool {
    match expr {
        Expr::InSubquery { .. } => true,
        Expr::Binary { left, right, .. } => contains_subquery(left) || contains_subquery(right),
        Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => contains_subquery(expr),
        _ => false,
    }
}

/// Pass 1: move filters below joins when all referenced columns come from
/// one side; merge filters into scans.
pub fn push_down_predicates(plan: LogicalPlan) -> Result<LogicalPlan> {
    Ok(match plan {
        LogicalPlan::Filter {
            input,
            predicate,
            schema,
            est_rows,
        } => {
            let input = push_down_predicates(*input)?;
            match input {
                LogicalPlan::Join {
                    left,
                    right,
                    kind,
                    on,
                    schema: join_schema,
                    est_rows: join_rows,
                } if kind == JoinKind::Inner || kind == JoinKind::Cross => {
                    let mut factors = Vec::new();
                    predicate.split_conjunction(&mut factors);
                    let mut left_side = Vec::new();
                    let mut right_side = Vec::new();
                    let mut residual = Vec::new();
                    for f in factors {
                        if covered_by(&f, left.schema()) && !covered_by(&f, right.schema()) {
                            left_side.push(f);
                        } else if covered_by(&f, right.schema())
                            && !covered_by(&f, left.schema())
                        {
                            right_side.push(f);
                        } else {
                            residual.push(f);
                        }
                    }
                    let left = match Expr::conjoin(left_side) {
                        Some(p) => {
                            let schema = left.schema().clone();
                            let est = (left.est_rows() * 0.3).max(1.0);
                            Box::new(push_down_predicates(LogicalPlan::Filter {
                                input: left,
                                predicate: p,
                                schema,
                                est_rows: est,
                            })?)
                        }
                        None => left,
                    };
                    let right = match Expr::conjoin(right_side) {
                        Some(p) => {
                            let schema = right.schema().clone();
                            let est = (right.est_rows() * 0.3).max(1.0);
                            Box::new(push_down_predicates(LogicalPlan::Filter {
                                input: right,
                                predicate: p,
                                schema,
                                est_rows: est,
                            })?)
                        }
                        None => right,
                    };
                    let join = LogicalPlan::Join {
                        left,
                        right,
                        kind,
                        on,
                        schema: join_schema,
                        est_rows: join_rows,
                    };
                    match Expr::conjoin(residual) {
                        Some(p) => LogicalPlan::Filter {
                            input: Box::new(join),
                            predicate: p,
                            schema,
                            est_rows,
                        },
                        None => join,
                    }
                }
                LogicalPlan::Scan {
                    table,
                    binding,
                    qualify,
                    projection,
                    filter,
                    schema: scan_schema,
                    est_rows: scan_rows,
                } => {
                    // Subquery factors stay above the scan so the unnesting
                    // pass can still reach them.
                    let mut factors = Vec::new();
                    predicate.split_conjunction(&mut factors);
                    let (subqueries, plain): (Vec<Expr>, Vec<Expr>) = factors
                        .into_iter()
                        .partition(|f| contains_subquery(f));
                    let merged = match (filter, Expr::conjoin(plain)) {
                        (Some(f), Some(p)) => Some(Expr::binary(f, BinOp::And, p)),
                        (Some(f), None) => Some(f),
                        (None, p) => p,
                    };
                    let scan = LogicalPlan::Scan {
                        table,
                        binding,
                        qualify,
                        projection,
                        filter: merged,
                        schema: scan_schema.clone(),
                        est_rows: est_rows.min(scan_rows),
                    };
                    match Expr::conjoin(subqueries) {
                        Some(p) => LogicalPlan::Filter {
                            input: Box::new(scan),
                            predicate: p,
                            schema,
                            est_rows,
                        },
                        None => scan,
                    }
                }
                LogicalPlan::Filter {
                    input,
                    predicate: inner,
                    ..
                } => {
                    let merged = Expr::binary(inner, BinOp::And, predicate);
                    push_down_predicates(LogicalPlan::Filter {
                        input,
                        predicate: merged,
                        schema,
                        est_rows,
                    })?
                }
                other => LogicalPlan::Filter {
                    input: Box::new(other),
                    predicate,
                    schema,
                    est_rows,
                },
            }
        }
        other => map_children(other, push_down_predicates)?,
    })
}

/// Pass 2: reduce scan projections to the union of columns referenced by
/// ancestors. `needed = None` means "all columns".
pub fn push_down_projections(
    plan: LogicalPlan,
    needed: Option<&HashSet<String>>,
) -> Result<LogicalPlan> {
    Ok(match plan {
        LogicalPlan::Scan {
            table,
            binding,
            qualify,
            filter,
            schema,
            est_rows,
            ..
        } => {
            let projection = needed.map(|need| {
                schema
                    .iter()
                    .map(|c| c.name.clone())
                    .filter(|name| {
                        need.iter().any(|n| {
                            n == name || n.rsplit('.').next() == name.rsplit('.').next()
                        })
                    })
                    .collect::<Vec<_>>()
            });
            // Filter columns must stay readable; the storage layer applies
            // the filter before projecting, so only the output narrows.
            let (projection, schema) = match projection {
                Some(cols) if !cols.is_empty() && cols.len() < schema.len() => {
                    let schema = schema
                        .iter()
                        .filter(|c| cols.contains(&c.name))
                        .cloned()
                        .collect();
                    (Some(cols), schema)
                }
                _ => (None, schema),
            };
            LogicalPlan::Scan {
                table,
                binding,
                qualify,
                projection,
                filter,
                schema,
                est_rows,
            }
        }
        LogicalPlan::Project {
            input,
            items,
            schema,
            est_rows,
        } => {
            let mut need = HashSet::new();
            for (e, _) in &items {
                let mut cols = Vec::new();
                e.referenced_columns(&mut cols);
                need.extend(cols);
            }
            collect_expr_columns(&input, &mut need);
            let input = Box::new(push_down_projections(*input, Some(&need))?);
            LogicalPlan::Project {
                input,
                items,
                schema,
                est_rows,
            }
        }
        LogicalPlan::Aggregate {
            input,
            group_by,
            aggregates,
            schema,
            est_rows,
        } => {
            let mut need = HashSet::new();
            for e in &group_by {
                let mut cols = Vec::new();
                e.referenced_columns(&mut cols);
                need.extend(cols);
            }
            for a in &aggregates {
                if let Some(arg) = &a.arg {
                    let mut cols = Vec::new();
                    arg.referenced_columns(&mut cols);
                    need.extend(cols);
                }
            }
            collect_expr_columns(&input, &mut need);
            let narrowed = if need.is_empty() { None } else { Some(&need) };
            let input = Box::new(push_down_projections(*input, narrowed)?);
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
                schema,
                est_rows,
            }
        }
        // Other nodes need every column their ancestors asked for plus their
        // own expression references; propagate the widened set.
        other => {
            let mut need = needed.cloned().unwrap_or_default();
            let widen = needed.is_some();
            if widen {
                collect_expr_columns(&other, &mut need);
            }
            let need_ref = if widen { Some(&need) } else { None };
            map_children(other, |child| push_down_projections(child, need_ref))?
        }
    })
}

/// Columns referenced by a node's own expressions (filters, join keys, sort
/// keys), which must survive projection narrowing below it.
fn collect_expr_columns(plan: &LogicalPlan, out: &mut HashSet<String>) {
    let mut cols = Vec::new();
    match plan {
        LogicalPlan::Filter { predicate, .. } => predicate.referenced_columns(&mut cols),
        LogicalPlan::Scan {
            filter: Some(f), ..
        } => f.referenced_columns(&mut cols),
        LogicalPlan::Join { on: Some(on), .. } => on.referenced_columns(&mut cols),
        LogicalPlan::MultiJoin { predicates, .. } => {
            for p in predicates {
                p.referenced_columns(&mut cols);
            }
        }
        LogicalPlan::Sort { keys, .. } => {
            for k in keys {
                k.expr.referenced_columns(&mut cols);
            }
        }
        _ => {}
    }
    out.extend(cols);
}

/// Pass 3: evaluate expressions whose inputs are all literals.
pub fn fold_constants(plan: LogicalPlan) -> Result<LogicalPlan> {
    fn fold_expr(expr: Expr) -> Expr {
        if expr.is_constant() && !matches!(expr, Expr::Literal(_)) {
            let empty = Row::from_pairs(vec![]);
            if let Ok(v) = rowset::eval_expr(&expr, &empty) {
                return Expr::Literal(v);
            }
        }
        match expr {
            Expr::Binary { left, op, right } => Expr::Binary {
                left: Box::new(fold_expr(*left)),
                op,
                right: Box::new(fold_expr(*right)),
            },
            Expr::Unary { op, expr } => Expr::Unary {
                op,
                expr: Box::new(fold_expr(*expr)),
            },
            other => other,
        }
    }

    Ok(match plan {
        LogicalPlan::Filter {
            input,
            predicate,
            schema,
            est_rows,
        } => LogicalPlan::Filter {
            input: Box::new(fold_constants(*input)?),
            predicate: fold_expr(predicate),
            schema,
            est_rows,
        },
        LogicalPlan::Scan {
            table,
            binding,
            qualify,
            projection,
            filter,
            schema,
            est_rows,
        } => LogicalPlan::Scan {
            table,
            binding,
            qualify,
            projection,
            filter: filter.map(fold_expr),
            schema,
            est_rows,
        },
        LogicalPlan::Project {
            input,
            items,
            schema,
            est_rows,
        } => LogicalPlan::Project {
            input: Box::new(fold_constants(*input)?),
            items: items.into_iter().map(|(e, n)| (fold_expr(e), n)).collect(),
            schema,
            est_rows,
        },
        other => map_children(other, fold_constants)?,
    })
}

/// Pass 4: convert `IN (subquery)` into a semi-join when the subquery is
/// correlation-free and yields a single column.
pub fn unnest_subqueries(plan: LogicalPlan, planner: &LogicalPlanner) -> Result<LogicalPlan> {
    Ok(match plan {
        LogicalPlan::Filter {
            input,
            predicate,
            schema,
            est_rows,
        } => {
            let input = unnest_subqueries(*input, planner)?;
            let mut factors = Vec::new();
            predicate.split_conjunction(&mut factors);

            let mut current = input;
            let mut remaining = Vec::new();
            for factor in factors {
                match factor {
                    Expr::InSubquery {
                        expr,
                        subquery,
                        negated: false,
                    } => {
                        let sub_plan = planner.plan(&subquery)?;
                        let sub_plan = rewrite_subplan(sub_plan, planner)?;
                        let sub_schema = sub_plan.schema();
                        if sub_schema.len() != 1 {
                            return Err(Error::Syntax(
                                "IN subquery must return exactly one column".into(),
                            ));
                        }
                        let right_col = Expr::column(sub_schema[0].name.clone());
                        let on = Expr::binary(*expr, BinOp::Eq, right_col);
                        let current_schema = current.schema().clone();
                        let est = current.est_rows();
                        current = LogicalPlan::Join {
                            left: Box::new(current),
                            right: Box::new(sub_plan),
                            kind: JoinKind::Semi,
                            on: Some(on),
                            // Semi join keeps the left schema.
                            schema: current_schema,
                            est_rows: (est * 0.5).max(1.0),
                        };
                    }
                    Expr::InSubquery { negated: true, .. } => {
                        return Err(Error::Unsupported("NOT IN (subquery)".into()));
                    }
                    other => remaining.push(other),
                }
            }
            match Expr::conjoin(remaining) {
                Some(p) => LogicalPlan::Filter {
                    input: Box::new(current),
                    predicate: p,
                    schema,
                    est_rows,
                },
                None => current,
            }
        }
        other => map_children(other, |child| unnest_subqueries(child, planner))?,
    })
}

fn rewrite_subplan(plan: LogicalPlan, planner: &LogicalPlanner) -> Result<LogicalPlan> {
    let plan = push_down_predicates(plan)?;
    let plan = push_down_projections(plan, None)?;
    let plan = fold_constants(plan)?;
    unnest_subqueries(plan, planner)
}

/// Pass 5: flatten chains of inner joins into a multi-way join set for the
/// optimizer's order search.
pub fn reassociate_joins(plan: LogicalPlan) -> Result<LogicalPlan> {
    Ok(match plan {
        LogicalPlan::Join {
            left,
            right,
            kind: JoinKind::Inner,
            on,
            schema,
            est_rows,
        } => {
            let left = reassociate_joins(*left)?;
            let right = reassociate_joins(*right)?;
            let mut inputs = Vec::new();
            let mut predicates = Vec::new();
            flatten_into(left, &mut inputs, &mut predicates);
            flatten_into(right, &mut inputs, &mut predicates);
            if let Some(on) = on {
                on.split_conjunction(&mut predicates);
            }
            if inputs.len() >= 2 {
                LogicalPlan::MultiJoin {
                    inputs,
                    predicates,
                    schema,
                    est_rows,
                }
            } else {
                // A degenerate chain; keep a plain join shape.
                let mut it = inputs.into_iter();
                let only = it.next().expect("at least one input");
                LogicalPlan::Filter {
                    input: Box::new(only),
                    predicate: Expr::conjoin(predicates)
                        .unwrap_or(Expr::Literal(crate::storage::value::Value::Bool(true))),
                    schema,
                    est_rows,
                }
            }
        }
        other => map_children(other, reassociate_joins)?,
    })
}

fn flatten_into(plan: LogicalPlan, inputs: &mut Vec<LogicalPlan>, predicates: &mut Vec<Expr>) {
    match plan {
        LogicalPlan::MultiJoin {
            inputs: nested,
            predicates: nested_preds,
            ..
        } => {
            inputs.extend(nested);
            predicates.extend(nested_preds);
        }
        LogicalPlan::Join {
            left,
            right,
            kind: JoinKind::Inner,
            on,
            ..
        } => {
            flatten_into(*left, inputs, predicates);
            flatten_into(*right, inputs, predicates);
            if let Some(on) = on {
                on.split_conjunction(predicates);
            }
        }
        other => inputs.push(other),
    }
}

/// Apply `f` to every direct child, rebuilding the node.
fn map_children<F>(plan: LogicalPlan, mut f: F) -> Result<LogicalPlan>
where
    F: FnMut(LogicalPlan) -> Result<LogicalPlan>,
{
    Ok(match plan {
        LogicalPlan::Filter {
            input,
            predicate,
            schema,
            est_rows,
        } => LogicalPlan::Filter {
            input: Box::new(f(*input)?),
            predicate,
            schema,
            est_rows,
        },
        LogicalPlan::Project {
            input,
            items,
            schema,
            est_rows,
        } => LogicalPlan::Project {
            input: Box::new(f(*input)?),
            items,
            schema,
            est_rows,
        },
        LogicalPlan::Join {
            left,
            right,
            kind,
            on,
            schema,
            est_rows,
        } => LogicalPlan::Join {
            left: Box::new(f(*left)?),
            right: Box::new(f(*right)?),
            kind,
            on,
            schema,
            est_rows,
        },
        LogicalPlan::MultiJoin {
            inputs,
            predicates,
            schema,
            est_rows,
        } => LogicalPlan::MultiJoin {
            inputs: inputs.into_iter().map(&mut f).collect::<Result<_>>()?,
            predicates,
            schema,
            est_rows,
        },
        LogicalPlan::Aggregate {
            input,
            group_by,
            aggregates,
            schema,
            est_rows,
        } => LogicalPlan::Aggregate {
            input: Box::new(f(*input)?),
            group_by,
            aggregates,
            schema,
            est_rows,
        },
        LogicalPlan::Sort {
            input,
            keys,
            schema,
            est_rows,
        } => LogicalPlan::Sort {
            input: Box::new(f(*input)?),
            keys,
            schema,
            est_rows,
        },
        LogicalPlan::Limit {
            input,
            limit,
            offset,
            schema,
            est_rows,
        } => LogicalPlan::Limit {
            input: Box::new(f(*input)?),
            limit,
            offset,
            schema,
            est_rows,
        },
        LogicalPlan::Union {
            inputs,
            all,
            schema,
            est_rows,
        } => LogicalPlan::Union {
            inputs: inputs.into_iter().map(&mut f).collect::<Result<_>>()?,
            all,
            schema,
            est_rows,
        },
        leaf @ (LogicalPlan::Scan { .. }
        | LogicalPlan::FtsScan { .. }
        | LogicalPlan::Values { .. }) => leaf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::stats::StatisticsCache;
    use crate::sql::ast::Statement;
    use crate::sql::parse::parse;
    use crate::storage::schema::{
        Catalog, ColumnDescriptor, PersistencePolicy, SemanticType, TableDescriptor, TableEngine,
        DEFAULT_DATABASE,
    };
    use std::sync::Arc;

    fn planner() -> LogicalPlanner {
        let catalog = Arc::new(Catalog::new());
        for name in ["a", "b", "c"] {
            let desc = TableDescriptor {
                name: name.into(),
                columns: vec![
                    ColumnDescriptor {
                        name: "k".into(),
                        data_type: SemanticType::Int,
                        nullable: false,
                        primary_key: true,
                        auto_increment: false,
                        default: None,
                    },
                    ColumnDescriptor::new("v", SemanticType::String),
                ],
                primary_key: vec!["k".into()],
                indexes: vec![],
                persistence: PersistencePolicy::MemoryOnly,
                engine: TableEngine::Hybrid,
                fulltext: vec![],
            };
            catalog.register_table(DEFAULT_DATABASE, desc).unwrap();
        }
        LogicalPlanner::new(
            catalog,
            Arc::new(StatisticsCache::new()),
            DEFAULT_DATABASE.into(),
        )
    }

    fn plan_sql(sql: &str) -> LogicalPlan {
        let p = planner();
        let stmt = match parse(sql).unwrap() {
            Statement::Select(s) => s,
            _ => unreachable!(),
        };
        let plan = p.plan(&stmt).unwrap();
        rewrite(plan, &p).unwrap()
    }

    fn find_scan<'a>(plan: &'a LogicalPlan, table: &str) -> Option<&'a LogicalPlan> {
        match plan {
            LogicalPlan::Scan { table: t, .. } if t == table => Some(plan),
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => find_scan(input, table),
            LogicalPlan::Join { left, right, .. } => {
                find_scan(left, table).or_else(|| find_scan(right, table))
            }
            LogicalPlan::MultiJoin { inputs, .. } | LogicalPlan::Union { inputs, .. } => {
                inputs.iter().find_map(|i| find_scan(i, table))
            }
            _ => None,
        }
    }

    #[test]
    fn test_predicate_pushed_into_scan() {
        let plan = plan_sql("SELECT k FROM a WHERE k > 5");
        let scan = find_scan(&plan, "a").expect("scan survives");
        match scan {
            LogicalPlan::Scan { filter, .. } => assert!(filter.is_some()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_one_sided_predicate_pushed_below_join() {
        let plan = plan_sql(
            "SELECT * FROM a JOIN b ON a.k = b.k WHERE a.v = 'x'",
        );
        // After re-association the join is a MultiJoin; the a-side filter
        // must have been pushed into a's scan.
        let scan = find_scan(&plan, "a").expect("scan for a");
        match scan {
            LogicalPlan::Scan { filter, .. } => {
                assert!(filter.is_some(), "a.v predicate lands on the scan")
            }
            _ => unreachable!(),
        }
        let scan_b = find_scan(&plan, "b").expect("scan for b");
        match scan_b {
            LogicalPlan::Scan { filter, .. } => assert!(filter.is_none()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_projection_pushdown_narrows_scan() {
        let plan = plan_sql("SELECT v FROM a WHERE v = 'x'");
        let scan = find_scan(&plan, "a").expect("scan");
        match scan {
            LogicalPlan::Scan { projection, .. } => {
                let cols = projection.as_ref().expect("narrowed");
                assert_eq!(cols, &vec!["v".to_string()]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_constant_folding() {
        let plan = plan_sql("SELECT k FROM a WHERE k > 1 + 2");
        let scan = find_scan(&plan, "a").unwrap();
        match scan {
            LogicalPlan::Scan { filter: Some(f), .. } => {
                assert!(
                    f.to_string().contains("3"),
                    "1 + 2 folded to 3 in {f}"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_join_chain_flattened() {
        let plan = plan_sql(
            "SELECT * FROM a JOIN b ON a.k = b.k JOIN c ON b.k = c.k",
        );
        fn find_multi(plan: &LogicalPlan) -> Option<(usize, usize)> {
            match plan {
                LogicalPlan::MultiJoin {
                    inputs, predicates, ..
                } => Some((inputs.len(), predicates.len())),
                LogicalPlan::Filter { input, .. }
                | LogicalPlan::Project { input, .. }
                | LogicalPlan::Sort { input, .. }
                | LogicalPlan::Limit { input, .. } => find_multi(input),
                _ => None,
            }
        }
        let (inputs, predicates) = find_multi(&plan).expect("multijoin");
        assert_eq!(inputs, 3);
        assert_eq!(predicates, 2);
    }

    #[test]
    fn test_in_subquery_becomes_semi_join() {
        let plan = plan_sql("SELECT * FROM a WHERE k IN (SELECT k FROM b)");
        fn find_semi(plan: &LogicalPlan) -> bool {
            match plan {
                LogicalPlan::Join {
                    kind: JoinKind::Semi,
                    ..
                } => true,
                LogicalPlan::Filter { input, .. }
                | LogicalPlan::Project { input, .. }
                | LogicalPlan::Sort { input, .. }
                | LogicalPlan::Limit { input, .. } => find_semi(input),
                LogicalPlan::Join { left, right, .. } => find_semi(left) || find_semi(right),
                _ => false,
            }
        }
        assert!(find_semi(&plan), "plan: {plan:?}");
    }
}
