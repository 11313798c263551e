//! Physical plans
//!
//! Chosen by the optimizer; executed by the pull-based operator runtime.
//! Every node's schema is derivable from its children plus the operator
//! definition, and every node carries its computed cost.

use crate::plan::logical::{AggExpr, Schema};
use crate::sql::ast::{Expr, JoinKind, OrderItem};

#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalPlan {
    SeqScan {
        table: String,
        binding: String,
        qualify: bool,
        projection: Option<Vec<String>>,
        filter: Option<Expr>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    IndexScan {
        table: String,
        binding: String,
        qualify: bool,
        index: String,
        key: Expr,
        residual: Option<Expr>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    FtsScan {
        table: String,
        columns: Vec<String>,
        query: String,
        residual: Option<Expr>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    Values {
        rows: Vec<Vec<Expr>>,
        schema: Schema,
    },
    Filter {
        input: Box<PhysicalPlan>,
        predicate: Expr,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    Project {
        input: Box<PhysicalPlan>,
        items: Vec<(Expr, String)>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    HashJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        residual: Option<Expr>,
        kind: JoinKind,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    NestedLoopJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        on: Option<Expr>,
        kind: JoinKind,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    HashAggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    StreamAggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    Sort {
        input: Box<PhysicalPlan>,
        keys: Vec<OrderItem>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: Option<u64>,
        offset: Option<u64>,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
    Append {
        inputs: Vec<PhysicalPlan>,
        all: bool,
        schema: Schema,
        est_rows: f64,
        cost: f64,
    },
}

impl PhysicalPlan {
    pub fn schema(&self) -> &Schema {
        match self {
            PhysicalPlan::SeqScan { schema, .. }
            | PhysicalPlan::IndexScan { schema, .. }
            | PhysicalPlan::FtsScan { schema, .. }
            | PhysicalPlan::Values { schema, .. }
            | PhysicalPlan::Filter { schema, .. }
            | PhysicalPlan::Project { schema, .. }
            | PhysicalPlan::HashJoin { schema, .. }
            | PhysicalPlan::NestedLoopJoin { schema, .. }
            | PhysicalPlan::HashAggregate { schema, .. }
            | PhysicalPlan::StreamAggregate { schema, .. }
            | PhysicalPlan::Sort { schema, .. }
            | PhysicalPlan::Limit { schema, .. }
            | PhysicalPlan::Append { schema, .. } => schema,
        }
    }

    pub fn cost(&self) -> f64 {
        match self {
            PhysicalPlan::Values { .. } => 0.0,
            PhysicalPlan::SeqScan { cost, .. }
            | PhysicalPlan::IndexScan { cost, .. }
            | PhysicalPlan::FtsScan { cost, .. }
            | PhysicalPlan::Filter { cost, .. }
            | PhysicalPlan::Project { cost, .. }
            | PhysicalPlan::HashJoin { cost, .. }
            | PhysicalPlan::NestedLoopJoin { cost, .. }
            | PhysicalPlan::HashAggregate { cost, .. }
            | PhysicalPlan::StreamAggregate { cost, .. }
            | PhysicalPlan::Sort { cost, .. }
            | PhysicalPlan::Limit { cost, .. }
            | PhysicalPlan::Append { cost, .. } => *cost,
        }
    }

    pub fn est_rows(&self) -> f64 {
        match self {
            PhysicalPlan::Values { rows, .. } => rows.len() as f64,
            PhysicalPlan::SeqScan { est_rows, .. }
            | PhysicalPlan::IndexScan { est_rows, .. }
            | PhysicalPlan::FtsScan { est_rows, .. }
            | PhysicalPlan::Filter { est_rows, .. }
            | PhysicalPlan::Project { est_rows, .. }
            | PhysicalPlan::HashJoin { est_rows, .. }
            | PhysicalPlan::NestedLoopJoin { est_rows, .. }
            | PhysicalPlan::HashAggregate { est_rows, .. }
            | PhysicalPlan::StreamAggregate { est_rows, .. }
            | PhysicalPlan::Sort { est_rows, .. }
            | PhysicalPlan::Limit { est_rows, .. }
            | PhysicalPlan::Append { est_rows, .. } => *est_rows,
        }
    }

    /// Scan bindings in plan order; join nodes use this for their labels.
    pub fn scan_order(&self, out: &mut Vec<String>) {
        match self {
            PhysicalPlan::SeqScan { binding, .. } | PhysicalPlan::IndexScan { binding, .. } => {
                out.push(binding.clone())
            }
            PhysicalPlan::FtsScan { table, .. } => out.push(table.clone()),
            PhysicalPlan::Values { .. } => {}
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Project { input, .. }
            | PhysicalPlan::HashAggregate { input, .. }
            | PhysicalPlan::StreamAggregate { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. } => input.scan_order(out),
            PhysicalPlan::HashJoin { left, right, .. }
            | PhysicalPlan::NestedLoopJoin { left, right, .. } => {
                left.scan_order(out);
                right.scan_order(out);
            }
            PhysicalPlan::Append { inputs, .. } => {
                for i in inputs {
                    i.scan_order(out);
                }
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            PhysicalPlan::SeqScan {
                table,
                filter,
                est_rows,
                cost,
                ..
            } => {
                let mut s = format!("SeqScan {table} (rows={est_rows:.0}, cost={cost:.1})");
                if let Some(f) = filter {
                    s.push_str(&format!(" filter={f}"));
                }
                s
            }
            PhysicalPlan::IndexScan {
                table,
                index,
                key,
                est_rows,
                cost,
                ..
            } => format!(
                "IndexScan {table} using {index} key={key} (rows={est_rows:.0}, cost={cost:.1})"
            ),
            PhysicalPlan::FtsScan {
                table,
                query,
                est_rows,
                cost,
                ..
            } => format!("FtsScan {table} query='{query}' (rows={est_rows:.0}, cost={cost:.1})"),
            PhysicalPlan::Values { rows, .. } => format!("Values ({} rows)", rows.len()),
            PhysicalPlan::Filter {
                predicate,
                est_rows,
                cost,
                ..
            } => format!("Filter {predicate} (rows={est_rows:.0}, cost={cost:.1})"),
            PhysicalPlan::Project { items, .. } => {
                let names: Vec<&str> = items.iter().map(|(_, n)| n.as_str()).collect();
                format!("Project [{}]", names.join(", "))
            }
            PhysicalPlan::HashJoin {
                est_rows, cost, kind, ..
            } => {
                let mut order = Vec::new();
                self.scan_order(&mut order);
                let label = order.join(" ⋈ ");
                let kind = match kind {
                    JoinKind::Semi => "semi ",
                    JoinKind::Left => "left ",
                    JoinKind::Right => "right ",
                    _ => "",
                };
                format!("HashJoin {kind}[{label}] (rows={est_rows:.0}, cost={cost:.1})")
            }
            PhysicalPlan::NestedLoopJoin {
                est_rows, cost, kind, ..
            } => {
                let mut order = Vec::new();
                self.scan_order(&mut order);
                let label = order.join(" ⋈ ");
                let kind = match kind {
                    JoinKind::Semi => "semi ",
                    JoinKind::Left => "left ",
                    JoinKind::Right => "right ",
                    _ => "",
                };
                format!("NestedLoopJoin {kind}[{label}] (rows={est_rows:.0}, cost={cost:.1})")
            }
            PhysicalPlan::HashAggregate {
                group_by,
                aggregates,
                est_rows,
                cost,
                ..
            } => format!(
                "HashAggregate groups={} aggs={} (rows={est_rows:.0}, cost={cost:.1})",
                group_by.len(),
                aggregates.len()
            ),
            PhysicalPlan::StreamAggregate {
                group_by,
                aggregates,
                est_rows,
                cost,
                ..
            } => format!(
                "StreamAggregate groups={} aggs={} (rows={est_rows:.0}, cost={cost:.1})",
                group_by.len(),
                aggregates.len()
            ),
            PhysicalPlan::Sort { keys, .. } => {
                let items: Vec<String> = keys
                    .iter()
                    .map(|k| format!("{}{}", k.expr, if k.asc { "" } else { " DESC" }))
                    .collect();
                format!("Sort [{}]", items.join(", "))
            }
            PhysicalPlan::Limit { limit, offset, .. } => format!(
                "Limit {}{}",
                limit.map(|l| l.to_string()).unwrap_or_else(|| "∞".into()),
                offset.map(|o| format!(" offset {o}")).unwrap_or_default()
            ),
            PhysicalPlan::Append { inputs, all, .. } => format!(
                "Append {} inputs{}",
                inputs.len(),
                if *all { " (all)" } else { "" }
            ),
        }
    }

    /// EXPLAIN rendering: one operator per line, two spaces per depth.
    pub fn explain(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.explain_into(0, &mut lines);
        lines
    }

    fn explain_into(&self, depth: usize, lines: &mut Vec<String>) {
        lines.push(format!("{}{}", "  ".repeat(depth), self.describe()));
        match self {
            PhysicalPlan::Filter { input, .. }
            | PhysicalPlan::Project { input, .. }
            | PhysicalPlan::HashAggregate { input, .. }
            | PhysicalPlan::StreamAggregate { input, .. }
            | PhysicalPlan::Sort { input, .. }
            | PhysicalPlan::Limit { input, .. } => input.explain_into(depth + 1, lines),
            PhysicalPlan::HashJoin { left, right, .. }
            | PhysicalPlan::NestedLoopJoin { left, right, .. } => {
                left.explain_into(depth + 1, lines);
                right.explain_into(depth + 1, lines);
            }
            PhysicalPlan::Append { inputs, .. } => {
                for i in inputs {
                    i.explain_into(depth + 1, lines);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{ColumnDescriptor, SemanticType};

    fn scan(table: &str) -> PhysicalPlan {
        PhysicalPlan::SeqScan {
            table: table.into(),
            binding: table.into(),
            qualify: false,
            projection: None,
            filter: None,
            schema: vec![ColumnDescriptor::new("k", SemanticType::Int)],
            est_rows: 10.0,
            cost: 10.0,
        }
    }

    #[test]
    fn test_explain_indents_children() {
        let plan = PhysicalPlan::Limit {
            input: Box::new(PhysicalPlan::Filter {
                input: Box::new(scan("t")),
                predicate: Expr::column("k"),
                schema: vec![],
                est_rows: 5.0,
                cost: 12.0,
            }),
            limit: Some(3),
            offset: None,
            schema: vec![],
            est_rows: 3.0,
            cost: 12.0,
        };
        let lines = plan.explain();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Limit"));
        assert!(lines[1].starts_with("  Filter"));
        assert!(lines[2].starts_with("    SeqScan"));
    }

    #[test]
    fn test_join_label_lists_scan_order() {
        let plan = PhysicalPlan::HashJoin {
            left: Box::new(PhysicalPlan::HashJoin {
                left: Box::new(scan("b")),
                right: Box::new(scan("a")),
                left_keys: vec![],
                right_keys: vec![],
                residual: None,
                kind: JoinKind::Inner,
                schema: vec![],
                est_rows: 10.0,
                cost: 1.0,
            }),
            right: Box::new(scan("c")),
            left_keys: vec![],
            right_keys: vec![],
            residual: None,
            kind: JoinKind::Inner,
            schema: vec![],
            est_rows: 10.0,
            cost: 1.0,
        };
        let lines = plan.explain();
        assert!(lines[0].contains("b ⋈ a ⋈ c"), "top label: {}", lines[0]);
    }
}
