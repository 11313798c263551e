//! Logical plans
//!
//! Built from the normalized AST, rewritten by `plan::rewrite`, then handed
//! to the optimizer for physical selection. Every node carries its output
//! schema and an estimated row count; schemas are refreshed after each
//! rewrite pass.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::optimizer::stats::StatisticsCache;
use crate::sql::ast::{
    Expr, FromClause, JoinKind, OrderItem, SelectItem, SelectStmt, TableRef,
};
use crate::storage::schema::{Catalog, ColumnDescriptor, SemanticType, TableDescriptor};

pub type Schema = Vec<ColumnDescriptor>;

/// Aggregate functions supported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn parse(name: &str) -> Option<AggFunc> {
        match name {
            "COUNT" => Some(AggFunc::Count),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        }
    }
}

/// One aggregate output column.
#[derive(Debug, Clone, PartialEq)]
pub struct AggExpr {
    pub func: AggFunc,
    /// `None` for COUNT(*).
    pub arg: Option<Expr>,
    pub alias: String,
}

/// Logical operator tree.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalPlan {
    Scan {
        table: String,
        binding: String,
        /// Qualify emitted column names with the binding (multi-table query).
        qualify: bool,
        projection: Option<Vec<String>>,
        filter: Option<Expr>,
        schema: Schema,
        est_rows: f64,
    },
    /// Full-text retrieval over a table's FULLTEXT columns.
    FtsScan {
        table: String,
        columns: Vec<String>,
        query: String,
        residual: Option<Expr>,
        schema: Schema,
        est_rows: f64,
    },
    /// Literal rows (SELECT without FROM).
    Values {
        rows: Vec<Vec<Expr>>,
        schema: Schema,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
        schema: Schema,
        est_rows: f64,
    },
    Project {
        input: Box<LogicalPlan>,
        items: Vec<(Expr, String)>,
        schema: Schema,
        est_rows: f64,
    },
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        kind: JoinKind,
        on: Option<Expr>,
        schema: Schema,
        est_rows: f64,
    },
    /// Flattened inner-join set produced by join re-association.
    MultiJoin {
        inputs: Vec<LogicalPlan>,
        predicates: Vec<Expr>,
        schema: Schema,
        est_rows: f64,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        schema: Schema,
        est_rows: f64,
    },
    Sort {
        input: Box<LogicalPlan>,
        keys: Vec<OrderItem>,
        schema: Schema,
        est_rows: f64,
    },
    Limit {
        input: Box<LogicalPlan>,
        limit: Option<u64>,
        offset: Option<u64>,
        schema: Schema,
        est_rows: f64,
    },
    Union {
        inputs: Vec<LogicalPlan>,
        all: bool,
        schema: Schema,
        est_rows: f64,
    },
}

impl LogicalPlan {
    pub fn schema(&self) -> &Schema {
        match self {
            LogicalPlan::Scan { schema, .. }
            | LogicalPlan::FtsScan { schema, .. }
            | LogicalPlan::Values { schema, .. }
            | LogicalPlan::Filter { schema, .. }
            | LogicalPlan::Project { schema, .. }
            | LogicalPlan::Join { schema, .. }
            | LogicalPlan::MultiJoin { schema, .. }
            | LogicalPlan::Aggregate { schema, .. }
            | LogicalPlan::Sort { schema, .. }
            | LogicalPlan::Limit { schema, .. }
            | LogicalPlan::Union { schema, .. } => schema,
        }
    }

    pub fn est_rows(&self) -> f64 {
        match self {
            LogicalPlan::Values { rows, .. } => rows.len() as f64,
            LogicalPlan::Scan { est_rows, .. }
            | LogicalPlan::FtsScan { est_rows, .. }
            | LogicalPlan::Filter { est_rows, .. }
            | LogicalPlan::Project { est_rows, .. }
            | LogicalPlan::Join { est_rows, .. }
            | LogicalPlan::MultiJoin { est_rows, .. }
            | LogicalPlan::Aggregate { est_rows, .. }
            | LogicalPlan::Sort { est_rows, .. }
            | LogicalPlan::Limit { est_rows, .. }
            | LogicalPlan::Union { est_rows, .. } => *est_rows,
        }
    }

    /// Source tables feeding this plan.
    pub fn source_tables(&self, out: &mut Vec<String>) {
        match self {
            LogicalPlan::Scan { table, .. } | LogicalPlan::FtsScan { table, .. } => {
                if !out.contains(table) {
                    out.push(table.clone());
                }
            }
            LogicalPlan::Values { .. } => {}
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Limit { input, .. } => input.source_tables(out),
            LogicalPlan::Join { left, right, .. } => {
                left.source_tables(out);
                right.source_tables(out);
            }
            LogicalPlan::MultiJoin { inputs, .. } | LogicalPlan::Union { inputs, .. } => {
                for i in inputs {
                    i.source_tables(out);
                }
            }
        }
    }
}

/// Infer an output type for an expression against an input schema.
pub fn infer_type(expr: &Expr, schema: &Schema) -> SemanticType {
    match expr {
        Expr::Column { table, name } => {
            let qualified = table.as_ref().map(|t| format!("{t}.{name}"));
            schema
                .iter()
                .find(|c| {
                    qualified.as_deref() == Some(c.name.as_str())
                        || c.name == *name
                        || c.name.rsplit('.').next() == Some(name.as_str())
                })
                .map(|c| c.data_type)
                .unwrap_or(SemanticType::String)
        }
        Expr::Literal(v) => match v {
            crate::storage::value::Value::Int(_) => SemanticType::Int,
            crate::storage::value::Value::Uint(_) => SemanticType::Uint,
            crate::storage::value::Value::Float(_) => SemanticType::Float,
            crate::storage::value::Value::Bool(_) => SemanticType::Bool,
            crate::storage::value::Value::Bytes(_) => SemanticType::Bytes,
            crate::storage::value::Value::Time(_) => SemanticType::Time,
            crate::storage::value::Value::Json(_) => SemanticType::Json,
            _ => SemanticType::String,
        },
        Expr::Binary { left, op, right } => {
            if op.is_comparison()
                || matches!(op, crate::sql::ast::BinOp::And | crate::sql::ast::BinOp::Or)
            {
                SemanticType::Bool
            } else {
                match (infer_type(left, schema), infer_type(right, schema)) {
                    (SemanticType::Int, SemanticType::Int) => SemanticType::Int,
                    (SemanticType::String, SemanticType::String) => SemanticType::String,
                    _ => SemanticType::Float,
                }
            }
        }
        Expr::IsNull { .. }
        | Expr::InList { .. }
        | Expr::InSubquery { .. }
        | Expr::Between { .. }
        | Expr::Like { .. }
        | Expr::Match { .. } => SemanticType::Bool,
        Expr::Unary { expr, .. } => infer_type(expr, schema),
        Expr::Function { name, args, .. } => match name.as_str() {
            "COUNT" | "LENGTH" => SemanticType::Int,
            "SUM" | "AVG" => SemanticType::Float,
            "MIN" | "MAX" => args
                .first()
                .map(|a| infer_type(a, schema))
                .unwrap_or(SemanticType::Float),
            "UPPER" | "LOWER" | "COALESCE" => SemanticType::String,
            "NOW" => SemanticType::Time,
            _ => SemanticType::String,
        },
        Expr::Placeholder(_) => SemanticType::String,
    }
}

/// Output name for a projection item without an alias.
pub fn output_name(expr: &Expr) -> String {
    match expr {
        Expr::Column { name, .. } => name.clone(),
        other => other.to_string(),
    }
}

/// Builds logical plans from normalized SELECT statements.
pub struct LogicalPlanner {
    catalog: Arc<Catalog>,
    stats: Arc<StatisticsCache>,
    database: String,
}

impl LogicalPlanner {
    pub fn new(catalog: Arc<Catalog>, stats: Arc<StatisticsCache>, database: String) -> Self {
        Self {
            catalog,
            stats,
            database,
        }
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableDescriptor>> {
        self.catalog.table(&self.database, name)
    }

    /// Build the initial logical tree. Rewrites run afterwards.
    pub fn plan(&self, stmt: &SelectStmt) -> Result<LogicalPlan> {
        if stmt.unions.is_empty() {
            return self.plan_single(stmt);
        }

        // ORDER BY / LIMIT on a union apply to the combined rows.
        let mut base = stmt.clone();
        base.unions = Vec::new();
        let order_by = std::mem::take(&mut base.order_by);
        let limit = base.limit.take();
        let offset = base.offset.take();

        let mut inputs = vec![self.plan_single(&base)?];
        let mut all = true;
        for (branch, branch_all) in &stmt.unions {
            all = all && *branch_all;
            let branch_plan = self.plan_single(branch)?;
            if branch_plan.schema().len() != inputs[0].schema().len() {
                return Err(Error::Syntax(
                    "UNION branches must have the same number of columns".into(),
                ));
            }
            inputs.push(branch_plan);
        }
        let schema = inputs[0].schema().clone();
        let est_rows = inputs.iter().map(LogicalPlan::est_rows).sum();
        let mut plan = LogicalPlan::Union {
            inputs,
            all,
            schema,
            est_rows,
        };
        if !order_by.is_empty() {
            let schema = plan.schema().clone();
            let est_rows = plan.est_rows();
            plan = LogicalPlan::Sort {
                input: Box::new(plan),
                keys: order_by,
                schema,
                est_rows,
            };
        }
        if limit.is_some() || offset.is_some() {
            let schema = plan.schema().clone();
            let est_rows = plan.est_rows();
            plan = LogicalPlan::Limit {
                input: Box::new(plan),
                limit,
                offset,
                schema,
                est_rows,
            };
        }
        Ok(plan)
    }

    fn plan_single(&self, stmt: &SelectStmt) -> Result<LogicalPlan> {
        let mut plan = match &stmt.from {
            Some(from) => self.plan_from(from)?,
            None => self.plan_values(stmt)?,
        };

        if let Some(selection) = &stmt.selection {
            plan = self.wrap_filter(plan, selection.clone())?;
        }

        let (aggregates, plain_items) = split_aggregates(&stmt.projection, stmt)?;
        let mut order_keys = stmt.order_by.clone();
        if !aggregates.is_empty() || !stmt.group_by.is_empty() {
            plan = self.wrap_aggregate(plan, stmt, aggregates.clone())?;
            // Above the aggregate, references to aggregate expressions
            // resolve through their output columns.
            if let Some(having) = &stmt.having {
                let rewritten = replace_agg_refs(having, &aggregates);
                plan = self.wrap_filter(plan, rewritten)?;
            }
            for key in &mut order_keys {
                key.expr = replace_agg_refs(&key.expr, &aggregates);
            }
            // Restore the projection's column order over the aggregate
            // output (group keys come first inside the aggregate itself).
            let items = projection_over_aggregate(&stmt.projection, &aggregates);
            plan = self.wrap_project(plan, items)?;
        } else if !matches!(stmt.projection.as_slice(), [SelectItem::Wildcard]) {
            plan = self.wrap_project(plan, plain_items)?;
        }

        if stmt.distinct {
            plan = self.wrap_distinct(plan);
        }
        if !order_keys.is_empty() {
            let schema = plan.schema().clone();
            let est_rows = plan.est_rows();
            plan = LogicalPlan::Sort {
                input: Box::new(plan),
                keys: order_keys,
                schema,
                est_rows,
            };
        }
        if stmt.limit.is_some() || stmt.offset.is_some() {
            let schema = plan.schema().clone();
            let est_rows = stmt
                .limit
                .map(|l| (l as f64).min(plan.est_rows()))
                .unwrap_or_else(|| plan.est_rows());
            plan = LogicalPlan::Limit {
                input: Box::new(plan),
                limit: stmt.limit,
                offset: stmt.offset,
                schema,
                est_rows,
            };
        }
        Ok(plan)
    }

    fn plan_values(&self, stmt: &SelectStmt) -> Result<LogicalPlan> {
        // SELECT without FROM: one synthetic row, projection evaluated over it.
        let mut items = Vec::new();
        for item in &stmt.projection {
            match item {
                SelectItem::Wildcard => {
                    return Err(Error::Syntax("SELECT * requires a FROM clause".into()))
                }
                SelectItem::Expr { expr, alias } => items.push((
                    expr.clone(),
                    alias.clone().unwrap_or_else(|| output_name(expr)),
                )),
            }
        }
        let schema: Schema = items
            .iter()
            .map(|(e, name)| ColumnDescriptor::new(name.clone(), infer_type(e, &Schema::new())))
            .collect();
        Ok(LogicalPlan::Values {
            rows: vec![items.into_iter().map(|(e, _)| e).collect()],
            schema,
        })
    }

    fn plan_from(&self, from: &FromClause) -> Result<LogicalPlan> {
        let qualify = !from.joins.is_empty();
        let mut plan = self.plan_scan(&from.base, qualify)?;
        for join in &from.joins {
            let right = self.plan_scan(&join.relation, qualify)?;
            let mut schema = plan.schema().clone();
            schema.extend(right.schema().iter().cloned());
            let est_rows = self.stats.join_rows(
                plan.est_rows(),
                right.est_rows(),
                join_key_column(join.on.as_ref(), plan.schema()),
                join_key_column(join.on.as_ref(), right.schema()),
            );
            plan = LogicalPlan::Join {
                left: Box::new(plan),
                right: Box::new(right),
                kind: join.kind,
                on: join.on.clone(),
                schema,
                est_rows,
            };
        }
        Ok(plan)
    }

    fn plan_scan(&self, table_ref: &TableRef, qualify: bool) -> Result<LogicalPlan> {
        let desc = self.table(&table_ref.name)?;
        let binding = table_ref.binding().to_string();
        let schema: Schema = desc
            .columns
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if qualify {
                    c.name = format!("{binding}.{}", c.name);
                }
                c
            })
            .collect();
        Ok(LogicalPlan::Scan {
            table: table_ref.name.clone(),
            binding,
            qualify,
            projection: None,
            filter: None,
            est_rows: self.stats.table_rows(&table_ref.name),
            schema,
        })
    }

    fn wrap_filter(&self, plan: LogicalPlan, predicate: Expr) -> Result<LogicalPlan> {
        // A MATCH conjunct over a single table becomes a full-text scan.
        if let LogicalPlan::Scan {
            table,
            schema,
            est_rows,
            ..
        } = &plan
        {
            let mut factors = Vec::new();
            predicate.clone().split_conjunction(&mut factors);
            if let Some(pos) = factors
                .iter()
                .position(|f| matches!(f, Expr::Match { .. }))
            {
                let matched = factors.remove(pos);
                if let Expr::Match { columns, query } = matched {
                    let desc = self.table(table)?;
                    for c in &columns {
                        if !desc.fulltext.contains(c) {
                            return Err(Error::Unsupported(format!(
                                "column '{c}' has no FULLTEXT index"
                            )));
                        }
                    }
                    return Ok(LogicalPlan::FtsScan {
                        table: table.clone(),
                        columns,
                        query,
                        residual: Expr::conjoin(factors),
                        schema: schema.clone(),
                        est_rows: (est_rows * 0.1).max(1.0),
                    });
                }
            }
        }

        if expr_contains_match(&predicate) {
            return Err(Error::Unsupported(
                "MATCH ... AGAINST applies to single-table queries".into(),
            ));
        }

        let mut tables = Vec::new();
        plan.source_tables(&mut tables);
        let selectivity = match tables.first() {
            Some(t) if tables.len() == 1 => self.stats.selectivity(t, &predicate),
            _ => crate::optimizer::stats::DEFAULT_SELECTIVITY,
        };
        let schema = plan.schema().clone();
        let est_rows = (plan.est_rows() * selectivity).max(1.0);
        Ok(LogicalPlan::Filter {
            input: Box::new(plan),
            predicate,
            schema,
            est_rows,
        })
    }

    fn wrap_project(&self, plan: LogicalPlan, items: Vec<(Expr, String)>) -> Result<LogicalPlan> {
        let input_schema = plan.schema().clone();
        let schema: Schema = items
            .iter()
            .map(|(e, name)| ColumnDescriptor::new(name.clone(), infer_type(e, &input_schema)))
            .collect();
        let est_rows = plan.est_rows();
        Ok(LogicalPlan::Project {
            input: Box::new(plan),
            items,
            schema,
            est_rows,
        })
    }

    fn wrap_aggregate(
        &self,
        plan: LogicalPlan,
        stmt: &SelectStmt,
        aggregates: Vec<AggExpr>,
    ) -> Result<LogicalPlan> {
        let input_schema = plan.schema().clone();
        let mut schema: Schema = stmt
            .group_by
            .iter()
            .map(|e| ColumnDescriptor::new(output_name(e), infer_type(e, &input_schema)))
            .collect();
        for agg in &aggregates {
            let ty = match agg.func {
                AggFunc::Count => SemanticType::Int,
                AggFunc::Sum | AggFunc::Avg => SemanticType::Float,
                AggFunc::Min | AggFunc::Max => agg
                    .arg
                    .as_ref()
                    .map(|a| infer_type(a, &input_schema))
                    .unwrap_or(SemanticType::Float),
            };
            schema.push(ColumnDescriptor::new(agg.alias.clone(), ty));
        }
        let mut tables = Vec::new();
        plan.source_tables(&mut tables);
        let est_rows = self.stats.group_rows(
            tables.first().map(String::as_str).filter(|_| tables.len() == 1),
            &stmt.group_by,
            plan.est_rows(),
        );
        Ok(LogicalPlan::Aggregate {
            input: Box::new(plan),
            group_by: stmt.group_by.clone(),
            aggregates,
            schema,
            est_rows,
        })
    }

    fn wrap_distinct(&self, plan: LogicalPlan) -> LogicalPlan {
        let schema = plan.schema().clone();
        let group_by: Vec<Expr> = schema.iter().map(|c| Expr::column(c.name.clone())).collect();
        let est_rows = plan.est_rows();
        LogicalPlan::Aggregate {
            input: Box::new(plan),
            group_by,
            aggregates: vec![],
            schema,
            est_rows,
        }
    }
}

/// Key column `(table, column)` for join cardinality when the ON clause is a
/// simple equality and one side belongs to the given schema.
fn join_key_column<'a>(
    on: Option<&'a Expr>,
    schema: &Schema,
) -> Option<(&'a str, &'a str)> {
    if let Some(Expr::Binary { left, op, right }) = on {
        if *op == crate::sql::ast::BinOp::Eq {
            for side in [left.as_ref(), right.as_ref()] {
                if let Expr::Column {
                    table: Some(t),
                    name,
                } = side
                {
                    let qualified = format!("{t}.{name}");
                    if schema.iter().any(|c| c.name == qualified) {
                        return Some((t.as_str(), name.as_str()));
                    }
                }
            }
        }
    }
    None
}

fn expr_contains_match(expr: &Expr) -> bool {
    match expr {
        Expr::Match { .. } => true,
        Expr::Binary { left, right, .. } => {
            expr_contains_match(left) || expr_contains_match(right)
        }
        Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr_contains_match(expr),
        _ => false,
    }
}

/// Replace aggregate function calls with references to their aggregate
/// output columns; used for HAVING and ORDER BY above an aggregate.
fn replace_agg_refs(expr: &Expr, aggregates: &[AggExpr]) -> Expr {
    if let Expr::Function {
        name,
        args,
        wildcard,
    } = expr
    {
        if let Some(func) = AggFunc::parse(name) {
            let arg = if *wildcard { None } else { args.first().cloned() };
            if let Some(a) = aggregates.iter().find(|a| a.func == func && a.arg == arg) {
                return Expr::column(a.alias.clone());
            }
        }
    }
    match expr {
        Expr::Binary { left, op, right } => Expr::Binary {
            left: Box::new(replace_agg_refs(left, aggregates)),
            op: *op,
            right: Box::new(replace_agg_refs(right, aggregates)),
        },
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(replace_agg_refs(expr, aggregates)),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(replace_agg_refs(expr, aggregates)),
            negated: *negated,
        },
        other => other.clone(),
    }
}

/// Projection items re-established over the aggregate's output schema.
fn projection_over_aggregate(
    projection: &[SelectItem],
    aggregates: &[AggExpr],
) -> Vec<(Expr, String)> {
    let mut items = Vec::new();
    for item in projection {
        match item {
            SelectItem::Wildcard => {}
            SelectItem::Expr { expr, alias } => {
                let rewritten = replace_agg_refs(expr, aggregates);
                let name = alias.clone().unwrap_or_else(|| output_name(expr));
                // Anything that is not already a plain reference resolves
                // through the aggregate's output column of the same name.
                let resolved = match rewritten {
                    resolved @ (Expr::Column { .. } | Expr::Literal(_)) => resolved,
                    _ => Expr::column(output_name(expr)),
                };
                items.push((resolved, name));
            }
        }
    }
    items
}

/// Partition projection items into aggregates and plain expressions.
fn split_aggregates(
    projection: &[SelectItem],
    stmt: &SelectStmt,
) -> Result<(Vec<AggExpr>, Vec<(Expr, String)>)> {
    let mut aggregates = Vec::new();
    let mut plain = Vec::new();
    for item in projection {
        match item {
            SelectItem::Wildcard => {}
            SelectItem::Expr { expr, alias } => {
                if let Expr::Function {
                    name,
                    args,
                    wildcard,
                } = expr
                {
                    if let Some(func) = AggFunc::parse(name) {
                        let arg = if *wildcard { None } else { args.first().cloned() };
                        if func != AggFunc::Count && arg.is_none() {
                            return Err(Error::Syntax(format!("{name}() requires an argument")));
                        }
                        aggregates.push(AggExpr {
                            func,
                            arg,
                            alias: alias.clone().unwrap_or_else(|| expr.to_string()),
                        });
                        continue;
                    }
                }
                plain.push((
                    expr.clone(),
                    alias.clone().unwrap_or_else(|| output_name(expr)),
                ));
            }
        }
    }
    if !aggregates.is_empty() {
        // Plain items must be group-by expressions.
        for (expr, _) in &plain {
            if !stmt.group_by.contains(expr) {
                return Err(Error::Syntax(format!(
                    "'{expr}' must appear in GROUP BY or an aggregate"
                )));
            }
        }
    }
    Ok((aggregates, plain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::parse::parse;
    use crate::sql::ast::Statement;
    use crate::storage::schema::{PersistencePolicy, TableEngine, DEFAULT_DATABASE};

    fn planner() -> LogicalPlanner {
        let catalog = Arc::new(Catalog::new());
        let desc = TableDescriptor {
            name: "users".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".into(),
                    data_type: SemanticType::Int,
                    nullable: false,
                    primary_key: true,
                    auto_increment: false,
                    default: None,
                },
                ColumnDescriptor::new("name", SemanticType::String),
                ColumnDescriptor::new("age", SemanticType::Int),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
            persistence: PersistencePolicy::MemoryOnly,
            engine: TableEngine::Hybrid,
            fulltext: vec![],
        };
        catalog.register_table(DEFAULT_DATABASE, desc).unwrap();
        LogicalPlanner::new(catalog, Arc::new(StatisticsCache::new()), DEFAULT_DATABASE.into())
    }

    fn select(sql: &str) -> SelectStmt {
        match parse(sql).unwrap() {
            Statement::Select(s) => s,
            other => panic!("expected select: {other:?}"),
        }
    }

    #[test]
    fn test_plan_select_filter_project() {
        let p = planner();
        let plan = p.plan(&select("SELECT id, name FROM users WHERE id > 1")).unwrap();
        match &plan {
            LogicalPlan::Project { input, schema, .. } => {
                assert_eq!(schema.len(), 2);
                assert_eq!(schema[0].name, "id");
                assert!(matches!(input.as_ref(), LogicalPlan::Filter { .. }));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_plan_wildcard_has_no_project() {
        let p = planner();
        let plan = p.plan(&select("SELECT * FROM users")).unwrap();
        assert!(matches!(plan, LogicalPlan::Scan { .. }));
        assert_eq!(plan.schema().len(), 3);
    }

    #[test]
    fn test_plan_aggregate_schema() {
        let p = planner();
        let plan = p
            .plan(&select("SELECT age, COUNT(*) FROM users GROUP BY age"))
            .unwrap();
        // A projection above the aggregate restores the SELECT column order.
        let (outer_schema, input) = match &plan {
            LogicalPlan::Project { schema, input, .. } => (schema, input.as_ref()),
            other => panic!("unexpected plan {other:?}"),
        };
        assert_eq!(outer_schema.len(), 2);
        assert_eq!(outer_schema[0].name, "age");
        match input {
            LogicalPlan::Aggregate {
                group_by,
                aggregates,
                schema,
                ..
            } => {
                assert_eq!(group_by.len(), 1);
                assert_eq!(aggregates.len(), 1);
                assert_eq!(aggregates[0].func, AggFunc::Count);
                assert_eq!(schema.len(), 2);
                assert_eq!(schema[1].data_type, SemanticType::Int);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_projection_order_restored_over_aggregate() {
        let p = planner();
        let plan = p
            .plan(&select("SELECT COUNT(*) AS n, age FROM users GROUP BY age"))
            .unwrap();
        match &plan {
            LogicalPlan::Project { schema, .. } => {
                assert_eq!(schema[0].name, "n");
                assert_eq!(schema[1].name, "age");
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_plain_item_must_be_grouped() {
        let p = planner();
        let err = p
            .plan(&select("SELECT name, COUNT(*) FROM users GROUP BY age"))
            .unwrap_err();
        assert!(matches!(err, Error::Syntax(_)));
    }

    #[test]
    fn test_unknown_table_errors() {
        let p = planner();
        let err = p.plan(&select("SELECT * FROM missing")).unwrap_err();
        assert!(matches!(err, Error::TableNotFound(_)));
    }

    #[test]
    fn test_order_and_limit_nodes() {
        let p = planner();
        let plan = p
            .plan(&select("SELECT * FROM users ORDER BY id DESC LIMIT 5 OFFSET 2"))
            .unwrap();
        match plan {
            LogicalPlan::Limit { limit, offset, input, .. } => {
                assert_eq!(limit, Some(5));
                assert_eq!(offset, Some(2));
                assert!(matches!(input.as_ref(), LogicalPlan::Sort { .. }));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_join_schema_is_qualified() {
        let p = planner();
        let plan = p
            .plan(&select("SELECT * FROM users u JOIN users v ON u.id = v.id"))
            .unwrap();
        match &plan {
            LogicalPlan::Join { schema, .. } => {
                assert_eq!(schema.len(), 6);
                assert!(schema.iter().any(|c| c.name == "u.id"));
                assert!(schema.iter().any(|c| c.name == "v.id"));
            }
            other => panic!("unexpected plan {other:?}"),
        }
    }

    #[test]
    fn test_select_without_from() {
        let p = planner();
        let plan = p.plan(&select("SELECT 1 + 1")).unwrap();
        assert!(matches!(plan, LogicalPlan::Values { .. }));
    }
}
