//! Normalized statement tree
//!
//! The planner consumes this tree, never the raw parser output. The adapter
//! in `sql::parse` lowers the external parser's AST into these types, so the
//! rest of the system is insulated from the parser's surface.

use crate::storage::schema::{ColumnDescriptor, IndexDescriptor, PersistencePolicy};
use crate::storage::value::Value;

/// A normalized SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    CreateTable(CreateTableStmt),
    DropTable { name: String, if_exists: bool },
    CreateIndex(CreateIndexStmt),
    Set { name: String, value: Value },
    Show(ShowKind),
    Use(String),
    Begin,
    Commit,
    Rollback,
    Explain(Box<SelectStmt>),
    Analyze { table: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShowKind {
    Databases,
    Tables,
    Variables,
}

/// SELECT, normalized: join chains flattened under `from`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectStmt {
    pub distinct: bool,
    pub projection: Vec<SelectItem>,
    pub from: Option<FromClause>,
    pub selection: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Additional UNION branches; the flag is true for UNION ALL.
    pub unions: Vec<(SelectStmt, bool)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FromClause {
    pub base: TableRef,
    pub joins: Vec<JoinClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// Name the rest of the query refers to this relation by.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Cross,
    /// Produced by subquery unnesting; never parsed directly.
    Semi,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub relation: TableRef,
    pub kind: JoinKind,
    pub on: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub asc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertStmt {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStmt {
    pub table: String,
    pub assignments: Vec<(String, Expr)>,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteStmt {
    pub table: String,
    pub selection: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTableStmt {
    pub name: String,
    pub if_not_exists: bool,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: Vec<String>,
    pub fulltext: Vec<String>,
    pub persistence: Option<PersistencePolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexStmt {
    pub table: String,
    pub index: IndexDescriptor,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::NotEq => "<>",
            BinOp::Lt => "<",
            BinOp::LtEq => "<=",
            BinOp::Gt => ">",
            BinOp::GtEq => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Plus => "+",
            BinOp::Minus => "-",
            BinOp::Multiply => "*",
            BinOp::Divide => "/",
            BinOp::Modulo => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Normalized expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference, optionally qualified by a table binding.
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Value),
    /// Positional prepared-statement parameter.
    Placeholder(usize),
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<SelectStmt>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    Function {
        name: String,
        args: Vec<Expr>,
        /// COUNT(*) and friends.
        wildcard: bool,
    },
    /// MATCH(col, ...) AGAINST ('query') full-text predicate.
    Match {
        columns: Vec<String>,
        query: String,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Expr {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Column names referenced anywhere in this expression.
    pub fn referenced_columns(&self, out: &mut Vec<String>) {
        match self {
            Expr::Column { table, name } => {
                let full = match table {
                    Some(t) => format!("{t}.{name}"),
                    None => name.clone(),
                };
                if !out.contains(&full) {
                    out.push(full);
                }
            }
            Expr::Literal(_) | Expr::Placeholder(_) => {}
            Expr::Binary { left, right, .. } => {
                left.referenced_columns(out);
                right.referenced_columns(out);
            }
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.referenced_columns(out),
            Expr::InList { expr, list, .. } => {
                expr.referenced_columns(out);
                for e in list {
                    e.referenced_columns(out);
                }
            }
            Expr::InSubquery { expr, .. } => expr.referenced_columns(out),
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.referenced_columns(out);
                low.referenced_columns(out);
                high.referenced_columns(out);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.referenced_columns(out);
                pattern.referenced_columns(out);
            }
            Expr::Function { args, .. } => {
                for a in args {
                    a.referenced_columns(out);
                }
            }
            Expr::Match { columns, .. } => {
                for c in columns {
                    if !out.contains(c) {
                        out.push(c.clone());
                    }
                }
            }
        }
    }

    /// True when every leaf is a literal.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::Column { .. } | Expr::Placeholder(_) | Expr::Match { .. } => false,
            Expr::Binary { left, right, .. } => left.is_constant() && right.is_constant(),
            Expr::Unary { expr, .. } | Expr::IsNull { expr, .. } => expr.is_constant(),
            Expr::InList { expr, list, .. } => {
                expr.is_constant() && list.iter().all(Expr::is_constant)
            }
            Expr::InSubquery { .. } => false,
            Expr::Between {
                expr, low, high, ..
            } => expr.is_constant() && low.is_constant() && high.is_constant(),
            Expr::Like { expr, pattern, .. } => expr.is_constant() && pattern.is_constant(),
            Expr::Function { .. } => false,
        }
    }

    /// Split a conjunction into its factors.
    pub fn split_conjunction(self, out: &mut Vec<Expr>) {
        match self {
            Expr::Binary {
                left,
                op: BinOp::And,
                right,
            } => {
                left.split_conjunction(out);
                right.split_conjunction(out);
            }
            other => out.push(other),
        }
    }

    /// Rebuild a conjunction from factors.
    pub fn conjoin(mut factors: Vec<Expr>) -> Option<Expr> {
        let first = if factors.is_empty() {
            return None;
        } else {
            factors.remove(0)
        };
        Some(factors.into_iter().fold(first, |acc, f| {
            Expr::binary(acc, BinOp::And, f)
        }))
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Column { table: Some(t), name } => write!(f, "{t}.{name}"),
            Expr::Column { table: None, name } => write!(f, "{name}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Placeholder(_) => write!(f, "?"),
            Expr::Binary { left, op, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Unary { op: UnaryOp::Not, expr } => write!(f, "(NOT {expr})"),
            Expr::Unary { op: UnaryOp::Neg, expr } => write!(f, "(-{expr})"),
            Expr::IsNull { expr, negated } => {
                write!(f, "({expr} IS {}NULL)", if *negated { "NOT " } else { "" })
            }
            Expr::InList { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(|e| e.to_string()).collect();
                write!(
                    f,
                    "({expr} {}IN ({}))",
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::InSubquery { expr, negated, .. } => {
                write!(f, "({expr} {}IN (<subquery>))", if *negated { "NOT " } else { "" })
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => write!(
                f,
                "({expr} {}BETWEEN {low} AND {high})",
                if *negated { "NOT " } else { "" }
            ),
            Expr::Like {
                expr,
                pattern,
                negated,
            } => write!(f, "({expr} {}LIKE {pattern})", if *negated { "NOT " } else { "" }),
            Expr::Function { name, args, wildcard } => {
                if *wildcard {
                    write!(f, "{name}(*)")
                } else {
                    let items: Vec<String> = args.iter().map(|e| e.to_string()).collect();
                    write!(f, "{name}({})", items.join(", "))
                }
            }
            Expr::Match { columns, query } => {
                write!(f, "MATCH({}) AGAINST ('{}')", columns.join(", "), query)
            }
        }
    }
}

impl std::fmt::Display for SelectStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SELECT ")?;
        if self.distinct {
            write!(f, "DISTINCT ")?;
        }
        let items: Vec<String> = self
            .projection
            .iter()
            .map(|item| match item {
                SelectItem::Wildcard => "*".to_string(),
                SelectItem::Expr { expr, alias: Some(a) } => format!("{expr} AS {a}"),
                SelectItem::Expr { expr, alias: None } => expr.to_string(),
            })
            .collect();
        write!(f, "{}", items.join(", "))?;
        if let Some(from) = &self.from {
            write!(f, " FROM {}", from.base.name)?;
            if let Some(a) = &from.base.alias {
                write!(f, " AS {a}")?;
            }
            for j in &from.joins {
                let kw = match j.kind {
                    JoinKind::Inner | JoinKind::Semi => "JOIN",
                    JoinKind::Left => "LEFT JOIN",
                    JoinKind::Right => "RIGHT JOIN",
                    JoinKind::Cross => "CROSS JOIN",
                };
                write!(f, " {kw} {}", j.relation.name)?;
                if let Some(a) = &j.relation.alias {
                    write!(f, " AS {a}")?;
                }
                if let Some(on) = &j.on {
                    write!(f, " ON {on}")?;
                }
            }
        }
        if let Some(sel) = &self.selection {
            write!(f, " WHERE {sel}")?;
        }
        if !self.group_by.is_empty() {
            let items: Vec<String> = self.group_by.iter().map(|e| e.to_string()).collect();
            write!(f, " GROUP BY {}", items.join(", "))?;
        }
        if let Some(h) = &self.having {
            write!(f, " HAVING {h}")?;
        }
        if !self.order_by.is_empty() {
            let items: Vec<String> = self
                .order_by
                .iter()
                .map(|o| format!("{}{}", o.expr, if o.asc { "" } else { " DESC" }))
                .collect();
            write!(f, " ORDER BY {}", items.join(", "))?;
        }
        if let Some(l) = self.limit {
            write!(f, " LIMIT {l}")?;
        }
        if let Some(o) = self.offset {
            write!(f, " OFFSET {o}")?;
        }
        for (branch, all) in &self.unions {
            write!(f, " UNION {}{branch}", if *all { "ALL " } else { "" })?;
        }
        Ok(())
    }
}

/// Classification used by the dispatcher for logging and cache decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    Select,
    Dml,
    Ddl,
    Set,
    Show,
    Use,
    Txn,
    Other,
}

impl Statement {
    pub fn class(&self) -> StatementClass {
        match self {
            Statement::Select(_) | Statement::Explain(_) => StatementClass::Select,
            Statement::Insert(_) | Statement::Update(_) | Statement::Delete(_) => {
                StatementClass::Dml
            }
            Statement::CreateTable(_)
            | Statement::DropTable { .. }
            | Statement::CreateIndex(_)
            | Statement::Analyze { .. } => StatementClass::Ddl,
            Statement::Set { .. } => StatementClass::Set,
            Statement::Show(_) => StatementClass::Show,
            Statement::Use(_) => StatementClass::Use,
            Statement::Begin | Statement::Commit | Statement::Rollback => StatementClass::Txn,
            Statement::Ping => StatementClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_conjoin() {
        let e = Expr::binary(
            Expr::binary(Expr::column("a"), BinOp::Gt, Expr::Literal(Value::Int(1))),
            BinOp::And,
            Expr::binary(Expr::column("b"), BinOp::Eq, Expr::Literal(Value::Int(2))),
        );
        let mut parts = Vec::new();
        e.clone().split_conjunction(&mut parts);
        assert_eq!(parts.len(), 2);
        let rebuilt = Expr::conjoin(parts).unwrap();
        assert_eq!(rebuilt, e);
    }

    #[test]
    fn test_referenced_columns_dedup() {
        let e = Expr::binary(
            Expr::binary(Expr::column("a"), BinOp::Plus, Expr::column("a")),
            BinOp::Gt,
            Expr::column("b"),
        );
        let mut cols = Vec::new();
        e.referenced_columns(&mut cols);
        assert_eq!(cols, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_display_select() {
        let stmt = SelectStmt {
            projection: vec![
                SelectItem::Expr {
                    expr: Expr::column("id"),
                    alias: None,
                },
                SelectItem::Expr {
                    expr: Expr::column("name"),
                    alias: None,
                },
            ],
            from: Some(FromClause {
                base: TableRef {
                    name: "users".to_string(),
                    alias: None,
                },
                joins: vec![],
            }),
            selection: Some(Expr::binary(
                Expr::column("id"),
                BinOp::Gt,
                Expr::Literal(Value::Int(1)),
            )),
            ..Default::default()
        };
        assert_eq!(stmt.to_string(), "SELECT id, name FROM users WHERE (id > 1)");
    }
}
