//! Parse adapter
//!
//! SQL text goes through the external parser (`sqlparser`, MySQL dialect)
//! and is lowered into the normalized tree in `sql::ast`. A handful of
//! session statements (USE, SET, SHOW, transaction control, ANALYZE) are
//! recognized up front from the raw text; clients emit many dialect-specific
//! spellings of these that are not worth routing through the full grammar.

use sqlparser::ast as sp;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::error::{Error, Result};
use crate::sql::ast::{
    BinOp, CreateIndexStmt, CreateTableStmt, DeleteStmt, Expr, FromClause, InsertStmt,
    JoinClause, JoinKind, OrderItem, SelectItem, SelectStmt, ShowKind, Statement, TableRef,
    UnaryOp, UpdateStmt,
};
use crate::storage::schema::{
    ColumnDescriptor, IndexDescriptor, IndexKind, SemanticType,
};
use crate::storage::value::Value;

/// Parse one SQL statement into the normalized tree.
pub fn parse(sql: &str) -> Result<Statement> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(Error::Syntax("empty query".into()));
    }

    if let Some(stmt) = parse_session_statement(trimmed)? {
        return Ok(stmt);
    }

    let mut statements = Parser::parse_sql(&MySqlDialect {}, trimmed)?;
    if statements.len() != 1 {
        return Err(Error::Unsupported(
            "multi-statement packets are not supported".into(),
        ));
    }
    let mut lowering = Lowering::default();
    lowering.lower_statement(statements.remove(0))
}

/// Fast-path recognition of session statements from raw text.
fn parse_session_statement(sql: &str) -> Result<Option<Statement>> {
    let upper = sql.to_uppercase();
    let word = |n: usize| upper.split_whitespace().nth(n).unwrap_or("");

    match word(0) {
        "USE" => {
            let db = sql
                .split_whitespace()
                .nth(1)
                .ok_or_else(|| Error::Syntax("USE requires a database name".into()))?;
            Ok(Some(Statement::Use(unquote_ident(db))))
        }
        "BEGIN" => Ok(Some(Statement::Begin)),
        "START" if word(1) == "TRANSACTION" => Ok(Some(Statement::Begin)),
        "COMMIT" => Ok(Some(Statement::Commit)),
        "ROLLBACK" => Ok(Some(Statement::Rollback)),
        "SHOW" => match word(1) {
            "DATABASES" | "SCHEMAS" => Ok(Some(Statement::Show(ShowKind::Databases))),
            "TABLES" => Ok(Some(Statement::Show(ShowKind::Tables))),
            "VARIABLES" => Ok(Some(Statement::Show(ShowKind::Variables))),
            other => Err(Error::Unsupported(format!("SHOW {other}"))),
        },
        "ANALYZE" if word(1) == "TABLE" => {
            let table = sql
                .split_whitespace()
                .nth(2)
                .ok_or_else(|| Error::Syntax("ANALYZE TABLE requires a table name".into()))?;
            Ok(Some(Statement::Analyze {
                table: unquote_ident(table),
            }))
        }
        "SET" => Ok(Some(parse_set(sql)?)),
        _ => Ok(None),
    }
}

/// `SET [SESSION|GLOBAL] name = value`, plus the `SET NAMES ...` family that
/// clients send on connect (accepted and recorded as plain variables).
fn parse_set(sql: &str) -> Result<Statement> {
    let rest = sql[3..].trim();
    let upper = rest.to_uppercase();
    if upper.starts_with("NAMES") || upper.starts_with("CHARACTER SET") {
        return Ok(Statement::Set {
            name: "names".to_string(),
            value: Value::Str(rest.split_whitespace().nth(1).unwrap_or("utf8mb4").to_string()),
        });
    }
    let rest = if upper.starts_with("SESSION ") || upper.starts_with("GLOBAL ") {
        rest.splitn(2, char::is_whitespace).nth(1).unwrap_or("").trim()
    } else {
        rest
    };
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| Error::Syntax("SET requires name = value".into()))?;
    let name = name.trim().trim_start_matches("@@").trim_start_matches('@');
    Ok(Statement::Set {
        name: unquote_ident(name.trim()),
        value: parse_literal_text(value.trim())?,
    })
}

fn parse_literal_text(text: &str) -> Result<Value> {
    if text.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("on") {
        return Ok(Value::Bool(true));
    }
    if text.eq_ignore_ascii_case("false") || text.eq_ignore_ascii_case("off") {
        return Ok(Value::Bool(false));
    }
    if (text.starts_with('\'') && text.ends_with('\'') && text.len() >= 2)
        || (text.starts_with('"') && text.ends_with('"') && text.len() >= 2)
    {
        return Ok(Value::Str(text[1..text.len() - 1].to_string()));
    }
    if text.starts_with('\'') || text.starts_with('"') {
        return Err(Error::Syntax(format!("unterminated string literal: {text}")));
    }
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    if let Ok(f) = text.parse::<f64>() {
        return Ok(Value::Float(f));
    }
    Ok(Value::Str(text.to_string()))
}

fn unquote_ident(s: &str) -> String {
    s.trim_matches('`').trim_matches('"').to_string()
}

/// Lowering context; assigns prepared-statement placeholder positions in
/// textual order.
#[derive(Default)]
struct Lowering {
    next_param: usize,
}

impl Lowering {
    fn lower_statement(&mut self, stmt: sp::Statement) -> Result<Statement> {
        match stmt {
            sp::Statement::Query(query) => Ok(Statement::Select(self.lower_query(*query)?)),
            sp::Statement::Insert(insert) => self.lower_insert(insert),
            sp::Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => self.lower_update(table, assignments, selection),
            sp::Statement::Delete(delete) => self.lower_delete(delete),
            sp::Statement::CreateTable(create) => self.lower_create_table(create),
            sp::Statement::Drop {
                object_type,
                if_exists,
                names,
                ..
            } => {
                if object_type != sp::ObjectType::Table {
                    return Err(Error::Unsupported(format!("DROP {object_type}")));
                }
                let name = names
                    .first()
                    .map(object_name)
                    .ok_or_else(|| Error::Syntax("DROP TABLE requires a name".into()))?;
                Ok(Statement::DropTable { name, if_exists })
            }
            sp::Statement::CreateIndex(create) => self.lower_create_index(create),
            sp::Statement::Explain { statement, .. } => match self.lower_statement(*statement)? {
                Statement::Select(select) => Ok(Statement::Explain(Box::new(select))),
                _ => Err(Error::Unsupported("EXPLAIN supports SELECT only".into())),
            },
            other => Err(Error::Unsupported(format!(
                "statement kind: {}",
                summarize(&other)
            ))),
        }
    }

    fn lower_query(&mut self, query: sp::Query) -> Result<SelectStmt> {
        let sp::Query {
            body,
            order_by,
            limit,
            offset,
            ..
        } = query;

        let mut stmt = self.lower_set_expr(*body)?;

        if let Some(ob) = order_by {
            for item in ob.exprs {
                stmt.order_by.push(OrderItem {
                    expr: self.lower_expr(item.expr)?,
                    asc: item.asc.unwrap_or(true),
                });
            }
        }
        if let Some(l) = limit {
            stmt.limit = Some(expr_to_u64(&self.lower_expr(l)?)?);
        }
        if let Some(o) = offset {
            stmt.offset = Some(expr_to_u64(&self.lower_expr(o.value)?)?);
        }
        Ok(stmt)
    }

    fn lower_set_expr(&mut self, body: sp::SetExpr) -> Result<SelectStmt> {
        match body {
            sp::SetExpr::Select(select) => self.lower_select(*select),
            sp::SetExpr::SetOperation {
                op: sp::SetOperator::Union,
                set_quantifier,
                left,
                right,
            } => {
                let all = matches!(set_quantifier, sp::SetQuantifier::All);
                let mut stmt = self.lower_set_expr(*left)?;
                let branch = self.lower_set_expr(*right)?;
                stmt.unions.push((branch, all));
                Ok(stmt)
            }
            other => Err(Error::Unsupported(format!(
                "query body: {}",
                summarize_set_expr(&other)
            ))),
        }
    }

    fn lower_select(&mut self, select: sp::Select) -> Result<SelectStmt> {
        let sp::Select {
            distinct,
            projection,
            from,
            selection,
            group_by,
            having,
            ..
        } = select;

        let mut items = Vec::new();
        for p in projection {
            items.push(match p {
                sp::SelectItem::Wildcard(_) => SelectItem::Wildcard,
                sp::SelectItem::QualifiedWildcard(..) => SelectItem::Wildcard,
                sp::SelectItem::UnnamedExpr(e) => SelectItem::Expr {
                    expr: self.lower_expr(e)?,
                    alias: None,
                },
                sp::SelectItem::ExprWithAlias { expr, alias } => SelectItem::Expr {
                    expr: self.lower_expr(expr)?,
                    alias: Some(alias.value),
                },
            });
        }

        let from_clause = self.lower_from(from)?;

        let group_exprs = match group_by {
            sp::GroupByExpr::Expressions(exprs, _) => exprs
                .into_iter()
                .map(|e| self.lower_expr(e))
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::Unsupported("GROUP BY ALL".into())),
        };

        Ok(SelectStmt {
            distinct: distinct.is_some(),
            projection: items,
            from: from_clause,
            selection: selection.map(|e| self.lower_expr(e)).transpose()?,
            group_by: group_exprs,
            having: having.map(|e| self.lower_expr(e)).transpose()?,
            order_by: vec![],
            limit: None,
            offset: None,
            unions: vec![],
        })
    }

    fn lower_from(&mut self, from: Vec<sp::TableWithJoins>) -> Result<Option<FromClause>> {
        let mut iter = from.into_iter();
        let first = match iter.next() {
            Some(f) => f,
            None => return Ok(None),
        };

        let base = table_ref(first.relation)?;
        let mut joins = Vec::new();
        for j in first.joins {
            joins.push(self.lower_join(j)?);
        }
        // Comma-separated FROM lists are implicit cross joins.
        for extra in iter {
            joins.push(JoinClause {
                relation: table_ref(extra.relation)?,
                kind: JoinKind::Cross,
                on: None,
            });
            for j in extra.joins {
                joins.push(self.lower_join(j)?);
            }
        }
        Ok(Some(FromClause { base, joins }))
    }

    fn lower_join(&mut self, join: sp::Join) -> Result<JoinClause> {
        let (kind, constraint) = match join.join_operator {
            sp::JoinOperator::Inner(c) => (JoinKind::Inner, Some(c)),
            sp::JoinOperator::LeftOuter(c) => (JoinKind::Left, Some(c)),
            sp::JoinOperator::RightOuter(c) => (JoinKind::Right, Some(c)),
            sp::JoinOperator::CrossJoin => (JoinKind::Cross, None),
            other => {
                return Err(Error::Unsupported(format!("join type: {other:?}")));
            }
        };
        let on = match constraint {
            Some(sp::JoinConstraint::On(e)) => Some(self.lower_expr(e)?),
            Some(sp::JoinConstraint::Using(cols)) => {
                // USING(a, b) becomes left.a = right.a AND left.b = right.b at
                // planning time; here it stays a bare column equality.
                let mut factors = Vec::new();
                for c in cols {
                    factors.push(Expr::binary(
                        Expr::column(c.value.clone()),
                        BinOp::Eq,
                        Expr::column(c.value),
                    ));
                }
                Expr::conjoin(factors)
            }
            Some(sp::JoinConstraint::None) | None => None,
            Some(sp::JoinConstraint::Natural) => {
                return Err(Error::Unsupported("NATURAL JOIN".into()));
            }
        };
        Ok(JoinClause {
            relation: table_ref(join.relation)?,
            kind,
            on,
        })
    }

    fn lower_insert(&mut self, insert: sp::Insert) -> Result<Statement> {
        let sp::Insert {
            table_name,
            columns,
            source,
            ..
        } = insert;
        let source = source.ok_or_else(|| Error::Unsupported("INSERT without VALUES".into()))?;
        let rows = match *source.body {
            sp::SetExpr::Values(values) => {
                let mut rows = Vec::new();
                for row in values.rows {
                    rows.push(
                        row.into_iter()
                            .map(|e| self.lower_expr(e))
                            .collect::<Result<Vec<_>>>()?,
                    );
                }
                rows
            }
            _ => return Err(Error::Unsupported("INSERT ... SELECT".into())),
        };
        Ok(Statement::Insert(InsertStmt {
            table: object_name(&table_name),
            columns: columns.into_iter().map(|c| c.value).collect(),
            rows,
        }))
    }

    fn lower_update(
        &mut self,
        table: sp::TableWithJoins,
        assignments: Vec<sp::Assignment>,
        selection: Option<sp::Expr>,
    ) -> Result<Statement> {
        let table = table_ref(table.relation)?;
        let mut pairs = Vec::new();
        for a in assignments {
            let column = match a.target {
                sp::AssignmentTarget::ColumnName(name) => {
                    name.0.last().map(|i| i.value.clone()).unwrap_or_default()
                }
                sp::AssignmentTarget::Tuple(_) => {
                    return Err(Error::Unsupported("tuple assignment".into()))
                }
            };
            pairs.push((column, self.lower_expr(a.value)?));
        }
        Ok(Statement::Update(UpdateStmt {
            table: table.name,
            assignments: pairs,
            selection: selection.map(|e| self.lower_expr(e)).transpose()?,
        }))
    }

    fn lower_delete(&mut self, delete: sp::Delete) -> Result<Statement> {
        let sp::Delete {
            from, selection, ..
        } = delete;
        let tables = match from {
            sp::FromTable::WithFromKeyword(t) | sp::FromTable::WithoutKeyword(t) => t,
        };
        let table = tables
            .into_iter()
            .next()
            .ok_or_else(|| Error::Syntax("DELETE requires a table".into()))?;
        let table = table_ref(table.relation)?;
        Ok(Statement::Delete(DeleteStmt {
            table: table.name,
            selection: selection.map(|e| self.lower_expr(e)).transpose()?,
        }))
    }

    fn lower_create_table(&mut self, create: sp::CreateTable) -> Result<Statement> {
        let sp::CreateTable {
            name,
            if_not_exists,
            columns,
            constraints,
            ..
        } = create;

        let mut descriptors = Vec::new();
        let mut primary_key = Vec::new();
        let mut fulltext = Vec::new();

        for col in columns {
            let col_name = col.name.value.clone();
            let mut desc = ColumnDescriptor::new(col_name.clone(), map_data_type(&col.data_type));
            for opt in &col.options {
                match &opt.option {
                    sp::ColumnOption::NotNull => desc.nullable = false,
                    sp::ColumnOption::Null => desc.nullable = true,
                    sp::ColumnOption::Unique { is_primary, .. } if *is_primary => {
                        desc.primary_key = true;
                        desc.nullable = false;
                        primary_key.push(col_name.clone());
                    }
                    sp::ColumnOption::Unique { .. } => {}
                    sp::ColumnOption::Default(e) => {
                        if let Ok(Expr::Literal(v)) = self.lower_expr(e.clone()) {
                            desc.default = Some(v);
                        }
                    }
                    sp::ColumnOption::DialectSpecific(tokens) => {
                        if tokens
                            .iter()
                            .any(|t| t.to_string().eq_ignore_ascii_case("AUTO_INCREMENT"))
                        {
                            desc.auto_increment = true;
                        }
                    }
                    _ => {}
                }
            }
            descriptors.push(desc);
        }

        for constraint in constraints {
            match constraint {
                sp::TableConstraint::PrimaryKey { columns, .. } => {
                    for c in columns {
                        let cname = c.value;
                        if let Some(d) = descriptors.iter_mut().find(|d| d.name == cname) {
                            d.primary_key = true;
                            d.nullable = false;
                        }
                        primary_key.push(cname);
                    }
                }
                sp::TableConstraint::FulltextOrSpatial {
                    fulltext: true,
                    columns,
                    ..
                } => {
                    fulltext.extend(columns.into_iter().map(|c| c.value));
                }
                _ => {}
            }
        }

        Ok(Statement::CreateTable(CreateTableStmt {
            name: object_name(&name),
            if_not_exists,
            columns: descriptors,
            primary_key,
            fulltext,
            persistence: None,
        }))
    }

    fn lower_create_index(&mut self, create: sp::CreateIndex) -> Result<Statement> {
        let sp::CreateIndex {
            name,
            table_name,
            columns,
            unique,
            ..
        } = create;
        let cols: Vec<String> = columns
            .into_iter()
            .map(|c| match c.expr {
                sp::Expr::Identifier(i) => Ok(i.value),
                other => Err(Error::Unsupported(format!("index expression: {other}"))),
            })
            .collect::<Result<Vec<_>>>()?;
        let index_name = name
            .as_ref()
            .map(object_name)
            .unwrap_or_else(|| format!("idx_{}", cols.join("_")));
        Ok(Statement::CreateIndex(CreateIndexStmt {
            table: object_name(&table_name),
            index: IndexDescriptor {
                name: index_name,
                columns: cols,
                unique,
                kind: IndexKind::Ordered,
            },
        }))
    }

    fn lower_expr(&mut self, expr: sp::Expr) -> Result<Expr> {
        match expr {
            sp::Expr::Identifier(i) => Ok(Expr::Column {
                table: None,
                name: i.value,
            }),
            sp::Expr::CompoundIdentifier(parts) => {
                let mut names: Vec<String> = parts.into_iter().map(|i| i.value).collect();
                let name = names.pop().unwrap_or_default();
                Ok(Expr::Column {
                    table: names.pop(),
                    name,
                })
            }
            sp::Expr::Value(v) => self.lower_value(v),
            sp::Expr::BinaryOp { left, op, right } => {
                let op = map_bin_op(&op)?;
                Ok(Expr::binary(self.lower_expr(*left)?, op, self.lower_expr(*right)?))
            }
            sp::Expr::UnaryOp { op, expr } => {
                let op = match op {
                    sp::UnaryOperator::Not => UnaryOp::Not,
                    sp::UnaryOperator::Minus => UnaryOp::Neg,
                    sp::UnaryOperator::Plus => return self.lower_expr(*expr),
                    other => {
                        return Err(Error::Unsupported(format!("unary operator {other}")))
                    }
                };
                Ok(Expr::Unary {
                    op,
                    expr: Box::new(self.lower_expr(*expr)?),
                })
            }
            sp::Expr::IsNull(e) => Ok(Expr::IsNull {
                expr: Box::new(self.lower_expr(*e)?),
                negated: false,
            }),
            sp::Expr::IsNotNull(e) => Ok(Expr::IsNull {
                expr: Box::new(self.lower_expr(*e)?),
                negated: true,
            }),
            sp::Expr::InList {
                expr,
                list,
                negated,
            } => Ok(Expr::InList {
                expr: Box::new(self.lower_expr(*expr)?),
                list: list
                    .into_iter()
                    .map(|e| self.lower_expr(e))
                    .collect::<Result<Vec<_>>>()?,
                negated,
            }),
            sp::Expr::InSubquery {
                expr,
                subquery,
                negated,
            } => Ok(Expr::InSubquery {
                expr: Box::new(self.lower_expr(*expr)?),
                subquery: Box::new(self.lower_query(*subquery)?),
                negated,
            }),
            sp::Expr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(Expr::Between {
                expr: Box::new(self.lower_expr(*expr)?),
                low: Box::new(self.lower_expr(*low)?),
                high: Box::new(self.lower_expr(*high)?),
                negated,
            }),
            sp::Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => Ok(Expr::Like {
                expr: Box::new(self.lower_expr(*expr)?),
                pattern: Box::new(self.lower_expr(*pattern)?),
                negated,
            }),
            sp::Expr::Nested(e) => self.lower_expr(*e),
            sp::Expr::Function(func) => self.lower_function(func),
            sp::Expr::MatchAgainst {
                columns,
                match_value,
                ..
            } => {
                let query = match match_value {
                    sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => s,
                    other => {
                        return Err(Error::Syntax(format!(
                            "MATCH ... AGAINST requires a string literal, got {other}"
                        )))
                    }
                };
                Ok(Expr::Match {
                    columns: columns.into_iter().map(|c| c.value).collect(),
                    query,
                })
            }
            other => Err(Error::Unsupported(format!("expression: {other}"))),
        }
    }

    fn lower_function(&mut self, func: sp::Function) -> Result<Expr> {
        let name = object_name(&func.name).to_uppercase();
        let mut args = Vec::new();
        let mut wildcard = false;
        match func.args {
            sp::FunctionArguments::None => {}
            sp::FunctionArguments::List(list) => {
                for arg in list.args {
                    match arg {
                        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Expr(e)) => {
                            args.push(self.lower_expr(e)?)
                        }
                        sp::FunctionArg::Unnamed(sp::FunctionArgExpr::Wildcard) => {
                            wildcard = true;
                        }
                        other => {
                            return Err(Error::Unsupported(format!("function argument {other}")))
                        }
                    }
                }
            }
            sp::FunctionArguments::Subquery(_) => {
                return Err(Error::Unsupported("subquery function arguments".into()))
            }
        }
        Ok(Expr::Function {
            name,
            args,
            wildcard,
        })
    }

    fn lower_value(&mut self, value: sp::Value) -> Result<Expr> {
        Ok(match value {
            sp::Value::Number(n, _) => {
                if let Ok(i) = n.parse::<i64>() {
                    Expr::Literal(Value::Int(i))
                } else if let Ok(u) = n.parse::<u64>() {
                    Expr::Literal(Value::Uint(u))
                } else {
                    let f = n
                        .parse::<f64>()
                        .map_err(|_| Error::Syntax(format!("bad numeric literal: {n}")))?;
                    Expr::Literal(Value::Float(f))
                }
            }
            sp::Value::SingleQuotedString(s) | sp::Value::DoubleQuotedString(s) => {
                Expr::Literal(Value::Str(s))
            }
            sp::Value::HexStringLiteral(s) => {
                let bytes = (0..s.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&s[i..(i + 2).min(s.len())], 16))
                    .collect::<std::result::Result<Vec<u8>, _>>()
                    .map_err(|_| Error::Syntax(format!("bad hex literal: {s}")))?;
                Expr::Literal(Value::Bytes(bytes))
            }
            sp::Value::Boolean(b) => Expr::Literal(Value::Bool(b)),
            sp::Value::Null => Expr::Literal(Value::Null),
            sp::Value::Placeholder(_) => {
                let idx = self.next_param;
                self.next_param += 1;
                Expr::Placeholder(idx)
            }
            other => return Err(Error::Unsupported(format!("literal: {other}"))),
        })
    }
}

fn table_ref(factor: sp::TableFactor) -> Result<TableRef> {
    match factor {
        sp::TableFactor::Table { name, alias, .. } => Ok(TableRef {
            name: object_name(&name),
            alias: alias.map(|a| a.name.value),
        }),
        other => Err(Error::Unsupported(format!("table factor: {other}"))),
    }
}

fn object_name(name: &sp::ObjectName) -> String {
    name.0
        .last()
        .map(|i| i.value.clone())
        .unwrap_or_default()
}

fn map_bin_op(op: &sp::BinaryOperator) -> Result<BinOp> {
    Ok(match op {
        sp::BinaryOperator::Eq => BinOp::Eq,
        sp::BinaryOperator::NotEq => BinOp::NotEq,
        sp::BinaryOperator::Lt => BinOp::Lt,
        sp::BinaryOperator::LtEq => BinOp::LtEq,
        sp::BinaryOperator::Gt => BinOp::Gt,
        sp::BinaryOperator::GtEq => BinOp::GtEq,
        sp::BinaryOperator::And => BinOp::And,
        sp::BinaryOperator::Or => BinOp::Or,
        sp::BinaryOperator::Plus => BinOp::Plus,
        sp::BinaryOperator::Minus => BinOp::Minus,
        sp::BinaryOperator::Multiply => BinOp::Multiply,
        sp::BinaryOperator::Divide => BinOp::Divide,
        sp::BinaryOperator::Modulo => BinOp::Modulo,
        other => return Err(Error::Unsupported(format!("operator {other}"))),
    })
}

/// Map parser data types by their rendered keyword; keeps the adapter
/// insulated from variant churn in the external parser.
fn map_data_type(dt: &sp::DataType) -> SemanticType {
    let rendered = dt.to_string().to_uppercase();
    let unsigned = rendered.contains("UNSIGNED");
    if rendered.starts_with("TINYINT(1)") || rendered.starts_with("BOOL") {
        SemanticType::Bool
    } else if rendered.starts_with("INT")
        || rendered.starts_with("BIGINT")
        || rendered.starts_with("SMALLINT")
        || rendered.starts_with("TINYINT")
        || rendered.starts_with("MEDIUMINT")
    {
        if unsigned {
            SemanticType::Uint
        } else {
            SemanticType::Int
        }
    } else if rendered.starts_with("FLOAT")
        || rendered.starts_with("DOUBLE")
        || rendered.starts_with("REAL")
        || rendered.starts_with("DECIMAL")
        || rendered.starts_with("NUMERIC")
    {
        SemanticType::Float
    } else if rendered.starts_with("BLOB")
        || rendered.starts_with("BINARY")
        || rendered.starts_with("VARBINARY")
        || rendered.starts_with("BYTEA")
    {
        SemanticType::Bytes
    } else if rendered.starts_with("TIMESTAMP")
        || rendered.starts_with("DATETIME")
        || rendered.starts_with("DATE")
        || rendered.starts_with("TIME")
    {
        SemanticType::Time
    } else if rendered.starts_with("JSON") {
        SemanticType::Json
    } else {
        SemanticType::String
    }
}

fn expr_to_u64(expr: &Expr) -> Result<u64> {
    match expr {
        Expr::Literal(Value::Int(i)) if *i >= 0 => Ok(*i as u64),
        Expr::Literal(Value::Uint(u)) => Ok(*u),
        other => Err(Error::Syntax(format!(
            "expected a non-negative integer, got {other}"
        ))),
    }
}

fn summarize(stmt: &sp::Statement) -> String {
    let text = stmt.to_string();
    text.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

fn summarize_set_expr(e: &sp::SetExpr) -> String {
    let text = e.to_string();
    text.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select_with_filter() {
        let stmt = parse("SELECT id, name FROM users WHERE id > 1").unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            other => panic!("expected select, got {other:?}"),
        };
        assert_eq!(select.projection.len(), 2);
        let from = select.from.unwrap();
        assert_eq!(from.base.name, "users");
        assert!(select.selection.is_some());
    }

    #[test]
    fn test_parse_join_chain() {
        let stmt =
            parse("SELECT * FROM a JOIN b ON a.k = b.k JOIN c ON b.k = c.k").unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => unreachable!(),
        };
        let from = select.from.unwrap();
        assert_eq!(from.joins.len(), 2);
        assert_eq!(from.joins[0].relation.name, "b");
        assert!(matches!(from.joins[0].kind, JoinKind::Inner));
    }

    #[test]
    fn test_parse_insert_multi_row() {
        let stmt = parse("INSERT INTO users VALUES (1,'Alice'),(2,'Bob')").unwrap();
        let insert = match stmt {
            Statement::Insert(i) => i,
            _ => unreachable!(),
        };
        assert_eq!(insert.table, "users");
        assert_eq!(insert.rows.len(), 2);
        assert_eq!(insert.rows[1][1], Expr::Literal(Value::Str("Bob".into())));
    }

    #[test]
    fn test_parse_create_table_with_pk() {
        let stmt = parse("CREATE TABLE users(id INT PRIMARY KEY, name VARCHAR(100))").unwrap();
        let create = match stmt {
            Statement::CreateTable(c) => c,
            _ => unreachable!(),
        };
        assert_eq!(create.primary_key, vec!["id".to_string()]);
        assert_eq!(create.columns[0].data_type, SemanticType::Int);
        assert!(!create.columns[0].nullable);
        assert_eq!(create.columns[1].data_type, SemanticType::String);
    }

    #[test]
    fn test_parse_session_statements() {
        assert_eq!(parse("USE shop").unwrap(), Statement::Use("shop".into()));
        assert_eq!(parse("BEGIN").unwrap(), Statement::Begin);
        assert_eq!(parse("start transaction").unwrap(), Statement::Begin);
        assert_eq!(
            parse("SHOW VARIABLES").unwrap(),
            Statement::Show(ShowKind::Variables)
        );
        assert_eq!(
            parse("SET max_rows = 100").unwrap(),
            Statement::Set {
                name: "max_rows".into(),
                value: Value::Int(100)
            }
        );
    }

    #[test]
    fn test_unmatched_quote_is_syntax_error() {
        let err = parse("SELECT * FROM users WHERE name = 'Alice").unwrap_err();
        assert!(matches!(err, Error::Syntax(_)));
        assert_eq!(err.mysql_code(), 1064);
    }

    #[test]
    fn test_empty_query_is_syntax_error() {
        assert!(matches!(parse("   "), Err(Error::Syntax(_))));
    }

    #[test]
    fn test_round_trip_via_pretty_print() {
        let original = match parse("SELECT id, name FROM users WHERE id > 1 ORDER BY id DESC LIMIT 5") {
            Ok(Statement::Select(s)) => s,
            other => panic!("{other:?}"),
        };
        let reparsed = match parse(&original.to_string()) {
            Ok(Statement::Select(s)) => s,
            other => panic!("{other:?}"),
        };
        assert_eq!(original.projection, reparsed.projection);
        assert_eq!(original.order_by, reparsed.order_by);
        assert_eq!(original.limit, reparsed.limit);
    }

    #[test]
    fn test_placeholders_numbered_in_order() {
        let stmt = parse("SELECT * FROM t WHERE a = ? AND b = ?").unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => unreachable!(),
        };
        let mut seen = Vec::new();
        fn walk(e: &Expr, seen: &mut Vec<usize>) {
            match e {
                Expr::Placeholder(i) => seen.push(*i),
                Expr::Binary { left, right, .. } => {
                    walk(left, seen);
                    walk(right, seen);
                }
                _ => {}
            }
        }
        walk(select.selection.as_ref().unwrap(), &mut seen);
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn test_match_against() {
        let stmt = parse("SELECT * FROM docs WHERE MATCH(body) AGAINST ('quick fox')").unwrap();
        let select = match stmt {
            Statement::Select(s) => s,
            _ => unreachable!(),
        };
        match select.selection.unwrap() {
            Expr::Match { columns, query } => {
                assert_eq!(columns, vec!["body".to_string()]);
                assert_eq!(query, "quick fox");
            }
            other => panic!("expected MATCH, got {other:?}"),
        }
    }
}
