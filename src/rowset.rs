//! Shared row-level evaluation utilities
//!
//! Predicate evaluation, ordering, and pagination over the unified `Row`
//! value. Storage engines use these for filtered scans; the executor reuses
//! the same code inside filter/sort/limit operators so both paths agree on
//! NULL and comparison semantics.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::sql::ast::{BinOp, Expr, OrderItem, UnaryOp};
use crate::storage::value::{Row, Value};

/// Evaluate an expression against a row.
pub fn eval_expr(expr: &Expr, row: &Row) -> Result<Value> {
    match expr {
        Expr::Column { table, name } => {
            let key = match table {
                Some(t) => format!("{t}.{name}"),
                None => name.clone(),
            };
            row.get(&key)
                .cloned()
                .ok_or_else(|| Error::UnknownColumn(key))
        }
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Placeholder(i) => Err(Error::Internal(format!("unbound parameter {i}"))),
        Expr::Binary { left, op, right } => eval_binary(left, *op, right, row),
        Expr::Unary { op, expr } => {
            let v = eval_expr(expr, row)?;
            match op {
                UnaryOp::Not => {
                    if v.is_null() {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::Bool(!v.is_true()))
                    }
                }
                UnaryOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Uint(u) if u <= i64::MAX as u64 => Ok(Value::Int(-(u as i64))),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Null => Ok(Value::Null),
                    other => Err(Error::Unsupported(format!("negation of {other}"))),
                },
            }
        }
        Expr::IsNull { expr, negated } => {
            let v = eval_expr(expr, row)?;
            Ok(Value::Bool(v.is_null() != *negated))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval_expr(expr, row)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                let candidate = eval_expr(item, row)?;
                if needle.sql_eq(&candidate) == Some(true) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
        Expr::InSubquery { .. } => Err(Error::Internal(
            "subquery predicates must be unnested before execution".into(),
        )),
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval_expr(expr, row)?;
            let lo = eval_expr(low, row)?;
            let hi = eval_expr(high, row)?;
            if v.is_null() || lo.is_null() || hi.is_null() {
                return Ok(Value::Null);
            }
            let inside = v.sql_cmp(&lo) != Some(Ordering::Less)
                && v.sql_cmp(&hi) != Some(Ordering::Greater);
            Ok(Value::Bool(inside != *negated))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let v = eval_expr(expr, row)?;
            let p = eval_expr(pattern, row)?;
            match (v, p) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (v, p) => {
                    let matched = like_match(&v.to_text(), &p.to_text());
                    Ok(Value::Bool(matched != *negated))
                }
            }
        }
        Expr::Function {
            name,
            args,
            wildcard: _,
        } => eval_scalar_function(name, args, row),
        Expr::Match { .. } => Err(Error::Internal(
            "MATCH predicates are routed through the full-text engine".into(),
        )),
    }
}

fn eval_binary(left: &Expr, op: BinOp, right: &Expr, row: &Row) -> Result<Value> {
    // AND/OR use three-valued logic with short circuits.
    if op == BinOp::And {
        let l = eval_expr(left, row)?;
        if !l.is_null() && !l.is_true() {
            return Ok(Value::Bool(false));
        }
        let r = eval_expr(right, row)?;
        if !r.is_null() && !r.is_true() {
            return Ok(Value::Bool(false));
        }
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        return Ok(Value::Bool(true));
    }
    if op == BinOp::Or {
        let l = eval_expr(left, row)?;
        if l.is_true() {
            return Ok(Value::Bool(true));
        }
        let r = eval_expr(right, row)?;
        if r.is_true() {
            return Ok(Value::Bool(true));
        }
        if l.is_null() || r.is_null() {
            return Ok(Value::Null);
        }
        return Ok(Value::Bool(false));
    }

    let l = eval_expr(left, row)?;
    let r = eval_expr(right, row)?;

    if op.is_comparison() {
        let ord = match l.sql_cmp(&r) {
            Some(o) => o,
            None => return Ok(Value::Null),
        };
        let result = match op {
            BinOp::Eq => ord == Ordering::Equal,
            BinOp::NotEq => ord != Ordering::Equal,
            BinOp::Lt => ord == Ordering::Less,
            BinOp::LtEq => ord != Ordering::Greater,
            BinOp::Gt => ord == Ordering::Greater,
            BinOp::GtEq => ord != Ordering::Less,
            _ => unreachable!(),
        };
        return Ok(Value::Bool(result));
    }

    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    arith(l, op, r)
}

fn arith(l: Value, op: BinOp, r: Value) -> Result<Value> {
    // Integer arithmetic stays integral; anything mixed promotes explicitly.
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        return Ok(match op {
            BinOp::Plus => Value::Int(a.wrapping_add(*b)),
            BinOp::Minus => Value::Int(a.wrapping_sub(*b)),
            BinOp::Multiply => Value::Int(a.wrapping_mul(*b)),
            BinOp::Divide => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Float(*a as f64 / *b as f64)
                }
            }
            BinOp::Modulo => {
                if *b == 0 {
                    Value::Null
                } else {
                    Value::Int(a % b)
                }
            }
            _ => unreachable!(),
        });
    }
    if let (Value::Str(a), Value::Str(b)) = (&l, &r) {
        if op == BinOp::Plus {
            return Ok(Value::Str(format!("{a}{b}")));
        }
    }
    let a = l
        .as_f64()
        .ok_or_else(|| Error::Unsupported(format!("arithmetic on {l}")))?;
    let b = r
        .as_f64()
        .ok_or_else(|| Error::Unsupported(format!("arithmetic on {r}")))?;
    Ok(match op {
        BinOp::Plus => Value::Float(a + b),
        BinOp::Minus => Value::Float(a - b),
        BinOp::Multiply => Value::Float(a * b),
        BinOp::Divide => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Float(a / b)
            }
        }
        BinOp::Modulo => {
            if b == 0.0 {
                Value::Null
            } else {
                Value::Float(a % b)
            }
        }
        _ => unreachable!(),
    })
}

fn eval_scalar_function(name: &str, args: &[Expr], row: &Row) -> Result<Value> {
    let mut values = Vec::with_capacity(args.len());
    for a in args {
        values.push(eval_expr(a, row)?);
    }
    match (name, values.as_slice()) {
        ("UPPER", [Value::Str(s)]) => Ok(Value::Str(s.to_uppercase())),
        ("LOWER", [Value::Str(s)]) => Ok(Value::Str(s.to_lowercase())),
        ("LENGTH", [Value::Str(s)]) => Ok(Value::Int(s.len() as i64)),
        ("ABS", [Value::Int(i)]) => Ok(Value::Int(i.abs())),
        ("ABS", [Value::Float(f)]) => Ok(Value::Float(f.abs())),
        ("COALESCE", values) => Ok(values
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        ("NOW", []) => Ok(Value::Time(chrono::Utc::now())),
        (_, values) if values.iter().any(Value::is_null) => Ok(Value::Null),
        _ => Err(Error::Unsupported(format!("function {name}()"))),
    }
}

/// SQL LIKE with `%` and `_` wildcards.
pub fn like_match(text: &str, pattern: &str) -> bool {
    fn inner(t: &[char], p: &[char]) -> bool {
        match (t.first(), p.first()) {
            (_, None) => t.is_empty(),
            (_, Some('%')) => {
                if inner(t, &p[1..]) {
                    return true;
                }
                !t.is_empty() && inner(&t[1..], p)
            }
            (None, Some(_)) => false,
            (Some(tc), Some('_')) => {
                let _ = tc;
                inner(&t[1..], &p[1..])
            }
            (Some(tc), Some(pc)) => {
                tc.eq_ignore_ascii_case(pc) && inner(&t[1..], &p[1..])
            }
        }
    }
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&t, &p)
}

/// Evaluate a predicate; NULL results count as not matching.
pub fn eval_predicate(expr: &Expr, row: &Row) -> Result<bool> {
    Ok(eval_expr(expr, row)?.is_true())
}

/// Sort rows in place by the given order keys.
pub fn sort_rows(rows: &mut [Row], order: &[OrderItem]) -> Result<()> {
    let mut failure: Option<Error> = None;
    rows.sort_by(|a, b| {
        for item in order {
            let va = match eval_expr(&item.expr, a) {
                Ok(v) => v,
                Err(e) => {
                    failure.get_or_insert(e);
                    return Ordering::Equal;
                }
            };
            let vb = match eval_expr(&item.expr, b) {
                Ok(v) => v,
                Err(e) => {
                    failure.get_or_insert(e);
                    return Ordering::Equal;
                }
            };
            let ord = va.total_cmp(&vb);
            let ord = if item.asc { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Apply OFFSET/LIMIT pagination.
pub fn paginate(rows: Vec<Row>, offset: Option<u64>, limit: Option<u64>) -> Vec<Row> {
    let skip = offset.unwrap_or(0) as usize;
    let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    rows.into_iter().skip(skip).take(take).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ast::Expr as E;

    fn row() -> Row {
        Row::from_pairs(vec![
            ("id".into(), Value::Int(2)),
            ("name".into(), Value::Str("Bob".into())),
            ("score".into(), Value::Null),
        ])
    }

    #[test]
    fn test_comparison_predicate() {
        let e = E::binary(E::column("id"), BinOp::Gt, E::Literal(Value::Int(1)));
        assert!(eval_predicate(&e, &row()).unwrap());
        let e = E::binary(E::column("id"), BinOp::Gt, E::Literal(Value::Int(5)));
        assert!(!eval_predicate(&e, &row()).unwrap());
    }

    #[test]
    fn test_eq_null_matches_nothing() {
        // `score = NULL` is NULL, which is not true; only IS NULL matches.
        let e = E::binary(E::column("score"), BinOp::Eq, E::Literal(Value::Null));
        assert!(!eval_predicate(&e, &row()).unwrap());
        let e = E::IsNull {
            expr: Box::new(E::column("score")),
            negated: false,
        };
        assert!(eval_predicate(&e, &row()).unwrap());
    }

    #[test]
    fn test_three_valued_and() {
        let null_cmp = E::binary(E::column("score"), BinOp::Eq, E::Literal(Value::Int(1)));
        let false_cmp = E::binary(E::column("id"), BinOp::Eq, E::Literal(Value::Int(9)));
        let e = E::binary(null_cmp, BinOp::And, false_cmp);
        // NULL AND FALSE is FALSE
        assert_eq!(eval_expr(&e, &row()).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_like() {
        assert!(like_match("Bob", "b%"));
        assert!(like_match("Bob", "_ob"));
        assert!(!like_match("Bob", "c%"));
        assert!(like_match("", "%"));
    }

    #[test]
    fn test_unknown_column_error() {
        let e = E::column("missing");
        assert!(matches!(eval_expr(&e, &row()), Err(Error::UnknownColumn(_))));
    }

    #[test]
    fn test_sort_and_paginate() {
        let mut rows: Vec<Row> = [3, 1, 2]
            .iter()
            .map(|i| Row::from_pairs(vec![("id".into(), Value::Int(*i))]))
            .collect();
        sort_rows(
            &mut rows,
            &[OrderItem {
                expr: E::column("id"),
                asc: false,
            }],
        )
        .unwrap();
        let ids: Vec<i64> = rows
            .iter()
            .map(|r| match r.get("id").unwrap() {
                Value::Int(i) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![3, 2, 1]);
        let page = paginate(rows, Some(1), Some(1));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].get("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_integer_division_by_zero_is_null() {
        let e = E::binary(E::Literal(Value::Int(1)), BinOp::Divide, E::Literal(Value::Int(0)));
        assert_eq!(eval_expr(&e, &row()).unwrap(), Value::Null);
    }
}
