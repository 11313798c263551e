//! Unified row value representation
//!
//! Every storage backend and operator exchanges rows built from the same
//! tagged sum type. Comparisons dispatch on the tag; promotion to float is
//! explicit, never implicit reflection over runtime types.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// SQL value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Time(chrono::DateTime<chrono::Utc>),
    /// JSON values travel as text through row encodings; the KV backend's
    /// codec is not self-describing.
    Json(#[serde(with = "json_text")] serde_json::Value),
}

mod json_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &serde_json::Value,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<serde_json::Value, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Value {
    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness for predicate results. NULL is not true.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Uint(u) => *u != 0,
            _ => false,
        }
    }

    /// Explicit promotion to f64 for mixed-type arithmetic and comparison.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Equality following SQL semantics: NULL equals nothing, numerics
    /// compare across tags via explicit promotion.
    pub fn sql_eq(&self, other: &Value) -> Option<bool> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.sql_cmp(other) == Some(Ordering::Equal))
    }

    /// Three-way comparison following SQL semantics. Returns `None` when the
    /// operands are NULL or not comparable.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Uint(a), Value::Uint(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Time(b)) => parse_time(a).map(|t| t.cmp(b)),
            (Value::Time(a), Value::Str(b)) => parse_time(b).map(|t| a.cmp(&t)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Total order used by sort operators and ordered indexes: NULL sorts
    /// first, incomparable tags order by tag rank.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        if let Some(ord) = self.sql_cmp(other) {
            return ord;
        }
        self.tag_rank().cmp(&other.tag_rank())
    }

    fn tag_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Uint(_) | Value::Float(_) => 2,
            Value::Time(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::Json(_) => 6,
        }
    }

    /// Text-protocol rendering. NULL is framed separately on the wire and
    /// must never reach this method.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Uint(u) => u.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{f:.0}")
                } else {
                    f.to_string()
                }
            }
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Time(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::Json(j) => j.to_string(),
        }
    }

    /// Stable byte encoding used for key construction (primary keys, index
    /// keys, group-by keys). Integers encode big-endian with the sign bit
    /// flipped so byte order matches value order.
    pub fn encode_key(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0x00),
            Value::Int(i) => {
                out.push(0x01);
                out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
            }
            Value::Uint(u) => {
                out.push(0x01);
                // Uints above i64::MAX keep ordering within the uint range
                out.extend_from_slice(&(u.wrapping_add(1 << 63)).to_be_bytes());
            }
            Value::Float(f) => {
                out.push(0x02);
                let bits = f.to_bits();
                let ordered = if *f >= 0.0 { bits ^ (1 << 63) } else { !bits };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Value::Bool(b) => {
                out.push(0x03);
                out.push(u8::from(*b));
            }
            Value::Str(s) => {
                out.push(0x04);
                out.extend_from_slice(s.as_bytes());
                out.push(0x00);
            }
            Value::Bytes(b) => {
                out.push(0x05);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
            Value::Time(t) => {
                out.push(0x06);
                out.extend_from_slice(&t.timestamp_micros().to_be_bytes());
            }
            Value::Json(j) => {
                out.push(0x07);
                out.extend_from_slice(j.to_string().as_bytes());
                out.push(0x00);
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            other => write!(f, "{}", other.to_text()),
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let mut key = Vec::new();
        self.encode_key(&mut key);
        key.hash(state);
    }
}

fn parse_time(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

/// An immutable row: ordered column names shared across the rows of one
/// result, plus one value per column. Updates build new rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Build a row from pairs; handy in tests and at adapter boundaries.
    pub fn from_pairs(pairs: Vec<(String, Value)>) -> Self {
        let (columns, values): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self {
            columns: Arc::new(columns),
            values,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn columns_arc(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Look up a value by column name. Qualified lookups (`t.c`) match the
    /// suffix when the row carries unqualified names.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(idx) = self.columns.iter().position(|c| c == name) {
            return Some(&self.values[idx]);
        }
        let unqualified = name.rsplit('.').next()?;
        self.columns
            .iter()
            .position(|c| c == unqualified || c.rsplit('.').next() == Some(unqualified))
            .map(|idx| &self.values[idx])
    }

    pub fn get_at(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// New row keeping only the named columns, in the requested order.
    pub fn project(&self, names: &[String]) -> Row {
        let values = names
            .iter()
            .map(|n| self.get(n).cloned().unwrap_or(Value::Null))
            .collect();
        Row::new(Arc::new(names.to_vec()), values)
    }

    /// Concatenate two rows (join output).
    pub fn join(&self, other: &Row) -> Row {
        let mut columns = (*self.columns).clone();
        columns.extend(other.columns.iter().cloned());
        let mut values = self.values.clone();
        values.extend(other.values.iter().cloned());
        Row::new(Arc::new(columns), values)
    }

    /// Encoded key over the named columns.
    pub fn key_for(&self, columns: &[String]) -> Vec<u8> {
        let mut key = Vec::new();
        for c in columns {
            self.get(c).unwrap_or(&Value::Null).encode_key(&mut key);
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_promotion() {
        assert_eq!(Value::Int(3).sql_cmp(&Value::Float(3.0)), Some(Ordering::Equal));
        assert_eq!(Value::Uint(5).sql_cmp(&Value::Int(4)), Some(Ordering::Greater));
        assert_eq!(Value::Int(-1).sql_cmp(&Value::Uint(0)), Some(Ordering::Less));
    }

    #[test]
    fn test_null_never_equal() {
        assert_eq!(Value::Null.sql_eq(&Value::Null), None);
        assert_eq!(Value::Int(1).sql_eq(&Value::Null), None);
    }

    #[test]
    fn test_total_order_nulls_first() {
        let mut vals = vec![Value::Int(2), Value::Null, Value::Int(1)];
        vals.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(vals[0], Value::Null);
        assert_eq!(vals[1], Value::Int(1));
    }

    #[test]
    fn test_key_encoding_orders_ints() {
        let enc = |v: i64| {
            let mut k = Vec::new();
            Value::Int(v).encode_key(&mut k);
            k
        };
        assert!(enc(-5) < enc(0));
        assert!(enc(0) < enc(7));
        assert!(enc(7) < enc(i64::MAX));
    }

    #[test]
    fn test_row_lookup_and_project() {
        let row = Row::from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            ("name".to_string(), Value::Str("Alice".into())),
        ]);
        assert_eq!(row.get("name"), Some(&Value::Str("Alice".into())));
        assert_eq!(row.get("users.id"), Some(&Value::Int(1)));
        let projected = row.project(&["name".to_string()]);
        assert_eq!(projected.columns(), &["name".to_string()]);
        assert_eq!(projected.values(), &[Value::Str("Alice".into())]);
    }

    #[test]
    fn test_row_encoding_round_trip() {
        // The KV backend stores rows in this encoding; JSON and timestamps
        // must survive it.
        let row = Row::from_pairs(vec![
            ("id".to_string(), Value::Int(1)),
            (
                "meta".to_string(),
                Value::Json(serde_json::json!({"tags": ["a", "b"], "n": 3})),
            ),
            ("at".to_string(), Value::Time(chrono::Utc::now())),
            ("blob".to_string(), Value::Bytes(vec![0, 255, 7])),
        ]);
        let bytes = bincode::serialize(&row).unwrap();
        let back: Row = bincode::deserialize(&bytes).unwrap();
        assert_eq!(row, back);
    }

    #[test]
    fn test_row_join_concatenates() {
        let a = Row::from_pairs(vec![("a".to_string(), Value::Int(1))]);
        let b = Row::from_pairs(vec![("b".to_string(), Value::Int(2))]);
        let joined = a.join(&b);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined.get("b"), Some(&Value::Int(2)));
    }
}
