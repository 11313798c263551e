//! Table statistics and cardinality estimation
//!
//! Per-table statistics objects live behind per-entry locks in a shared
//! cache; refresh is asynchronous and never blocks readers. Estimates fall
//! back to fixed defaults when statistics are missing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::sql::ast::{BinOp, Expr};
use crate::storage::value::{Row, Value};

/// Fallbacks when no statistics exist.
pub const DEFAULT_TABLE_ROWS: f64 = 10_000.0;
pub const DEFAULT_SELECTIVITY: f64 = 0.1;
pub const DEFAULT_NDV: f64 = 100.0;

const HISTOGRAM_BUCKETS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistogramKind {
    EquiWidth,
    EquiDepth,
}

#[derive(Debug, Clone)]
pub struct Bucket {
    pub lo: f64,
    pub hi: f64,
    pub count: u64,
}

/// Column histogram; buckets cover the full observed range.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub kind: HistogramKind,
    pub buckets: Vec<Bucket>,
    pub total: u64,
}

impl Histogram {
    /// Build an equi-width histogram over numeric samples.
    pub fn equi_width(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let n = HISTOGRAM_BUCKETS.min(values.len()).max(1);
        let width = ((hi - lo) / n as f64).max(f64::MIN_POSITIVE);
        let mut buckets: Vec<Bucket> = (0..n)
            .map(|i| Bucket {
                lo: lo + width * i as f64,
                hi: if i == n - 1 { hi } else { lo + width * (i + 1) as f64 },
                count: 0,
            })
            .collect();
        for v in values {
            let mut idx = ((v - lo) / width) as usize;
            if idx >= n {
                idx = n - 1;
            }
            buckets[idx].count += 1;
        }
        Some(Self {
            kind: HistogramKind::EquiWidth,
            buckets,
            total: values.len() as u64,
        })
    }

    /// Build an equi-depth histogram over numeric samples.
    pub fn equi_depth(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = HISTOGRAM_BUCKETS.min(sorted.len()).max(1);
        let per_bucket = sorted.len().div_ceil(n);
        let mut buckets = Vec::with_capacity(n);
        for chunk in sorted.chunks(per_bucket) {
            buckets.push(Bucket {
                lo: chunk[0],
                hi: chunk[chunk.len() - 1],
                count: chunk.len() as u64,
            });
        }
        Some(Self {
            kind: HistogramKind::EquiDepth,
            buckets,
            total: values.len() as u64,
        })
    }

    /// Fraction of values satisfying `op bound`.
    pub fn selectivity(&self, op: BinOp, bound: f64) -> f64 {
        if self.total == 0 {
            return DEFAULT_SELECTIVITY;
        }
        let mut matching = 0.0;
        for b in &self.buckets {
            let width = (b.hi - b.lo).max(f64::MIN_POSITIVE);
            let frac_below = ((bound - b.lo) / width).clamp(0.0, 1.0);
            let count = b.count as f64;
            matching += match op {
                BinOp::Lt | BinOp::LtEq => count * frac_below,
                BinOp::Gt | BinOp::GtEq => count * (1.0 - frac_below),
                _ => 0.0,
            };
        }
        (matching / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Per-column statistics.
#[derive(Debug, Clone, Default)]
pub struct ColumnStats {
    pub ndv: u64,
    pub null_count: u64,
    pub histogram: Option<Histogram>,
}

/// Per-table statistics object.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub table: String,
    pub total_rows: u64,
    pub avg_row_len: f64,
    pub columns: HashMap<String, ColumnStats>,
    pub refreshed_at: DateTime<Utc>,
}

impl TableStats {
    /// Analyze a full set of rows. NDV is capped at the row count.
    pub fn analyze(table: &str, rows: &[Row]) -> Self {
        let total_rows = rows.len() as u64;
        let mut columns: HashMap<String, ColumnStats> = HashMap::new();
        let mut total_len = 0usize;

        if let Some(first) = rows.first() {
            for name in first.columns() {
                let mut distinct: HashSet<Vec<u8>> = HashSet::new();
                let mut nulls = 0u64;
                let mut numeric: Vec<f64> = Vec::new();
                for row in rows {
                    match row.get(name) {
                        Some(Value::Null) | None => nulls += 1,
                        Some(v) => {
                            let mut key = Vec::new();
                            v.encode_key(&mut key);
                            distinct.insert(key);
                            if let Some(f) = v.as_f64() {
                                numeric.push(f);
                            }
                        }
                    }
                }
                let ndv = (distinct.len() as u64).min(total_rows);
                columns.insert(
                    name.clone(),
                    ColumnStats {
                        ndv,
                        null_count: nulls,
                        histogram: Histogram::equi_width(&numeric),
                    },
                );
            }
            for row in rows {
                total_len += row
                    .values()
                    .iter()
                    .map(|v| v.to_text().len().max(8))
                    .sum::<usize>();
            }
        }

        Self {
            table: table.to_string(),
            total_rows,
            avg_row_len: if total_rows > 0 {
                total_len as f64 / total_rows as f64
            } else {
                0.0
            },
            columns,
            refreshed_at: Utc::now(),
        }
    }

    pub fn ndv(&self, column: &str) -> f64 {
        let unqualified = column.rsplit('.').next().unwrap_or(column);
        self.columns
            .get(column)
            .or_else(|| self.columns.get(unqualified))
            .map(|c| c.ndv as f64)
            .filter(|&n| n > 0.0)
            .unwrap_or(DEFAULT_NDV)
    }
}

/// Shared statistics cache; per-table entries behind their own locks so a
/// refresh never blocks planning on other tables.
#[derive(Default)]
pub struct StatisticsCache {
    entries: RwLock<HashMap<String, Arc<RwLock<TableStats>>>>,
}

impl StatisticsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<Arc<RwLock<TableStats>>> {
        self.entries.read().unwrap().get(table).cloned()
    }

    pub fn put(&self, stats: TableStats) {
        let mut entries = self.entries.write().unwrap();
        match entries.get(&stats.table) {
            Some(slot) => *slot.write().unwrap() = stats,
            None => {
                entries.insert(stats.table.clone(), Arc::new(RwLock::new(stats)));
            }
        }
    }

    pub fn invalidate(&self, table: &str) {
        self.entries.write().unwrap().remove(table);
    }

    /// Estimated base-table cardinality.
    pub fn table_rows(&self, table: &str) -> f64 {
        self.get(table)
            .map(|s| s.read().unwrap().total_rows as f64)
            .unwrap_or(DEFAULT_TABLE_ROWS)
    }

    /// Distinct values for a column, with defaults when unknown.
    pub fn column_ndv(&self, table: &str, column: &str) -> f64 {
        self.get(table)
            .map(|s| s.read().unwrap().ndv(column))
            .unwrap_or(DEFAULT_NDV)
    }

    /// Selectivity of a predicate over one table's rows: conjunctions
    /// multiply, equality uses 1/NDV with a 1/total_rows floor, ranges use
    /// the column histogram.
    pub fn selectivity(&self, table: &str, predicate: &Expr) -> f64 {
        let entry = self.get(table);
        let mut factors = Vec::new();
        predicate.clone().split_conjunction(&mut factors);
        let mut selectivity = 1.0;
        for factor in &factors {
            selectivity *= self.factor_selectivity(entry.as_deref(), factor);
        }
        selectivity.clamp(0.0, 1.0)
    }

    fn factor_selectivity(&self, entry: Option<&RwLock<TableStats>>, factor: &Expr) -> f64 {
        match factor {
            Expr::Binary { left, op, right } if op.is_comparison() => {
                let (column, literal) = match (left.as_ref(), right.as_ref()) {
                    (Expr::Column { name, .. }, Expr::Literal(v)) => (name, v),
                    (Expr::Literal(v), Expr::Column { name, .. }) => (name, v),
                    _ => return DEFAULT_SELECTIVITY,
                };
                let stats = match entry {
                    Some(s) => s.read().unwrap(),
                    None => return DEFAULT_SELECTIVITY,
                };
                match op {
                    BinOp::Eq => {
                        let ndv = stats.ndv(column);
                        let floor = 1.0 / (stats.total_rows.max(1) as f64);
                        (1.0 / ndv).max(floor)
                    }
                    BinOp::NotEq => {
                        let ndv = stats.ndv(column);
                        1.0 - (1.0 / ndv).min(1.0)
                    }
                    _ => {
                        let unqualified = column.rsplit('.').next().unwrap_or(column);
                        let hist = stats
                            .columns
                            .get(column.as_str())
                            .or_else(|| stats.columns.get(unqualified))
                            .and_then(|c| c.histogram.as_ref());
                        match (hist, literal.as_f64()) {
                            (Some(h), Some(bound)) => h.selectivity(*op, bound),
                            _ => DEFAULT_SELECTIVITY,
                        }
                    }
                }
            }
            Expr::IsNull { negated, .. } => {
                if *negated {
                    0.9
                } else {
                    DEFAULT_SELECTIVITY
                }
            }
            Expr::InList { list, .. } => {
                (list.len() as f64 * DEFAULT_SELECTIVITY / 2.0).clamp(0.0, 1.0)
            }
            Expr::Between { .. } => 0.25,
            Expr::Like { .. } => 0.25,
            _ => DEFAULT_SELECTIVITY,
        }
    }

    /// Join cardinality: `left × right / max(ndv(left key), ndv(right key))`.
    pub fn join_rows(
        &self,
        left_rows: f64,
        right_rows: f64,
        left_key: Option<(&str, &str)>,
        right_key: Option<(&str, &str)>,
    ) -> f64 {
        let ndv_left = left_key
            .map(|(t, c)| self.column_ndv(t, c))
            .unwrap_or(DEFAULT_NDV);
        let ndv_right = right_key
            .map(|(t, c)| self.column_ndv(t, c))
            .unwrap_or(DEFAULT_NDV);
        (left_rows * right_rows / ndv_left.max(ndv_right).max(1.0)).max(1.0)
    }

    /// Aggregation output cardinality: group-key NDV capped at input rows.
    pub fn group_rows(&self, table: Option<&str>, group_by: &[Expr], input_rows: f64) -> f64 {
        if group_by.is_empty() {
            return 1.0;
        }
        let mut groups = 1.0;
        for key in group_by {
            let ndv = match (table, key) {
                (Some(t), Expr::Column { name, .. }) => self.column_ndv(t, name),
                _ => DEFAULT_NDV,
            };
            groups *= ndv;
        }
        groups.min(input_rows).max(1.0)
    }

    pub fn tables_with_stats(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rows(n: i64) -> Vec<Row> {
        (0..n)
            .map(|i| {
                Row::from_pairs(vec![
                    ("id".into(), Value::Int(i)),
                    ("grp".into(), Value::Int(i % 10)),
                    (
                        "note".into(),
                        if i % 5 == 0 {
                            Value::Null
                        } else {
                            Value::Str(format!("n{i}"))
                        },
                    ),
                ])
            })
            .collect()
    }

    #[test]
    fn test_analyze_ndv_capped_at_rows() {
        let stats = TableStats::analyze("t", &sample_rows(100));
        assert_eq!(stats.total_rows, 100);
        assert_eq!(stats.columns["id"].ndv, 100);
        assert_eq!(stats.columns["grp"].ndv, 10);
        assert!(stats.columns["id"].ndv <= stats.total_rows);
        assert_eq!(stats.columns["note"].null_count, 20);
    }

    #[test]
    fn test_histogram_covers_range() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let hist = Histogram::equi_width(&values).unwrap();
        assert_eq!(hist.total, 100);
        assert_eq!(hist.buckets.first().unwrap().lo, 0.0);
        assert_eq!(hist.buckets.last().unwrap().hi, 99.0);
        let covered: u64 = hist.buckets.iter().map(|b| b.count).sum();
        assert_eq!(covered, 100);
    }

    #[test]
    fn test_histogram_range_selectivity() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let hist = Histogram::equi_width(&values).unwrap();
        let sel = hist.selectivity(BinOp::Gt, 49.0);
        assert!((sel - 0.5).abs() < 0.1, "got {sel}");
        let sel = hist.selectivity(BinOp::Lt, 10.0);
        assert!((sel - 0.1).abs() < 0.05, "got {sel}");
    }

    #[test]
    fn test_equi_depth_buckets_balanced() {
        let mut values: Vec<f64> = (0..64).map(|i| i as f64).collect();
        values.extend(std::iter::repeat(100.0).take(64));
        let hist = Histogram::equi_depth(&values).unwrap();
        let max = hist.buckets.iter().map(|b| b.count).max().unwrap();
        let min = hist.buckets.iter().map(|b| b.count).min().unwrap();
        assert!(max - min <= 8, "buckets reasonably balanced: {min}..{max}");
    }

    #[test]
    fn test_equality_selectivity_uses_ndv() {
        let cache = StatisticsCache::new();
        cache.put(TableStats::analyze("t", &sample_rows(100)));
        let pred = Expr::binary(
            Expr::column("grp"),
            BinOp::Eq,
            Expr::Literal(Value::Int(3)),
        );
        let sel = cache.selectivity("t", &pred);
        assert!((sel - 0.1).abs() < 1e-9, "1/ndv(grp)=0.1, got {sel}");
    }

    #[test]
    fn test_missing_stats_fall_back() {
        let cache = StatisticsCache::new();
        assert_eq!(cache.table_rows("nope"), DEFAULT_TABLE_ROWS);
        assert_eq!(cache.column_ndv("nope", "c"), DEFAULT_NDV);
        let pred = Expr::binary(Expr::column("c"), BinOp::Eq, Expr::Literal(Value::Int(1)));
        assert_eq!(cache.selectivity("nope", &pred), DEFAULT_SELECTIVITY);
    }

    #[test]
    fn test_conjunction_multiplies() {
        let cache = StatisticsCache::new();
        cache.put(TableStats::analyze("t", &sample_rows(100)));
        let pred = Expr::binary(
            Expr::binary(Expr::column("grp"), BinOp::Eq, Expr::Literal(Value::Int(3))),
            BinOp::And,
            Expr::binary(Expr::column("id"), BinOp::Eq, Expr::Literal(Value::Int(7))),
        );
        let sel = cache.selectivity("t", &pred);
        assert!((sel - 0.1 * 0.01).abs() < 1e-9, "got {sel}");
    }

    #[test]
    fn test_join_and_group_cardinality() {
        let cache = StatisticsCache::new();
        cache.put(TableStats::analyze("t", &sample_rows(100)));
        let rows = cache.join_rows(100.0, 50.0, Some(("t", "grp")), None);
        // max(ndv) = max(10, default 100) = 100
        assert!((rows - 50.0).abs() < 1e-9);
        let groups = cache.group_rows(Some("t"), &[Expr::column("grp")], 100.0);
        assert!((groups - 10.0).abs() < 1e-9);
        let capped = cache.group_rows(Some("t"), &[Expr::column("id")], 20.0);
        assert!((capped - 20.0).abs() < 1e-9);
    }
}
