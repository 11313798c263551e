//! Adaptive cost model
//!
//! Unit cost is one row read from a sequential scan. Constants adapt from
//! actual-vs-estimated feedback through an exponential moving average and
//! are clamped to a sane band so one bad estimate cannot wreck planning.

use std::sync::RwLock;

/// EMA smoothing factor for feedback.
const ALPHA: f64 = 0.1;
/// Global clamp band for all constants.
const CLAMP_MIN: f64 = 0.01;
const CLAMP_MAX: f64 = 100.0;
/// The index factor has its own narrower band.
const INDEX_FACTOR_MIN: f64 = 0.1;
const INDEX_FACTOR_MAX: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostConstants {
    pub cpu_factor: f64,
    pub hash_build: f64,
    pub hash_probe: f64,
    pub index_factor: f64,
}

impl Default for CostConstants {
    fn default() -> Self {
        Self {
            cpu_factor: 0.2,
            hash_build: 1.5,
            hash_probe: 1.0,
            index_factor: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinAlgorithm {
    Hash,
    NestedLoop,
}

/// Cost model with adaptive constants. Constructed with no back-pointers:
/// statistics are injected by callers, never fetched from here.
#[derive(Debug, Default)]
pub struct CostModel {
    constants: RwLock<CostConstants>,
}

impl CostModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constants(&self) -> CostConstants {
        *self.constants.read().unwrap()
    }

    /// `rows × 1.0` sequential, `rows × index_factor` via an index.
    pub fn scan_cost(&self, rows: f64, use_index: bool) -> f64 {
        let c = self.constants();
        if use_index {
            rows * c.index_factor
        } else {
            rows
        }
    }

    /// Evaluation cost plus output cost.
    pub fn filter_cost(&self, rows: f64, selectivity: f64) -> f64 {
        let c = self.constants();
        rows * c.cpu_factor + rows * selectivity
    }

    pub fn join_cost(&self, left_rows: f64, right_rows: f64, kind: JoinAlgorithm) -> f64 {
        let c = self.constants();
        match kind {
            JoinAlgorithm::Hash => left_rows * c.hash_build + right_rows * c.hash_probe,
            JoinAlgorithm::NestedLoop => left_rows * right_rows * c.cpu_factor,
        }
    }

    pub fn aggregate_cost(&self, rows: f64, groups: f64) -> f64 {
        let c = self.constants();
        rows * c.cpu_factor + groups
    }

    pub fn sort_cost(&self, rows: f64) -> f64 {
        let c = self.constants();
        let n = rows.max(2.0);
        n * n.log2() * c.cpu_factor
    }

    /// Feed actual-vs-estimated execution cost back into the constants:
    /// every constant drifts toward `constant × (actual / estimated)` with
    /// smoothing, then clamps.
    pub fn observe(&self, estimated: f64, actual: f64) {
        if estimated <= 0.0 || actual <= 0.0 {
            return;
        }
        let ratio = (actual / estimated).clamp(0.1, 10.0);
        let scale = (1.0 - ALPHA) + ALPHA * ratio;
        let mut c = self.constants.write().unwrap();
        c.cpu_factor = (c.cpu_factor * scale).clamp(CLAMP_MIN, CLAMP_MAX);
        c.hash_build = (c.hash_build * scale).clamp(CLAMP_MIN, CLAMP_MAX);
        c.hash_probe = (c.hash_probe * scale).clamp(CLAMP_MIN, CLAMP_MAX);
        c.index_factor = (c.index_factor * scale).clamp(INDEX_FACTOR_MIN, INDEX_FACTOR_MAX);
    }
}
