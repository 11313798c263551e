//! Join order search
//!
//! Dynamic programming over subset bitmasks for up to ten relations, a
//! greedy cheapest-pair heuristic above that, and a depth-limited bushy
//! search that must beat the left-deep plan by 15% to be chosen.

use crate::optimizer::cost::{CostModel, JoinAlgorithm};

/// Greedy fallback threshold.
const DP_MAX_RELATIONS: usize = 10;
/// Bushy trees only considered for join sets at least this large.
const BUSHY_MIN_RELATIONS: usize = 4;
const BUSHY_MAX_DEPTH: usize = 3;
/// Required improvement before a bushy shape replaces left-deep.
const BUSHY_IMPROVEMENT: f64 = 0.15;

/// One base relation entering the join search.
#[derive(Debug, Clone)]
pub struct JoinRelation {
    pub name: String,
    pub rows: f64,
}

/// Inner-equijoin edge between two relations, with the estimated
/// `1 / max(ndv_left, ndv_right)` selectivity.
#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub left: usize,
    pub right: usize,
    pub selectivity: f64,
}

/// Shape of the chosen join order.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinTree {
    Leaf(usize),
    Node {
        left: Box<JoinTree>,
        right: Box<JoinTree>,
        algorithm: JoinAlgorithm,
    },
}

impl JoinTree {
    pub fn leaves(&self, out: &mut Vec<usize>) {
        match self {
            JoinTree::Leaf(i) => out.push(*i),
            JoinTree::Node { left, right, .. } => {
                left.leaves(out);
                right.leaves(out);
            }
        }
    }

    fn depth(&self) -> usize {
        match self {
            JoinTree::Leaf(_) => 0,
            JoinTree::Node { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Debug, Clone)]
struct PlanEntry {
    cost: f64,
    rows: f64,
    nl_joins: usize,
    tree: JoinTree,
    /// Leaf order, for the lexicographic tie-break.
    order: Vec<usize>,
}

impl PlanEntry {
    /// Tie-break chain: cost, then intermediate cardinality, then fewer
    /// nested-loop joins, then lexicographic table order.
    fn better_than(&self, other: &PlanEntry, relations: &[JoinRelation]) -> bool {
        const EPS: f64 = 1e-9;
        if (self.cost - other.cost).abs() > EPS {
            return self.cost < other.cost;
        }
        if (self.rows - other.rows).abs() > EPS {
            return self.rows < other.rows;
        }
        if self.nl_joins != other.nl_joins {
            return self.nl_joins < other.nl_joins;
        }
        let names = |order: &[usize]| -> Vec<&str> {
            order.iter().map(|i| relations[*i].name.as_str()).collect()
        };
        names(&self.order) < names(&other.order)
    }
}

/// Result of the search.
#[derive(Debug, Clone)]
pub struct ReorderResult {
    pub tree: JoinTree,
    pub cost: f64,
    pub rows: f64,
}

/// Pick a join order for the given relations and equi-join edges.
pub fn reorder(
    relations: &[JoinRelation],
    edges: &[JoinEdge],
    cost_model: &CostModel,
) -> ReorderResult {
    assert!(!relations.is_empty());
    if relations.len() == 1 {
        return ReorderResult {
            tree: JoinTree::Leaf(0),
            cost: cost_model.scan_cost(relations[0].rows, false),
            rows: relations[0].rows,
        };
    }
    if relations.len() > DP_MAX_RELATIONS {
        return greedy(relations, edges, cost_model);
    }

    let left_deep = dp(relations, edges, cost_model, false);
    if relations.len() >= BUSHY_MIN_RELATIONS {
        let bushy = dp(relations, edges, cost_model, true);
        if bushy.cost <= left_deep.cost * (1.0 - BUSHY_IMPROVEMENT)
            && bushy.tree.depth() <= BUSHY_MAX_DEPTH
        {
            return ReorderResult {
                tree: bushy.tree,
                cost: bushy.cost,
                rows: bushy.rows,
            };
        }
    }
    ReorderResult {
        tree: left_deep.tree,
        cost: left_deep.cost,
        rows: left_deep.rows,
    }
}

fn crossing_selectivity(edges: &[JoinEdge], left_mask: u64, right_mask: u64) -> Option<f64> {
    let mut selectivity = 1.0;
    let mut connected = false;
    for e in edges {
        let l = 1u64 << e.left;
        let r = 1u64 << e.right;
        let crosses = (left_mask & l != 0 && right_mask & r != 0)
            || (left_mask & r != 0 && right_mask & l != 0);
        if crosses {
            connected = true;
            selectivity *= e.selectivity;
        }
    }
    connected.then_some(selectivity)
}

fn join_candidate(
    left: &PlanEntry,
    right: &PlanEntry,
    left_mask: u64,
    right_mask: u64,
    edges: &[JoinEdge],
    cost_model: &CostModel,
) -> PlanEntry {
    let (selectivity, has_equi) = match crossing_selectivity(edges, left_mask, right_mask) {
        Some(s) => (s, true),
        None => (1.0, false),
    };
    let out_rows = (left.rows * right.rows * selectivity).max(1.0);

    let algorithm = if has_equi {
        let hash = cost_model.join_cost(left.rows, right.rows, JoinAlgorithm::Hash);
        let nl = cost_model.join_cost(left.rows, right.rows, JoinAlgorithm::NestedLoop);
        if hash <= nl {
            JoinAlgorithm::Hash
        } else {
            JoinAlgorithm::NestedLoop
        }
    } else {
        JoinAlgorithm::NestedLoop
    };
    let join_cost = cost_model.join_cost(left.rows, right.rows, algorithm);

    let mut order = left.order.clone();
    order.extend(&right.order);
    PlanEntry {
        cost: left.cost + right.cost + join_cost,
        rows: out_rows,
        nl_joins: left.nl_joins
            + right.nl_joins
            + usize::from(algorithm == JoinAlgorithm::NestedLoop),
        tree: JoinTree::Node {
            left: Box::new(left.tree.clone()),
            right: Box::new(right.tree.clone()),
            algorithm,
        },
        order,
    }
}

fn dp(
    relations: &[JoinRelation],
    edges: &[JoinEdge],
    cost_model: &CostModel,
    bushy: bool,
) -> PlanEntry {
    let n = relations.len();
    let full: u64 = (1 << n) - 1;
    let mut best: Vec<Option<PlanEntry>> = vec![None; (full + 1) as usize];

    for (i, rel) in relations.iter().enumerate() {
        best[1usize << i] = Some(PlanEntry {
            cost: cost_model.scan_cost(rel.rows, false),
            rows: rel.rows,
            nl_joins: 0,
            tree: JoinTree::Leaf(i),
            order: vec![i],
        });
    }

    for mask in 1..=full {
        if mask.count_ones() < 2 {
            continue;
        }
        // Enumerate proper submask splits.
        let mut sub = (mask - 1) & mask;
        while sub > 0 {
            let other = mask & !sub;
            if let (Some(left), Some(right)) =
                (best[sub as usize].as_ref(), best[other as usize].as_ref())
            {
                let allowed = if bushy {
                    true
                } else {
                    // Left-deep: the probe side is always a single relation.
                    other.count_ones() == 1
                };
                if allowed {
                    let candidate = join_candidate(left, right, sub, other, edges, cost_model);
                    let keep = if bushy && candidate.tree.depth() > BUSHY_MAX_DEPTH {
                        false
                    } else {
                        match best[mask as usize].as_ref() {
                            Some(current) => candidate.better_than(current, relations),
                            None => true,
                        }
                    };
                    if keep {
                        best[mask as usize] = Some(candidate);
                    }
                }
            }
            sub = (sub - 1) & mask;
        }
    }

    best[full as usize]
        .clone()
        .expect("every connected or cross-joined subset has a plan")
}

/// Greedy left-deep heuristic: repeatedly join the cheapest remaining pair.
fn greedy(
    relations: &[JoinRelation],
    edges: &[JoinEdge],
    cost_model: &CostModel,
) -> ReorderResult {
    let mut clusters: Vec<(u64, PlanEntry)> = relations
        .iter()
        .enumerate()
        .map(|(i, rel)| {
            (
                1u64 << i,
                PlanEntry {
                    cost: cost_model.scan_cost(rel.rows, false),
                    rows: rel.rows,
                    nl_joins: 0,
                    tree: JoinTree::Leaf(i),
                    order: vec![i],
                },
            )
        })
        .collect();

    while clusters.len() > 1 {
        let mut best_pair = (0usize, 1usize);
        let mut best_entry: Option<PlanEntry> = None;
        for i in 0..clusters.len() {
            for j in 0..clusters.len() {
                if i == j {
                    continue;
                }
                let candidate = join_candidate(
                    &clusters[i].1,
                    &clusters[j].1,
                    clusters[i].0,
                    clusters[j].0,
                    edges,
                    cost_model,
                );
                let take = match best_entry.as_ref() {
                    Some(current) => candidate.better_than(current, relations),
                    None => true,
                };
                if take {
                    best_pair = (i, j);
                    best_entry = Some(candidate);
                }
            }
        }
        let (i, j) = best_pair;
        let merged_mask = clusters[i].0 | clusters[j].0;
        let entry = best_entry.expect("at least one pair exists");
        let (hi, lo) = if i > j { (i, j) } else { (j, i) };
        clusters.remove(hi);
        clusters.remove(lo);
        clusters.push((merged_mask, entry));
    }

    let (_, entry) = clusters.pop().unwrap();
    ReorderResult {
        tree: entry.tree,
        cost: entry.cost,
        rows: entry.rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(name: &str, rows: f64) -> JoinRelation {
        JoinRelation {
            name: name.into(),
            rows,
        }
    }

    fn leaf_names(result: &ReorderResult, relations: &[JoinRelation]) -> Vec<String> {
        let mut leaves = Vec::new();
        result.tree.leaves(&mut leaves);
        leaves.iter().map(|i| relations[*i].name.clone()).collect()
    }

    #[test]
    fn test_smallest_intermediate_first() {
        // a(100), b(10), c(1000), all joined on equal keys: the plan must
        // join b to a first, then bring in c last.
        let relations = vec![rel("a", 100.0), rel("b", 10.0), rel("c", 1000.0)];
        let edges = vec![
            JoinEdge {
                left: 0,
                right: 1,
                selectivity: 0.01,
            },
            JoinEdge {
                left: 1,
                right: 2,
                selectivity: 0.01,
            },
            JoinEdge {
                left: 0,
                right: 2,
                selectivity: 0.01,
            },
        ];
        let model = CostModel::new();
        let result = reorder(&relations, &edges, &model);
        let names = leaf_names(&result, &relations);
        assert_eq!(names, vec!["b", "a", "c"], "plan order: {names:?}");
    }

    #[test]
    fn test_single_relation() {
        let relations = vec![rel("only", 42.0)];
        let model = CostModel::new();
        let result = reorder(&relations, &[], &model);
        assert_eq!(result.tree, JoinTree::Leaf(0));
        assert_eq!(result.rows, 42.0);
    }

    #[test]
    fn test_cross_join_uses_nested_loop() {
        let relations = vec![rel("x", 10.0), rel("y", 10.0)];
        let model = CostModel::new();
        let result = reorder(&relations, &[], &model);
        match result.tree {
            JoinTree::Node { algorithm, .. } => {
                assert_eq!(algorithm, JoinAlgorithm::NestedLoop)
            }
            _ => panic!("expected a join node"),
        }
    }

    #[test]
    fn test_equi_join_prefers_hash_for_large_inputs() {
        let relations = vec![rel("x", 1000.0), rel("y", 1000.0)];
        let edges = vec![JoinEdge {
            left: 0,
            right: 1,
            selectivity: 0.001,
        }];
        let model = CostModel::new();
        let result = reorder(&relations, &edges, &model);
        match result.tree {
            JoinTree::Node { algorithm, .. } => assert_eq!(algorithm, JoinAlgorithm::Hash),
            _ => panic!("expected a join node"),
        }
    }

    #[test]
    fn test_greedy_handles_many_relations() {
        let relations: Vec<JoinRelation> =
            (0..12).map(|i| rel(&format!("t{i}"), 100.0 * (i + 1) as f64)).collect();
        let edges: Vec<JoinEdge> = (0..11)
            .map(|i| JoinEdge {
                left: i,
                right: i + 1,
                selectivity: 0.01,
            })
            .collect();
        let model = CostModel::new();
        let result = reorder(&relations, &edges, &model);
        let mut leaves = Vec::new();
        result.tree.leaves(&mut leaves);
        leaves.sort_unstable();
        assert_eq!(leaves, (0..12).collect::<Vec<_>>(), "all relations joined");
    }

    #[test]
    fn test_dp_covers_all_relations() {
        let relations = vec![
            rel("a", 50.0),
            rel("b", 500.0),
            rel("c", 5.0),
            rel("d", 5000.0),
        ];
        let edges = vec![
            JoinEdge { left: 0, right: 1, selectivity: 0.01 },
            JoinEdge { left: 1, right: 2, selectivity: 0.01 },
            JoinEdge { left: 2, right: 3, selectivity: 0.01 },
        ];
        let model = CostModel::new();
        let result = reorder(&relations, &edges, &model);
        let mut leaves = Vec::new();
        result.tree.leaves(&mut leaves);
        leaves.sort_unstable();
        assert_eq!(leaves, vec![0, 1, 2, 3]);
        assert!(result.cost > 0.0);
    }
}
