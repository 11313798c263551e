//! Genetic index selection
//!
//! Picks a subset of candidate indexes under per-table and per-index
//! constraints, maximizing the summed benefit estimates from the recent
//! workload. Population-based search with elitism, adaptive mutation and
//! crossover rates, and cooperative cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Constraint-violation penalty.
const PENALTY: f64 = 1000.0;

/// A candidate index with its estimated workload benefit.
#[derive(Debug, Clone)]
pub struct IndexCandidate {
    pub table: String,
    pub columns: Vec<String>,
    pub benefit: f64,
}

/// Selection constraints.
#[derive(Debug, Clone)]
pub struct Constraints {
    pub max_indexes_per_table: usize,
    pub max_columns_per_index: usize,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_indexes_per_table: 5,
            max_columns_per_index: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Roulette,
    Tournament,
}

/// Tuning knobs; defaults follow the classic configuration.
#[derive(Debug, Clone)]
pub struct GaConfig {
    pub population: usize,
    pub init_gene_prob: f64,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    pub max_generations: usize,
    pub selection: SelectionStrategy,
    pub elites: usize,
    pub tournament_size: usize,
    /// Converged when `(max - avg) / max` stays at or below this...
    pub convergence_epsilon: f64,
    /// ...for this many consecutive generations.
    pub convergence_window: usize,
    /// Deterministic seed for tests; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            population: 50,
            init_gene_prob: 0.3,
            crossover_rate: 0.8,
            mutation_rate: 0.1,
            max_generations: 100,
            selection: SelectionStrategy::Tournament,
            elites: 2,
            tournament_size: 3,
            convergence_epsilon: 0.01,
            convergence_window: 10,
            seed: None,
        }
    }
}

/// Outcome of a selection run.
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// Indices into the candidate list.
    pub selected: Vec<usize>,
    pub fitness: f64,
    pub generations: usize,
    pub cancelled: bool,
}

type Genome = Vec<bool>;

/// Fitness: summed benefit of selected candidates, minus a flat penalty for
/// any violated constraint.
fn fitness(genome: &Genome, candidates: &[IndexCandidate], constraints: &Constraints) -> f64 {
    let mut total = 0.0;
    let mut per_table: HashMap<&str, usize> = HashMap::new();
    let mut violated = false;

    for (i, selected) in genome.iter().enumerate() {
        if !selected {
            continue;
        }
        let c = &candidates[i];
        total += c.benefit;
        *per_table.entry(c.table.as_str()).or_default() += 1;
        if c.columns.len() > constraints.max_columns_per_index {
            violated = true;
        }
    }
    if per_table
        .values()
        .any(|&n| n > constraints.max_indexes_per_table)
    {
        violated = true;
    }
    if violated {
        total -= PENALTY;
    }
    total
}

/// Run the genetic search. `cancel` is checked every generation.
pub fn select_indexes(
    candidates: &[IndexCandidate],
    constraints: &Constraints,
    config: &GaConfig,
    cancel: &AtomicBool,
) -> SelectionResult {
    if candidates.is_empty() {
        return SelectionResult {
            selected: vec![],
            fitness: 0.0,
            generations: 0,
            cancelled: false,
        };
    }
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let genes = candidates.len();
    let mut population: Vec<Genome> = (0..config.population.max(2))
        .map(|_| {
            (0..genes)
                .map(|_| rng.gen_bool(config.init_gene_prob))
                .collect()
        })
        .collect();

    let mut mutation_rate = config.mutation_rate;
    let mut crossover_rate = config.crossover_rate;
    let mut converged_streak = 0usize;
    let mut last_best = f64::NEG_INFINITY;
    let mut cancelled = false;
    let mut generation = 0usize;

    while generation < config.max_generations {
        if cancel.load(Ordering::Relaxed) {
            cancelled = true;
            break;
        }
        generation += 1;

        let mut scored: Vec<(f64, Genome)> = population
            .iter()
            .map(|g| (fitness(g, candidates, constraints), g.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let best = scored[0].0;
        let avg = scored.iter().map(|(f, _)| f).sum::<f64>() / scored.len() as f64;
        let convergence = if best.abs() > f64::EPSILON {
            ((best - avg) / best.abs()).abs()
        } else {
            0.0
        };
        let change_rate = if last_best.is_finite() && last_best.abs() > f64::EPSILON {
            ((best - last_best) / last_best.abs()).abs()
        } else {
            1.0
        };
        last_best = best;

        // Adaptive rates: a flat, converged population gets extra diversity;
        // a scattered one reverts to the defaults.
        if convergence < 0.01 && change_rate < 0.001 {
            mutation_rate = 0.2;
            crossover_rate = 0.7;
        } else if convergence > 0.1 {
            mutation_rate = config.mutation_rate;
            crossover_rate = config.crossover_rate;
        }

        if convergence <= config.convergence_epsilon {
            converged_streak += 1;
            if converged_streak >= config.convergence_window {
                population = scored.into_iter().map(|(_, g)| g).collect();
                break;
            }
        } else {
            converged_streak = 0;
        }

        // Elites carry over unchanged.
        let mut next: Vec<Genome> = scored
            .iter()
            .take(config.elites)
            .map(|(_, g)| g.clone())
            .collect();

        while next.len() < population.len() {
            let a = pick_parent(&scored, config, &mut rng);
            let b = pick_parent(&scored, config, &mut rng);
            let (mut c1, mut c2) = if rng.gen_bool(crossover_rate) && genes > 1 {
                single_point_crossover(a, b, &mut rng)
            } else {
                (a.clone(), b.clone())
            };
            mutate(&mut c1, mutation_rate, &mut rng);
            mutate(&mut c2, mutation_rate, &mut rng);
            next.push(c1);
            if next.len() < population.len() {
                next.push(c2);
            }
        }
        population = next;
    }

    let (best_fitness, best_genome) = population
        .iter()
        .map(|g| (fitness(g, candidates, constraints), g))
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(f, g)| (f, g.clone()))
        .unwrap();

    SelectionResult {
        selected: best_genome
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i))
            .collect(),
        fitness: best_fitness,
        generations: generation,
        cancelled,
    }
}

fn pick_parent<'a>(
    scored: &'a [(f64, Genome)],
    config: &GaConfig,
    rng: &mut StdRng,
) -> &'a Genome {
    match config.selection {
        SelectionStrategy::Tournament => {
            let mut best: Option<&(f64, Genome)> = None;
            for _ in 0..config.tournament_size.max(1) {
                let pick = &scored[rng.gen_range(0..scored.len())];
                best = match best {
                    Some(b) if b.0 >= pick.0 => Some(b),
                    _ => Some(pick),
                };
            }
            &best.unwrap().1
        }
        SelectionStrategy::Roulette => {
            // Shift fitness to be positive before spinning the wheel.
            let min = scored
                .iter()
                .map(|(f, _)| *f)
                .fold(f64::INFINITY, f64::min);
            let offset = if min < 0.0 { -min + 1.0 } else { 1.0 };
            let total: f64 = scored.iter().map(|(f, _)| f + offset).sum();
            let mut spin = rng.gen_range(0.0..total);
            for (f, g) in scored {
                spin -= f + offset;
                if spin <= 0.0 {
                    return g;
                }
            }
            &scored[scored.len() - 1].1
        }
    }
}

fn single_point_crossover(a: &Genome, b: &Genome, rng: &mut StdRng) -> (Genome, Genome) {
    let point = rng.gen_range(1..a.len());
    let mut c1 = a[..point].to_vec();
    c1.extend_from_slice(&b[point..]);
    let mut c2 = b[..point].to_vec();
    c2.extend_from_slice(&a[point..]);
    (c1, c2)
}

fn mutate(genome: &mut Genome, rate: f64, rng: &mut StdRng) {
    for gene in genome.iter_mut() {
        if rng.gen_bool(rate) {
            *gene = !*gene;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(table: &str, columns: &[&str], benefit: f64) -> IndexCandidate {
        IndexCandidate {
            table: table.into(),
            columns: columns.iter().map(|s| s.to_string()).collect(),
            benefit,
        }
    }

    fn config(seed: u64) -> GaConfig {
        GaConfig {
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_selects_high_benefit_candidates() {
        let candidates = vec![
            candidate("t", &["a"], 100.0),
            candidate("t", &["b"], 90.0),
            candidate("t", &["c"], 0.5),
        ];
        let result = select_indexes(
            &candidates,
            &Constraints::default(),
            &config(7),
            &AtomicBool::new(false),
        );
        assert!(result.selected.contains(&0));
        assert!(result.selected.contains(&1));
        assert!(result.fitness >= 190.0);
    }

    #[test]
    fn test_constraint_penalty_prunes_wide_indexes() {
        let constraints = Constraints {
            max_indexes_per_table: 5,
            max_columns_per_index: 2,
        };
        let candidates = vec![
            candidate("t", &["a"], 50.0),
            // Too many columns: any genome selecting it eats the penalty.
            candidate("t", &["a", "b", "c", "d"], 60.0),
        ];
        let result = select_indexes(
            &candidates,
            &constraints,
            &config(11),
            &AtomicBool::new(false),
        );
        assert_eq!(result.selected, vec![0]);
    }

    #[test]
    fn test_max_indexes_per_table_respected() {
        let constraints = Constraints {
            max_indexes_per_table: 2,
            max_columns_per_index: 3,
        };
        let candidates: Vec<IndexCandidate> = (0..6)
            .map(|i| candidate("t", &["c"], 10.0 + i as f64))
            .collect();
        let result = select_indexes(
            &candidates,
            &constraints,
            &config(13),
            &AtomicBool::new(false),
        );
        assert!(result.selected.len() <= 2, "selected {:?}", result.selected);
    }

    #[test]
    fn test_cancellation_stops_early() {
        let candidates: Vec<IndexCandidate> =
            (0..20).map(|i| candidate("t", &["c"], i as f64)).collect();
        let cancel = AtomicBool::new(true);
        let result = select_indexes(&candidates, &Constraints::default(), &config(17), &cancel);
        assert!(result.cancelled);
        assert_eq!(result.generations, 0);
    }

    #[test]
    fn test_empty_candidates() {
        let result = select_indexes(
            &[],
            &Constraints::default(),
            &config(1),
            &AtomicBool::new(false),
        );
        assert!(result.selected.is_empty());
        assert_eq!(result.fitness, 0.0);
    }

    #[test]
    fn test_roulette_strategy_also_converges() {
        let candidates = vec![
            candidate("t", &["a"], 100.0),
            candidate("t", &["b"], 1.0),
        ];
        let cfg = GaConfig {
            selection: SelectionStrategy::Roulette,
            seed: Some(23),
            ..Default::default()
        };
        let result =
            select_indexes(&candidates, &Constraints::default(), &cfg, &AtomicBool::new(false));
        assert!(result.selected.contains(&0));
    }
}
