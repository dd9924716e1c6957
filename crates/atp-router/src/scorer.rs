//! # Multi-Objective Scorer
//!
//! Routing decisions over four objectives: cost, latency, and carbon
//! intensity minimized, quality maximized. Two modes: Pareto-frontier
//! filtering by dominance, or weighted scalarization against fixed
//! normalization bounds. The scorer is a decision combinator, not a learner.

use atp_common::metrics::{Counter, Histogram, Registry};
use rand::Rng;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const FRONTIER_SIZE_BUCKETS: [f64; 5] = [1.0, 5.0, 10.0, 20.0, 50.0];

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("quality score must be in [0, 1], got {0}")]
    QualityRange(f64),
    #[error("{axis} must be non-negative, got {value}")]
    NegativeAxis { axis: &'static str, value: f64 },
    #[error("weights must each be in [0, 1] and sum to 1.0")]
    InvalidWeights,
}

// ─── Objective Vector ───────────────────────────────────────────────────────

/// A point in objective space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveVector {
    /// USD cost (minimize).
    pub cost: f64,
    /// Milliseconds (minimize).
    pub latency: f64,
    /// 0..=1 (maximize).
    pub quality_score: f64,
    /// gCO2e/kWh (minimize).
    pub carbon_intensity: f64,
}

impl ObjectiveVector {
    pub fn new(
        cost: f64,
        latency: f64,
        quality_score: f64,
        carbon_intensity: f64,
    ) -> Result<Self, ScoreError> {
        if !(0.0..=1.0).contains(&quality_score) {
            return Err(ScoreError::QualityRange(quality_score));
        }
        for (axis, value) in [
            ("cost", cost),
            ("latency", latency),
            ("carbon_intensity", carbon_intensity),
        ] {
            if value < 0.0 {
                return Err(ScoreError::NegativeAxis { axis, value });
            }
        }
        Ok(ObjectiveVector {
            cost,
            latency,
            quality_score,
            carbon_intensity,
        })
    }

    /// Pareto dominance: better or equal on every axis, strictly better on
    /// at least one.
    pub fn dominates(&self, other: &ObjectiveVector) -> bool {
        let all_better_or_equal = self.cost <= other.cost
            && self.latency <= other.latency
            && self.carbon_intensity <= other.carbon_intensity
            && self.quality_score >= other.quality_score;
        let strictly_better = self.cost < other.cost
            || self.latency < other.latency
            || self.quality_score > other.quality_score
            || self.carbon_intensity < other.carbon_intensity;
        all_better_or_equal && strictly_better
    }

    /// Euclidean distance, with quality negated so all axes point the same
    /// way.
    pub fn distance_to(&self, other: &ObjectiveVector) -> f64 {
        ((self.cost - other.cost).powi(2)
            + (self.latency - other.latency).powi(2)
            + (other.quality_score - self.quality_score).powi(2)
            + (self.carbon_intensity - other.carbon_intensity).powi(2))
        .sqrt()
    }

    /// The ideal point: free, instant, perfect, carbon-neutral.
    pub fn ideal() -> Self {
        ObjectiveVector {
            cost: 0.0,
            latency: 0.0,
            quality_score: 1.0,
            carbon_intensity: 0.0,
        }
    }
}

// ─── Options ────────────────────────────────────────────────────────────────

/// A routing option with its objectives and caller metadata.
#[derive(Debug, Clone)]
pub struct ScoredOption {
    pub option_id: String,
    pub objectives: ObjectiveVector,
    pub metadata: serde_json::Value,
    /// Populated by weighted scalarization.
    pub scalar_score: f64,
}

impl ScoredOption {
    pub fn new(option_id: impl Into<String>, objectives: ObjectiveVector) -> Self {
        ScoredOption {
            option_id: option_id.into(),
            objectives,
            metadata: serde_json::Value::Null,
            scalar_score: 0.0,
        }
    }
}

/// How to pick a single winner from a Pareto frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    First,
    Random,
    ClosestToIdeal,
}

// ─── Weights & Bounds ───────────────────────────────────────────────────────

/// Scalarization weights; must each be in [0, 1] and sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub cost: f64,
    pub latency: f64,
    pub quality_score: f64,
    pub carbon_intensity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoreWeights {
            cost: 0.25,
            latency: 0.25,
            quality_score: 0.25,
            carbon_intensity: 0.25,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<(), ScoreError> {
        let weights = [self.cost, self.latency, self.quality_score, self.carbon_intensity];
        if weights.iter().any(|w| !(0.0..=1.0).contains(w)) {
            return Err(ScoreError::InvalidWeights);
        }
        if (weights.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
            return Err(ScoreError::InvalidWeights);
        }
        Ok(())
    }
}

/// Normalization bounds for scalarization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreBounds {
    pub max_cost: f64,
    pub max_latency_ms: f64,
    pub max_carbon_intensity: f64,
}

impl Default for ScoreBounds {
    fn default() -> Self {
        ScoreBounds {
            max_cost: 10.0,
            max_latency_ms: 5000.0,
            max_carbon_intensity: 1000.0,
        }
    }
}

// ─── Scorer ─────────────────────────────────────────────────────────────────

pub struct MultiObjectiveScorer {
    weights: ScoreWeights,
    bounds: ScoreBounds,
    invocations: Arc<Counter>,
    dominated: Arc<Counter>,
    frontier_size: Arc<Histogram>,
}

impl MultiObjectiveScorer {
    pub fn new(registry: &Registry) -> Self {
        MultiObjectiveScorer {
            weights: ScoreWeights::default(),
            bounds: ScoreBounds::default(),
            invocations: registry.counter("multi_objective_scoring_invocations_total"),
            dominated: registry.counter("multi_objective_pareto_dominated_total"),
            frontier_size: registry
                .histogram("multi_objective_frontier_size", &FRONTIER_SIZE_BUCKETS),
        }
    }

    pub fn set_weights(&mut self, weights: ScoreWeights) -> Result<(), ScoreError> {
        weights.validate()?;
        self.weights = weights;
        Ok(())
    }

    pub fn set_bounds(&mut self, bounds: ScoreBounds) {
        self.bounds = bounds;
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Weighted scalar score in [0, 1]; higher is better.
    pub fn scalar_score(&self, objectives: &ObjectiveVector) -> f64 {
        let cost_norm = (1.0 - objectives.cost / self.bounds.max_cost).max(0.0);
        let latency_norm = (1.0 - objectives.latency / self.bounds.max_latency_ms).max(0.0);
        let quality_norm = objectives.quality_score;
        let carbon_norm =
            (1.0 - objectives.carbon_intensity / self.bounds.max_carbon_intensity).max(0.0);

        self.weights.cost * cost_norm
            + self.weights.latency * latency_norm
            + self.weights.quality_score * quality_norm
            + self.weights.carbon_intensity * carbon_norm
    }

    /// Non-dominated subset of the options.
    pub fn pareto_frontier(&self, options: Vec<ScoredOption>) -> Vec<ScoredOption> {
        let mut frontier: Vec<ScoredOption> = Vec::new();

        for candidate in options {
            let dominated = frontier
                .iter()
                .any(|member| member.objectives.dominates(&candidate.objectives));
            if dominated {
                self.dominated.inc(1);
                continue;
            }
            frontier.retain(|member| !candidate.objectives.dominates(&member.objectives));
            frontier.push(candidate);
        }

        self.frontier_size.observe(frontier.len() as f64);
        frontier
    }

    /// Score options: Pareto frontier, or scalar-scored and sorted
    /// descending.
    pub fn score_options(&self, options: Vec<ScoredOption>, use_pareto: bool) -> Vec<ScoredOption> {
        self.invocations.inc(1);
        if options.is_empty() {
            return Vec::new();
        }

        if use_pareto {
            return self.pareto_frontier(options);
        }

        let mut scored = options;
        for option in &mut scored {
            option.scalar_score = self.scalar_score(&option.objectives);
        }
        scored.sort_by(|a, b| {
            b.scalar_score
                .partial_cmp(&a.scalar_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }

    /// Pick the single best option under the given strategy.
    pub fn select_best(
        &self,
        options: Vec<ScoredOption>,
        use_pareto: bool,
        strategy: SelectionStrategy,
        rng: &mut impl Rng,
    ) -> Option<ScoredOption> {
        let scored = self.score_options(options, use_pareto);
        if scored.is_empty() {
            return None;
        }
        if !use_pareto {
            return scored.into_iter().next();
        }

        match strategy {
            SelectionStrategy::First => scored.into_iter().next(),
            SelectionStrategy::Random => {
                let idx = ((rng.random::<f64>() * scored.len() as f64) as usize)
                    .min(scored.len() - 1);
                scored.into_iter().nth(idx)
            }
            SelectionStrategy::ClosestToIdeal => {
                let ideal = ObjectiveVector::ideal();
                scored.into_iter().min_by(|a, b| {
                    a.objectives
                        .distance_to(&ideal)
                        .partial_cmp(&b.objectives.distance_to(&ideal))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vector(cost: f64, latency: f64, quality: f64, carbon: f64) -> ObjectiveVector {
        ObjectiveVector::new(cost, latency, quality, carbon).unwrap()
    }

    fn scorer() -> (Registry, MultiObjectiveScorer) {
        let registry = Registry::new();
        let scorer = MultiObjectiveScorer::new(&registry);
        (registry, scorer)
    }

    // ─── Validation ─────────────────────────────────────────────────────

    #[test]
    fn quality_out_of_range_rejected() {
        assert!(ObjectiveVector::new(1.0, 1.0, 1.5, 0.0).is_err());
        assert!(ObjectiveVector::new(1.0, 1.0, -0.1, 0.0).is_err());
    }

    #[test]
    fn negative_axes_rejected() {
        assert!(ObjectiveVector::new(-1.0, 1.0, 0.5, 0.0).is_err());
        assert!(ObjectiveVector::new(1.0, -1.0, 0.5, 0.0).is_err());
        assert!(ObjectiveVector::new(1.0, 1.0, 0.5, -1.0).is_err());
    }

    #[test]
    fn weights_must_sum_to_one() {
        let (_reg, mut scorer) = scorer();
        assert!(scorer
            .set_weights(ScoreWeights {
                cost: 0.5,
                latency: 0.5,
                quality_score: 0.5,
                carbon_intensity: 0.5,
            })
            .is_err());
        assert!(scorer
            .set_weights(ScoreWeights {
                cost: 0.4,
                latency: 0.3,
                quality_score: 0.2,
                carbon_intensity: 0.1,
            })
            .is_ok());
    }

    // ─── Dominance ──────────────────────────────────────────────────────

    #[test]
    fn strictly_better_dominates() {
        let a = vector(1.0, 100.0, 0.9, 50.0);
        let b = vector(2.0, 200.0, 0.8, 100.0);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
    }

    #[test]
    fn equal_vectors_do_not_dominate() {
        let a = vector(1.0, 100.0, 0.9, 50.0);
        assert!(!a.dominates(&a));
    }

    #[test]
    fn tradeoffs_do_not_dominate() {
        let cheap_slow = vector(1.0, 500.0, 0.8, 50.0);
        let fast_pricey = vector(5.0, 50.0, 0.8, 50.0);
        assert!(!cheap_slow.dominates(&fast_pricey));
        assert!(!fast_pricey.dominates(&cheap_slow));
    }

    // ─── Pareto Frontier ────────────────────────────────────────────────

    #[test]
    fn frontier_drops_dominated_options() {
        let (registry, scorer) = scorer();
        let options = vec![
            ScoredOption::new("good", vector(1.0, 100.0, 0.9, 50.0)),
            ScoredOption::new("bad", vector(2.0, 200.0, 0.8, 100.0)),
            ScoredOption::new("tradeoff", vector(0.5, 400.0, 0.7, 50.0)),
        ];
        let frontier = scorer.pareto_frontier(options);
        let ids: Vec<&str> = frontier.iter().map(|o| o.option_id.as_str()).collect();
        assert!(ids.contains(&"good"));
        assert!(ids.contains(&"tradeoff"));
        assert!(!ids.contains(&"bad"));
        assert_eq!(registry.counter_value("multi_objective_pareto_dominated_total"), 1);
        assert_eq!(registry.histogram_count("multi_objective_frontier_size"), 1);
    }

    #[test]
    fn later_candidate_can_evict_frontier_members() {
        let (_reg, scorer) = scorer();
        let options = vec![
            ScoredOption::new("mediocre", vector(2.0, 200.0, 0.8, 100.0)),
            ScoredOption::new("dominant", vector(1.0, 100.0, 0.9, 50.0)),
        ];
        let frontier = scorer.pareto_frontier(options);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].option_id, "dominant");
    }

    // ─── Scalarization ──────────────────────────────────────────────────

    #[test]
    fn ideal_point_scores_one() {
        let (_reg, scorer) = scorer();
        let score = scorer.scalar_score(&ObjectiveVector::ideal());
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn scalar_scores_sort_descending() {
        let (_reg, scorer) = scorer();
        let options = vec![
            ScoredOption::new("worse", vector(8.0, 4000.0, 0.2, 800.0)),
            ScoredOption::new("better", vector(1.0, 200.0, 0.9, 100.0)),
        ];
        let scored = scorer.score_options(options, false);
        assert_eq!(scored[0].option_id, "better");
        assert!(scored[0].scalar_score > scored[1].scalar_score);
    }

    #[test]
    fn out_of_bounds_axes_clamp_to_zero() {
        let (_reg, scorer) = scorer();
        let score = scorer.scalar_score(&vector(100.0, 60_000.0, 0.0, 5000.0));
        assert!((score - 0.0).abs() < 1e-9);
    }

    // ─── Selection ──────────────────────────────────────────────────────

    #[test]
    fn select_first_from_frontier() {
        let (_reg, scorer) = scorer();
        let mut rng = StdRng::seed_from_u64(1);
        let options = vec![
            ScoredOption::new("a", vector(1.0, 100.0, 0.9, 50.0)),
            ScoredOption::new("b", vector(0.5, 400.0, 0.7, 50.0)),
        ];
        let best = scorer
            .select_best(options, true, SelectionStrategy::First, &mut rng)
            .unwrap();
        assert_eq!(best.option_id, "a");
    }

    #[test]
    fn select_closest_to_ideal() {
        let (_reg, scorer) = scorer();
        let mut rng = StdRng::seed_from_u64(1);
        let options = vec![
            ScoredOption::new("near", vector(0.1, 1.0, 0.99, 0.1)),
            ScoredOption::new("far", vector(0.2, 450.0, 0.5, 0.2)),
        ];
        let best = scorer
            .select_best(options, true, SelectionStrategy::ClosestToIdeal, &mut rng)
            .unwrap();
        assert_eq!(best.option_id, "near");
    }

    #[test]
    fn select_random_stays_on_frontier() {
        let (_reg, scorer) = scorer();
        let mut rng = StdRng::seed_from_u64(42);
        let options = vec![
            ScoredOption::new("a", vector(1.0, 100.0, 0.9, 50.0)),
            ScoredOption::new("b", vector(0.5, 400.0, 0.7, 50.0)),
            ScoredOption::new("dominated", vector(2.0, 500.0, 0.6, 60.0)),
        ];
        for _ in 0..20 {
            let best = scorer
                .select_best(options.clone(), true, SelectionStrategy::Random, &mut rng)
                .unwrap();
            assert_ne!(best.option_id, "dominated");
        }
    }

    #[test]
    fn empty_options_select_none() {
        let (_reg, scorer) = scorer();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(scorer
            .select_best(Vec::new(), true, SelectionStrategy::First, &mut rng)
            .is_none());
    }

    #[test]
    fn invocations_counted() {
        let (registry, scorer) = scorer();
        scorer.score_options(Vec::new(), true);
        scorer.score_options(
            vec![ScoredOption::new("a", vector(1.0, 1.0, 0.5, 1.0))],
            false,
        );
        assert_eq!(
            registry.counter_value("multi_objective_scoring_invocations_total"),
            2
        );
    }
}
