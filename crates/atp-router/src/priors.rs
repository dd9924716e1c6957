//! # Reinforcement Priors
//!
//! Bayesian performance priors per `"<model>:<task>"` key, fed by aggregated
//! federated reward signals. Success rate carries a Beta posterior; latency
//! and quality smooth exponentially. Confidence grows with sample count and
//! gates how strongly a prior bends the scorer's objective vectors.

use crate::scorer::{MultiObjectiveScorer, ObjectiveVector};
use atp_common::metrics::{Counter, Gauge, Histogram, Registry};
use atp_federated::signal::{FederatedRewardSignal, RewardStats};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Exponential smoothing rate for latency and quality priors.
const EMA_ALPHA: f64 = 0.1;

/// Priors below this confidence leave objectives untouched.
const MIN_CONFIDENCE: f64 = 0.1;

const UPDATE_LATENCY_BUCKETS: [f64; 5] = [0.001, 0.005, 0.01, 0.1, 1.0];

// ─── Prior ──────────────────────────────────────────────────────────────────

/// Learned performance prior for one model/task pair.
#[derive(Debug, Clone)]
pub struct ReinforcementPrior {
    pub model_task_key: String,
    /// Posterior mean success rate, 0..=1.
    pub success_rate_prior: f64,
    pub latency_prior_ms: f64,
    /// 0..=1.
    pub quality_prior: f64,
    pub sample_count: u64,
    pub last_updated: SystemTime,
    /// 0..=1, saturating at 1000 samples.
    pub confidence: f64,
}

impl ReinforcementPrior {
    fn from_stats(model_task_key: &str, stats: &RewardStats) -> Self {
        ReinforcementPrior {
            model_task_key: model_task_key.to_string(),
            success_rate_prior: stats.success_rate,
            latency_prior_ms: stats.avg_latency,
            quality_prior: stats.quality_score.unwrap_or(0.5),
            sample_count: stats.total_samples,
            last_updated: SystemTime::now(),
            confidence: (stats.total_samples as f64 / 100.0).min(1.0),
        }
    }

    /// Fold new evidence into the prior: Beta posterior for success rate,
    /// EMA for latency and quality.
    fn update_from_stats(&mut self, stats: &RewardStats) {
        let prior_alpha = self.success_rate_prior * self.sample_count as f64;
        let prior_beta = (1.0 - self.success_rate_prior) * self.sample_count as f64;

        let successes = (stats.success_rate * stats.total_samples as f64).round();
        let failures = stats.total_samples as f64 - successes;

        let posterior_alpha = prior_alpha + successes;
        let posterior_beta = prior_beta + failures;
        if posterior_alpha + posterior_beta > 0.0 {
            self.success_rate_prior = posterior_alpha / (posterior_alpha + posterior_beta);
        }

        self.latency_prior_ms =
            (1.0 - EMA_ALPHA) * self.latency_prior_ms + EMA_ALPHA * stats.avg_latency;
        if let Some(quality) = stats.quality_score {
            self.quality_prior = (1.0 - EMA_ALPHA) * self.quality_prior + EMA_ALPHA * quality;
        }

        self.sample_count += stats.total_samples;
        self.last_updated = SystemTime::now();
        self.confidence = (self.sample_count as f64 / 1000.0).min(1.0);
    }

    /// Bend a base objective vector by this prior, proportional to
    /// confidence. Low-confidence priors are a no-op.
    pub fn adjusted(&self, base: &ObjectiveVector) -> ObjectiveVector {
        if self.confidence < MIN_CONFIDENCE {
            return *base;
        }
        ObjectiveVector {
            cost: base.cost + (1.0 - self.success_rate_prior) * self.confidence,
            latency: base.latency + self.latency_prior_ms * self.confidence,
            quality_score: (base.quality_score - (1.0 - self.quality_prior) * self.confidence)
                .max(0.0),
            carbon_intensity: base.carbon_intensity,
        }
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PriorTable {
    priors: HashMap<String, ReinforcementPrior>,
    last_aggregation_round: u64,
}

/// Owns the prior table and applies aggregated federated signals.
pub struct ReinforcementPriorManager {
    table: Mutex<PriorTable>,
    updates_applied: Arc<Counter>,
    update_failures: Arc<Counter>,
    active_priors: Arc<Gauge>,
    update_latency: Arc<Histogram>,
}

impl ReinforcementPriorManager {
    pub fn new(registry: &Registry) -> Self {
        ReinforcementPriorManager {
            table: Mutex::new(PriorTable::default()),
            updates_applied: registry.counter("prior_updates_applied_total"),
            update_failures: registry.counter("prior_update_failures_total"),
            active_priors: registry.gauge("active_priors"),
            update_latency: registry
                .histogram("prior_update_latency_seconds", &UPDATE_LATENCY_BUCKETS),
        }
    }

    /// Apply an aggregated signal. Invalid signals and stale rounds apply
    /// nothing; returns the number of priors created or updated.
    pub fn update_from_aggregated_signal(&self, signal: &FederatedRewardSignal) -> usize {
        let errors = signal.validate();
        if !errors.is_empty() {
            warn!(?errors, "rejected aggregated reward signal");
            self.update_failures.inc(1);
            return 0;
        }

        let start = Instant::now();
        let mut table = self.table.lock().expect("prior table poisoned");

        // Rounds are idempotent: anything at or before the last seen round
        // is a no-op.
        if signal.aggregation_round <= table.last_aggregation_round {
            debug!(
                round = signal.aggregation_round,
                last = table.last_aggregation_round,
                "skipping stale aggregation round"
            );
            return 0;
        }
        table.last_aggregation_round = signal.aggregation_round;

        let mut updates_applied = 0usize;
        for (key, stats) in &signal.reward_signals {
            match table.priors.get_mut(key) {
                Some(prior) => prior.update_from_stats(stats),
                None => {
                    table
                        .priors
                        .insert(key.clone(), ReinforcementPrior::from_stats(key, stats));
                }
            }
            updates_applied += 1;
        }

        self.updates_applied.inc(updates_applied as u64);
        self.active_priors.set(table.priors.len() as i64);
        self.update_latency.observe(start.elapsed().as_secs_f64());

        info!(
            updates_applied,
            round = signal.aggregation_round,
            "applied prior updates"
        );
        updates_applied
    }

    pub fn prior_for(&self, model_task_key: &str) -> Option<ReinforcementPrior> {
        self.table
            .lock()
            .ok()
            .and_then(|table| table.priors.get(model_task_key).cloned())
    }

    pub fn prior_count(&self) -> usize {
        self.table.lock().map(|t| t.priors.len()).unwrap_or(0)
    }

    /// Base objectives bent by the key's prior, if one exists.
    pub fn adjusted_objectives(
        &self,
        model_task_key: &str,
        base: &ObjectiveVector,
    ) -> ObjectiveVector {
        match self.prior_for(model_task_key) {
            Some(prior) => prior.adjusted(base),
            None => *base,
        }
    }

    /// Evict priors not updated within `max_age`. Returns the eviction
    /// count.
    pub fn cleanup_stale_priors(&self, max_age: Duration) -> usize {
        let mut table = self.table.lock().expect("prior table poisoned");
        let before = table.priors.len();
        table.priors.retain(|_, prior| {
            prior
                .last_updated
                .elapsed()
                .map(|age| age <= max_age)
                .unwrap_or(true)
        });
        let removed = before - table.priors.len();
        if removed > 0 {
            info!(removed, "cleaned up stale priors");
            self.active_priors.set(table.priors.len() as i64);
        }
        removed
    }
}

// ─── Prior-Aware Scorer ─────────────────────────────────────────────────────

/// A routing candidate bound to its model/task identity.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub option_id: String,
    pub model_task_key: Option<String>,
    pub objectives: ObjectiveVector,
    pub metadata: serde_json::Value,
}

impl Candidate {
    pub fn new(
        option_id: impl Into<String>,
        model_task_key: impl Into<String>,
        objectives: ObjectiveVector,
    ) -> Self {
        Candidate {
            option_id: option_id.into(),
            model_task_key: Some(model_task_key.into()),
            objectives,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A candidate after prior adjustment and scoring.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub reinforcement_score: f64,
    pub adjusted_objectives: ObjectiveVector,
}

/// Scorer composition: a base multi-objective scorer whose inputs pass
/// through the prior table first.
pub struct PriorAwareScorer {
    base: MultiObjectiveScorer,
    priors: Arc<ReinforcementPriorManager>,
}

impl PriorAwareScorer {
    pub fn new(registry: &Registry, priors: Arc<ReinforcementPriorManager>) -> Self {
        PriorAwareScorer {
            base: MultiObjectiveScorer::new(registry),
            priors,
        }
    }

    pub fn base(&self) -> &MultiObjectiveScorer {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut MultiObjectiveScorer {
        &mut self.base
    }

    pub fn priors(&self) -> &Arc<ReinforcementPriorManager> {
        &self.priors
    }

    /// Scalar score with optional prior adjustment.
    pub fn scalar_score(&self, objectives: &ObjectiveVector, model_task_key: Option<&str>) -> f64 {
        let adjusted = match model_task_key {
            Some(key) => self.priors.adjusted_objectives(key, objectives),
            None => *objectives,
        };
        self.base.scalar_score(&adjusted)
    }

    /// Score candidates through their priors, sorted best-first.
    pub fn score_candidates(&self, candidates: Vec<Candidate>) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|candidate| {
                let adjusted = match candidate.model_task_key.as_deref() {
                    Some(key) => self.priors.adjusted_objectives(key, &candidate.objectives),
                    None => candidate.objectives,
                };
                ScoredCandidate {
                    reinforcement_score: self.base.scalar_score(&adjusted),
                    adjusted_objectives: adjusted,
                    candidate,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.reinforcement_score
                .partial_cmp(&a.reinforcement_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atp_federated::signal::cluster_hash;
    use std::collections::BTreeMap;

    fn stats(success_rate: f64, avg_latency: f64, total_samples: u64) -> RewardStats {
        RewardStats {
            success_rate,
            avg_latency,
            total_samples,
            quality_score: None,
            cost_efficiency: None,
        }
    }

    fn signal(round: u64, key: &str, stats_value: RewardStats) -> FederatedRewardSignal {
        let mut rewards = BTreeMap::new();
        rewards.insert(key.to_string(), stats_value);
        FederatedRewardSignal::new(round, cluster_hash("c", "s"), rewards, 3)
    }

    fn manager() -> (Registry, ReinforcementPriorManager) {
        let registry = Registry::new();
        let manager = ReinforcementPriorManager::new(&registry);
        (registry, manager)
    }

    // ─── Prior Creation & Update ────────────────────────────────────────

    #[test]
    fn new_prior_initialized_from_signal() {
        let (registry, manager) = manager();
        let applied =
            manager.update_from_aggregated_signal(&signal(1, "gpt-4:chat", stats(0.9, 1200.0, 50)));
        assert_eq!(applied, 1);

        let prior = manager.prior_for("gpt-4:chat").unwrap();
        assert!((prior.success_rate_prior - 0.9).abs() < 1e-9);
        assert!((prior.latency_prior_ms - 1200.0).abs() < 1e-9);
        assert_eq!(prior.sample_count, 50);
        assert!((prior.confidence - 0.5).abs() < 1e-9); // 50 / 100
        assert_eq!(registry.gauge_value("active_priors"), 1);
        assert_eq!(registry.counter_value("prior_updates_applied_total"), 1);
    }

    #[test]
    fn bayesian_success_update() {
        let (_reg, manager) = manager();
        manager.update_from_aggregated_signal(&signal(1, "m:t", stats(0.5, 100.0, 100)));
        manager.update_from_aggregated_signal(&signal(2, "m:t", stats(1.0, 100.0, 100)));

        let prior = manager.prior_for("m:t").unwrap();
        // Beta(50, 50) + 100 successes → mean 150/200.
        assert!((prior.success_rate_prior - 0.75).abs() < 1e-9);
        assert_eq!(prior.sample_count, 200);
        assert!((prior.confidence - 0.2).abs() < 1e-9); // 200 / 1000
    }

    #[test]
    fn latency_smooths_exponentially() {
        let (_reg, manager) = manager();
        manager.update_from_aggregated_signal(&signal(1, "m:t", stats(0.9, 100.0, 100)));
        manager.update_from_aggregated_signal(&signal(2, "m:t", stats(0.9, 200.0, 100)));

        let prior = manager.prior_for("m:t").unwrap();
        // 0.9 × 100 + 0.1 × 200 = 110.
        assert!((prior.latency_prior_ms - 110.0).abs() < 1e-9);
    }

    #[test]
    fn quality_updates_only_when_present() {
        let (_reg, manager) = manager();
        let mut with_quality = stats(0.9, 100.0, 100);
        with_quality.quality_score = Some(0.8);
        manager.update_from_aggregated_signal(&signal(1, "m:t", with_quality));
        manager.update_from_aggregated_signal(&signal(2, "m:t", stats(0.9, 100.0, 100)));

        let prior = manager.prior_for("m:t").unwrap();
        assert!((prior.quality_prior - 0.8).abs() < 1e-9);
    }

    // ─── Idempotence & Validation ───────────────────────────────────────

    #[test]
    fn same_round_applies_once() {
        let (_reg, manager) = manager();
        let s = signal(5, "m:t", stats(0.9, 100.0, 100));
        assert_eq!(manager.update_from_aggregated_signal(&s), 1);
        let snapshot = manager.prior_for("m:t").unwrap();

        assert_eq!(manager.update_from_aggregated_signal(&s), 0);
        let after = manager.prior_for("m:t").unwrap();
        assert_eq!(after.sample_count, snapshot.sample_count);
        assert!((after.success_rate_prior - snapshot.success_rate_prior).abs() < 1e-12);
    }

    #[test]
    fn older_round_skipped() {
        let (_reg, manager) = manager();
        manager.update_from_aggregated_signal(&signal(10, "m:t", stats(0.9, 100.0, 100)));
        assert_eq!(
            manager.update_from_aggregated_signal(&signal(3, "m:t", stats(0.1, 1.0, 100))),
            0
        );
        assert!((manager.prior_for("m:t").unwrap().success_rate_prior - 0.9).abs() < 1e-9);
    }

    #[test]
    fn invalid_signal_rejected_and_counted() {
        let (registry, manager) = manager();
        let mut bad = signal(1, "m:t", stats(0.9, 100.0, 100));
        bad.cluster_hash = "short".into();
        assert_eq!(manager.update_from_aggregated_signal(&bad), 0);
        assert_eq!(registry.counter_value("prior_update_failures_total"), 1);
        assert_eq!(manager.prior_count(), 0);
    }

    // ─── Stale Cleanup ──────────────────────────────────────────────────

    #[test]
    fn stale_priors_evicted() {
        let (registry, manager) = manager();
        manager.update_from_aggregated_signal(&signal(1, "m:t", stats(0.9, 100.0, 100)));
        assert_eq!(manager.cleanup_stale_priors(Duration::ZERO), 1);
        assert_eq!(manager.prior_count(), 0);
        assert_eq!(registry.gauge_value("active_priors"), 0);
    }

    #[test]
    fn fresh_priors_survive_cleanup() {
        let (_reg, manager) = manager();
        manager.update_from_aggregated_signal(&signal(1, "m:t", stats(0.9, 100.0, 100)));
        assert_eq!(manager.cleanup_stale_priors(Duration::from_secs(3600)), 0);
        assert_eq!(manager.prior_count(), 1);
    }

    // ─── Objective Adjustment ───────────────────────────────────────────

    #[test]
    fn adjustment_follows_prior_formulas() {
        let prior = ReinforcementPrior {
            model_task_key: "m:t".into(),
            success_rate_prior: 0.8,
            latency_prior_ms: 100.0,
            quality_prior: 0.9,
            sample_count: 500,
            last_updated: SystemTime::now(),
            confidence: 0.5,
        };
        let base = ObjectiveVector::new(1.0, 200.0, 0.9, 50.0).unwrap();
        let adjusted = prior.adjusted(&base);

        assert!((adjusted.cost - (1.0 + 0.2 * 0.5)).abs() < 1e-9);
        assert!((adjusted.latency - (200.0 + 100.0 * 0.5)).abs() < 1e-9);
        assert!((adjusted.quality_score - (0.9 - 0.1 * 0.5)).abs() < 1e-9);
        assert!((adjusted.carbon_intensity - 50.0).abs() < 1e-9);
    }

    #[test]
    fn low_confidence_prior_is_noop() {
        let prior = ReinforcementPrior {
            model_task_key: "m:t".into(),
            success_rate_prior: 0.1,
            latency_prior_ms: 9999.0,
            quality_prior: 0.1,
            sample_count: 5,
            last_updated: SystemTime::now(),
            confidence: 0.05,
        };
        let base = ObjectiveVector::new(1.0, 200.0, 0.9, 50.0).unwrap();
        assert_eq!(prior.adjusted(&base), base);
    }

    #[test]
    fn unknown_key_leaves_objectives_unchanged() {
        let (_reg, manager) = manager();
        let base = ObjectiveVector::new(1.0, 200.0, 0.9, 50.0).unwrap();
        assert_eq!(manager.adjusted_objectives("nope", &base), base);
    }

    // ─── Prior-Aware Scoring ────────────────────────────────────────────

    #[test]
    fn poor_prior_demotes_candidate() {
        let registry = Registry::new();
        let manager = Arc::new(ReinforcementPriorManager::new(&registry));
        // "flaky" has a terrible, confident prior; "steady" has none.
        manager.update_from_aggregated_signal(&signal(1, "flaky:chat", stats(0.1, 4000.0, 900)));

        let scorer = PriorAwareScorer::new(&registry, Arc::clone(&manager));
        let objectives = ObjectiveVector::new(1.0, 200.0, 0.9, 50.0).unwrap();
        let scored = scorer.score_candidates(vec![
            Candidate::new("a", "flaky:chat", objectives),
            Candidate::new("b", "steady:chat", objectives),
        ]);

        assert_eq!(scored[0].candidate.option_id, "b");
        assert!(scored[0].reinforcement_score > scored[1].reinforcement_score);
        // The flaky candidate's adjusted vector moved; the other didn't.
        assert!(scored[1].adjusted_objectives.latency > objectives.latency);
        assert_eq!(scored[0].adjusted_objectives, objectives);
    }

    #[test]
    fn scalar_score_without_key_uses_base() {
        let registry = Registry::new();
        let manager = Arc::new(ReinforcementPriorManager::new(&registry));
        let scorer = PriorAwareScorer::new(&registry, manager);
        let objectives = ObjectiveVector::new(1.0, 200.0, 0.9, 50.0).unwrap();
        let with_none = scorer.scalar_score(&objectives, None);
        let base = scorer.base().scalar_score(&objectives);
        assert!((with_none - base).abs() < 1e-12);
    }
}
