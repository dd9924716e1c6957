//! # Federated Reward Signals
//!
//! Schema for anonymous cluster statistics shared across routers. Signals
//! carry per-(model, task) reward statistics keyed as `"<model>:<task>"`,
//! stamped with an aggregation round and an anonymous cluster hash.
//!
//! Validation enumerates failing field paths rather than stopping at the
//! first error, so a rejected signal can be diagnosed from the log line.

use atp_common::metrics::Registry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Fixed schema version for federated reward signals.
pub const SCHEMA_VERSION: u32 = 1;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid federated reward signal: {0:?}")]
    Invalid(Vec<String>),
    #[error("malformed signal json: {0}")]
    Json(#[from] serde_json::Error),
}

// ─── Schema ─────────────────────────────────────────────────────────────────

/// Reward statistics for one `"<model>:<task>"` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardStats {
    /// Fraction of successful requests, 0..=1.
    pub success_rate: f64,
    /// Average latency in milliseconds.
    pub avg_latency: f64,
    /// Number of samples aggregated into this entry.
    pub total_samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_efficiency: Option<f64>,
}

/// Anonymous cluster statistics for one aggregation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedRewardSignal {
    pub schema_version: u32,
    pub aggregation_round: u64,
    /// Anonymous cluster identifier (SHA-256 hash), 16..=64 chars.
    pub cluster_hash: String,
    pub reward_signals: BTreeMap<String, RewardStats>,
    /// Number of routers contributing to this signal.
    pub participant_count: u32,
    /// RFC 3339 creation timestamp.
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_budget_used: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_scale: Option<f64>,
}

impl FederatedRewardSignal {
    pub fn new(
        aggregation_round: u64,
        cluster_hash: impl Into<String>,
        reward_signals: BTreeMap<String, RewardStats>,
        participant_count: u32,
    ) -> Self {
        FederatedRewardSignal {
            schema_version: SCHEMA_VERSION,
            aggregation_round,
            cluster_hash: cluster_hash.into(),
            reward_signals,
            participant_count,
            timestamp: chrono::Utc::now().to_rfc3339(),
            privacy_budget_used: None,
            noise_scale: None,
        }
    }

    /// Validate against the schema. Returns the failing field paths, empty
    /// when the signal is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.schema_version != SCHEMA_VERSION {
            errors.push(format!(
                "schema_version: expected {SCHEMA_VERSION}, got {}",
                self.schema_version
            ));
        }
        if self.aggregation_round < 1 {
            errors.push("aggregation_round: must be >= 1".into());
        }
        if self.cluster_hash.len() < 16 || self.cluster_hash.len() > 64 {
            errors.push("cluster_hash: must be 16..=64 characters".into());
        }
        if self.participant_count < 1 {
            errors.push("participant_count: must be >= 1".into());
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            errors.push("timestamp: not RFC 3339".into());
        }

        for (key, stats) in &self.reward_signals {
            if !(0.0..=1.0).contains(&stats.success_rate) {
                errors.push(format!("reward_signals.{key}.success_rate: must be in [0, 1]"));
            }
            if !stats.avg_latency.is_finite() || stats.avg_latency < 0.0 {
                errors.push(format!("reward_signals.{key}.avg_latency: must be >= 0"));
            }
            if stats.total_samples < 1 {
                errors.push(format!("reward_signals.{key}.total_samples: must be >= 1"));
            }
            if let Some(quality) = stats.quality_score {
                if !(0.0..=1.0).contains(&quality) {
                    errors.push(format!("reward_signals.{key}.quality_score: must be in [0, 1]"));
                }
            }
            if let Some(cost) = stats.cost_efficiency {
                if !cost.is_finite() || cost < 0.0 {
                    errors.push(format!("reward_signals.{key}.cost_efficiency: must be >= 0"));
                }
            }
        }

        if let Some(budget) = self.privacy_budget_used {
            if !budget.is_finite() || budget < 0.0 {
                errors.push("privacy_budget_used: must be >= 0".into());
            }
        }
        if let Some(noise) = self.noise_scale {
            if !noise.is_finite() || noise < 0.0 {
                errors.push("noise_scale: must be >= 0".into());
            }
        }

        errors
    }

    /// Serialize for transport, recording a reward-batch publication.
    pub fn publish(&self, registry: &Registry) -> Result<String, SignalError> {
        let raw = serde_json::to_string(self)?;
        registry.counter("federated_reward_batches_total").inc(1);
        Ok(raw)
    }

    /// Parse and validate a signal from its JSON form.
    pub fn from_json(raw: &str) -> Result<Self, SignalError> {
        let signal: FederatedRewardSignal = serde_json::from_str(raw)?;
        let errors = signal.validate();
        if !errors.is_empty() {
            return Err(SignalError::Invalid(errors));
        }
        Ok(signal)
    }
}

/// Anonymous cluster identifier: full hex SHA-256 over `"<cluster_id>:<salt>"`.
pub fn cluster_hash(cluster_id: &str, salt: &str) -> String {
    hex::encode(Sha256::digest(format!("{cluster_id}:{salt}").as_bytes()))
}

// ─── Aggregation ────────────────────────────────────────────────────────────

/// Merge signals from the same `(cluster_hash, aggregation_round)`.
///
/// Required fields are sample-weighted averages; `total_samples` sums;
/// optional fields average over the contributors that provided them;
/// `privacy_budget_used` sums; `noise_scale` averages over setters. Returns
/// `None` for an empty or mismatched input set.
pub fn aggregate_signals(signals: &[FederatedRewardSignal]) -> Option<FederatedRewardSignal> {
    let first = signals.first()?;
    if signals
        .iter()
        .any(|s| s.cluster_hash != first.cluster_hash || s.aggregation_round != first.aggregation_round)
    {
        return None;
    }

    let mut all_keys: Vec<&String> = signals.iter().flat_map(|s| s.reward_signals.keys()).collect();
    all_keys.sort();
    all_keys.dedup();

    let mut merged = BTreeMap::new();
    for key in all_keys {
        let contributors: Vec<&RewardStats> = signals
            .iter()
            .filter_map(|s| s.reward_signals.get(key))
            .collect();
        let total_weight: f64 = contributors.iter().map(|c| c.total_samples as f64).sum();
        if total_weight <= 0.0 {
            continue;
        }

        let success_rate = contributors
            .iter()
            .map(|c| c.success_rate * c.total_samples as f64)
            .sum::<f64>()
            / total_weight;
        let avg_latency = contributors
            .iter()
            .map(|c| c.avg_latency * c.total_samples as f64)
            .sum::<f64>()
            / total_weight;
        let total_samples: u64 = contributors.iter().map(|c| c.total_samples).sum();

        let quality_score = weighted_optional(&contributors, |c| c.quality_score);
        let cost_efficiency = weighted_optional(&contributors, |c| c.cost_efficiency);

        merged.insert(
            key.clone(),
            RewardStats {
                success_rate,
                avg_latency,
                total_samples,
                quality_score,
                cost_efficiency,
            },
        );
    }

    let privacy_budget: f64 = signals.iter().filter_map(|s| s.privacy_budget_used).sum();
    let noise_scales: Vec<f64> = signals.iter().filter_map(|s| s.noise_scale).collect();

    let mut out = FederatedRewardSignal::new(
        first.aggregation_round,
        first.cluster_hash.clone(),
        merged,
        signals.iter().map(|s| s.participant_count).sum(),
    );
    out.privacy_budget_used = (privacy_budget > 0.0).then_some(privacy_budget);
    out.noise_scale = (!noise_scales.is_empty())
        .then(|| noise_scales.iter().sum::<f64>() / noise_scales.len() as f64);
    Some(out)
}

/// Sample-weighted average of an optional field over the contributors that
/// set it.
fn weighted_optional(
    contributors: &[&RewardStats],
    field: impl Fn(&RewardStats) -> Option<f64>,
) -> Option<f64> {
    let mut sum = 0.0;
    let mut weight = 0.0;
    for c in contributors {
        if let Some(v) = field(c) {
            sum += v * c.total_samples as f64;
            weight += c.total_samples as f64;
        }
    }
    (weight > 0.0).then(|| sum / weight)
}
