//! # Secure Aggregation
//!
//! Privacy-preserving merge of federated reward signals. Each router holds a
//! signing key and shares a symmetric integer cipher with the coordinator;
//! contributions carry differential-privacy noise, per-field encrypted
//! values, and an HMAC-SHA256 signature over the canonical contribution
//! payload.
//!
//! The coordinator decrypts each contribution and averages the values. A
//! production deployment would replace the per-contribution decrypt with
//! additive homomorphism; the protocol surface would not change.

use crate::signal::{FederatedRewardSignal, RewardStats, SignalError};
use atp_common::metrics::{Counter, Registry};
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::RngExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SecureAggError {
    #[error("invalid signal: {0}")]
    InvalidSignal(#[from] SignalError),
    #[error("malformed ciphertext")]
    Ciphertext,
}

// ─── Integer Cipher ─────────────────────────────────────────────────────────

/// Symmetric integer cipher: an 8-byte nonce plus the value XORed with a
/// keystream derived from the shared key and nonce, hex-encoded.
pub struct SealedIntCipher {
    key: [u8; 32],
}

impl SealedIntCipher {
    pub fn new(shared_key: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(b"atp-seal:");
        h.update(shared_key);
        SealedIntCipher {
            key: h.finalize().into(),
        }
    }

    fn keystream(&self, nonce: &[u8; 8]) -> [u8; 8] {
        let mut h = Sha256::new();
        h.update(self.key);
        h.update(nonce);
        let digest = h.finalize();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        out
    }

    pub fn encrypt_int(&self, value: i64, nonce: [u8; 8]) -> String {
        let stream = self.keystream(&nonce);
        let body: Vec<u8> = value
            .to_be_bytes()
            .iter()
            .zip(stream.iter())
            .map(|(v, k)| v ^ k)
            .collect();
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        hex::encode(out)
    }

    pub fn decrypt_int(&self, ciphertext: &str) -> Result<i64, SecureAggError> {
        let raw = hex::decode(ciphertext).map_err(|_| SecureAggError::Ciphertext)?;
        if raw.len() != 16 {
            return Err(SecureAggError::Ciphertext);
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&raw[..8]);
        let stream = self.keystream(&nonce);
        let mut body = [0u8; 8];
        for (i, byte) in raw[8..].iter().enumerate() {
            body[i] = byte ^ stream[i];
        }
        Ok(i64::from_be_bytes(body))
    }
}

/// Per-field nonce, derived deterministically from the contribution context.
fn field_nonce(router_id: &str, model_task: &str, field: &str, round: u64) -> [u8; 8] {
    let digest = Sha256::digest(format!("{router_id}:{model_task}:{field}:{round}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

/// Differential-privacy noise in `[-50, 50) × noise_scale`, derived from the
/// field context.
fn deterministic_noise(router_id: &str, model_task: &str, field: &str, round: u64, noise_scale: f64) -> i64 {
    let digest = Sha256::digest(format!("noise:{router_id}:{model_task}:{field}:{round}").as_bytes());
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    let bucket = (u64::from_be_bytes(raw) % 100) as i64 - 50;
    (bucket as f64 * noise_scale) as i64
}

// ─── Encrypted Contribution ─────────────────────────────────────────────────

/// One router's encrypted, signed share of an aggregation round.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedContribution {
    pub router_id: String,
    pub aggregation_round: u64,
    pub cluster_hash: String,
    /// model_task → field → encrypted value.
    pub encrypted_signals: BTreeMap<String, BTreeMap<String, String>>,
    pub timestamp: f64,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_budget_used: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_scale: Option<f64>,
}

/// Canonical signing payload: JSON with sorted keys.
fn signing_payload(
    router_id: &str,
    aggregation_round: u64,
    cluster_hash: &str,
    encrypted_signals: &BTreeMap<String, BTreeMap<String, String>>,
    timestamp: f64,
) -> Vec<u8> {
    let mut map: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    map.insert("aggregation_round", aggregation_round.into());
    map.insert("cluster_hash", cluster_hash.into());
    map.insert(
        "encrypted_signals",
        serde_json::to_value(encrypted_signals).unwrap_or_default(),
    );
    map.insert("router_id", router_id.into());
    map.insert("timestamp", timestamp.into());
    serde_json::to_vec(&map).unwrap_or_default()
}

fn sign(key: &[u8], payload: &[u8]) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ─── Aggregator Node ────────────────────────────────────────────────────────

/// Router-side participant in secure aggregation.
pub struct AggregatorNode {
    router_id: String,
    signing_key: Vec<u8>,
    cipher: SealedIntCipher,
    deterministic_noise: bool,
}

impl AggregatorNode {
    pub fn new(router_id: impl Into<String>, signing_key: &[u8], encryption_key: &[u8]) -> Self {
        AggregatorNode {
            router_id: router_id.into(),
            signing_key: signing_key.to_vec(),
            cipher: SealedIntCipher::new(encryption_key),
            deterministic_noise: true,
        }
    }

    /// Draw nonces and noise from the caller's RNG instead of the
    /// deterministic derivation.
    pub fn with_random_noise(mut self) -> Self {
        self.deterministic_noise = false;
        self
    }

    /// Encrypt a validated signal into a signed contribution. Floats are
    /// integer-encoded at ×1000 before noise and encryption.
    pub fn encrypt_signal(
        &self,
        signal: &FederatedRewardSignal,
        noise_scale: f64,
        fixed_timestamp: Option<f64>,
        rng: &mut impl Rng,
    ) -> Result<EncryptedContribution, SecureAggError> {
        let errors = signal.validate();
        if !errors.is_empty() {
            return Err(SignalError::Invalid(errors).into());
        }

        let mut encrypted_signals = BTreeMap::new();
        for (model_task, stats) in &signal.reward_signals {
            let mut fields: Vec<(&str, i64)> = vec![
                ("success_rate", (stats.success_rate * 1000.0).round() as i64),
                ("avg_latency", (stats.avg_latency * 1000.0).round() as i64),
                ("total_samples", stats.total_samples as i64),
            ];
            if let Some(quality) = stats.quality_score {
                fields.push(("quality_score", (quality * 1000.0).round() as i64));
            }
            if let Some(cost) = stats.cost_efficiency {
                fields.push(("cost_efficiency", (cost * 1000.0).round() as i64));
            }

            let mut encrypted = BTreeMap::new();
            for (field, int_value) in fields {
                let (nonce, noise) = if self.deterministic_noise {
                    (
                        field_nonce(&self.router_id, model_task, field, signal.aggregation_round),
                        deterministic_noise(
                            &self.router_id,
                            model_task,
                            field,
                            signal.aggregation_round,
                            noise_scale,
                        ),
                    )
                } else {
                    let nonce = rng.random::<u64>().to_be_bytes();
                    let bucket = (rng.random::<f64>() * 100.0).floor() as i64 - 50;
                    (nonce, (bucket as f64 * noise_scale) as i64)
                };
                encrypted.insert(
                    field.to_string(),
                    self.cipher.encrypt_int(int_value + noise, nonce),
                );
            }
            encrypted_signals.insert(model_task.clone(), encrypted);
        }

        let timestamp = fixed_timestamp.unwrap_or_else(epoch_secs);
        let payload = signing_payload(
            &self.router_id,
            signal.aggregation_round,
            &signal.cluster_hash,
            &encrypted_signals,
            timestamp,
        );

        Ok(EncryptedContribution {
            router_id: self.router_id.clone(),
            aggregation_round: signal.aggregation_round,
            cluster_hash: signal.cluster_hash.clone(),
            encrypted_signals,
            timestamp,
            signature: sign(&self.signing_key, &payload),
            privacy_budget_used: signal.privacy_budget_used,
            noise_scale: Some(noise_scale),
        })
    }
}

// ─── Coordinator ────────────────────────────────────────────────────────────

/// Collects signed contributions for one round and produces the aggregated
/// signal.
pub struct AggregationCoordinator {
    router_keys: HashMap<String, Vec<u8>>,
    cipher: SealedIntCipher,
    min_participants: usize,
    max_participants: usize,
    contributions: Mutex<HashMap<String, EncryptedContribution>>,
    failures: Arc<Counter>,
    rounds_completed: Arc<Counter>,
}

impl AggregationCoordinator {
    pub fn new(
        router_keys: HashMap<String, Vec<u8>>,
        encryption_key: &[u8],
        registry: &Registry,
    ) -> Self {
        AggregationCoordinator {
            router_keys,
            cipher: SealedIntCipher::new(encryption_key),
            min_participants: 2,
            max_participants: 100,
            contributions: Mutex::new(HashMap::new()),
            failures: registry.counter("secure_agg_failures_total"),
            rounds_completed: registry.counter("federated_rounds_completed"),
        }
    }

    pub fn with_participant_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_participants = min;
        self.max_participants = max;
        self
    }

    pub fn contribution_count(&self) -> usize {
        self.contributions.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Accept a contribution. Unknown routers, bad signatures, and duplicate
    /// submissions are rejected and counted.
    pub fn collect(&self, contribution: EncryptedContribution) -> bool {
        let Some(expected_key) = self.router_keys.get(&contribution.router_id) else {
            warn!(router_id = %contribution.router_id, "contribution from unknown router");
            self.failures.inc(1);
            return false;
        };

        let payload = signing_payload(
            &contribution.router_id,
            contribution.aggregation_round,
            &contribution.cluster_hash,
            &contribution.encrypted_signals,
            contribution.timestamp,
        );
        let expected_sig = sign(expected_key, &payload);
        if !constant_time_eq(expected_sig.as_bytes(), contribution.signature.as_bytes()) {
            warn!(router_id = %contribution.router_id, "contribution signature mismatch");
            self.failures.inc(1);
            return false;
        }

        let mut contributions = match self.contributions.lock() {
            Ok(contributions) => contributions,
            Err(_) => return false,
        };
        if contributions.contains_key(&contribution.router_id) {
            self.failures.inc(1);
            return false;
        }
        contributions.insert(contribution.router_id.clone(), contribution);
        true
    }

    /// Aggregate all collected contributions into a federated reward signal.
    ///
    /// Float-encoded fields decrypt, average, and scale back by 1000;
    /// `total_samples` sums across contributors.
    pub fn aggregate(&self) -> Option<FederatedRewardSignal> {
        let contributions: Vec<EncryptedContribution> = self
            .contributions
            .lock()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();

        let n = contributions.len();
        if n < self.min_participants || n > self.max_participants {
            self.failures.inc(1);
            return None;
        }

        let first = &contributions[0];
        let round = first.aggregation_round;
        let cluster = first.cluster_hash.clone();
        if contributions
            .iter()
            .any(|c| c.aggregation_round != round || c.cluster_hash != cluster)
        {
            self.failures.inc(1);
            return None;
        }

        // model_task → field → decrypted values across contributors.
        let mut decrypted: BTreeMap<String, BTreeMap<String, Vec<i64>>> = BTreeMap::new();
        for contribution in &contributions {
            for (model_task, fields) in &contribution.encrypted_signals {
                let entry = decrypted.entry(model_task.clone()).or_default();
                for (field, ciphertext) in fields {
                    match self.cipher.decrypt_int(ciphertext) {
                        Ok(value) => entry.entry(field.clone()).or_default().push(value),
                        Err(_) => {
                            warn!(%model_task, %field, "undecryptable contribution value skipped");
                        }
                    }
                }
            }
        }

        let mut reward_signals = BTreeMap::new();
        for (model_task, fields) in &decrypted {
            // Float fields come back from the ×1000 integer encoding; the
            // sample count is the only native integer and sums instead.
            let float_avg = |field: &str| -> Option<f64> {
                fields.get(field).filter(|v| !v.is_empty()).map(|values| {
                    let avg = values.iter().sum::<i64>() as f64 / values.len() as f64;
                    avg / 1000.0
                })
            };

            let total_samples = fields
                .get("total_samples")
                .map(|values| values.iter().sum::<i64>().max(0) as u64)
                .unwrap_or(0);

            reward_signals.insert(
                model_task.clone(),
                RewardStats {
                    success_rate: float_avg("success_rate").unwrap_or(0.0),
                    avg_latency: float_avg("avg_latency").unwrap_or(0.0),
                    total_samples,
                    quality_score: float_avg("quality_score"),
                    cost_efficiency: float_avg("cost_efficiency"),
                },
            );
        }

        let privacy_budget: f64 = contributions.iter().filter_map(|c| c.privacy_budget_used).sum();
        let noise_scales: Vec<f64> = contributions.iter().filter_map(|c| c.noise_scale).collect();

        let mut signal = FederatedRewardSignal::new(round, cluster, reward_signals, n as u32);
        signal.privacy_budget_used = (privacy_budget > 0.0).then_some(privacy_budget);
        signal.noise_scale = (!noise_scales.is_empty())
            .then(|| noise_scales.iter().sum::<f64>() / noise_scales.len() as f64);

        self.rounds_completed.inc(1);
        Some(signal)
    }

    /// Clear collected contributions for a new round.
    pub fn reset(&self) {
        if let Ok(mut contributions) = self.contributions.lock() {
            contributions.clear();
        }
    }
}
