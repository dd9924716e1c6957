//! # Fair Scheduler
//!
//! Weighted fair queueing over per-session sub-queues. Each session carries
//! a virtual-time priority that advances by `1 / effective_weight` on every
//! grant, so long-run grant share is proportional to session weight. The
//! global AIMD controller caps per-session in-flight grants.
//!
//! A starvation detector watches head-of-line waits against a dynamic
//! quantile threshold and temporarily boosts under-served sessions; boosts
//! decay exponentially and expire after a fixed duration.

use crate::aimd::AimdController;
use atp_common::metrics::{Counter, Registry};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

// ─── Configuration ──────────────────────────────────────────────────────────

/// Scheduler tuning knobs with environment overrides.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Floor for the starvation threshold in milliseconds.
    pub static_threshold_ms: f64,
    /// Quantile of recent waits that defines the dynamic threshold.
    pub starvation_quantile: f64,
    /// Multiplicative boost applied to a starved session's weight.
    pub boost_factor: f64,
    /// Per-second exponential decay of an active boost.
    pub boost_decay: f64,
    /// Lifetime of a boost after application.
    pub boost_duration: Duration,
    /// Capacity of the recent-wait ring used for the quantile.
    pub max_recent_waits: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            static_threshold_ms: 50.0,
            starvation_quantile: 0.95,
            boost_factor: 2.0,
            boost_decay: 0.9,
            boost_duration: Duration::from_secs(60),
            max_recent_waits: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Defaults with `FAIR_SCHED_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = SchedulerConfig::default();
        if let Some(v) = env_f64("FAIR_SCHED_STARVATION_QUANTILE") {
            config.starvation_quantile = v;
        }
        if let Some(v) = env_f64("FAIR_SCHED_BOOST_FACTOR") {
            config.boost_factor = v;
        }
        if let Some(v) = env_f64("FAIR_SCHED_BOOST_DECAY") {
            config.boost_decay = v;
        }
        config
    }
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// ─── Grant ──────────────────────────────────────────────────────────────────

/// Waiter handle returned by [`FairScheduler::enqueue`]. Completes at most
/// once, carrying the global grant-order index.
pub struct Grant {
    rx: Receiver<u64>,
}

impl Grant {
    /// Block until granted. Returns the grant-order index, or `None` if the
    /// scheduler dropped the entry.
    pub fn wait(&self) -> Option<u64> {
        self.rx.recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<u64> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking check; consumes the grant when present.
    pub fn try_wait(&self) -> Option<u64> {
        self.rx.try_recv().ok()
    }
}

// ─── State ──────────────────────────────────────────────────────────────────

struct QueueEntry {
    session: String,
    enqueued_at: Instant,
    waiter: Sender<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Boost {
    factor: f64,
    applied_at: Instant,
}

#[derive(Default)]
struct Inner {
    queue: Vec<QueueEntry>,
    active: HashMap<String, u32>,
    weights: HashMap<String, f64>,
    /// WFQ virtual time per session; entries are ordered by it.
    vtime: HashMap<String, f64>,
    boosted: HashMap<String, Boost>,
    recent_waits: VecDeque<f64>,
    grant_counter: u64,
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

pub struct FairScheduler {
    inner: Mutex<Inner>,
    config: SchedulerConfig,
    aimd: Arc<AimdController>,
    starvation_events: Arc<Counter>,
}

impl FairScheduler {
    pub fn new(config: SchedulerConfig, aimd: Arc<AimdController>, registry: &Registry) -> Self {
        FairScheduler {
            inner: Mutex::new(Inner::default()),
            config,
            aimd,
            starvation_events: registry.counter("fair_sched_starvation_events_total"),
        }
    }

    /// Set a session's base weight. Unset sessions weigh 1.0.
    pub fn set_weight(&self, session: &str, weight: f64) {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        inner.weights.insert(session.to_string(), weight.max(f64::MIN_POSITIVE));
    }

    /// Queue an entry for the session. The returned [`Grant`] completes when
    /// the entry is admitted under the fair-queueing discipline.
    pub fn enqueue(&self, session: &str) -> Grant {
        let (tx, rx) = bounded(1);
        {
            let mut inner = self.inner.lock().expect("scheduler state poisoned");
            inner.queue.push(QueueEntry {
                session: session.to_string(),
                enqueued_at: Instant::now(),
                waiter: tx,
            });
        }
        self.pump();
        Grant { rx }
    }

    /// Release one in-flight grant for the session and re-run selection.
    pub fn release(&self, session: &str) {
        {
            let mut inner = self.inner.lock().expect("scheduler state poisoned");
            if let Some(active) = inner.active.get_mut(session) {
                *active = active.saturating_sub(1);
            }
        }
        self.pump();
    }

    /// Re-run selection without releasing anything. Lets timer-driven
    /// callers surface starvation between grants.
    pub fn poll(&self) {
        self.pump();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().map(|i| i.queue.len()).unwrap_or(0)
    }

    pub fn active_count(&self, session: &str) -> u32 {
        self.inner
            .lock()
            .map(|i| i.active.get(session).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_boosted(&self, session: &str) -> bool {
        self.inner
            .lock()
            .map(|i| i.boosted.contains_key(session))
            .unwrap_or(false)
    }

    pub fn recent_waits_len(&self) -> usize {
        self.inner.lock().map(|i| i.recent_waits.len()).unwrap_or(0)
    }

    /// Effective weight of a session right now (expired boosts removed).
    pub fn effective_weight(&self, session: &str) -> f64 {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        effective_weight_locked(&mut inner, &self.config, session, Instant::now())
    }

    /// The starvation threshold currently in force.
    pub fn dynamic_threshold_ms(&self) -> f64 {
        let inner = self.inner.lock().expect("scheduler state poisoned");
        dynamic_threshold_locked(&inner, &self.config)
    }

    /// Grant every eligible entry in WFQ priority order.
    fn pump(&self) {
        loop {
            let granted = {
                let mut inner = self.inner.lock().expect("scheduler state poisoned");
                self.grant_next_locked(&mut inner)
            };
            match granted {
                Some((waiter, order)) => {
                    // Waiter may have gone away; the slot was already taken
                    // and will come back through release().
                    let _ = waiter.send(order);
                }
                None => break,
            }
        }
    }

    fn grant_next_locked(&self, inner: &mut Inner) -> Option<(Sender<u64>, u64)> {
        let now = Instant::now();
        let window = self.aimd.get();

        // Starvation pass: boost any session whose head-of-line wait exceeds
        // the dynamic threshold.
        let threshold_ms = dynamic_threshold_locked(inner, &self.config);
        let mut head_waits: HashMap<&str, f64> = HashMap::new();
        for entry in &inner.queue {
            let wait_ms = now.duration_since(entry.enqueued_at).as_secs_f64() * 1000.0;
            let head = head_waits.entry(entry.session.as_str()).or_insert(0.0);
            if wait_ms > *head {
                *head = wait_ms;
            }
        }
        let starved: Vec<String> = head_waits
            .iter()
            .filter(|(_, wait)| **wait > threshold_ms)
            .map(|(session, _)| session.to_string())
            .collect();
        for session in starved {
            debug!(%session, threshold_ms, "starvation boost applied");
            inner.boosted.insert(
                session,
                Boost {
                    factor: self.config.boost_factor,
                    applied_at: now,
                },
            );
            self.starvation_events.inc(1);
        }

        // Selection: smallest session vtime, ties broken by arrival time.
        let mut best: Option<(usize, f64, Instant)> = None;
        for (idx, entry) in inner.queue.iter().enumerate() {
            let active = inner.active.get(&entry.session).copied().unwrap_or(0);
            if active >= window {
                continue;
            }
            let vtime = inner.vtime.get(&entry.session).copied().unwrap_or(0.0);
            let better = match &best {
                None => true,
                Some((_, best_vtime, best_at)) => {
                    vtime < *best_vtime || (vtime == *best_vtime && entry.enqueued_at < *best_at)
                }
            };
            if better {
                best = Some((idx, vtime, entry.enqueued_at));
            }
        }

        let (idx, _, _) = best?;
        let entry = inner.queue.remove(idx);

        let effective = effective_weight_locked(inner, &self.config, &entry.session, now);
        *inner.vtime.entry(entry.session.clone()).or_insert(0.0) += 1.0 / effective;
        *inner.active.entry(entry.session.clone()).or_insert(0) += 1;

        let wait_ms = now.duration_since(entry.enqueued_at).as_secs_f64() * 1000.0;
        if inner.recent_waits.len() >= self.config.max_recent_waits {
            inner.recent_waits.pop_front();
        }
        inner.recent_waits.push_back(wait_ms);

        inner.grant_counter += 1;
        let order = inner.grant_counter;
        Some((entry.waiter, order))
    }
}

/// `base × (1 + (boost_factor − 1) × boost_decay^age_secs)` while boosted;
/// expired boosts are dropped.
fn effective_weight_locked(
    inner: &mut Inner,
    config: &SchedulerConfig,
    session: &str,
    now: Instant,
) -> f64 {
    let base = inner.weights.get(session).copied().unwrap_or(1.0);
    let Some(boost) = inner.boosted.get(session).copied() else {
        return base;
    };
    let age = now.duration_since(boost.applied_at);
    if age > config.boost_duration {
        inner.boosted.remove(session);
        return base;
    }
    base * (1.0 + (boost.factor - 1.0) * config.boost_decay.powf(age.as_secs_f64()))
}

/// `max(static_threshold, quantile(recent_waits))`.
fn dynamic_threshold_locked(inner: &Inner, config: &SchedulerConfig) -> f64 {
    if inner.recent_waits.is_empty() {
        return config.static_threshold_ms;
    }
    let mut waits: Vec<f64> = inner.recent_waits.iter().copied().collect();
    waits.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((waits.len() as f64 * config.starvation_quantile).ceil() as usize)
        .clamp(1, waits.len())
        - 1;
    config.static_threshold_ms.max(waits[idx])
}
