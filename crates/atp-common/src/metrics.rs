//! # Metrics Registry
//!
//! Lightweight in-process metrics: named counters, gauges, and fixed-bucket
//! histograms, rendered in Prometheus text exposition format.
//!
//! A process-wide registry is available via [`Registry::global`], but every
//! component takes a `&Registry` at construction so tests can inject a
//! private one.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ─── Counter ────────────────────────────────────────────────────────────────

/// Monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ─── Gauge ──────────────────────────────────────────────────────────────────

/// Settable integer gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ─── Histogram ──────────────────────────────────────────────────────────────

/// Fixed-bucket histogram with running sum and count.
#[derive(Debug)]
pub struct Histogram {
    /// Upper bounds of the finite buckets, ascending.
    bounds: Vec<f64>,
    /// Observation counts per finite bucket, plus a trailing +Inf bucket.
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: Mutex<f64>,
}

impl Histogram {
    fn new(bounds: &[f64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Histogram {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum: Mutex::new(0.0),
        }
    }

    pub fn observe(&self, v: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|&b| v <= b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sum) = self.sum.lock() {
            *sum += v;
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum.lock().map(|s| *s).unwrap_or(0.0)
    }

    /// Cumulative bucket counts as `(upper_bound, count)` pairs, +Inf last.
    pub fn cumulative_buckets(&self) -> Vec<(f64, u64)> {
        let mut acc = 0u64;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            acc += bucket.load(Ordering::Relaxed);
            let bound = self.bounds.get(i).copied().unwrap_or(f64::INFINITY);
            out.push((bound, acc));
        }
        out
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Named metric registry. Metric handles are `Arc`s, so components grab them
/// once at construction and update lock-free afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    counters: Mutex<HashMap<String, Arc<Counter>>>,
    gauges: Mutex<HashMap<String, Arc<Gauge>>>,
    histograms: Mutex<HashMap<String, Arc<Histogram>>>,
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::default);

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// The process-wide registry, initialized on first use.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Get or create a counter.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut m = self.counters.lock().expect("counter map poisoned");
        Arc::clone(m.entry(name.to_string()).or_default())
    }

    /// Get or create a gauge.
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut m = self.gauges.lock().expect("gauge map poisoned");
        Arc::clone(m.entry(name.to_string()).or_default())
    }

    /// Get or create a histogram with the given finite bucket bounds.
    /// An existing histogram keeps its original bounds.
    pub fn histogram(&self, name: &str, bounds: &[f64]) -> Arc<Histogram> {
        let mut m = self.histograms.lock().expect("histogram map poisoned");
        Arc::clone(
            m.entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram::new(bounds))),
        )
    }

    /// Current value of a counter, 0 if it was never created.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|m| m.get(name).map(|c| c.get()))
            .unwrap_or(0)
    }

    /// Current value of a gauge, 0 if it was never created.
    pub fn gauge_value(&self, name: &str) -> i64 {
        self.gauges
            .lock()
            .ok()
            .and_then(|m| m.get(name).map(|g| g.get()))
            .unwrap_or(0)
    }

    /// Total observation count of a histogram, 0 if it was never created.
    pub fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .lock()
            .ok()
            .and_then(|m| m.get(name).map(|h| h.count()))
            .unwrap_or(0)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        // ── Counters ────────────────────────────────────────────────
        let counters = self.counters.lock().expect("counter map poisoned");
        let mut names: Vec<_> = counters.keys().cloned().collect();
        names.sort();
        for name in &names {
            writeln!(out, "# TYPE {name} counter").ok();
            writeln!(out, "{name} {}", counters[name].get()).ok();
        }
        drop(counters);

        // ── Gauges ──────────────────────────────────────────────────
        let gauges = self.gauges.lock().expect("gauge map poisoned");
        let mut names: Vec<_> = gauges.keys().cloned().collect();
        names.sort();
        for name in &names {
            writeln!(out, "# TYPE {name} gauge").ok();
            writeln!(out, "{name} {}", gauges[name].get()).ok();
        }
        drop(gauges);

        // ── Histograms ──────────────────────────────────────────────
        let histograms = self.histograms.lock().expect("histogram map poisoned");
        let mut names: Vec<_> = histograms.keys().cloned().collect();
        names.sort();
        for name in &names {
            let h = &histograms[name];
            writeln!(out, "# TYPE {name} histogram").ok();
            for (bound, count) in h.cumulative_buckets() {
                if bound.is_infinite() {
                    writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}").ok();
                } else {
                    writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {count}").ok();
                }
            }
            writeln!(out, "{name}_sum {}", h.sum()).ok();
            writeln!(out, "{name}_count {}", h.count()).ok();
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Counters & Gauges ──────────────────────────────────────────────

    #[test]
    fn counter_increments() {
        let reg = Registry::new();
        let c = reg.counter("requests_total");
        c.inc(1);
        c.inc(2);
        assert_eq!(reg.counter_value("requests_total"), 3);
    }

    #[test]
    fn counter_handle_is_shared() {
        let reg = Registry::new();
        let a = reg.counter("ops");
        let b = reg.counter("ops");
        a.inc(1);
        b.inc(1);
        assert_eq!(reg.counter_value("ops"), 2);
    }

    #[test]
    fn gauge_set_and_add() {
        let reg = Registry::new();
        let g = reg.gauge("lanes_active");
        g.set(5);
        g.add(-2);
        assert_eq!(reg.gauge_value("lanes_active"), 3);
    }

    #[test]
    fn missing_metric_reads_zero() {
        let reg = Registry::new();
        assert_eq!(reg.counter_value("nope"), 0);
        assert_eq!(reg.gauge_value("nope"), 0);
        assert_eq!(reg.histogram_count("nope"), 0);
    }

    // ─── Histograms ─────────────────────────────────────────────────────

    #[test]
    fn histogram_buckets_cumulative() {
        let reg = Registry::new();
        let h = reg.histogram("fragment_count_per_message", &[1.0, 2.0, 4.0, 8.0]);
        h.observe(1.0);
        h.observe(3.0);
        h.observe(100.0);

        let buckets = h.cumulative_buckets();
        assert_eq!(buckets[0], (1.0, 1)); // le=1: the 1.0 observation
        assert_eq!(buckets[2], (4.0, 2)); // le=4: 1.0 and 3.0
        assert_eq!(buckets.last().unwrap().1, 3); // +Inf sees everything
        assert_eq!(h.count(), 3);
        assert!((h.sum() - 104.0).abs() < 1e-9);
    }

    // ─── Prometheus Rendering ───────────────────────────────────────────

    #[test]
    fn render_contains_all_metric_kinds() {
        let reg = Registry::new();
        reg.counter("abac_denies_total").inc(2);
        reg.gauge("active_priors").set(7);
        reg.histogram("multi_objective_frontier_size", &[1.0, 5.0])
            .observe(3.0);

        let text = reg.render_prometheus();
        assert!(text.contains("# TYPE abac_denies_total counter"));
        assert!(text.contains("abac_denies_total 2"));
        assert!(text.contains("active_priors 7"));
        assert!(text.contains("multi_objective_frontier_size_bucket{le=\"5\"} 1"));
        assert!(text.contains("multi_objective_frontier_size_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("multi_objective_frontier_size_count 1"));
    }

    #[test]
    fn global_registry_is_stable() {
        let a = Registry::global() as *const Registry;
        let b = Registry::global() as *const Registry;
        assert_eq!(a, b);
    }
}
