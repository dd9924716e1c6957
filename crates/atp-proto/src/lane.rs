//! # Lane Sequencer
//!
//! A lane is an independent sequencing context keyed by
//! `(persona_id, stream_id)`. Each lane owns its own monotonic `msg_seq`
//! counter, so parallel persona sessions on the same stream never contend
//! for sequence numbers.

use atp_common::metrics::{Gauge, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Sequencing context for `msg_seq` isolation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Lane {
    pub persona_id: String,
    pub stream_id: String,
}

impl Lane {
    pub fn new(persona_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Lane {
            persona_id: persona_id.into(),
            stream_id: stream_id.into(),
        }
    }

    /// Storage key form.
    pub fn key(&self) -> String {
        format!("{}:{}", self.persona_id, self.stream_id)
    }
}

/// Per-lane `msg_seq` allocator. Lanes are created on first use; cardinality
/// is exported as the `lanes_active` gauge.
pub struct LaneSequencer {
    counters: Mutex<HashMap<String, u64>>,
    lanes_active: Arc<Gauge>,
}

impl LaneSequencer {
    pub fn new(registry: &Registry) -> Self {
        LaneSequencer {
            counters: Mutex::new(HashMap::new()),
            lanes_active: registry.gauge("lanes_active"),
        }
    }

    /// Allocate the next `msg_seq` for the lane. The first allocation on a
    /// fresh lane returns 1.
    pub fn next(&self, lane: &Lane) -> u64 {
        let mut counters = self.counters.lock().expect("lane map poisoned");
        let counter = counters.entry(lane.key()).or_insert(0);
        *counter += 1;
        let seq = *counter;
        self.lanes_active.set(counters.len() as i64);
        seq
    }

    /// Current `msg_seq` without advancing; 0 for an unused lane.
    pub fn current(&self, lane: &Lane) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(&lane.key()).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Zero the lane's counter. The lane stays active.
    pub fn reset(&self, lane: &Lane) {
        let mut counters = self.counters.lock().expect("lane map poisoned");
        counters.insert(lane.key(), 0);
        self.lanes_active.set(counters.len() as i64);
    }

    /// Keys of all lanes seen so far.
    pub fn active_lanes(&self) -> Vec<String> {
        self.counters
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}
