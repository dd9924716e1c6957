//! # External Reassembly Buffer Store
//!
//! Persists fragment parts outside the reassembler so reconstruction
//! survives router restarts or moves between instances. The in-memory
//! implementation stands in for an external backend and prunes entries on a
//! TTL.

use atp_common::metrics::{Counter, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Message identity within the store.
pub type StoreKey = (String, String, u64);

/// Default time-to-live for buffered parts.
pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(600);

/// Result of pushing a part: whether the message completed, and the joined
/// data when it did.
pub type PushOutcome = (bool, Option<String>);

/// External persistence for fragment parts. Text parts are stored verbatim,
/// binary parts hex-encoded.
pub trait BufferStore: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn push_part(
        &self,
        session_id: &str,
        stream_id: &str,
        msg_seq: u64,
        frag_seq: u32,
        data: &str,
        is_last: bool,
        is_binary: bool,
    ) -> PushOutcome;

    /// Discard any buffered parts for the message.
    fn clear(&self, session_id: &str, stream_id: &str, msg_seq: u64);
}

#[derive(Debug)]
struct Entry {
    parts: HashMap<u32, String>,
    last_seq: Option<u32>,
    updated: Instant,
    is_binary: bool,
}

impl Entry {
    fn new() -> Self {
        Entry {
            parts: HashMap::new(),
            last_seq: None,
            updated: Instant::now(),
            is_binary: false,
        }
    }
}

/// In-memory buffer store with TTL pruning.
pub struct MemoryBufferStore {
    entries: Mutex<HashMap<StoreKey, Entry>>,
    ttl: Duration,
    ops: Arc<Counter>,
}

impl MemoryBufferStore {
    pub fn new(ttl: Duration, registry: &Registry) -> Self {
        MemoryBufferStore {
            entries: Mutex::new(HashMap::new()),
            ttl,
            ops: registry.counter("buffer_store_ops"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune_locked(&self, entries: &mut HashMap<StoreKey, Entry>) {
        let ttl = self.ttl;
        entries.retain(|_, e| e.updated.elapsed() <= ttl);
    }
}

impl BufferStore for MemoryBufferStore {
    fn push_part(
        &self,
        session_id: &str,
        stream_id: &str,
        msg_seq: u64,
        frag_seq: u32,
        data: &str,
        is_last: bool,
        is_binary: bool,
    ) -> PushOutcome {
        self.ops.inc(1);
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return (false, None),
        };
        let key = (session_id.to_string(), stream_id.to_string(), msg_seq);
        let entry = entries.entry(key.clone()).or_insert_with(Entry::new);

        entry.parts.insert(frag_seq, data.to_string());
        if is_binary {
            entry.is_binary = true;
        }
        if is_last {
            entry.last_seq = Some(entry.last_seq.unwrap_or(0).max(frag_seq));
        }
        entry.updated = Instant::now();

        let complete = match entry.last_seq {
            None => false,
            Some(last) => (0..=last).all(|i| entry.parts.contains_key(&i)),
        };

        let outcome = if complete {
            let last = entry.last_seq.unwrap_or(0);
            let full: String = (0..=last)
                .filter_map(|i| entry.parts.get(&i).map(String::as_str))
                .collect();
            entries.remove(&key);
            (true, Some(full))
        } else {
            (false, None)
        };

        self.prune_locked(&mut entries);
        outcome
    }

    fn clear(&self, session_id: &str, stream_id: &str, msg_seq: u64) {
        self.ops.inc(1);
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&(session_id.to_string(), stream_id.to_string(), msg_seq));
        }
    }
}
