//! # Reassembly
//!
//! Reconstructs original messages from `FRAG` frames. Accepts arbitrary
//! arrival order and produces exactly one `REASSEMBLED` frame per
//! `(session, stream, msg_seq)`, or a discriminated failure when the
//! fragment set is corrupt, truncated, or incomplete.
//!
//! Two modes: in-process state held in a map, or persistence delegated to an
//! external [`BufferStore`]. A gap timer drops fragments that arrive for a
//! gap position after `gap_ttl`; idle states are garbage-collected on a TTL.

use crate::frame::{flags, Content, Frame};
use crate::short_checksum;
use crate::store::BufferStore;
use atp_common::metrics::{Counter, Registry};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Message identity: `(session_id, stream_id, msg_seq)`.
pub type ReassemblyKey = (String, String, u64);

/// Default gap timer before late fragments are dropped.
pub const DEFAULT_GAP_TTL: Duration = Duration::from_millis(500);

/// Default idle lifetime of a reassembly state.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(300);

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Discriminated reassembly failure. Aborts the current message only; other
/// messages in flight are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("checksum mismatch fragment")]
    ChecksumMismatch,
    #[error("merkle root mismatch")]
    MerkleRootMismatch,
    #[error("fragment truncated")]
    Truncated,
    #[error("fragment truncated (size variance)")]
    TruncatedSizeVariance,
    #[error("missing fragments: {0:?}")]
    MissingFragments(Vec<u32>),
}

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ReassemblyState {
    /// Fragment data by index: text verbatim, binary hex-encoded.
    parts: HashMap<u32, String>,
    last_seq: Option<u32>,
    /// Completion attempts with an unchanged missing set.
    attempts: u32,
    frag_sizes: HashMap<u32, usize>,
    prev_missing: Vec<u32>,
    is_binary: bool,
    merkle_root: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<ReassemblyKey, ReassemblyState>,
    /// When the next expected contiguous index first became a gap.
    gap_since: HashMap<ReassemblyKey, Instant>,
    last_access: HashMap<ReassemblyKey, Instant>,
}

// ─── Reassembler ────────────────────────────────────────────────────────────

/// Reassembly configuration.
#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    pub gap_ttl: Duration,
    pub state_ttl: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        ReassemblerConfig {
            gap_ttl: DEFAULT_GAP_TTL,
            state_ttl: DEFAULT_STATE_TTL,
        }
    }
}

pub struct Reassembler {
    inner: Mutex<Inner>,
    store: Option<Arc<dyn BufferStore>>,
    config: ReassemblerConfig,
    late_dropped: Arc<Counter>,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig, registry: &Registry) -> Self {
        Reassembler {
            inner: Mutex::new(Inner::default()),
            store: None,
            config,
            late_dropped: registry.counter("late_fragments_dropped"),
        }
    }

    /// Delegate part persistence to an external buffer store.
    pub fn with_store(mut self, store: Arc<dyn BufferStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Number of in-process reassembly states currently held.
    pub fn state_count(&self) -> usize {
        self.inner.lock().map(|i| i.states.len()).unwrap_or(0)
    }

    /// Push one fragment. Returns the reassembled frame once the set
    /// completes, `None` while parts are outstanding (or the fragment was a
    /// duplicate / late arrival), or a [`ReassemblyError`] on corruption.
    pub fn push(&self, frame: &Frame) -> Result<Option<Frame>, ReassemblyError> {
        let key = (
            frame.session_id.clone(),
            frame.stream_id.clone(),
            frame.msg_seq,
        );
        let now = Instant::now();

        let mut guard = self.inner.lock().expect("reassembly state poisoned");
        guard.last_access.insert(key.clone(), now);

        if let Some(store) = &self.store {
            drop(guard);
            return self.push_via_store(store, frame);
        }

        let inner = &mut *guard;
        let state = inner.states.entry(key.clone()).or_default();

        // Gap timer: the smallest index not yet present is the next expected
        // contiguous position.
        let mut expected_next: u32 = 0;
        while state.parts.contains_key(&expected_next) {
            expected_next += 1;
        }
        if frame.frag_seq > expected_next {
            inner.gap_since.entry(key.clone()).or_insert(now);
        } else if frame.frag_seq == expected_next {
            if let Some(gap_opened) = inner.gap_since.get(&key).copied() {
                if now.duration_since(gap_opened) > self.config.gap_ttl {
                    self.late_dropped.inc(1);
                    return Ok(None);
                }
                inner.gap_since.remove(&key);
            }
        }

        let is_last = frame.has_flag(flags::LAST);

        // Duplicates are ignored, except a re-delivered LAST which re-runs
        // the completion check below.
        if state.parts.contains_key(&frame.frag_seq)
            && !(is_last && state.last_seq == Some(frame.frag_seq))
        {
            return Ok(None);
        }

        let (frag_data, is_binary) = fragment_data(&frame.payload.content);
        if is_binary {
            state.is_binary = true;
        }

        state.parts.insert(frame.frag_seq, frag_data.clone());

        let prev_size = state.frag_sizes.get(&frame.frag_seq).copied();
        let cur_size = frag_data.chars().count();
        if let Some(prev) = prev_size {
            if cur_size < prev {
                return Err(ReassemblyError::Truncated);
            }
        }
        state.frag_sizes.insert(frame.frag_seq, cur_size);

        // Integrity: a checksum longer than 16 chars is a Merkle root shared
        // by all fragments; otherwise verify the per-fragment digest.
        if let Some(checksum) = frame.payload.checksum.as_deref() {
            if checksum.len() > 16 {
                match &state.merkle_root {
                    None => state.merkle_root = Some(checksum.to_string()),
                    Some(root) if root != checksum => {
                        return Err(ReassemblyError::MerkleRootMismatch)
                    }
                    Some(_) => {}
                }
            } else if state.merkle_root.is_none() && checksum != short_checksum(&frag_data) {
                return Err(ReassemblyError::ChecksumMismatch);
            }
        }

        if is_last {
            state.last_seq = Some(frame.frag_seq);
        }
        let Some(last) = state.last_seq else {
            return Ok(None);
        };

        let missing: Vec<u32> = (0..=last)
            .filter(|i| !state.parts.contains_key(i))
            .collect();
        if !missing.is_empty() {
            if state.prev_missing == missing {
                state.attempts += 1;
            }
            state.prev_missing = missing.clone();
            if state.attempts >= 2 {
                return Err(ReassemblyError::MissingFragments(missing));
            }
            return Ok(None);
        }

        // All non-final fragments must match the largest recorded size.
        let expected = (0..last)
            .filter_map(|i| state.frag_sizes.get(&i).copied())
            .max()
            .unwrap_or(0);
        if expected > 0 {
            for i in 0..last {
                if let Some(size) = state.frag_sizes.get(&i) {
                    if *size < expected {
                        return Err(ReassemblyError::TruncatedSizeVariance);
                    }
                }
            }
        }

        let full: String = (0..=last)
            .filter_map(|i| state.parts.get(&i).map(String::as_str))
            .collect();
        let is_binary = state.is_binary;
        let merkle_root = state.merkle_root.clone();

        let span = tracing::info_span!(
            "fragment.reassemble",
            frag.parts = u64::from(last) + 1,
            frag.session = %frame.session_id,
            frag.stream = %frame.stream_id,
            frag.msg_seq = frame.msg_seq,
            frag.bytes = full.len() as u64,
        );
        let _enter = span.enter();

        let final_frame = build_final(frame, &full, is_binary, merkle_root)?;
        inner.states.remove(&key);
        Ok(Some(final_frame))
    }

    fn push_via_store(
        &self,
        store: &Arc<dyn BufferStore>,
        frame: &Frame,
    ) -> Result<Option<Frame>, ReassemblyError> {
        let is_last = frame.has_flag(flags::LAST);
        let (frag_data, is_binary) = fragment_data(&frame.payload.content);

        let (complete, full) = store.push_part(
            &frame.session_id,
            &frame.stream_id,
            frame.msg_seq,
            frame.frag_seq,
            &frag_data,
            is_last,
            is_binary,
        );
        if !complete {
            return Ok(None);
        }
        let full = full.unwrap_or_default();

        let parts_estimate = if frag_data.is_empty() {
            0
        } else {
            full.len() / frag_data.len().max(1)
        };
        let span = tracing::info_span!(
            "fragment.reassemble",
            frag.parts = parts_estimate as u64,
            frag.session = %frame.session_id,
            frag.stream = %frame.stream_id,
            frag.msg_seq = frame.msg_seq,
            frag.bytes = full.len() as u64,
        );
        let _enter = span.enter();

        // Store-completed messages always carry the short digest of the
        // joined data.
        build_final(frame, &full, is_binary, None).map(Some)
    }

    /// Remove reassembly states idle longer than `ttl`. Returns the number
    /// removed.
    pub fn gc(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("reassembly state poisoned");
        let inner = &mut *guard;
        let stale: Vec<ReassemblyKey> = inner
            .last_access
            .iter()
            .filter(|(_, t)| now.duration_since(**t) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.states.remove(key);
            inner.gap_since.remove(key);
            inner.last_access.remove(key);
        }
        stale.len()
    }

    /// [`gc`](Self::gc) with the configured state TTL.
    pub fn gc_default(&self) -> usize {
        self.gc(self.config.state_ttl)
    }
}

/// Fragment data for storage: text verbatim, binary hex-encoded.
fn fragment_data(content: &Content) -> (String, bool) {
    match content {
        Content::Text { text, .. } => (text.clone(), false),
        Content::Binary(bytes) => (hex::encode(bytes), true),
    }
}

/// Build the final reassembled frame from the joined fragment data.
fn build_final(
    frame: &Frame,
    full: &str,
    is_binary: bool,
    merkle_root: Option<String>,
) -> Result<Frame, ReassemblyError> {
    let mut payload = frame.payload.clone();
    if is_binary {
        let bytes = hex::decode(full).map_err(|_| ReassemblyError::ChecksumMismatch)?;
        payload.content = Content::Binary(Bytes::from(bytes));
        payload.checksum = Some(short_checksum(full));
    } else {
        let rest = match &frame.payload.content {
            Content::Text { rest, .. } => rest.clone(),
            Content::Binary(_) => serde_json::Map::new(),
        };
        payload.content = Content::Text {
            text: full.to_string(),
            rest,
        };
        payload.checksum = Some(merkle_root.unwrap_or_else(|| short_checksum(full)));
    }

    let mut final_frame = frame.clone();
    final_frame.frag_seq = 0;
    final_frame.payload = payload;
    final_frame.sig = None;
    final_frame.remove_flag(flags::FRAG);
    final_frame.remove_flag(flags::LAST);
    final_frame.push_flag(flags::REASSEMBLED);
    Ok(final_frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frag::{FragmentationPolicy, Fragmenter};
    use crate::frame::{Payload, Qos};
    use crate::store::MemoryBufferStore;

    fn text_frame(text: &str, qos: Qos) -> Frame {
        Frame::message("sess", "stream", 7, qos, Payload::text("ask", text))
    }

    fn fragments(text: &str, base_size: usize, qos: Qos) -> Vec<Frame> {
        let registry = Registry::new();
        let fragmenter = Fragmenter::new(FragmentationPolicy::with_base_size(base_size), &registry);
        fragmenter.fragment(&text_frame(text, qos))
    }

    fn reassembler() -> (Registry, Reassembler) {
        let registry = Registry::new();
        let r = Reassembler::new(ReassemblerConfig::default(), &registry);
        (registry, r)
    }

    // ─── Round Trip ─────────────────────────────────────────────────────

    #[test]
    fn in_order_round_trip() {
        let (_reg, r) = reassembler();
        let frags = fragments(&"A".repeat(600), 128, Qos::Gold);
        assert_eq!(frags.len(), 3);

        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert_eq!(r.push(&frags[1]).unwrap(), None);
        let out = r.push(&frags[2]).unwrap().expect("complete");

        assert_eq!(out.payload.content.as_text().unwrap().len(), 600);
        assert!(out.has_flag(flags::REASSEMBLED));
        assert!(!out.has_flag(flags::FRAG));
        assert!(!out.has_flag(flags::LAST));
        assert_eq!(out.frag_seq, 0);
        assert_eq!(
            out.payload.checksum.as_deref(),
            Some(short_checksum(&"A".repeat(600)).as_str())
        );
        assert_eq!(r.state_count(), 0);
    }

    #[test]
    fn out_of_order_with_duplicate() {
        let (_reg, r) = reassembler();
        let frags = fragments(&"O".repeat(700), 128, Qos::Bronze);
        assert!(frags.len() >= 3);

        // Duplicate of the first at the head; LAST arrives second.
        let mut order = vec![frags[0].clone(), frags[0].clone()];
        order.push(frags.last().unwrap().clone());
        order.extend(frags[1..frags.len() - 1].iter().cloned());

        let mut completed = Vec::new();
        for frag in &order {
            if let Some(done) = r.push(frag).unwrap() {
                completed.push(done);
            }
        }
        assert_eq!(completed.len(), 1, "exactly one reassembled frame");
        assert_eq!(completed[0].payload.content.as_text().unwrap(), &"O".repeat(700));
    }

    #[test]
    fn binary_round_trip() {
        let registry = Registry::new();
        let mut policy = FragmentationPolicy::default();
        policy.binary_max_size = 16;
        let fragmenter = Fragmenter::new(policy, &registry);
        let data: Vec<u8> = (0..=255u8).collect();
        let frame = Frame::message("s", "t", 1, Qos::Bronze, Payload::binary("blob", data.clone()));

        let frags = fragmenter.fragment(&frame);
        assert!(frags.len() > 1);

        let r = Reassembler::new(ReassemblerConfig::default(), &registry);
        let mut out = None;
        for frag in &frags {
            if let Some(done) = r.push(frag).unwrap() {
                out = Some(done);
            }
        }
        let out = out.expect("complete");
        assert_eq!(out.payload.content.as_bytes().unwrap(), data.as_slice());
        assert!(out.has_flag(flags::REASSEMBLED));
    }

    #[test]
    fn empty_payload_round_trip() {
        let (_reg, r) = reassembler();
        let frags = fragments("", 128, Qos::Bronze);
        assert_eq!(frags.len(), 1);
        let out = r.push(&frags[0]).unwrap().expect("complete");
        assert_eq!(out.payload.content.as_text(), Some(""));
        assert_eq!(
            out.payload.checksum.as_deref(),
            Some(short_checksum("").as_str())
        );
    }

    #[test]
    fn merkle_round_trip_keeps_root() {
        let registry = Registry::new();
        let mut policy = FragmentationPolicy::with_base_size(16);
        policy.enable_merkle = true;
        let fragmenter = Fragmenter::new(policy, &registry);
        let text = "MERKLE INTEGRITY ACROSS FRAGMENT SETS";
        let frags = fragmenter.fragment(&text_frame(text, Qos::Bronze));
        let root = frags[0].payload.checksum.clone().unwrap();
        assert_eq!(root.len(), 64);

        let r = Reassembler::new(ReassemblerConfig::default(), &registry);
        let mut out = None;
        for frag in &frags {
            if let Some(done) = r.push(frag).unwrap() {
                out = Some(done);
            }
        }
        let out = out.expect("complete");
        assert_eq!(out.payload.checksum.as_deref(), Some(root.as_str()));
        assert_eq!(out.payload.content.as_text(), Some(text));
    }

    // ─── Corruption ─────────────────────────────────────────────────────

    #[test]
    fn corrupted_fragment_detected_on_first_push() {
        let (_reg, r) = reassembler();
        let mut frags = fragments("HELLO WORLD THIS IS A LONG TEXT FOR CHECKSUM", 16, Qos::Bronze);

        // Modify the first fragment's text but keep its original checksum.
        if let Content::Text { text, .. } = &mut frags[0].payload.content {
            *text = text.to_lowercase();
        }
        assert_eq!(
            r.push(&frags[0]).unwrap_err(),
            ReassemblyError::ChecksumMismatch
        );
    }

    #[test]
    fn merkle_root_mismatch_detected() {
        let registry = Registry::new();
        let mut policy = FragmentationPolicy::with_base_size(8);
        policy.enable_merkle = true;
        let fragmenter = Fragmenter::new(policy, &registry);
        let mut frags = fragmenter.fragment(&text_frame("ABCDEFGHIJKLMNOP", Qos::Bronze));
        assert!(frags.len() >= 2);
        frags[1].payload.checksum = Some("f".repeat(64));

        let r = Reassembler::new(ReassemblerConfig::default(), &registry);
        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert_eq!(
            r.push(&frags[1]).unwrap_err(),
            ReassemblyError::MerkleRootMismatch
        );
    }

    #[test]
    fn redelivered_last_with_smaller_size_is_truncation() {
        let (_reg, r) = reassembler();
        let frags = fragments("ABCDEFGHIJ", 4, Qos::Bronze);
        assert_eq!(frags.len(), 3);
        let last = frags.last().unwrap().clone();

        // Fragment 1 never arrives, so the first LAST only records the
        // missing set. A re-delivered LAST is re-processed — shrunk data is
        // caught as truncation.
        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert_eq!(r.push(&last).unwrap(), None);

        let mut shrunk = last.clone();
        if let Content::Text { text, .. } = &mut shrunk.payload.content {
            text.truncate(1);
        }
        shrunk.payload.checksum = Some(short_checksum(
            shrunk.payload.content.as_text().unwrap_or_default(),
        ));
        assert_eq!(r.push(&shrunk).unwrap_err(), ReassemblyError::Truncated);
    }

    #[test]
    fn missing_fragment_fails_after_two_attempts() {
        let (_reg, r) = reassembler();
        let frags = fragments(&"M".repeat(40), 8, Qos::Bronze);
        assert_eq!(frags.len(), 5);

        // Drop fragment 2 entirely.
        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert_eq!(r.push(&frags[1]).unwrap(), None);
        assert_eq!(r.push(&frags[3]).unwrap(), None);
        let last = frags.last().unwrap();

        // First LAST: missing recorded. Re-delivered LAST: attempts 1, then 2.
        assert_eq!(r.push(last).unwrap(), None);
        assert_eq!(r.push(last).unwrap(), None);
        match r.push(last).unwrap_err() {
            ReassemblyError::MissingFragments(missing) => assert_eq!(missing, vec![2]),
            other => panic!("expected missing fragments, got {other}"),
        }
    }

    #[test]
    fn size_variance_in_non_final_fragment_detected() {
        let (_reg, r) = reassembler();
        let mut frags = fragments(&"V".repeat(40), 8, Qos::Bronze);
        assert_eq!(frags.len(), 5);

        // Shrink a middle fragment and fix up its checksum so only the
        // uniformity check can notice.
        if let Content::Text { text, .. } = &mut frags[2].payload.content {
            text.truncate(3);
        }
        frags[2].payload.checksum = Some(short_checksum(
            frags[2].payload.content.as_text().unwrap_or_default(),
        ));

        let mut result = None;
        for frag in &frags {
            match r.push(frag) {
                Ok(_) => {}
                Err(e) => {
                    result = Some(e);
                    break;
                }
            }
        }
        assert_eq!(result, Some(ReassemblyError::TruncatedSizeVariance));
    }

    // ─── Gap Timer ──────────────────────────────────────────────────────

    #[test]
    fn late_fragment_dropped_and_counted() {
        let registry = Registry::new();
        let r = Reassembler::new(
            ReassemblerConfig {
                gap_ttl: Duration::ZERO,
                ..ReassemblerConfig::default()
            },
            &registry,
        );
        let frags = fragments(&"L".repeat(40), 8, Qos::Bronze);

        // Skip fragment 0 — opens a gap at position 0.
        assert_eq!(r.push(&frags[1]).unwrap(), None);
        std::thread::sleep(Duration::from_millis(5));

        // Fragment 0 arrives after the (zero) gap TTL: dropped silently.
        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert_eq!(registry.counter_value("late_fragments_dropped"), 1);
        // The part was not recorded.
        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert_eq!(registry.counter_value("late_fragments_dropped"), 2);
    }

    #[test]
    fn gap_closed_within_ttl_proceeds() {
        let (registry, r) = {
            let registry = Registry::new();
            let r = Reassembler::new(ReassemblerConfig::default(), &registry);
            (registry, r)
        };
        let frags = fragments(&"G".repeat(20), 8, Qos::Bronze);
        assert_eq!(frags.len(), 3);

        // Out of order but fast: 1, 0, 2.
        assert_eq!(r.push(&frags[1]).unwrap(), None);
        assert_eq!(r.push(&frags[0]).unwrap(), None);
        assert!(r.push(&frags[2]).unwrap().is_some());
        assert_eq!(registry.counter_value("late_fragments_dropped"), 0);
    }

    // ─── Garbage Collection ─────────────────────────────────────────────

    #[test]
    fn gc_removes_stale_states() {
        let (_reg, r) = reassembler();
        let frags = fragments(&"S".repeat(40), 8, Qos::Bronze);
        r.push(&frags[0]).unwrap();
        assert_eq!(r.state_count(), 1);

        assert_eq!(r.gc(Duration::ZERO), 1);
        assert_eq!(r.state_count(), 0);
        // Nothing left to collect.
        assert_eq!(r.gc(Duration::ZERO), 0);
    }

    #[test]
    fn gc_keeps_fresh_states() {
        let (_reg, r) = reassembler();
        let frags = fragments(&"F".repeat(40), 8, Qos::Bronze);
        r.push(&frags[0]).unwrap();
        assert_eq!(r.gc(Duration::from_secs(300)), 0);
        assert_eq!(r.state_count(), 1);
    }

    // ─── External Store Mode ────────────────────────────────────────────

    #[test]
    fn store_mode_round_trip() {
        let registry = Registry::new();
        let store = Arc::new(MemoryBufferStore::new(Duration::from_secs(600), &registry));
        let r = Reassembler::new(ReassemblerConfig::default(), &registry).with_store(store);

        let frags = fragments(&"E".repeat(40), 8, Qos::Bronze);
        let mut out = None;
        for frag in &frags {
            if let Some(done) = r.push(frag).unwrap() {
                out = Some(done);
            }
        }
        let out = out.expect("complete");
        assert_eq!(out.payload.content.as_text().unwrap(), &"E".repeat(40));
        assert!(out.has_flag(flags::REASSEMBLED));
        assert_eq!(
            out.payload.checksum.as_deref(),
            Some(short_checksum(&"E".repeat(40)).as_str())
        );
        assert!(registry.counter_value("buffer_store_ops") >= frags.len() as u64);
    }

    #[test]
    fn store_mode_binary_round_trip() {
        let registry = Registry::new();
        let store = Arc::new(MemoryBufferStore::new(Duration::from_secs(600), &registry));
        let r = Reassembler::new(ReassemblerConfig::default(), &registry).with_store(store);

        let mut policy = FragmentationPolicy::default();
        policy.binary_max_size = 8;
        let fragmenter = Fragmenter::new(policy, &registry);
        let data: Vec<u8> = (0..64u8).collect();
        let frame = Frame::message("s", "t", 1, Qos::Bronze, Payload::binary("blob", data.clone()));

        let mut out = None;
        for frag in fragmenter.fragment(&frame) {
            if let Some(done) = r.push(&frag).unwrap() {
                out = Some(done);
            }
        }
        assert_eq!(
            out.expect("complete").payload.content.as_bytes().unwrap(),
            data.as_slice()
        );
    }
}
