//! # Fragmentation
//!
//! Policy-driven splitting of large payloads. The policy decides the
//! per-frame maximum fragment size from the payload kind and QoS tier; the
//! fragmenter emits a `FRAG`-flagged frame per chunk, the terminal one also
//! carrying `LAST`. Integrity is either a per-fragment short checksum or,
//! with Merkle mode enabled, the whole-message Merkle root on every
//! fragment.

use crate::frame::{flags, Content, Frame, Qos};
use crate::merkle::merkle_root_for;
use crate::short_checksum;
use atp_common::metrics::{Histogram, Registry};
use std::collections::HashMap;
use std::sync::Arc;

/// Default maximum code units of text per fragment.
pub const DEFAULT_TEXT_FRAGMENT_SIZE: usize = 256;

/// Default maximum bytes of binary data per fragment.
pub const DEFAULT_BINARY_FRAGMENT_SIZE: usize = 1024;

const FRAGMENT_COUNT_BUCKETS: [f64; 6] = [1.0, 2.0, 4.0, 8.0, 16.0, 32.0];

// ─── Policy ─────────────────────────────────────────────────────────────────

/// Fragmentation sizing policy.
#[derive(Debug, Clone)]
pub struct FragmentationPolicy {
    pub base_max_size: usize,
    pub binary_max_size: usize,
    /// QoS tiers scale the base size; missing tiers fall back to 1.0.
    pub qos_multipliers: HashMap<Qos, f64>,
    pub enable_merkle: bool,
}

impl Default for FragmentationPolicy {
    fn default() -> Self {
        let mut qos_multipliers = HashMap::new();
        qos_multipliers.insert(Qos::Gold, 2.0);
        qos_multipliers.insert(Qos::Silver, 1.5);
        qos_multipliers.insert(Qos::Bronze, 1.0);
        FragmentationPolicy {
            base_max_size: DEFAULT_TEXT_FRAGMENT_SIZE,
            binary_max_size: DEFAULT_BINARY_FRAGMENT_SIZE,
            qos_multipliers,
            enable_merkle: false,
        }
    }
}

impl FragmentationPolicy {
    pub fn with_base_size(base_max_size: usize) -> Self {
        FragmentationPolicy {
            base_max_size,
            ..FragmentationPolicy::default()
        }
    }

    /// Maximum fragment size for the frame: base or binary size scaled by
    /// the QoS multiplier.
    pub fn max_fragment_size(&self, frame: &Frame) -> usize {
        let multiplier = self.qos_multipliers.get(&frame.qos).copied().unwrap_or(1.0);
        let base = if frame.payload.content.is_binary() {
            self.binary_max_size
        } else {
            self.base_max_size
        };
        ((base as f64) * multiplier).round() as usize
    }
}

// ─── Fragmenter ─────────────────────────────────────────────────────────────

/// Splits frames into fragments under a [`FragmentationPolicy`].
pub struct Fragmenter {
    policy: FragmentationPolicy,
    fragment_count: Arc<Histogram>,
}

impl Fragmenter {
    pub fn new(policy: FragmentationPolicy, registry: &Registry) -> Self {
        Fragmenter {
            policy,
            fragment_count: registry
                .histogram("fragment_count_per_message", &FRAGMENT_COUNT_BUCKETS),
        }
    }

    pub fn policy(&self) -> &FragmentationPolicy {
        &self.policy
    }

    /// Fragment a frame. Every fragment carries `FRAG`; the last also
    /// carries `LAST`. An empty payload yields exactly one empty fragment.
    pub fn fragment(&self, frame: &Frame) -> Vec<Frame> {
        let max_size = self.policy.max_fragment_size(frame).max(1);

        let frags = match &frame.payload.content {
            Content::Text { text, .. } => self.fragment_text(frame, text, max_size),
            Content::Binary(bytes) => self.fragment_binary(frame, bytes, max_size),
        };

        self.fragment_count.observe(frags.len() as f64);
        frags
    }

    fn fragment_text(&self, frame: &Frame, text: &str, max_size: usize) -> Vec<Frame> {
        let merkle_root = self
            .policy
            .enable_merkle
            .then(|| merkle_root_for(text, max_size));

        let chars: Vec<char> = text.chars().collect();
        let mut frags: Vec<Frame> = Vec::new();

        for (seq, chunk) in chars.chunks(max_size).enumerate() {
            let chunk: String = chunk.iter().collect();
            let checksum = match &merkle_root {
                Some(root) => root.clone(),
                None => short_checksum(&chunk),
            };
            frags.push(make_fragment(
                frame,
                seq as u32,
                Content::Text {
                    text: chunk,
                    rest: text_rest(frame),
                },
                checksum,
            ));
        }

        finish_fragments(frame, frags, || {
            (
                Content::Text {
                    text: String::new(),
                    rest: text_rest(frame),
                },
                short_checksum(""),
            )
        })
    }

    fn fragment_binary(&self, frame: &Frame, data: &[u8], max_size: usize) -> Vec<Frame> {
        let merkle_root = self
            .policy
            .enable_merkle
            .then(|| merkle_root_for(&hex::encode(data), max_size));

        let mut frags: Vec<Frame> = Vec::new();
        for (seq, chunk) in data.chunks(max_size).enumerate() {
            // Checksums cover the hex encoding for cross-type uniformity.
            let checksum = match &merkle_root {
                Some(root) => root.clone(),
                None => short_checksum(&hex::encode(chunk)),
            };
            frags.push(make_fragment(
                frame,
                seq as u32,
                Content::binary(chunk.to_vec()),
                checksum,
            ));
        }

        finish_fragments(frame, frags, || {
            (Content::binary(Vec::new()), short_checksum(""))
        })
    }
}

fn text_rest(frame: &Frame) -> serde_json::Map<String, serde_json::Value> {
    match &frame.payload.content {
        Content::Text { rest, .. } => rest.clone(),
        Content::Binary(_) => serde_json::Map::new(),
    }
}

fn make_fragment(frame: &Frame, frag_seq: u32, content: Content, checksum: String) -> Frame {
    let mut frag = frame.clone();
    frag.frag_seq = frag_seq;
    frag.payload.content = content;
    frag.payload.checksum = Some(checksum);
    frag.push_flag(flags::FRAG);
    frag
}

/// Mark the last fragment, or synthesize the single empty fragment.
fn finish_fragments(
    frame: &Frame,
    mut frags: Vec<Frame>,
    empty: impl FnOnce() -> (Content, String),
) -> Vec<Frame> {
    match frags.last_mut() {
        Some(last) => last.push_flag(flags::LAST),
        None => {
            let (content, checksum) = empty();
            let mut frag = make_fragment(frame, 0, content, checksum);
            frag.push_flag(flags::LAST);
            frags.push(frag);
        }
    }
    frags
}

// ─── MORE-Flag Semantics ────────────────────────────────────────────────────

/// Translate `FRAG/LAST` fragments to `FRAG/MORE` semantics: every
/// non-final fragment carries `MORE`, the final fragment carries neither
/// `MORE` nor `LAST`. Flags come back sorted.
pub fn to_more_flag_semantics(fragments: &[Frame]) -> Vec<Frame> {
    let count = fragments.len();
    fragments
        .iter()
        .enumerate()
        .map(|(i, frag)| {
            let mut out = frag.clone();
            out.remove_flag(flags::LAST);
            if i + 1 < count {
                out.push_flag(flags::MORE);
            } else {
                out.remove_flag(flags::MORE);
            }
            out.push_flag(flags::FRAG);
            out.flags.sort();
            out.flags.dedup();
            out
        })
        .collect()
}
