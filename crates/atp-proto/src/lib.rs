//! # atp-proto
//!
//! ATP frame protocol. Pure logic, no I/O.
//!
//! Defines the on-wire frame model and the machinery that moves a large
//! payload through the router: policy-driven fragmentation, Merkle
//! checksums, and reliable reassembly with gap, duplicate, corruption, and
//! truncation handling.
//!
//! ## Crate structure
//!
//! - [`frame`] — Frame model, payload variants, validation, JSON codec
//! - [`lane`] — Per-(persona, stream) monotonic message sequencing
//! - [`merkle`] — Merkle tree over fragment chunks
//! - [`frag`] — Fragmentation policy and fragmenter
//! - [`reassembly`] — Reassembler state machine
//! - [`store`] — External reassembly buffer store

pub mod frag;
pub mod frame;
pub mod lane;
pub mod merkle;
pub mod reassembly;
pub mod store;

use sha2::{Digest, Sha256};

/// First 16 hex characters of the SHA-256 digest — the short checksum
/// carried by individual fragments and reassembled frames.
pub fn short_checksum(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    hex::encode(digest)[..16].to_string()
}
