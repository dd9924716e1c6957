//! # atp-federated
//!
//! Privacy-preserving reward sharing across a router federation.
//!
//! Routers periodically publish per-(model, task) reward statistics under an
//! anonymous cluster hash. A coordinator merges signals from the same
//! aggregation round — either in the clear with sample-weighted averaging,
//! or through the secure aggregation protocol (differential-privacy noise,
//! per-field symmetric encryption, HMAC-signed contributions).
//!
//! ## Crate structure
//!
//! - [`signal`] — Signal schema, validation, cluster hashing, plain aggregation
//! - [`secure`] — Secure aggregation nodes and coordinator

pub mod secure;
pub mod signal;
