//! Shared infrastructure for the ATP router core.
//!
//! This crate contains:
//! - **Metrics** — counter/gauge/histogram registry with Prometheus text export
//! - **Row encryption** — per-row DEK envelope encryption with tenant scoping

pub mod crypto;
pub mod metrics;
