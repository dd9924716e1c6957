//! # atp-router
//!
//! The ATP routing core: everything that decides whether, where, and when a
//! frame moves.
//!
//! ## Crate structure
//!
//! - [`aimd`] — Global AIMD admission window
//! - [`scheduler`] — Weighted fair queueing with starvation boosts
//! - [`abac`] — Attribute-based access control with cached decisions
//! - [`scorer`] — Multi-objective scoring (Pareto frontier, scalarization)
//! - [`priors`] — Reinforcement priors fed by federated reward signals
//! - [`pipeline`] — Per-frame orchestration of the above

pub mod abac;
pub mod aimd;
pub mod pipeline;
pub mod priors;
pub mod scheduler;
pub mod scorer;
