//! Trixel management node primitives.
//!
//! This crate implements the server side of a privacy-aware environmental
//! sensor network: it buffers raw station readings per (trixel, sensor type),
//! folds them through a pluggable privatization strategy on a fixed cadence,
//! and only publishes an estimate once enough distinct stations stand behind
//! it. Delegation of trixels is pulled from a lookup service and can change
//! at any time.

pub mod config;
pub mod delegation;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod node;
pub mod observation;
pub mod privatizer;
pub mod purger;
pub mod stations;
pub mod stats;
pub mod store;
pub mod types;

pub use crate::node::{NodeStatus, TmsNode};
