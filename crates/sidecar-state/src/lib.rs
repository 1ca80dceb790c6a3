//! sidecar-state crate
//!
//! Pluggable state models that turn decoded protocol logs into derived
//! rows, the registry that drives their per-block lifecycle, and the merkle
//! construction behind per-block state roots.

pub mod accumulator;
pub mod base;
pub mod error;
pub mod merkle;
pub mod models;
pub mod registry;

pub use error::StateError;
pub use models::StateChange;
pub use registry::{StateModel, StateRegistry};
