//! watt-core — shared types for the WattGrid power-balancing runtime.
//!
//! WattGrid enforces a job-wide power cap across a tree of compute
//! nodes while minimizing the runtime of the slowest node. This crate
//! holds the pieces every other crate agrees on:
//!
//! - The four-field policy and sample vectors exchanged over the tree
//! - The three-step balancing cycle and its transition arithmetic
//! - Per-field sample aggregation (min / max / sum / min)
//! - The tree topology descriptor (level, fan-in, node count)
//! - The runtime configuration surface (`BalanceConfig`)

pub mod config;
pub mod error;
pub mod topology;
pub mod types;

pub use config::BalanceConfig;
pub use error::{CoreError, CoreResult};
pub use topology::TreePosition;
pub use types::{Policy, Sample, Step, NUM_POLICY_FIELDS, NUM_SAMPLE_FIELDS};
