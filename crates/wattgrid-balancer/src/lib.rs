//! wattgrid-balancer — the per-package numeric core.
//!
//! Given a stream of balanced epoch runtimes measured under a
//! stationary power limit, a `PowerBalancer` decides when the stream
//! has stabilized, then searches downward for the smallest limit that
//! still meets a later-supplied target runtime. The difference between
//! its cap and its limit is the slack the tree redistributes.

pub mod balancer;
pub mod ring;

pub use balancer::PowerBalancer;
pub use ring::RuntimeRing;
