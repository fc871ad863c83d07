//! wattgrid-agent — the power-balancing state machine.
//!
//! Every tree node runs the same agent, specialized by role:
//!
//! - **Leaf** (one per compute node): drives per-package
//!   `PowerBalancer`s against the platform and reports aggregate
//!   samples upward.
//! - **Intermediate**: pure aggregator; pushes policies down
//!   unchanged, folds samples up with per-field min/max/sum/min.
//! - **Root**: extends intermediate with the per-step policy-update
//!   rules that close the balancing loop.
//!
//! # Architecture
//!
//! ```text
//! Controller (one per agent, owns the tick loop)
//!   ├── BalancerAgent (role dispatch, policy validation, tick wait)
//!   │     ├── LeafRole ── PowerBalancer per package ── PlatformIo
//!   │     ├── TreeRole (intermediate aggregation)
//!   │     └── RootRole (step policy updates)
//!   └── TreeComm (blocking down-policy / up-sample edges)
//! ```

pub mod agent;
pub mod controller;
pub mod error;
pub mod leaf;
pub mod role;
pub mod root;
pub mod step;
pub mod transport;
pub mod tree;

pub use agent::{BalancerAgent, TraceRecord};
pub use controller::Controller;
pub use error::{AgentError, AgentResult};
pub use leaf::LeafRole;
pub use root::RootRole;
pub use transport::{ChannelComm, TreeComm, build_tree};
pub use tree::{AscendOutcome, DescendOutcome, TreeRole};
