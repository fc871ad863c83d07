//! The agent facade — one uniform contract over the three roles.
//!
//! A `BalancerAgent` is constructed with a platform handle, a config,
//! and its tree position; it builds the matching role and dispatches
//! the external contract to it. Calling a leaf method on a non-leaf
//! (or vice versa) fails with `WrongRole`.

use std::time::{Duration, Instant};

use watt_core::{BalanceConfig, Policy, Sample, TreePosition};
use watt_platform::{signals, Domain, PlatformIo};

use crate::error::{AgentError, AgentResult};
use crate::leaf::LeafRole;
use crate::root::RootRole;
use crate::tree::{AscendOutcome, DescendOutcome, TreeRole};

/// Per-tick trace surface exposed by a leaf.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceRecord {
    pub policy: Policy,
    /// Enforced power limit summed across local packages, watts.
    pub enforced_power_limit: f64,
}

enum RoleState<P: PlatformIo> {
    Leaf(Box<LeafRole<P>>),
    Intermediate(TreeRole),
    Root(RootRole),
}

impl<P: PlatformIo> RoleState<P> {
    fn name(&self) -> &'static str {
        match self {
            RoleState::Leaf(_) => "leaf",
            RoleState::Intermediate(_) => "intermediate",
            RoleState::Root(_) => "root",
        }
    }
}

/// Busy-wait tick boundary. A spin on the monotonic clock, not a
/// sleep, so scheduler jitter does not perturb the control cadence.
struct TickWait {
    interval: Duration,
    last: Instant,
}

impl TickWait {
    fn new(interval_sec: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(interval_sec),
            last: Instant::now(),
        }
    }

    fn wait(&mut self) {
        while self.last.elapsed() < self.interval {
            std::hint::spin_loop();
        }
        self.last = Instant::now();
    }
}

/// One balancing agent, specialized by tree position.
pub struct BalancerAgent<P: PlatformIo> {
    role: RoleState<P>,
    tick: TickWait,
    num_package: usize,
    min_power: f64,
    max_power: f64,
    tdp: f64,
}

impl<P: PlatformIo> BalancerAgent<P> {
    /// Build the agent for `position`. Board power constants are read
    /// from the platform once, here; leaves keep the platform for the
    /// life of the agent, aggregators drop it after init.
    pub fn new(
        platform: P,
        config: &BalanceConfig,
        position: &TreePosition,
    ) -> AgentResult<Self> {
        let min_power = platform.read_signal(signals::POWER_PACKAGE_MIN, Domain::Board, 0)?;
        let max_power = platform.read_signal(signals::POWER_PACKAGE_MAX, Domain::Board, 0)?;
        let tdp = platform.read_signal(signals::POWER_PACKAGE_TDP, Domain::Board, 0)?;
        let time_window =
            platform.read_signal(signals::POWER_PACKAGE_TIME_WINDOW, Domain::Board, 0)?;
        let num_package = platform.num_package();

        let role = if position.is_leaf() {
            RoleState::Leaf(Box::new(LeafRole::new(
                platform,
                config,
                min_power,
                time_window,
            )?))
        } else if position.is_root() {
            RoleState::Root(RootRole::new(
                position.num_children(),
                position.num_node(),
                min_power * num_package as f64,
                max_power * num_package as f64,
            ))
        } else {
            RoleState::Intermediate(TreeRole::new(position.num_children()))
        };

        Ok(Self {
            role,
            tick: TickWait::new(config.wait_interval_sec),
            num_package,
            min_power,
            max_power,
            tdp,
        })
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.role, RoleState::Leaf(_))
    }

    pub fn step_count(&self) -> u64 {
        match &self.role {
            RoleState::Leaf(leaf) => leaf.step_count(),
            RoleState::Intermediate(tree) => tree.step_count(),
            RoleState::Root(root) => root.step_count(),
        }
    }

    /// Busy-wait until the configured tick interval has elapsed.
    pub fn wait(&mut self) {
        self.tick.wait();
    }

    /// Sanitize a job-level policy at the root boundary: NaN fields
    /// fall back to defaults, a nonzero cap clamps to the platform's
    /// settable node range, and an all-zero policy is rejected.
    pub fn validate_policy(&self, policy: &mut Policy) -> AgentResult<()> {
        if policy.power_cap.is_nan() {
            policy.power_cap = self.tdp * self.num_package as f64;
        }
        if policy.max_epoch_runtime.is_nan() {
            policy.max_epoch_runtime = 0.0;
        }
        if policy.power_slack.is_nan() {
            policy.power_slack = 0.0;
        }
        if policy.power_cap != 0.0 {
            let min_node = self.min_power * self.num_package as f64;
            let max_node = self.max_power * self.num_package as f64;
            policy.power_cap = policy.power_cap.clamp(min_node, max_node);
        }
        if policy.is_all_zero() {
            return Err(AgentError::InvalidPolicy(
                "all-zero policy".to_string(),
            ));
        }
        Ok(())
    }

    /// Push a policy toward the children. Invalid on a leaf.
    pub fn descend(&mut self, policy: &Policy) -> AgentResult<DescendOutcome> {
        match &mut self.role {
            RoleState::Leaf(_) => Err(AgentError::WrongRole {
                role: "leaf",
                method: "descend",
            }),
            RoleState::Intermediate(tree) => tree.descend(policy),
            RoleState::Root(root) => root.descend(policy),
        }
    }

    /// Fold child samples upward. Invalid on a leaf.
    pub fn ascend(&mut self, child_samples: &[Sample]) -> AgentResult<AscendOutcome> {
        match &mut self.role {
            RoleState::Leaf(_) => Err(AgentError::WrongRole {
                role: "leaf",
                method: "ascend",
            }),
            RoleState::Intermediate(tree) => tree.ascend(child_samples),
            RoleState::Root(root) => root.ascend(child_samples),
        }
    }

    /// Apply the tick's policy to the local platform. Leaf only.
    pub fn adjust_platform(&mut self, policy: &Policy) -> AgentResult<bool> {
        match &mut self.role {
            RoleState::Leaf(leaf) => leaf.adjust_platform(policy),
            other => Err(AgentError::WrongRole {
                role: other.name(),
                method: "adjust_platform",
            }),
        }
    }

    /// Sample the local platform. Leaf only.
    pub fn sample_platform(&mut self) -> AgentResult<(Sample, bool)> {
        match &mut self.role {
            RoleState::Leaf(leaf) => leaf.sample_platform(),
            other => Err(AgentError::WrongRole {
                role: other.name(),
                method: "sample_platform",
            }),
        }
    }

    /// Per-tick trace record. `None` on aggregator roles.
    pub fn trace(&self) -> Option<TraceRecord> {
        match &self.role {
            RoleState::Leaf(leaf) => Some(TraceRecord {
                policy: *leaf.last_policy(),
                enforced_power_limit: leaf.enforced_power_limit(),
            }),
            _ => None,
        }
    }
}
