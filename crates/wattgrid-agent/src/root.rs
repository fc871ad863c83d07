//! Root role — closes the balancing loop.
//!
//! The root is an aggregator like any intermediate node, plus the
//! per-step policy-update rules: after SEND_DOWN_LIMIT it zeroes the
//! cap so it is not re-applied, after MEASURE_RUNTIME it publishes the
//! tree-wide slowest runtime, and after REDUCE_LIMIT it computes the
//! per-node slack to hand back out.

use tracing::info;

use watt_core::{Policy, Sample};

use crate::error::{AgentError, AgentResult};
use crate::step;
use crate::tree::{AscendOutcome, DescendOutcome, TreeRole};

/// The tree root. Holds the job-level cap and the working policy the
/// next descend disseminates.
#[derive(Debug)]
pub struct RootRole {
    tree: TreeRole,
    num_node: usize,
    /// Lowest / highest acceptable job-level cap for one node
    /// (platform limits times package count).
    min_node_power: f64,
    max_node_power: f64,
    /// The cap currently driving the algorithm. `None` until the first
    /// job-level policy arrives.
    root_cap: Option<f64>,
    policy: Policy,
}

impl RootRole {
    pub fn new(
        num_children: usize,
        num_node: usize,
        min_node_power: f64,
        max_node_power: f64,
    ) -> Self {
        Self {
            tree: TreeRole::with_role_name(num_children, "root"),
            num_node: num_node.max(1),
            min_node_power,
            max_node_power,
            root_cap: None,
            policy: Policy::zeroed(),
        }
    }

    pub fn step_count(&self) -> u64 {
        self.tree.step_count()
    }

    pub fn is_step_complete(&self) -> bool {
        self.tree.is_step_complete()
    }

    /// The policy the next descend will disseminate.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Accept the controller-injected job-level policy and produce the
    /// per-child dissemination.
    ///
    /// A cap differing from the one in effect forces a hard reset and
    /// rebroadcast; otherwise stepping is driven by the internal
    /// policy, which `ascend` bumps each time the subtree completes a
    /// step.
    pub fn descend(&mut self, in_policy: &Policy) -> AgentResult<DescendOutcome> {
        let is_new;
        if self.root_cap != Some(in_policy.power_cap) {
            let cap = in_policy.power_cap;
            if !(cap >= self.min_node_power && cap <= self.max_node_power) {
                return Err(AgentError::InvalidPolicy(format!(
                    "job-level cap {cap} outside [{}, {}]",
                    self.min_node_power, self.max_node_power
                )));
            }
            self.tree.core.hard_reset(false);
            self.policy = Policy {
                power_cap: cap,
                step_count: 0,
                max_epoch_runtime: 0.0,
                power_slack: 0.0,
            };
            self.root_cap = Some(cap);
            is_new = true;
            info!(power_cap = cap, num_node = self.num_node, "new job-level power cap");
        } else if self.policy.step_count == self.tree.core.step_count + 1 {
            self.tree
                .core
                .advance_to(self.policy.step_count, "root")?;
            is_new = true;
        } else if self.policy.step_count == self.tree.core.step_count {
            is_new = false;
        } else {
            return Err(AgentError::ProtocolDesync {
                role: "root",
                agent_step: self.tree.core.step_count,
                policy_step: self.policy.step_count,
            });
        }
        Ok(DescendOutcome {
            child_policies: vec![self.policy; self.tree.num_children()],
            is_new,
        })
    }

    /// Aggregate child samples; when the subtree completes the current
    /// step, apply that step's policy update and bump the counter so
    /// the next descend moves everyone forward.
    pub fn ascend(&mut self, child_samples: &[Sample]) -> AgentResult<AscendOutcome> {
        let outcome = self.tree.ascend(child_samples)?;
        if outcome.completed {
            if self.tree.core.step_count != self.policy.step_count {
                return Err(AgentError::ProtocolDesync {
                    role: "root",
                    agent_step: self.tree.core.step_count,
                    policy_step: self.policy.step_count,
                });
            }
            let step = self.tree.core.step();
            step::update_root_policy(step, &mut self.policy, &outcome.sample, self.num_node);
            self.policy.step_count = self.tree.core.step_count + 1;
            info!(
                step = step.name(),
                max_epoch_runtime = self.policy.max_epoch_runtime,
                power_slack = self.policy.power_slack,
                "step complete, policy updated"
            );
        }
        Ok(outcome)
    }
}
