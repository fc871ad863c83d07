//! Intermediate role — pure aggregator between root and leaves.

use tracing::debug;

use watt_core::{Policy, Sample};

use crate::error::{AgentError, AgentResult};
use crate::role::RoleCore;

/// Result of a descend: the per-child policy vectors (always
/// identical) and whether they differ from the last dissemination.
#[derive(Debug, Clone, PartialEq)]
pub struct DescendOutcome {
    pub child_policies: Vec<Policy>,
    pub is_new: bool,
}

/// Result of an ascend: the aggregated sample and whether this call
/// observed the subtree completing the current step for the first
/// time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AscendOutcome {
    pub sample: Sample,
    pub completed: bool,
}

/// An aggregator node. Policies pass through unchanged; samples fold
/// with the per-field aggregation functions (min, max, sum, min).
#[derive(Debug)]
pub struct TreeRole {
    pub(crate) core: RoleCore,
    num_children: usize,
    last_policy: Policy,
    role_name: &'static str,
}

impl TreeRole {
    pub fn new(num_children: usize) -> Self {
        Self::with_role_name(num_children, "intermediate")
    }

    pub(crate) fn with_role_name(num_children: usize, role_name: &'static str) -> Self {
        Self {
            core: RoleCore::new(true),
            num_children,
            last_policy: Policy::zeroed(),
            role_name,
        }
    }

    pub fn step_count(&self) -> u64 {
        self.core.step_count
    }

    pub fn is_step_complete(&self) -> bool {
        self.core.is_step_complete
    }

    pub fn num_children(&self) -> usize {
        self.num_children
    }

    /// Push a policy toward the children.
    ///
    /// An unchanged `step_count` re-emits the last policy (`is_new ==
    /// false`); a non-zero `power_cap` is a hard reset; `own + 1` is a
    /// normal advance. Everything else is a desync.
    pub fn descend(&mut self, policy: &Policy) -> AgentResult<DescendOutcome> {
        let is_new;
        if policy.power_cap != 0.0 {
            // Fresh job-level cap: restart the subtree at step 0.
            self.core.hard_reset(false);
            self.last_policy = *policy;
            is_new = true;
            debug!(
                role = self.role_name,
                power_cap = policy.power_cap,
                "resetting on new job-level cap"
            );
        } else if policy.step_count == self.core.step_count {
            is_new = false;
        } else if self.core.is_step_complete {
            self.core.advance_to(policy.step_count, self.role_name)?;
            self.last_policy = *policy;
            is_new = true;
        } else {
            return Err(AgentError::ProtocolDesync {
                role: self.role_name,
                agent_step: self.core.step_count,
                policy_step: policy.step_count,
            });
        }
        Ok(DescendOutcome {
            child_policies: vec![self.last_policy; self.num_children],
            is_new,
        })
    }

    /// Fold the children's samples upward. The step completes exactly
    /// when the minimum child `step_count` reaches this role's own; a
    /// child ahead of its parent is a desync.
    pub fn ascend(&mut self, child_samples: &[Sample]) -> AgentResult<AscendOutcome> {
        let aggregated = Sample::aggregate(child_samples).ok_or_else(|| {
            AgentError::Transport(format!("{} ascend with no child samples", self.role_name))
        })?;

        if aggregated.step_count > self.core.step_count {
            return Err(AgentError::ProtocolDesync {
                role: self.role_name,
                agent_step: self.core.step_count,
                policy_step: aggregated.step_count,
            });
        }

        let mut completed = false;
        if !self.core.is_step_complete && aggregated.step_count == self.core.step_count {
            self.core.is_step_complete = true;
            completed = true;
            debug!(
                role = self.role_name,
                step_count = self.core.step_count,
                step = self.core.step().name(),
                "subtree completed step"
            );
        }
        Ok(AscendOutcome {
            sample: aggregated,
            completed,
        })
    }
}
