//! Policy and sample vectors, and the three-step balancing cycle.
//!
//! Policies flow from the root toward the leaves; samples flow from
//! the leaves toward the root. Both are fixed-length numeric vectors
//! on the wire (`[f64; 4]`) so the tree transport never needs to know
//! their meaning.

use serde::{Deserialize, Serialize};

/// Number of fields in a policy vector on the wire.
pub const NUM_POLICY_FIELDS: usize = 4;

/// Number of fields in a sample vector on the wire.
pub const NUM_SAMPLE_FIELDS: usize = 4;

/// One step of the balancing cycle. Three steps form one full cycle;
/// the current step is always `step_count mod 3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Publish the per-node slack each leaf should fold into its cap.
    /// Carries a non-zero `power_cap` only on the first cycle after a
    /// fresh job-level cap.
    SendDownLimit,
    /// Each leaf measures epoch runtime at its current limit until the
    /// measurement is stable; the tree-wide maximum becomes the target.
    MeasureRuntime,
    /// Each leaf lowers its limit while still meeting the target; the
    /// recovered slack and remaining headroom flow up.
    ReduceLimit,
}

impl Step {
    /// Number of steps in one balancing cycle.
    pub const COUNT: u64 = 3;

    /// The step selected by a monotone step counter.
    pub fn from_count(step_count: u64) -> Self {
        match step_count % Self::COUNT {
            0 => Step::SendDownLimit,
            1 => Step::MeasureRuntime,
            _ => Step::ReduceLimit,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::SendDownLimit => "SEND_DOWN_LIMIT",
            Step::MeasureRuntime => "MEASURE_RUNTIME",
            Step::ReduceLimit => "REDUCE_LIMIT",
        }
    }
}

/// Policy vector, root → leaves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Per-node average cap for the whole job. Non-zero only when a
    /// fresh job-level cap is being disseminated; zero on every other
    /// step.
    pub power_cap: f64,
    /// Monotone step counter; `step_count mod 3` selects the step.
    pub step_count: u64,
    /// Slowest per-node epoch runtime observed at the last measurement
    /// step. Zero until measured.
    pub max_epoch_runtime: f64,
    /// Per-node average power each leaf may add to its limit after a
    /// reduction round. Zero until computed.
    pub power_slack: f64,
}

impl Policy {
    pub fn zeroed() -> Self {
        Self {
            power_cap: 0.0,
            step_count: 0,
            max_epoch_runtime: 0.0,
            power_slack: 0.0,
        }
    }

    /// The step this policy is driving.
    pub fn step(&self) -> Step {
        Step::from_count(self.step_count)
    }

    /// True when every field is exactly zero. An all-zero policy is
    /// never valid at the root boundary.
    pub fn is_all_zero(&self) -> bool {
        self.power_cap == 0.0
            && self.step_count == 0
            && self.max_epoch_runtime == 0.0
            && self.power_slack == 0.0
    }

    /// Encode for the tree transport.
    pub fn to_wire(&self) -> [f64; NUM_POLICY_FIELDS] {
        [
            self.power_cap,
            self.step_count as f64,
            self.max_epoch_runtime,
            self.power_slack,
        ]
    }

    /// Decode from the tree transport. NaN handling is the root
    /// boundary's job (`validate`); here NaN step counts collapse to 0
    /// so the counter stays well-defined.
    pub fn from_wire(wire: [f64; NUM_POLICY_FIELDS]) -> Self {
        Self {
            power_cap: wire[0],
            step_count: if wire[1].is_finite() && wire[1] >= 0.0 {
                wire[1] as u64
            } else {
                0
            },
            max_epoch_runtime: wire[2],
            power_slack: wire[3],
        }
    }
}

/// Sample vector, leaves → root.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// The step counter the reporting subtree is executing. Aggregates
    /// by `min`: the root knows step k finished everywhere only when
    /// the minimum over children reaches k.
    pub step_count: u64,
    /// Slowest epoch runtime in the subtree. Aggregates by `max`.
    pub max_epoch_runtime: f64,
    /// Total slack power yielded by the subtree. Aggregates by `sum`.
    pub sum_power_slack: f64,
    /// Smallest cap-to-limit gap in the subtree. Aggregates by `min`.
    pub min_power_headroom: f64,
}

impl Sample {
    pub fn zeroed() -> Self {
        Self {
            step_count: 0,
            max_epoch_runtime: 0.0,
            sum_power_slack: 0.0,
            min_power_headroom: 0.0,
        }
    }

    /// Fold child samples with the per-field aggregation functions.
    /// Returns `None` for an empty child set.
    pub fn aggregate(children: &[Sample]) -> Option<Sample> {
        let first = children.first()?;
        let mut out = *first;
        for child in &children[1..] {
            out.step_count = out.step_count.min(child.step_count);
            out.max_epoch_runtime = out.max_epoch_runtime.max(child.max_epoch_runtime);
            out.sum_power_slack += child.sum_power_slack;
            out.min_power_headroom = out.min_power_headroom.min(child.min_power_headroom);
        }
        Some(out)
    }

    pub fn to_wire(&self) -> [f64; NUM_SAMPLE_FIELDS] {
        [
            self.step_count as f64,
            self.max_epoch_runtime,
            self.sum_power_slack,
            self.min_power_headroom,
        ]
    }

    pub fn from_wire(wire: [f64; NUM_SAMPLE_FIELDS]) -> Self {
        Self {
            step_count: if wire[0].is_finite() && wire[0] >= 0.0 {
                wire[0] as u64
            } else {
                0
            },
            max_epoch_runtime: wire[1],
            sum_power_slack: wire[2],
            min_power_headroom: wire[3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_cycles_with_counter() {
        assert_eq!(Step::from_count(0), Step::SendDownLimit);
        assert_eq!(Step::from_count(1), Step::MeasureRuntime);
        assert_eq!(Step::from_count(2), Step::ReduceLimit);
        assert_eq!(Step::from_count(3), Step::SendDownLimit);
        assert_eq!(Step::from_count(7), Step::MeasureRuntime);
    }

    #[test]
    fn policy_step_derives_from_counter() {
        let mut policy = Policy::zeroed();
        for count in 0..9 {
            policy.step_count = count;
            assert_eq!(policy.step(), Step::from_count(count));
        }
    }

    #[test]
    fn all_zero_detection() {
        assert!(Policy::zeroed().is_all_zero());

        let mut policy = Policy::zeroed();
        policy.power_cap = 200.0;
        assert!(!policy.is_all_zero());
    }

    #[test]
    fn aggregation_uses_min_max_sum_min() {
        let children = [
            Sample {
                step_count: 4,
                max_epoch_runtime: 1.0,
                sum_power_slack: 20.0,
                min_power_headroom: 10.0,
            },
            Sample {
                step_count: 5,
                max_epoch_runtime: 2.0,
                sum_power_slack: 20.0,
                min_power_headroom: 40.0,
            },
            Sample {
                step_count: 5,
                max_epoch_runtime: 1.5,
                sum_power_slack: 0.0,
                min_power_headroom: 25.0,
            },
        ];

        let agg = Sample::aggregate(&children).unwrap();
        assert_eq!(agg.step_count, 4);
        assert_eq!(agg.max_epoch_runtime, 2.0);
        assert_eq!(agg.sum_power_slack, 40.0);
        assert_eq!(agg.min_power_headroom, 10.0);
    }

    #[test]
    fn aggregation_of_empty_set_is_none() {
        assert!(Sample::aggregate(&[]).is_none());
    }

    #[test]
    fn wire_decode_collapses_nan_step_count() {
        let policy = Policy::from_wire([100.0, f64::NAN, 0.0, 0.0]);
        assert_eq!(policy.step_count, 0);

        let sample = Sample::from_wire([f64::NAN, 1.0, 0.0, 0.0]);
        assert_eq!(sample.step_count, 0);
    }
}
