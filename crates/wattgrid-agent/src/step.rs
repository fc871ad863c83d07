//! Per-step behavior, split by capability:
//!
//! - `update_root_policy` — what the root folds into its policy when
//!   the subtree finishes a step
//! - `enter_leaf` — what a leaf does on entering a step
//! - `sample_leaf` — what a leaf does on every sampling tick within a
//!   step
//!
//! Roles are passed in explicitly; the steps own no state.

use tracing::{debug, warn};

use watt_core::{Policy, Sample, Step};
use watt_platform::{PlatformError, PlatformIo};

use crate::error::AgentResult;
use crate::leaf::LeafRole;

/// Root-side policy update applied when step `step` completes.
pub(crate) fn update_root_policy(
    step: Step,
    policy: &mut Policy,
    sample: &Sample,
    num_node: usize,
) {
    match step {
        // The cap has been applied everywhere; stop re-applying it.
        Step::SendDownLimit => {
            policy.power_cap = 0.0;
        }
        // Publish the slowest runtime as the target everyone meets.
        Step::MeasureRuntime => {
            policy.max_epoch_runtime = sample.max_epoch_runtime;
        }
        // Hand the recovered slack back out, clamped so no node is
        // pushed past its cap.
        Step::ReduceLimit => {
            let per_node = sample.sum_power_slack / num_node as f64;
            policy.power_slack = per_node.min(sample.min_power_headroom);
        }
    }
}

/// Leaf-side hook invoked once when the role advances into `step`.
pub(crate) fn enter_leaf<P: PlatformIo>(step: Step, leaf: &mut LeafRole<P>, policy: &Policy) {
    match step {
        Step::SendDownLimit => {
            // Fold the redistributed slack into each package budget,
            // locking in the previous reduction. Nothing to measure.
            let per_package = policy.power_slack / leaf.num_package() as f64;
            for balancer in &mut leaf.balancers {
                let cap = balancer.power_limit() + per_package;
                balancer.set_power_cap(cap);
            }
            leaf.core.is_step_complete = true;
        }
        Step::MeasureRuntime => {}
        Step::ReduceLimit => {
            for balancer in &mut leaf.balancers {
                balancer.set_target_runtime(policy.max_epoch_runtime);
            }
        }
    }
}

/// Leaf-side hook invoked on every sampling tick.
pub(crate) fn sample_leaf<P: PlatformIo>(step: Step, leaf: &mut LeafRole<P>) -> AgentResult<()> {
    match step {
        Step::SendDownLimit => Ok(()),
        Step::MeasureRuntime => sample_measure(leaf),
        Step::ReduceLimit => sample_reduce(leaf),
    }
}

fn sample_measure<P: PlatformIo>(leaf: &mut LeafRole<P>) -> AgentResult<()> {
    if !refresh_signals(leaf)? {
        return Ok(());
    }
    let mut all_complete = true;
    for idx in 0..leaf.num_package() {
        if let Some(runtime) = leaf.new_epoch_runtime(idx)? {
            if !leaf.packages[idx].is_step_complete {
                let balancer = &mut leaf.balancers[idx];
                if balancer.is_runtime_stable(runtime) {
                    leaf.packages[idx].runtime = balancer.runtime_sample();
                    leaf.packages[idx].is_step_complete = true;
                    debug!(
                        package = idx,
                        runtime = leaf.packages[idx].runtime,
                        "runtime stable"
                    );
                }
            }
        }
        all_complete &= leaf.packages[idx].is_step_complete;
    }
    if all_complete {
        leaf.core.is_step_complete = true;
    }
    Ok(())
}

fn sample_reduce<P: PlatformIo>(leaf: &mut LeafRole<P>) -> AgentResult<()> {
    if !refresh_signals(leaf)? {
        return Ok(());
    }
    let mut all_complete = true;
    for idx in 0..leaf.num_package() {
        if let Some(runtime) = leaf.new_epoch_runtime(idx)? {
            if !leaf.packages[idx].is_step_complete {
                let balancer = &mut leaf.balancers[idx];
                // A package the platform clipped cannot reduce
                // further; treat it as having met the target so the
                // algorithm converges.
                let met =
                    leaf.packages[idx].is_out_of_bounds || balancer.is_target_met(runtime);
                leaf.packages[idx].power_slack = balancer.power_slack();
                leaf.packages[idx].power_headroom =
                    balancer.power_cap() - balancer.power_limit();
                if met {
                    leaf.packages[idx].is_step_complete = true;
                    leaf.packages[idx].is_out_of_bounds = false;
                    debug!(
                        package = idx,
                        power_slack = leaf.packages[idx].power_slack,
                        "reduction settled"
                    );
                }
            }
        }
        all_complete &= leaf.packages[idx].is_step_complete;
    }
    if all_complete {
        leaf.core.is_step_complete = true;
    }
    Ok(())
}

/// Refresh the batched signals. A transient read failure drops this
/// tick's samples and keeps the state machine where it is.
fn refresh_signals<P: PlatformIo>(leaf: &mut LeafRole<P>) -> AgentResult<bool> {
    match leaf.platform.read_batch() {
        Ok(()) => Ok(true),
        Err(PlatformError::ReadFailed(reason)) => {
            warn!(%reason, "transient platform read failure, skipping sample");
            Ok(false)
        }
        Err(other) => Err(other.into()),
    }
}
