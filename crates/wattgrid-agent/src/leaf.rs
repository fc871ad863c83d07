//! Leaf role — one per compute node.
//!
//! The leaf owns one `PowerBalancer` per package, actuates the
//! balancers' limit requests through the platform control, and reports
//! aggregate samples upward. All epoch bookkeeping lives here: a
//! runtime sample is consumed only when the package's epoch counter
//! has advanced.

use tracing::{debug, info, warn};

use watt_core::{BalanceConfig, Policy, Sample};
use watt_platform::{controls, signals, ControlHandle, Domain, PlatformIo, SignalHandle};
use wattgrid_balancer::PowerBalancer;

use crate::error::{AgentError, AgentResult};
use crate::role::RoleCore;
use crate::step;

/// Per-package bookkeeping.
#[derive(Debug)]
pub(crate) struct PackageState {
    runtime_handle: SignalHandle,
    count_handle: SignalHandle,
    network_handle: SignalHandle,
    ignore_handle: SignalHandle,
    limit_handle: ControlHandle,
    pub last_epoch_count: f64,
    pub last_request: f64,
    pub enforced_limit: f64,
    pub runtime: f64,
    pub power_slack: f64,
    pub power_headroom: f64,
    pub is_out_of_bounds: bool,
    pub is_step_complete: bool,
}

impl PackageState {
    fn reset(&mut self) {
        self.last_epoch_count = 0.0;
        self.runtime = 0.0;
        self.power_slack = 0.0;
        self.power_headroom = 0.0;
        self.is_out_of_bounds = false;
        self.is_step_complete = true;
    }
}

/// The leaf agent role.
pub struct LeafRole<P: PlatformIo> {
    pub(crate) platform: P,
    pub(crate) core: RoleCore,
    pub(crate) packages: Vec<PackageState>,
    pub(crate) balancers: Vec<PowerBalancer>,
    last_policy: Policy,
    /// Set once the first job-level cap has seeded the balancers. A
    /// step advance before that is a protocol violation.
    seeded: bool,
}

impl<P: PlatformIo> LeafRole<P> {
    pub fn new(
        mut platform: P,
        config: &BalanceConfig,
        min_power: f64,
        time_window: f64,
    ) -> AgentResult<Self> {
        let num_package = platform.num_package();
        let mut packages = Vec::with_capacity(num_package);
        let mut balancers = Vec::with_capacity(num_package);
        for idx in 0..num_package {
            let runtime_handle =
                platform.push_signal(signals::EPOCH_RUNTIME, Domain::Package, idx)?;
            let count_handle = platform.push_signal(signals::EPOCH_COUNT, Domain::Package, idx)?;
            let network_handle =
                platform.push_signal(signals::EPOCH_RUNTIME_NETWORK, Domain::Package, idx)?;
            let ignore_handle =
                platform.push_signal(signals::EPOCH_RUNTIME_IGNORE, Domain::Package, idx)?;
            let limit_handle =
                platform.push_control(controls::POWER_PACKAGE_LIMIT, Domain::Package, idx)?;
            packages.push(PackageState {
                runtime_handle,
                count_handle,
                network_handle,
                ignore_handle,
                limit_handle,
                last_epoch_count: 0.0,
                last_request: f64::NAN,
                enforced_limit: 0.0,
                runtime: 0.0,
                power_slack: 0.0,
                power_headroom: 0.0,
                is_out_of_bounds: false,
                is_step_complete: true,
            });
            balancers.push(PowerBalancer::new(config, min_power, time_window));
        }
        Ok(Self {
            platform,
            core: RoleCore::new(true),
            packages,
            balancers,
            last_policy: Policy::zeroed(),
            seeded: false,
        })
    }

    pub fn num_package(&self) -> usize {
        self.packages.len()
    }

    pub fn step_count(&self) -> u64 {
        self.core.step_count
    }

    /// Apply the tick's policy: seed or advance the state machine,
    /// then actuate each balancer's limit request. Returns true when a
    /// control write was staged.
    pub fn adjust_platform(&mut self, policy: &Policy) -> AgentResult<bool> {
        self.last_policy = *policy;
        if policy.power_cap != 0.0 {
            // Fresh job-level cap: restart the algorithm with the cap
            // spread evenly across local packages.
            self.core.hard_reset(true);
            let per_package = policy.power_cap / self.num_package() as f64;
            for balancer in &mut self.balancers {
                balancer.set_power_cap(per_package);
            }
            for package in &mut self.packages {
                package.reset();
            }
            self.seeded = true;
            info!(
                power_cap = policy.power_cap,
                per_package, "job-level cap applied, state machine reset"
            );
        } else if policy.step_count != self.core.step_count {
            if !self.seeded {
                // The first policy this leaf ever sees must carry a
                // cap; stepping without one means the tree is ahead of
                // us.
                return Err(AgentError::ProtocolDesync {
                    role: "leaf",
                    agent_step: self.core.step_count,
                    policy_step: policy.step_count,
                });
            }
            self.core.advance_to(policy.step_count, "leaf")?;
            for package in &mut self.packages {
                package.is_step_complete = false;
            }
            let entered = self.core.step();
            step::enter_leaf(entered, self, policy);
            debug!(
                step_count = self.core.step_count,
                step = entered.name(),
                "entered step"
            );
        }
        self.actuate_limits()
    }

    /// Run the current step's sampling hook and report the aggregate
    /// sample. Returns the sample and whether the step is complete.
    pub fn sample_platform(&mut self) -> AgentResult<(Sample, bool)> {
        step::sample_leaf(self.core.step(), self)?;

        let mut max_runtime: f64 = 0.0;
        let mut sum_slack = 0.0;
        let mut min_headroom = f64::INFINITY;
        for package in &self.packages {
            max_runtime = max_runtime.max(package.runtime);
            sum_slack += package.power_slack;
            min_headroom = min_headroom.min(package.power_headroom);
        }
        if !min_headroom.is_finite() {
            min_headroom = 0.0;
        }
        let sample = Sample {
            step_count: self.core.step_count,
            max_epoch_runtime: max_runtime,
            sum_power_slack: sum_slack,
            min_power_headroom: min_headroom,
        };
        Ok((sample, self.core.is_step_complete))
    }

    /// Trace surface: the last policy seen and the limit enforced
    /// across all packages.
    pub fn enforced_power_limit(&self) -> f64 {
        self.packages.iter().map(|p| p.enforced_limit).sum()
    }

    pub fn last_policy(&self) -> &Policy {
        &self.last_policy
    }

    /// If the package's epoch counter advanced since the last tick,
    /// return the balanced runtime of the new epoch: total time minus
    /// network and ignored time, so only node-local performance is
    /// measured.
    pub(crate) fn new_epoch_runtime(&mut self, idx: usize) -> AgentResult<Option<f64>> {
        let package = &mut self.packages[idx];
        let epoch_count = self.platform.sample(package.count_handle)?;
        if epoch_count == package.last_epoch_count {
            return Ok(None);
        }
        package.last_epoch_count = epoch_count;
        let total = self.platform.sample(package.runtime_handle)?;
        let network = self.platform.sample(package.network_handle)?;
        let ignore = self.platform.sample(package.ignore_handle)?;
        Ok(Some(total - network - ignore))
    }

    fn actuate_limits(&mut self) -> AgentResult<bool> {
        let mut do_write = false;
        for idx in 0..self.packages.len() {
            let request = self.balancers[idx].power_limit();
            if !request.is_finite() || request <= 0.0 {
                continue;
            }
            if request == self.packages[idx].last_request {
                continue;
            }
            let actual = self.platform.adjust(self.packages[idx].limit_handle, request)?;
            self.packages[idx].last_request = request;
            self.packages[idx].enforced_limit = actual;
            do_write = true;
            if actual > request {
                // The platform refused to go as low as asked; this
                // package cannot reduce any further.
                self.packages[idx].is_out_of_bounds = true;
                warn!(
                    package = idx,
                    requested = request,
                    actual,
                    "limit request clipped, package out of bounds"
                );
            }
            if actual != request {
                self.balancers[idx].power_limit_adjusted(actual);
            }
        }
        if do_write {
            self.platform.write_batch()?;
        }
        Ok(do_write)
    }
}

#[cfg(test)]
mod tests {
    use watt_platform::SimPlatform;

    use super::*;

    fn cap_policy(cap: f64) -> Policy {
        Policy {
            power_cap: cap,
            step_count: 0,
            max_epoch_runtime: 0.0,
            power_slack: 0.0,
        }
    }

    fn step_policy(step_count: u64, max_epoch_runtime: f64, power_slack: f64) -> Policy {
        Policy {
            power_cap: 0.0,
            step_count,
            max_epoch_runtime,
            power_slack,
        }
    }

    fn test_leaf(num_package: usize) -> LeafRole<SimPlatform> {
        let platform = SimPlatform::new(num_package, 50.0, 200.0).with_time_window(0.001);
        LeafRole::new(platform, &BalanceConfig::default(), 50.0, 0.001).unwrap()
    }

    /// Feed epochs until every package reports runtime stability.
    fn run_measure(leaf: &mut LeafRole<SimPlatform>, runtimes: &[f64]) {
        for _ in 0..10 {
            for (idx, &runtime) in runtimes.iter().enumerate() {
                leaf.platform.advance_epoch(idx, runtime, 0.0, 0.0);
            }
            leaf.sample_platform().unwrap();
        }
    }

    #[test]
    fn fresh_cap_splits_across_packages() {
        // A 300 W node cap over two 50-200 W packages.
        let mut leaf = test_leaf(2);
        let wrote = leaf.adjust_platform(&cap_policy(300.0)).unwrap();
        assert!(wrote);

        for idx in 0..2 {
            assert_eq!(leaf.balancers[idx].power_cap(), 150.0);
            assert_eq!(leaf.platform.enforced_limit(idx), 150.0);
        }

        let (sample, complete) = leaf.sample_platform().unwrap();
        assert!(complete);
        assert_eq!(sample.step_count, 0);
        assert_eq!(sample.max_epoch_runtime, 0.0);
        assert_eq!(sample.sum_power_slack, 0.0);
    }

    #[test]
    fn step_advance_without_cap_first_is_a_desync() {
        let mut leaf = test_leaf(2);
        let err = leaf
            .adjust_platform(&step_policy(1, 0.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, AgentError::ProtocolDesync { .. }));
    }

    #[test]
    fn measure_step_waits_for_stability_on_every_package() {
        let mut leaf = test_leaf(2);
        leaf.adjust_platform(&cap_policy(300.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();

        // Only package 0 produces epochs: step must stay incomplete.
        for _ in 0..10 {
            leaf.platform.advance_epoch(0, 1.0, 0.0, 0.0);
            let (_, complete) = leaf.sample_platform().unwrap();
            assert!(!complete);
        }

        // Package 1 catches up; both stable completes the step.
        for _ in 0..10 {
            leaf.platform.advance_epoch(0, 1.0, 0.0, 0.0);
            leaf.platform.advance_epoch(1, 2.0, 0.0, 0.0);
            leaf.sample_platform().unwrap();
        }
        let (sample, complete) = leaf.sample_platform().unwrap();
        assert!(complete);
        assert_eq!(sample.step_count, 1);
        assert_eq!(sample.max_epoch_runtime, 2.0);
    }

    #[test]
    fn balanced_runtime_subtracts_network_and_ignore_time() {
        let mut leaf = test_leaf(1);
        leaf.adjust_platform(&cap_policy(150.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();

        for _ in 0..10 {
            leaf.platform.advance_epoch(0, 2.0, 0.4, 0.1);
            leaf.sample_platform().unwrap();
        }
        let (sample, complete) = leaf.sample_platform().unwrap();
        assert!(complete);
        assert!((sample.max_epoch_runtime - 1.5).abs() < 1e-9);
    }

    #[test]
    fn reduce_step_yields_slack_when_faster_than_target() {
        let mut leaf = test_leaf(1);
        leaf.adjust_platform(&cap_policy(150.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();
        run_measure(&mut leaf, &[1.0]);

        leaf.adjust_platform(&step_policy(2, 2.0, 0.0)).unwrap();
        let mut complete = false;
        for _ in 0..200 {
            leaf.platform.advance_epoch(0, 1.0, 0.0, 0.0);
            let (_, done) = leaf.sample_platform().unwrap();
            // Keep actuating so lowered limits reach the platform.
            leaf.adjust_platform(&step_policy(2, 2.0, 0.0)).unwrap();
            if done {
                complete = true;
                break;
            }
        }
        assert!(complete);
        let (sample, _) = leaf.sample_platform().unwrap();
        assert!(sample.sum_power_slack > 0.0);
        assert_eq!(sample.sum_power_slack, sample.min_power_headroom);
        assert!(leaf.balancers[0].power_limit() >= 50.0);
        assert!(leaf.balancers[0].power_limit() < 150.0);
    }

    #[test]
    fn slowest_node_cannot_reduce_and_reports_zero_slack() {
        let mut leaf = test_leaf(1);
        leaf.adjust_platform(&cap_policy(150.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();
        run_measure(&mut leaf, &[2.0]);

        // Target equals own runtime: met immediately, nothing yielded.
        leaf.adjust_platform(&step_policy(2, 2.0, 0.0)).unwrap();
        let mut complete = false;
        for _ in 0..10 {
            leaf.platform.advance_epoch(0, 2.0, 0.0, 0.0);
            let (_, done) = leaf.sample_platform().unwrap();
            if done {
                complete = true;
                break;
            }
        }
        assert!(complete);
        let (sample, _) = leaf.sample_platform().unwrap();
        assert_eq!(sample.sum_power_slack, 0.0);
        assert_eq!(sample.min_power_headroom, 0.0);
    }

    #[test]
    fn clipped_package_is_treated_as_target_met() {
        // Platform floor at 140 W: the first reduction trial below it
        // gets clipped, marking the package out of bounds.
        let platform = SimPlatform::new(1, 140.0, 200.0).with_time_window(0.001);
        let mut leaf = LeafRole::new(platform, &BalanceConfig::default(), 50.0, 0.001).unwrap();
        leaf.adjust_platform(&cap_policy(150.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();
        run_measure(&mut leaf, &[1.0]);

        leaf.adjust_platform(&step_policy(2, 4.0, 0.0)).unwrap();
        let mut complete = false;
        for _ in 0..60 {
            leaf.platform.advance_epoch(0, 1.0, 0.0, 0.0);
            let (_, done) = leaf.sample_platform().unwrap();
            leaf.adjust_platform(&step_policy(2, 4.0, 0.0)).unwrap();
            if done {
                complete = true;
                break;
            }
        }
        assert!(complete);
        // The enforced limit never went below the platform floor.
        assert!(leaf.platform.enforced_limit(0) >= 140.0);
    }

    #[test]
    fn send_down_slack_raises_package_budgets() {
        let mut leaf = test_leaf(2);
        leaf.adjust_platform(&cap_policy(300.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();
        run_measure(&mut leaf, &[1.0, 1.0]);
        leaf.adjust_platform(&step_policy(2, 1.0, 0.0)).unwrap();
        for _ in 0..5 {
            leaf.platform.advance_epoch(0, 1.0, 0.0, 0.0);
            leaf.platform.advance_epoch(1, 1.0, 0.0, 0.0);
            leaf.sample_platform().unwrap();
        }

        // Next cycle's SEND_DOWN_LIMIT carries 20 W of per-node slack:
        // each package budget becomes its limit plus a 10 W share.
        leaf.adjust_platform(&step_policy(3, 1.0, 20.0)).unwrap();
        let (sample, complete) = leaf.sample_platform().unwrap();
        assert!(complete);
        assert_eq!(sample.step_count, 3);
        for idx in 0..2 {
            assert_eq!(leaf.balancers[idx].power_cap(), 160.0);
            assert_eq!(leaf.balancers[idx].power_limit(), 160.0);
            assert_eq!(leaf.platform.enforced_limit(idx), 160.0);
        }
    }

    #[test]
    fn transient_read_failure_skips_the_sample() {
        let mut leaf = test_leaf(1);
        leaf.adjust_platform(&cap_policy(150.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();

        leaf.platform.advance_epoch(0, 1.0, 0.0, 0.0);
        leaf.platform.inject_read_failures(1);
        let (sample, complete) = leaf.sample_platform().unwrap();
        assert!(!complete);
        assert_eq!(sample.step_count, 1);
        assert_eq!(sample.max_epoch_runtime, 0.0);
    }

    #[test]
    fn new_cap_resets_to_fresh_state() {
        // Run a full cycle, inject a new cap, and the
        // observable state matches a freshly seeded agent.
        let mut leaf = test_leaf(2);
        leaf.adjust_platform(&cap_policy(300.0)).unwrap();
        leaf.adjust_platform(&step_policy(1, 0.0, 0.0)).unwrap();
        run_measure(&mut leaf, &[1.0, 1.5]);
        leaf.adjust_platform(&step_policy(2, 1.5, 0.0)).unwrap();

        leaf.adjust_platform(&cap_policy(240.0)).unwrap();
        assert_eq!(leaf.step_count(), 0);
        for idx in 0..2 {
            assert_eq!(leaf.balancers[idx].power_cap(), 120.0);
            assert_eq!(leaf.balancers[idx].power_limit(), 120.0);
            assert!(leaf.balancers[idx].runtime_sample().is_nan());
        }
        let (sample, complete) = leaf.sample_platform().unwrap();
        assert!(complete);
        assert_eq!(sample.step_count, 0);
        assert_eq!(sample.max_epoch_runtime, 0.0);
        assert_eq!(sample.sum_power_slack, 0.0);
    }
}
