//! Downward cap search against a target epoch runtime.

use tracing::debug;

use watt_core::BalanceConfig;

use crate::ring::RuntimeRing;

/// Relative half-width of the tolerance band used both for stability
/// detection (around the ring median) and for target matching (around
/// the target runtime).
const RUNTIME_TOLERANCE: f64 = 0.02;

/// Smallest worthwhile reduction trial, watts. Below this the search
/// has converged.
const MIN_TRIAL_DELTA: f64 = 0.5;

/// Ring capacity as a multiple of the configured minimum sample count.
const RING_CAPACITY_FACTOR: usize = 4;

/// Per-package power balancer.
///
/// Lifecycle: `power_cap` seeds a fresh search at a new cap;
/// `is_runtime_stable` consumes measurement-step epochs until the
/// runtime settles; `target_runtime` installs the tree-wide slowest
/// runtime; `is_target_met` consumes reduce-step epochs, lowering
/// `power_limit` by a fixed fraction of the remaining headroom per
/// trial until the target is just met, the floor is reached, or a
/// trial overshoots and is reverted.
#[derive(Debug)]
pub struct PowerBalancer {
    power_cap: f64,
    power_limit: f64,
    min_power: f64,
    target: Option<f64>,
    target_met: bool,
    tried_reduction: bool,
    last_good_limit: f64,
    ring: RuntimeRing,
    min_num_samples: usize,
    settle_seconds: f64,
    reduction_fraction: f64,
}

impl PowerBalancer {
    /// `min_power` is the platform floor for the package limit;
    /// `time_window` is the platform's power-averaging window, which
    /// together with `stability_factor` sets how much measured runtime
    /// a stable sample set must span.
    pub fn new(config: &BalanceConfig, min_power: f64, time_window: f64) -> Self {
        Self {
            power_cap: f64::NAN,
            power_limit: f64::NAN,
            min_power,
            target: None,
            target_met: false,
            tried_reduction: false,
            last_good_limit: f64::NAN,
            ring: RuntimeRing::new(RING_CAPACITY_FACTOR * config.min_num_samples),
            min_num_samples: config.min_num_samples,
            settle_seconds: config.stability_factor * time_window,
            reduction_fraction: config.reduction_step_fraction,
        }
    }

    /// Install a new hard cap. Resets the limit to the cap, clears the
    /// runtime ring, and abandons any in-progress target search.
    pub fn set_power_cap(&mut self, cap: f64) {
        self.power_cap = cap;
        self.power_limit = cap;
        self.last_good_limit = cap;
        self.target = None;
        self.target_met = false;
        self.tried_reduction = false;
        self.ring.clear();
    }

    pub fn power_cap(&self) -> f64 {
        self.power_cap
    }

    /// The limit this balancer wants enforced. Always `<= power_cap`.
    pub fn power_limit(&self) -> f64 {
        self.power_limit
    }

    /// The platform clipped the requested limit; report slack against
    /// what is actually enforced.
    pub fn power_limit_adjusted(&mut self, actual: f64) {
        if actual.is_finite() {
            self.power_limit = actual.min(self.power_cap);
        }
    }

    /// Feed one measurement-step epoch runtime. Returns true when the
    /// runtime stream has stabilized at the current limit.
    pub fn is_runtime_stable(&mut self, sample: f64) -> bool {
        self.insert(sample);
        self.is_stable()
    }

    /// Median of the runtime ring, NaN before any sample.
    pub fn runtime_sample(&self) -> f64 {
        self.ring.median()
    }

    /// Install the runtime every node should meet while minimizing
    /// power. Measurement samples already in the ring seed the first
    /// reduction decision.
    pub fn set_target_runtime(&mut self, target: f64) {
        self.target = Some(target);
        self.target_met = false;
        self.tried_reduction = false;
        self.last_good_limit = self.power_limit;
    }

    /// Feed one reduce-step epoch runtime. Returns true once the ring
    /// median sits within tolerance of the target, or the reduction
    /// budget is exhausted. Sticky until the next cap or target.
    pub fn is_target_met(&mut self, sample: f64) -> bool {
        if self.target_met {
            return true;
        }
        let Some(target) = self.target else {
            return false;
        };
        self.insert(sample);
        if !self.is_stable() {
            return false;
        }

        let median = self.ring.median();
        let band = RUNTIME_TOLERANCE * target;
        if median > target + band {
            // The last trial pushed runtime past the target.
            if self.tried_reduction {
                debug!(
                    limit = self.power_limit,
                    revert_to = self.last_good_limit,
                    "reduction overshot target, reverting"
                );
                self.power_limit = self.last_good_limit;
                self.ring.clear();
            }
            self.target_met = true;
        } else if median >= target - band {
            self.target_met = true;
        } else {
            self.try_reduce(median);
        }
        self.target_met
    }

    /// Power this balancer has yielded: `cap − limit`.
    pub fn power_slack(&self) -> f64 {
        let slack = self.power_cap - self.power_limit;
        if slack.is_finite() {
            slack.max(0.0)
        } else {
            0.0
        }
    }

    fn try_reduce(&mut self, median: f64) {
        let step = self.reduction_fraction * (self.power_limit - self.min_power);
        if step <= MIN_TRIAL_DELTA || self.power_limit - step <= self.min_power {
            self.target_met = true;
            return;
        }
        self.last_good_limit = self.power_limit;
        self.power_limit -= step;
        self.tried_reduction = true;
        self.ring.clear();
        debug!(
            median,
            limit = self.power_limit,
            "runtime under target, lowering limit"
        );
    }

    /// NaN and non-positive runtimes carry no information; they are
    /// never inserted.
    fn insert(&mut self, sample: f64) {
        if sample.is_finite() && sample > 0.0 {
            self.ring.push(sample);
        }
    }

    fn is_stable(&self) -> bool {
        if self.ring.len() < self.min_num_samples {
            return false;
        }
        let median = self.ring.median();
        let band = RUNTIME_TOLERANCE * median;
        self.ring
            .newest_within(self.min_num_samples, median - band, median + band)
            && self.ring.newest_sum(self.min_num_samples) >= self.settle_seconds
    }
}
