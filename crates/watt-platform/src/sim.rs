//! Deterministic in-memory platform for tests and the simulator.
//!
//! Epoch signals are fed by the harness through `advance_epoch`;
//! nothing advances on its own. Power limit writes clip to the
//! configured settable range, mirroring how real package-power
//! hardware behaves. A one-shot read failure can be injected to
//! exercise the transient-fault path of the leaf role.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::io::{
    ControlHandle, Domain, PlatformError, PlatformIo, PlatformResult, SignalHandle, controls,
    signals,
};

#[derive(Debug, Clone, Copy)]
struct SimPackage {
    epoch_count: f64,
    epoch_runtime: f64,
    epoch_network: f64,
    epoch_ignore: f64,
    power_limit: f64,
}

#[derive(Debug, Clone, Copy)]
struct PushedSignal {
    name: &'static str,
    index: usize,
    cached: f64,
}

#[derive(Debug, Clone, Copy)]
struct PushedControl {
    index: usize,
    staged: Option<f64>,
}

/// Simulated node platform with a configurable number of packages.
pub struct SimPlatform {
    min_power: f64,
    max_power: f64,
    tdp: f64,
    time_window: f64,
    packages: Vec<SimPackage>,
    pushed_signals: Vec<PushedSignal>,
    pushed_controls: Vec<PushedControl>,
    fail_next_reads: usize,
}

impl SimPlatform {
    /// A node with `num_package` packages, settable limit range
    /// `[min_power, max_power]` watts per package.
    pub fn new(num_package: usize, min_power: f64, max_power: f64) -> Self {
        let tdp = max_power * 0.85;
        Self {
            min_power,
            max_power,
            tdp,
            time_window: 0.001,
            packages: vec![
                SimPackage {
                    epoch_count: 0.0,
                    epoch_runtime: 0.0,
                    epoch_network: 0.0,
                    epoch_ignore: 0.0,
                    power_limit: tdp,
                };
                num_package
            ],
            pushed_signals: Vec::new(),
            pushed_controls: Vec::new(),
            fail_next_reads: 0,
        }
    }

    pub fn with_time_window(mut self, time_window: f64) -> Self {
        self.time_window = time_window;
        self
    }

    /// Complete one application epoch on a package.
    pub fn advance_epoch(&mut self, package: usize, total: f64, network: f64, ignore: f64) {
        let pkg = &mut self.packages[package];
        pkg.epoch_count += 1.0;
        pkg.epoch_runtime = total;
        pkg.epoch_network = network;
        pkg.epoch_ignore = ignore;
    }

    /// The limit currently enforced on a package.
    pub fn enforced_limit(&self, package: usize) -> f64 {
        self.packages[package].power_limit
    }

    /// Make the next `count` batched reads fail with a transient
    /// error.
    pub fn inject_read_failures(&mut self, count: usize) {
        self.fail_next_reads = count;
    }

    fn signal_value(&self, name: &str, index: usize) -> PlatformResult<f64> {
        let package = |idx: usize| -> PlatformResult<&SimPackage> {
            self.packages.get(idx).ok_or(PlatformError::BadDomainIndex {
                domain: Domain::Package,
                index: idx,
            })
        };
        match name {
            signals::EPOCH_RUNTIME => Ok(package(index)?.epoch_runtime),
            signals::EPOCH_COUNT => Ok(package(index)?.epoch_count),
            signals::EPOCH_RUNTIME_NETWORK => Ok(package(index)?.epoch_network),
            signals::EPOCH_RUNTIME_IGNORE => Ok(package(index)?.epoch_ignore),
            signals::POWER_PACKAGE_MIN => Ok(self.min_power),
            signals::POWER_PACKAGE_MAX => Ok(self.max_power),
            signals::POWER_PACKAGE_TDP => Ok(self.tdp),
            signals::POWER_PACKAGE_TIME_WINDOW => Ok(self.time_window),
            other => Err(PlatformError::UnknownSignal(other.to_string())),
        }
    }

    fn intern_signal_name(name: &str) -> PlatformResult<&'static str> {
        match name {
            signals::EPOCH_RUNTIME => Ok(signals::EPOCH_RUNTIME),
            signals::EPOCH_COUNT => Ok(signals::EPOCH_COUNT),
            signals::EPOCH_RUNTIME_NETWORK => Ok(signals::EPOCH_RUNTIME_NETWORK),
            signals::EPOCH_RUNTIME_IGNORE => Ok(signals::EPOCH_RUNTIME_IGNORE),
            signals::POWER_PACKAGE_MIN => Ok(signals::POWER_PACKAGE_MIN),
            signals::POWER_PACKAGE_MAX => Ok(signals::POWER_PACKAGE_MAX),
            signals::POWER_PACKAGE_TDP => Ok(signals::POWER_PACKAGE_TDP),
            signals::POWER_PACKAGE_TIME_WINDOW => Ok(signals::POWER_PACKAGE_TIME_WINDOW),
            other => Err(PlatformError::UnknownSignal(other.to_string())),
        }
    }

    fn clip_limit(&self, value: f64) -> f64 {
        value.clamp(self.min_power, self.max_power)
    }
}

impl PlatformIo for SimPlatform {
    fn push_signal(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
    ) -> PlatformResult<SignalHandle> {
        if domain == Domain::Package && index >= self.packages.len() {
            return Err(PlatformError::BadDomainIndex { domain, index });
        }
        let name = Self::intern_signal_name(name)?;
        self.pushed_signals.push(PushedSignal {
            name,
            index,
            cached: 0.0,
        });
        Ok(SignalHandle(self.pushed_signals.len() - 1))
    }

    fn sample(&self, handle: SignalHandle) -> PlatformResult<f64> {
        self.pushed_signals
            .get(handle.0)
            .map(|s| s.cached)
            .ok_or(PlatformError::BadHandle(handle.0))
    }

    fn read_batch(&mut self) -> PlatformResult<()> {
        if self.fail_next_reads > 0 {
            self.fail_next_reads -= 1;
            return Err(PlatformError::ReadFailed("injected".to_string()));
        }
        for i in 0..self.pushed_signals.len() {
            let (name, index) = {
                let s = &self.pushed_signals[i];
                (s.name, s.index)
            };
            let value = self.signal_value(name, index)?;
            self.pushed_signals[i].cached = value;
        }
        Ok(())
    }

    fn push_control(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
    ) -> PlatformResult<ControlHandle> {
        if name != controls::POWER_PACKAGE_LIMIT {
            return Err(PlatformError::UnknownControl(name.to_string()));
        }
        if domain != Domain::Package || index >= self.packages.len() {
            return Err(PlatformError::BadDomainIndex { domain, index });
        }
        self.pushed_controls.push(PushedControl {
            index,
            staged: None,
        });
        Ok(ControlHandle(self.pushed_controls.len() - 1))
    }

    fn adjust(&mut self, handle: ControlHandle, value: f64) -> PlatformResult<f64> {
        let clipped = self.clip_limit(value);
        let control = self
            .pushed_controls
            .get_mut(handle.0)
            .ok_or(PlatformError::BadHandle(handle.0))?;
        control.staged = Some(clipped);
        if clipped != value {
            debug!(requested = value, clipped, "power limit request clipped");
        }
        Ok(clipped)
    }

    fn write_batch(&mut self) -> PlatformResult<()> {
        for i in 0..self.pushed_controls.len() {
            if let Some(value) = self.pushed_controls[i].staged.take() {
                let index = self.pushed_controls[i].index;
                self.packages[index].power_limit = value;
            }
        }
        Ok(())
    }

    fn read_signal(&self, name: &str, _domain: Domain, index: usize) -> PlatformResult<f64> {
        self.signal_value(name, index)
    }

    fn write_control(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
        value: f64,
    ) -> PlatformResult<f64> {
        if name != controls::POWER_PACKAGE_LIMIT {
            return Err(PlatformError::UnknownControl(name.to_string()));
        }
        if domain != Domain::Package || index >= self.packages.len() {
            return Err(PlatformError::BadDomainIndex { domain, index });
        }
        let clipped = self.clip_limit(value);
        self.packages[index].power_limit = clipped;
        Ok(clipped)
    }

    fn num_package(&self) -> usize {
        self.packages.len()
    }
}

/// A `SimPlatform` shared between an agent thread and the harness
/// that feeds it epochs. Every access takes a scoped lock.
#[derive(Clone)]
pub struct SharedPlatform(Arc<Mutex<SimPlatform>>);

impl SharedPlatform {
    pub fn new(sim: SimPlatform) -> Self {
        Self(Arc::new(Mutex::new(sim)))
    }

    fn guard(&self) -> MutexGuard<'_, SimPlatform> {
        // A panicked holder cannot leave the simulation in a state the
        // numeric facade cannot tolerate; recover the guard.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the simulation under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut SimPlatform) -> R) -> R {
        f(&mut self.guard())
    }
}

impl PlatformIo for SharedPlatform {
    fn push_signal(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
    ) -> PlatformResult<SignalHandle> {
        self.guard().push_signal(name, domain, index)
    }

    fn sample(&self, handle: SignalHandle) -> PlatformResult<f64> {
        self.guard().sample(handle)
    }

    fn read_batch(&mut self) -> PlatformResult<()> {
        self.guard().read_batch()
    }

    fn push_control(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
    ) -> PlatformResult<ControlHandle> {
        self.guard().push_control(name, domain, index)
    }

    fn adjust(&mut self, handle: ControlHandle, value: f64) -> PlatformResult<f64> {
        self.guard().adjust(handle, value)
    }

    fn write_batch(&mut self) -> PlatformResult<()> {
        self.guard().write_batch()
    }

    fn read_signal(&self, name: &str, domain: Domain, index: usize) -> PlatformResult<f64> {
        self.guard().read_signal(name, domain, index)
    }

    fn write_control(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
        value: f64,
    ) -> PlatformResult<f64> {
        self.guard().write_control(name, domain, index, value)
    }

    fn num_package(&self) -> usize {
        self.guard().num_package()
    }
}
