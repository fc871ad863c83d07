//! The `PlatformIo` trait and its vocabulary.

use thiserror::Error;

/// Result type alias for platform operations.
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Errors surfaced by a platform implementation.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unknown signal: {0}")]
    UnknownSignal(String),

    #[error("unknown control: {0}")]
    UnknownControl(String),

    #[error("domain index out of range: {domain:?} {index}")]
    BadDomainIndex { domain: Domain, index: usize },

    #[error("transient read failure: {0}")]
    ReadFailed(String),

    #[error("invalid handle: {0}")]
    BadHandle(usize),
}

/// Scope of a signal or control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Whole-board scope, index always 0.
    Board,
    /// One CPU package / NUMA power domain.
    Package,
}

/// Handle for a pushed (batched) signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalHandle(pub usize);

/// Handle for a pushed (batched) control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHandle(pub usize);

/// Signal names the balancing core consumes.
pub mod signals {
    /// Seconds spent in the last application epoch, per package.
    pub const EPOCH_RUNTIME: &str = "EPOCH_RUNTIME";
    /// Number of epochs completed, per package.
    pub const EPOCH_COUNT: &str = "EPOCH_COUNT";
    /// Portion of the last epoch spent in cross-node communication.
    pub const EPOCH_RUNTIME_NETWORK: &str = "EPOCH_RUNTIME_NETWORK";
    /// Portion of the last epoch the application marked as ignored.
    pub const EPOCH_RUNTIME_IGNORE: &str = "EPOCH_RUNTIME_IGNORE";
    /// Lowest settable package power limit, watts.
    pub const POWER_PACKAGE_MIN: &str = "POWER_PACKAGE_MIN";
    /// Highest settable package power limit, watts.
    pub const POWER_PACKAGE_MAX: &str = "POWER_PACKAGE_MAX";
    /// Package thermal design power, watts.
    pub const POWER_PACKAGE_TDP: &str = "POWER_PACKAGE_TDP";
    /// Averaging window of the package power limit, seconds.
    pub const POWER_PACKAGE_TIME_WINDOW: &str = "POWER_PACKAGE_TIME_WINDOW";
}

/// Control names the balancing core writes.
pub mod controls {
    /// Enforced package power limit, watts.
    pub const POWER_PACKAGE_LIMIT: &str = "POWER_PACKAGE_LIMIT";
}

/// Typed access to platform measurement and actuation.
///
/// The batched path (`push_signal` / `read_batch` / `sample`, and
/// `push_control` / `adjust` / `write_batch`) is the hot path used
/// once per control-loop tick. The one-shot `read_signal` /
/// `write_control` pair is for init-time queries.
///
/// `adjust` returns the value the platform will actually enforce,
/// which may differ from the request when the hardware clips it to
/// its settable range.
pub trait PlatformIo {
    fn push_signal(&mut self, name: &str, domain: Domain, index: usize)
        -> PlatformResult<SignalHandle>;

    /// Latest batched value for a pushed signal. Valid after the most
    /// recent `read_batch`.
    fn sample(&self, handle: SignalHandle) -> PlatformResult<f64>;

    /// Refresh every pushed signal from the platform.
    fn read_batch(&mut self) -> PlatformResult<()>;

    fn push_control(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
    ) -> PlatformResult<ControlHandle>;

    /// Stage a control write; applied at the next `write_batch`.
    /// Returns the clipped value the platform will enforce.
    fn adjust(&mut self, handle: ControlHandle, value: f64) -> PlatformResult<f64>;

    /// Apply every staged control write.
    fn write_batch(&mut self) -> PlatformResult<()>;

    /// One-shot signal read, bypassing the batch.
    fn read_signal(&self, name: &str, domain: Domain, index: usize) -> PlatformResult<f64>;

    /// One-shot control write, bypassing the batch. Returns the
    /// clipped value.
    fn write_control(
        &mut self,
        name: &str,
        domain: Domain,
        index: usize,
        value: f64,
    ) -> PlatformResult<f64>;

    /// Number of package power domains on this node.
    fn num_package(&self) -> usize;
}
