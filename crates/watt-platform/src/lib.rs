//! watt-platform — the measurement and actuation boundary.
//!
//! The balancing core never touches hardware directly. It consumes a
//! typed facade (`PlatformIo`) offering batched signal reads and
//! control writes over named signals, scoped to a domain (board or
//! package). Production deployments bind the facade to the host's
//! energy/power interface; tests and the `wattd` simulator bind it to
//! `SimPlatform`, a deterministic in-memory implementation.

pub mod io;
pub mod sim;

pub use io::{
    ControlHandle, Domain, PlatformError, PlatformIo, PlatformResult, SignalHandle, controls,
    signals,
};
pub use sim::{SharedPlatform, SimPlatform};
