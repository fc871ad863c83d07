//! Agent error types.

use thiserror::Error;

use watt_platform::PlatformError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur while running the balancing state machine.
///
/// `Platform` wraps transient faults that the roles normally recover
/// from in place; every other variant is fatal and surfaces to the
/// controller.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(
        "protocol desync in {role} role: agent at step {agent_step}, policy at step {policy_step}"
    )]
    ProtocolDesync {
        role: &'static str,
        agent_step: u64,
        policy_step: u64,
    },

    #[error("invalid job-level policy: {0}")]
    InvalidPolicy(String),

    #[error("{method} called on {role} role")]
    WrongRole {
        role: &'static str,
        method: &'static str,
    },

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("tree transport error: {0}")]
    Transport(String),
}
