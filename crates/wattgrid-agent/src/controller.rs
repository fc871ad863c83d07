//! The per-agent control loop.
//!
//! The controller owns one agent and its tree edges and serializes
//! every state transition on its own thread:
//!
//! ```text
//! wait → descend(policy in) → adjust_platform
//!      → sample_platform → ascend(samples in) → send up
//! ```
//!
//! At the root the inbound policy comes from an operator-shared cell
//! instead of a parent edge; it is validated at that boundary every
//! tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use watt_core::{Policy, Sample};
use watt_platform::PlatformIo;

use crate::agent::BalancerAgent;
use crate::error::{AgentError, AgentResult};
use crate::transport::TreeComm;

/// Shared cell through which the operator injects job-level policy.
pub type JobPolicyCell = Arc<Mutex<Policy>>;

/// Drives one agent at a fixed cadence.
pub struct Controller<P: PlatformIo, C: TreeComm> {
    agent: BalancerAgent<P>,
    comm: C,
    job_policy: Option<JobPolicyCell>,
    /// Latest completion sample seen from each child. `ascend` runs
    /// only once every child has reported at least once.
    sample_cache: Vec<Option<Sample>>,
}

impl<P: PlatformIo, C: TreeComm> Controller<P, C> {
    /// Controller for a leaf or intermediate agent.
    pub fn new(agent: BalancerAgent<P>, comm: C) -> Self {
        let num_children = comm.num_children();
        Self {
            agent,
            comm,
            job_policy: None,
            sample_cache: vec![None; num_children],
        }
    }

    /// Controller for the root agent, fed by an operator policy cell.
    pub fn with_job_policy(agent: BalancerAgent<P>, comm: C, job_policy: JobPolicyCell) -> Self {
        let mut controller = Self::new(agent, comm);
        controller.job_policy = Some(job_policy);
        controller
    }

    pub fn agent(&self) -> &BalancerAgent<P> {
        &self.agent
    }

    /// One full tick. Fatal errors propagate to the caller; the run
    /// should be restarted after a protocol desync.
    pub fn run_tick(&mut self) -> AgentResult<()> {
        self.agent.wait();

        if self.agent.is_leaf() {
            let policy = self.comm.recv_policy()?;
            self.agent.adjust_platform(&policy)?;
            let (sample, complete) = self.agent.sample_platform()?;
            self.comm.send_sample(complete.then_some(sample))?;
            return Ok(());
        }

        let policy = match &self.job_policy {
            Some(cell) => {
                let mut policy = *cell
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                self.agent.validate_policy(&mut policy)?;
                policy
            }
            None => self.comm.recv_policy()?,
        };

        let descent = self.agent.descend(&policy)?;
        self.comm.send_policies(&descent.child_policies)?;

        // A cap-carrying policy resets the subtree; completion samples
        // from before the reset are stale.
        if descent
            .child_policies
            .first()
            .is_some_and(|p| p.power_cap != 0.0)
        {
            self.sample_cache.fill(None);
        }

        for (slot, incoming) in self.sample_cache.iter_mut().zip(self.comm.recv_samples()?) {
            if incoming.is_some() {
                *slot = incoming;
            }
        }

        let mut upward = None;
        if self.sample_cache.iter().all(Option::is_some) {
            let samples: Vec<Sample> = self.sample_cache.iter().copied().flatten().collect();
            let outcome = self.agent.ascend(&samples)?;
            if outcome.completed {
                upward = Some(outcome.sample);
            }
        }
        if self.comm.has_parent() {
            self.comm.send_sample(upward)?;
        }
        Ok(())
    }

    /// Run a fixed number of ticks.
    pub fn run(&mut self, ticks: u64) -> AgentResult<()> {
        for _ in 0..ticks {
            self.run_tick()?;
        }
        Ok(())
    }

    /// Run until `shutdown` is raised or a fatal error occurs. A
    /// closed peer edge after shutdown is a normal exit.
    pub fn run_until(&mut self, shutdown: &AtomicBool) -> AgentResult<()> {
        while !shutdown.load(Ordering::Relaxed) {
            match self.run_tick() {
                Ok(()) => {}
                Err(AgentError::Transport(_)) if shutdown.load(Ordering::Relaxed) => break,
                Err(e) => {
                    error!(error = %e, "controller stopping on fatal error");
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
