//! Tree transport — blocking policy/sample edges between agents.
//!
//! Vectors cross the transport as fixed-length numeric arrays; the
//! transport never interprets them. Delivery is reliable and ordered
//! per edge. The in-process implementation uses OS channels, one pair
//! per edge, and is how `wattd` and the integration tests wire a full
//! tree together.
//!
//! Samples travel as `Option<Sample>`: `None` means "still working on
//! the current step", so a parent can block for exactly one message
//! per child per tick without stalling on a slow subtree.

use std::sync::mpsc::{channel, Receiver, Sender};

use watt_core::{Policy, Sample, TreePosition, NUM_POLICY_FIELDS, NUM_SAMPLE_FIELDS};

use crate::error::{AgentError, AgentResult};

type PolicyWire = [f64; NUM_POLICY_FIELDS];
type SampleWire = Option<[f64; NUM_SAMPLE_FIELDS]>;

/// One agent's view of its tree edges.
pub trait TreeComm {
    /// Blocking receive of this tick's policy from the parent.
    fn recv_policy(&self) -> AgentResult<Policy>;

    /// Send one policy to each child. `policies.len()` must equal the
    /// child count.
    fn send_policies(&self, policies: &[Policy]) -> AgentResult<()>;

    /// Blocking receive of one message per child: the child's
    /// completion sample, or `None` while its step is in progress.
    fn recv_samples(&self) -> AgentResult<Vec<Option<Sample>>>;

    /// Send this tick's completion sample to the parent.
    fn send_sample(&self, sample: Option<Sample>) -> AgentResult<()>;

    fn num_children(&self) -> usize;

    fn has_parent(&self) -> bool;
}

/// Channel-backed tree edges for in-process trees.
pub struct ChannelComm {
    parent_policy_rx: Option<Receiver<PolicyWire>>,
    parent_sample_tx: Option<Sender<SampleWire>>,
    child_policy_txs: Vec<Sender<PolicyWire>>,
    child_sample_rxs: Vec<Receiver<SampleWire>>,
}

impl TreeComm for ChannelComm {
    fn recv_policy(&self) -> AgentResult<Policy> {
        let rx = self
            .parent_policy_rx
            .as_ref()
            .ok_or_else(|| AgentError::Transport("no parent edge".to_string()))?;
        let wire = rx
            .recv()
            .map_err(|_| AgentError::Transport("parent disconnected".to_string()))?;
        Ok(Policy::from_wire(wire))
    }

    fn send_policies(&self, policies: &[Policy]) -> AgentResult<()> {
        if policies.len() != self.child_policy_txs.len() {
            return Err(AgentError::Transport(format!(
                "expected {} child policies, got {}",
                self.child_policy_txs.len(),
                policies.len()
            )));
        }
        for (idx, (tx, policy)) in self.child_policy_txs.iter().zip(policies).enumerate() {
            tx.send(policy.to_wire())
                .map_err(|_| AgentError::Transport(format!("child {idx} disconnected")))?;
        }
        Ok(())
    }

    fn recv_samples(&self) -> AgentResult<Vec<Option<Sample>>> {
        let mut samples = Vec::with_capacity(self.child_sample_rxs.len());
        for (idx, rx) in self.child_sample_rxs.iter().enumerate() {
            let wire = rx
                .recv()
                .map_err(|_| AgentError::Transport(format!("child {idx} disconnected")))?;
            samples.push(wire.map(Sample::from_wire));
        }
        Ok(samples)
    }

    fn send_sample(&self, sample: Option<Sample>) -> AgentResult<()> {
        let tx = self
            .parent_sample_tx
            .as_ref()
            .ok_or_else(|| AgentError::Transport("no parent edge".to_string()))?;
        tx.send(sample.map(|s| s.to_wire()))
            .map_err(|_| AgentError::Transport("parent disconnected".to_string()))
    }

    fn num_children(&self) -> usize {
        self.child_policy_txs.len()
    }

    fn has_parent(&self) -> bool {
        self.parent_policy_rx.is_some()
    }
}

/// Build the endpoints for a full tree described by `fan_in`.
///
/// Returns one `(position, comm)` pair per agent, root first, leaves
/// last, with children wired in order under their parents. `fan_in`
/// must be non-empty: a single-node job is a one-entry fan-in of 1
/// (root plus one leaf).
pub fn build_tree(fan_in: &[usize]) -> Vec<(TreePosition, ChannelComm)> {
    assert!(!fan_in.is_empty(), "fan_in must describe at least one level");
    let num_levels = fan_in.len();

    let mut nodes = Vec::new();
    // Parent-side endpoints waiting to be claimed by the next level
    // down. The root claims nothing.
    let mut parent_links: Vec<Option<(Receiver<PolicyWire>, Sender<SampleWire>)>> = vec![None];

    for level in (0..=num_levels).rev() {
        let mut next_parent_links = Vec::new();
        let links = std::mem::take(&mut parent_links);
        for link in links {
            let num_children = if level == 0 { 0 } else { fan_in[level - 1] };
            let mut child_policy_txs = Vec::with_capacity(num_children);
            let mut child_sample_rxs = Vec::with_capacity(num_children);
            for _ in 0..num_children {
                let (policy_tx, policy_rx) = channel();
                let (sample_tx, sample_rx) = channel();
                child_policy_txs.push(policy_tx);
                child_sample_rxs.push(sample_rx);
                next_parent_links.push(Some((policy_rx, sample_tx)));
            }
            let (parent_policy_rx, parent_sample_tx) = match link {
                Some((rx, tx)) => (Some(rx), Some(tx)),
                None => (None, None),
            };
            nodes.push((
                TreePosition::new(level, fan_in.to_vec()),
                ChannelComm {
                    parent_policy_rx,
                    parent_sample_tx,
                    child_policy_txs,
                    child_sample_rxs,
                },
            ));
        }
        parent_links = next_parent_links;
    }
    nodes
}
