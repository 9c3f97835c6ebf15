//! Broadcast overlay implementations and the contract the simulator
//! drives them through.
//!
//! An algorithm owns its topology and any per-broadcast scratch state.
//! The simulator calls `set_root` once per trial, then `respond` once per
//! first reception; everything else (delays, duplicate suppression at the
//! delivery level, statistics) is the simulator's business.

pub mod blockp2p;
pub mod eth;
pub mod kadcast;
pub mod mercator;
pub mod node_id;
pub mod random;
pub mod relay;

pub use blockp2p::BlockP2p;
pub use eth::Eth;
pub use kadcast::Kadcast;
pub use mercator::Mercator;
pub use random::RandomFlood;
pub use relay::RelayStrategy;

use crate::graph::Graph;
use crate::queue::Message;
use crate::NodeId;

/// Forwarding contract consumed by the simulator.
pub trait Algorithm {
    /// React to the first reception of `msg` at `msg.dst`: return the
    /// nodes to forward to. The destination itself must not appear in the
    /// list; duplicates are tolerated but wasteful. Called at most once
    /// per (node, broadcast) by the simulator; algorithms with their own
    /// step-indexed suppression may return an empty list on replays.
    fn respond(&mut self, msg: &Message) -> Vec<NodeId>;

    /// Reset per-broadcast scratch state for a trial rooted at `root`.
    fn set_root(&mut self, root: NodeId);

    /// Stable identifier used in result files.
    fn name(&self) -> String;

    /// Whether the driver must construct a fresh instance per root
    /// instead of just calling `set_root`.
    fn needs_rebuild_per_root(&self) -> bool {
        false
    }

    /// Whether the source's own emissions skip the queuing/switching
    /// coefficient of the propagation delay (the root is modelled as
    /// directly connected to its relay set).
    fn direct_first_hop(&self) -> bool {
        false
    }
}

/// Forward to every out-neighbor except the message source. The default
/// relay behavior for graph-backed overlays.
pub fn flood_outbound(graph: &Graph, u: NodeId, src: NodeId) -> Vec<NodeId> {
    graph
        .outbound(u)
        .iter()
        .copied()
        .filter(|&v| v != src)
        .collect()
}
