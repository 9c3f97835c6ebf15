//! Gossip over a Kademlia-style table: every reception forwards to a
//! random draw from the node's whole peer set, sized by how many of its
//! XOR buckets are populated.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::kadcast::{build_buckets, ID_BITS};
use super::node_id::NodeId128;
use super::Algorithm;
use crate::config::KademliaParams;
use crate::error::ConfigError;
use crate::queue::Message;
use crate::stats::MAX_DEPTH;
use crate::NodeId;

pub struct Eth {
    /// Union of each node's buckets, deduplicated.
    peer_sets: Vec<Vec<NodeId>>,
    /// Per-node populated-bucket count, fixed at construction.
    populated_buckets: Vec<usize>,
    visited: Vec<Vec<bool>>,
    params: KademliaParams,
    tree_root: NodeId,
    rng: ChaCha8Rng,
}

impl Eth {
    pub fn new(n: usize, params: KademliaParams, mut rng: ChaCha8Rng) -> Result<Self, ConfigError> {
        params.validate()?;
        if n == 0 {
            return Err(ConfigError::NoNodes);
        }

        let ids: Vec<NodeId128> = (0..n).map(|_| NodeId128::random(&mut rng)).collect();
        let buckets = build_buckets(&ids, params.bucket_cap);

        let mut peer_sets = Vec::with_capacity(n);
        let mut populated_buckets = Vec::with_capacity(n);
        for table in &buckets {
            let mut peers: Vec<NodeId> = table.iter().flatten().copied().collect();
            peers.sort_unstable();
            peers.dedup();
            peer_sets.push(peers);
            populated_buckets.push(table.iter().filter(|b| !b.is_empty()).count());
        }

        Ok(Eth {
            peer_sets,
            populated_buckets,
            visited: vec![vec![false; MAX_DEPTH + 1]; n],
            params,
            tree_root: 0,
            rng,
        })
    }

    pub fn peer_set(&self, u: NodeId) -> &[NodeId] {
        &self.peer_sets[u]
    }

    /// Root of the broadcast currently in flight.
    pub fn root(&self) -> NodeId {
        self.tree_root
    }
}

impl Algorithm for Eth {
    fn respond(&mut self, msg: &Message) -> Vec<NodeId> {
        let u = msg.dst;
        if msg.step > MAX_DEPTH || self.visited[u][msg.step] {
            return Vec::new();
        }
        self.visited[u][msg.step] = true;

        let want = (self.populated_buckets[u] * self.params.fanout).min(ID_BITS * self.params.fanout);
        self.peer_sets[u]
            .choose_multiple(&mut self.rng, want)
            .copied()
            .filter(|&v| v != msg.src)
            .collect()
    }

    fn set_root(&mut self, root: NodeId) {
        self.tree_root = root;
        for row in self.visited.iter_mut() {
            row.fill(false);
        }
    }

    fn name(&self) -> String {
        format!("eth_k{}_f{}", self.params.bucket_cap, self.params.fanout)
    }
}
