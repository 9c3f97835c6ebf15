//! Kadcast: structured broadcast over a Kademlia-style routing table.
//!
//! Nodes get random 128-bit identifiers; peer j lands in bucket
//! `floor(log2(id_i xor id_j))` of node i, capped at the configured
//! bucket size. The source seeds every bucket with a random fan-out; a
//! relay only covers buckets strictly below the one its sender came
//! from, which partitions the identifier space as the broadcast descends.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

use super::node_id::{bucket_index, NodeId128};
use super::Algorithm;
use crate::config::KademliaParams;
use crate::error::ConfigError;
use crate::queue::Message;
use crate::stats::MAX_DEPTH;
use crate::NodeId;

/// Identifier width in bits, and therefore the bucket count.
pub const ID_BITS: usize = 128;

pub struct Kadcast {
    ids: Vec<NodeId128>,
    /// `buckets[i][b]` lists node i's peers at XOR bucket b.
    buckets: Vec<Vec<Vec<NodeId>>>,
    visited: Vec<Vec<bool>>,
    params: KademliaParams,
    tree_root: NodeId,
    rng: ChaCha8Rng,
}

impl Kadcast {
    pub fn new(n: usize, params: KademliaParams, mut rng: ChaCha8Rng) -> Result<Self, ConfigError> {
        params.validate()?;
        if n == 0 {
            return Err(ConfigError::NoNodes);
        }

        let ids: Vec<NodeId128> = (0..n).map(|_| NodeId128::random(&mut rng)).collect();
        let buckets = build_buckets(&ids, params.bucket_cap);

        Ok(Kadcast {
            ids,
            buckets,
            visited: vec![vec![false; MAX_DEPTH + 1]; n],
            params,
            tree_root: 0,
            rng,
        })
    }

    pub fn id_of(&self, u: NodeId) -> &NodeId128 {
        &self.ids[u]
    }

    /// Root of the broadcast currently in flight.
    pub fn root(&self) -> NodeId {
        self.tree_root
    }

    pub fn buckets_of(&self, u: NodeId) -> &[Vec<NodeId>] {
        &self.buckets[u]
    }

    /// Random `fanout` picks from a bucket, excluding the source.
    fn pick_from(&mut self, bucket_owner: NodeId, bucket: usize, src: NodeId) -> Vec<NodeId> {
        let members = &self.buckets[bucket_owner][bucket];
        members
            .choose_multiple(&mut self.rng, self.params.fanout)
            .copied()
            .filter(|&v| v != src)
            .collect()
    }
}

/// Shared table construction for the identifier-keyed overlays.
pub(super) fn build_buckets(ids: &[NodeId128], bucket_cap: usize) -> Vec<Vec<Vec<NodeId>>> {
    let n = ids.len();
    let mut buckets = vec![vec![Vec::new(); ID_BITS]; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            let Some(b) = bucket_index(&ids[i].xor(&ids[j])) else {
                // Identical identifiers: astronomically unlikely, skip.
                continue;
            };
            if buckets[i][b].len() < bucket_cap {
                buckets[i][b].push(j);
            }
        }
    }
    buckets
}

impl Algorithm for Kadcast {
    fn respond(&mut self, msg: &Message) -> Vec<NodeId> {
        let u = msg.dst;
        let mut relays = Vec::new();

        if msg.step > MAX_DEPTH || self.visited[u][msg.step] {
            return relays;
        }
        self.visited[u][msg.step] = true;

        if msg.step == 0 {
            for b in 0..ID_BITS {
                relays.extend(self.pick_from(u, b, msg.src));
            }
            return relays;
        }

        let sender_bucket = bucket_index(&self.ids[u].xor(&self.ids[msg.src])).unwrap_or(0);
        for b in 0..sender_bucket {
            if self.buckets[u][b].is_empty() {
                continue;
            }
            relays.extend(self.pick_from(u, b, msg.src));
        }
        relays
    }

    fn set_root(&mut self, root: NodeId) {
        self.tree_root = root;
        for row in self.visited.iter_mut() {
            row.fill(false);
        }
    }

    fn name(&self) -> String {
        format!(
            "kadcast_k{}_f{}",
            self.params.bucket_cap, self.params.fanout
        )
    }
}
