//! Random-flood baseline: a fixed-fanout random digraph flooded on every
//! reception, with an extra burst of random targets from the root.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::{flood_outbound, Algorithm};
use crate::graph::Graph;
use crate::queue::Message;
use crate::NodeId;

pub struct RandomFlood {
    graph: Graph,
    tree_root: NodeId,
    root_fanout: usize,
    rng: ChaCha8Rng,
}

impl RandomFlood {
    /// Build a random digraph where every node picks `fanout` distinct
    /// random out-neighbors.
    pub fn new(n: usize, fanout: usize, root_fanout: usize, mut rng: ChaCha8Rng) -> Self {
        let mut graph = Graph::new(n);
        if n > 1 {
            let per_node = fanout.min(n - 1);
            for u in 0..n {
                for _ in 0..per_node {
                    let mut v = rng.gen_range(0..n);
                    while !graph.add_edge(u, v) {
                        v = rng.gen_range(0..n);
                    }
                }
            }
        }
        RandomFlood {
            graph,
            tree_root: 0,
            root_fanout,
            rng,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl Algorithm for RandomFlood {
    fn respond(&mut self, msg: &Message) -> Vec<NodeId> {
        let u = msg.dst;
        let mut relays = flood_outbound(&self.graph, u, msg.src);

        // The root tops its fan-out up with random extra targets.
        if u == self.tree_root && msg.step == 0 {
            let n = self.graph.node_count();
            let missing = self.root_fanout.saturating_sub(relays.len());
            for _ in 0..missing {
                let v = self.rng.gen_range(0..n);
                if v != msg.src && v != u && !relays.contains(&v) {
                    relays.push(v);
                }
            }
        }

        relays
    }

    fn set_root(&mut self, root: NodeId) {
        self.tree_root = root;
    }

    fn name(&self) -> String {
        "random_flood".to_owned()
    }
}
