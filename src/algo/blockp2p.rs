//! Clustered baseline: geographic clusters with fully-meshed entry
//! points, chord-style links inside large clusters, flooding on top.

use super::{flood_outbound, Algorithm};
use crate::cluster::ClusterResult;
use crate::graph::Graph;
use crate::queue::Message;
use crate::NodeId;

/// Cluster size at or below which the whole cluster is fully meshed.
const FULL_MESH_LIMIT: usize = 8;

pub struct BlockP2p {
    graph: Graph,
    tree_root: NodeId,
}

impl BlockP2p {
    pub fn new(n: usize, clusters: &ClusterResult) -> Self {
        let mut graph = Graph::new(n);

        // Entry points (first member of each cluster) form a full mesh.
        let entries: Vec<Option<NodeId>> = clusters
            .members
            .iter()
            .map(|m| m.first().copied())
            .collect();
        for &a in entries.iter().flatten() {
            for &b in entries.iter().flatten() {
                if a != b {
                    graph.add_edge(a, b);
                }
            }
        }

        // Inside each cluster: full mesh when small, chord links plus the
        // diagonal otherwise.
        for members in &clusters.members {
            let cn = members.len();
            if cn <= 1 {
                continue;
            }
            if cn <= FULL_MESH_LIMIT {
                for &u in members {
                    for &v in members {
                        if u != v {
                            graph.add_edge(u, v);
                        }
                    }
                }
            } else {
                for (j, &u) in members.iter().enumerate() {
                    let mut stride = 1;
                    while stride < cn {
                        graph.add_edge(u, members[(j + stride) % cn]);
                        stride *= 2;
                    }
                    graph.add_edge(u, members[(j + cn / 2) % cn]);
                }
            }
        }

        BlockP2p {
            graph,
            tree_root: 0,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Root of the broadcast currently in flight.
    pub fn root(&self) -> NodeId {
        self.tree_root
    }
}

impl Algorithm for BlockP2p {
    fn respond(&mut self, msg: &Message) -> Vec<NodeId> {
        flood_outbound(&self.graph, msg.dst, msg.src)
    }

    fn set_root(&mut self, root: NodeId) {
        self.tree_root = root;
    }

    fn name(&self) -> String {
        "blockp2p".to_owned()
    }
}
