//! Directed graph over dense node indices.
//!
//! Adjacency is kept both ways (outbound and inbound) and the two views are
//! consistent after every mutation: an edge (u, v) is present iff `v` is in
//! `outbound(u)` iff `u` is in `inbound(v)`. Self-loops and duplicate edges
//! are rejected at insert. Removal swaps with the last element, so edge
//! order is not preserved across deletes.

use crate::NodeId;

#[derive(Debug, Clone)]
pub struct Graph {
    n: usize,
    edges: usize,
    outbound: Vec<Vec<NodeId>>,
    inbound: Vec<Vec<NodeId>>,
}

impl Graph {
    pub fn new(n: usize) -> Self {
        Graph {
            n,
            edges: 0,
            outbound: vec![Vec::new(); n],
            inbound: vec![Vec::new(); n],
        }
    }

    pub fn node_count(&self) -> usize {
        self.n
    }

    /// Number of directed edges currently present.
    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// Insert the edge u -> v. Returns `false` (and leaves the graph
    /// untouched) for self-loops and edges already present.
    pub fn add_edge(&mut self, u: NodeId, v: NodeId) -> bool {
        if u == v || self.outbound[u].contains(&v) {
            return false;
        }
        self.outbound[u].push(v);
        self.inbound[v].push(u);
        self.edges += 1;
        true
    }

    /// Remove the edge u -> v if present. Returns whether an edge was
    /// removed. O(deg) swap-remove on both adjacency lists.
    pub fn del_edge(&mut self, u: NodeId, v: NodeId) -> bool {
        let Some(pos) = self.outbound[u].iter().position(|&x| x == v) else {
            return false;
        };
        self.outbound[u].swap_remove(pos);
        if let Some(pos) = self.inbound[v].iter().position(|&x| x == u) {
            self.inbound[v].swap_remove(pos);
        }
        self.edges -= 1;
        true
    }

    pub fn outbound(&self, u: NodeId) -> &[NodeId] {
        &self.outbound[u]
    }

    pub fn inbound(&self, u: NodeId) -> &[NodeId] {
        &self.inbound[u]
    }

    pub fn out_degree(&self, u: NodeId) -> usize {
        self.outbound[u].len()
    }

    pub fn in_degree(&self, u: NodeId) -> usize {
        self.inbound[u].len()
    }

    /// Mean out-degree across all nodes. Used for construction logging.
    pub fn avg_out_degree(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.edges as f64 / self.n as f64
    }
}
