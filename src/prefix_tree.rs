//! Geohash prefix tree.
//!
//! One node per observed prefix, each listing every peer whose full hash
//! extends that prefix. Built once at overlay construction and queried
//! read-only afterwards, so the member lists stay in ascending id order.

use std::collections::HashMap;

use crate::NodeId;

#[derive(Debug, Default)]
struct PrefixNode {
    node_ids: Vec<NodeId>,
    children: HashMap<u8, PrefixNode>,
}

/// Rooted tree over Base32 characters.
#[derive(Debug, Default)]
pub struct PrefixTree {
    root: PrefixNode,
}

impl PrefixTree {
    /// Build the tree from per-node geohashes (indexed by node id).
    pub fn build(hashes: &[String]) -> Self {
        let mut root = PrefixNode::default();
        for (id, hash) in hashes.iter().enumerate() {
            let mut node = &mut root;
            for c in hash.bytes() {
                node = node.children.entry(c).or_default();
                node.node_ids.push(id);
            }
        }
        PrefixTree { root }
    }

    /// All node ids whose hash starts with `prefix`, ascending. The empty
    /// prefix matches nothing (the root carries no members).
    pub fn nodes_with_prefix(&self, prefix: &str) -> &[NodeId] {
        let mut node = &self.root;
        if prefix.is_empty() {
            return &[];
        }
        for c in prefix.bytes() {
            match node.children.get(&c) {
                Some(child) => node = child,
                None => return &[],
            }
        }
        &node.node_ids
    }
}
