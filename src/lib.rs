//! geocast: a discrete-event simulator for geographically-aware P2P
//! broadcast overlays.
//!
//! Given per-node coordinates, an overlay algorithm builds its topology
//! (geohash k-buckets, random graphs, clustered meshes, or learned
//! virtual-coordinate peerings) and the simulator replays broadcasts from
//! random roots over a delay model derived from great-circle distance.
//! Results come back as latency percentiles, depth distributions,
//! per-cluster averages, and redundancy ratios.
//!
//! The crate is strictly single-threaded and fully deterministic: every
//! random draw flows from one configured seed through explicitly-plumbed
//! generators.

pub mod algo;
pub mod cluster;
pub mod config;
pub mod dataset;
pub mod error;
pub mod geo;
pub mod geohash;
pub mod graph;
pub mod kbucket;
pub mod prefix_tree;
pub mod queue;
pub mod report;
pub mod sim;
pub mod stats;
pub mod vivaldi;
pub mod vivaldi_pp;

/// Dense node index. All cross-references between topology structures are
/// indices into per-node vectors; nothing owns anything cyclically.
pub type NodeId = usize;

pub use algo::Algorithm;
pub use config::{AlgorithmKind, AttackConfig, KademliaParams, MercatorParams, SimConfig};
pub use geo::GeoCoord;
pub use queue::{Message, MsgQueue};
pub use stats::TestResult;
