//! Error types surfaced at the I/O and constructor boundaries.
//!
//! Nothing inside a running broadcast can fail: degenerate numeric cases are
//! handled locally with defined defaults, and uncovered nodes are reported
//! through the result sentinel rather than an error path.

use std::path::PathBuf;

/// Errors raised while loading a coordinate dataset.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dataset is empty (expected a node count on line 1)")]
    Empty,

    #[error("line {line}: expected {expected}, got {got:?}")]
    Malformed {
        line: usize,
        expected: &'static str,
        got: String,
    },

    #[error("expected {expected} coordinate lines, file ended after {got}")]
    Truncated { expected: usize, got: usize },

    #[error("line {line}: coordinate ({lat}, {lon}) out of range")]
    OutOfRange { line: usize, lat: f64, lon: f64 },

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised when an overlay or clustering is configured with
/// parameters it refuses to build from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("geohash precision must be at least 1, got {0}")]
    GeohashPrecision(usize),

    #[error("bucket size must be at least 1, got {0}")]
    BucketSize(usize),

    #[error("k-ary branching factor must be at least 1, got {0}")]
    KaryFactor(usize),

    #[error("cluster count must be in 1..=n ({n} nodes), got {k}")]
    ClusterCount { k: usize, n: usize },

    #[error("node count must be at least 1")]
    NoNodes,

    #[error("fanout must be at least 1, got {0}")]
    Fanout(usize),
}
