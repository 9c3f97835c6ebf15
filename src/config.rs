//! Flat run configuration.
//!
//! Everything the driver needs to reproduce a run lives here: link model,
//! statistics shape, repetition counts, attack ratios, per-algorithm
//! parameters, and the seed every random draw derives from. The structs
//! double as clap argument groups for the binary and serde types for
//! run manifests. Two constants are compiled in rather than configured:
//! the 250 ms fixed processing budget (`geo::FIXED_DELAY_MS`) and the
//! depth histogram range (`stats::MAX_DEPTH`), because the delay formulas
//! and result shapes assume them.

use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::geohash::{BITS_PER_CHAR, MAX_PRECISION};
use crate::kbucket::BucketFill;

/// Default link bandwidth: 33 Mbps.
pub const DEFAULT_BANDWIDTH_BPS: f64 = 33_000_000.0;
/// Default payload: a small 300-byte message.
pub const DEFAULT_DATA_SIZE_BYTES: f64 = 300.0;
/// Large-payload preset (1 MiB), selectable from the CLI.
pub const DATA_SIZE_LARGE_BYTES: f64 = 1_048_576.0;

/// Which broadcast overlay to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum AlgorithmKind {
    Mercator,
    Random,
    Blockp2p,
    Kadcast,
    Eth,
    Relay,
}

/// Simulator-level configuration.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct SimConfig {
    /// Link bandwidth in bits per second.
    #[arg(long, default_value_t = DEFAULT_BANDWIDTH_BPS)]
    pub bandwidth_bps: f64,

    /// Broadcast payload size in bytes.
    #[arg(long, default_value_t = DEFAULT_DATA_SIZE_BYTES)]
    pub data_size_bytes: f64,

    /// Number of K-means clusters used for per-cluster statistics.
    #[arg(long, default_value_t = 8)]
    pub k_clusters: usize,

    /// Extra random fan-out available to root-boosted algorithms.
    #[arg(long, default_value_t = 64)]
    pub root_fanout: usize,

    /// Repetitions of the whole multi-root sweep.
    #[arg(long, default_value_t = 1)]
    pub repetitions: usize,

    /// Random roots drawn per repetition.
    #[arg(long, default_value_t = 20)]
    pub roots_per_repetition: usize,

    /// Hard cap on the node count; larger datasets are truncated.
    #[arg(long, default_value_t = 8000)]
    pub max_nodes: usize,

    /// Seed for every random draw in the run.
    #[arg(long, default_value_t = 100)]
    pub random_seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            bandwidth_bps: DEFAULT_BANDWIDTH_BPS,
            data_size_bytes: DEFAULT_DATA_SIZE_BYTES,
            k_clusters: 8,
            root_fanout: 64,
            repetitions: 1,
            roots_per_repetition: 20,
            max_nodes: 8000,
            random_seed: 100,
        }
    }
}

/// Attack-scenario knobs.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Fraction of nodes that receive but never forward.
    #[arg(long, default_value_t = 0.0)]
    pub malicious_ratio: f64,

    /// Fraction of nodes that are offline for the whole run.
    #[arg(long, default_value_t = 0.0)]
    pub absent_ratio: f64,

    /// Fraction of nodes advertising a false position (geohash overlays
    /// build their routing state from the advertised position).
    #[arg(long, default_value_t = 0.0)]
    pub fake_coord_ratio: f64,

    /// Max offset in degrees for faked positions; non-positive means a
    /// uniformly random position anywhere on the globe.
    #[arg(long, default_value_t = -1.0)]
    pub fake_coord_offset_deg: f64,
}

impl Default for AttackConfig {
    fn default() -> Self {
        AttackConfig {
            malicious_ratio: 0.0,
            absent_ratio: 0.0,
            fake_coord_ratio: 0.0,
            fake_coord_offset_deg: -1.0,
        }
    }
}

/// MERCATOR overlay parameters.
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct MercatorParams {
    /// Geohash precision in characters.
    #[arg(long, default_value_t = 4)]
    pub geo_prec: usize,

    /// Capacity of each outer bucket.
    #[arg(long, default_value_t = 10)]
    pub bucket_size: usize,

    /// Same-cell peer count above which flooding switches to a k-ary tree.
    #[arg(long, default_value_t = 15)]
    pub k0_threshold: usize,

    /// Branching factor of the same-cell k-ary tree.
    #[arg(long, default_value_t = 3)]
    pub kary_factor: usize,

    /// Outer-bucket fill strategy.
    #[arg(long, value_enum, default_value = "compat")]
    pub bucket_fill: BucketFill,

    /// Top up buckets so every character position has peers at the
    /// characteristic XOR offsets (5, 10, 15).
    #[arg(long)]
    pub xor_anchors: bool,
}

impl Default for MercatorParams {
    fn default() -> Self {
        MercatorParams {
            geo_prec: 4,
            bucket_size: 10,
            k0_threshold: 15,
            kary_factor: 3,
            bucket_fill: BucketFill::Compat,
            xor_anchors: false,
        }
    }
}

impl MercatorParams {
    /// Bits in the geohash binary expansion.
    pub fn total_bits(&self) -> usize {
        self.geo_prec * BITS_PER_CHAR
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.geo_prec == 0 || self.geo_prec > MAX_PRECISION {
            return Err(ConfigError::GeohashPrecision(self.geo_prec));
        }
        if self.bucket_size == 0 {
            return Err(ConfigError::BucketSize(self.bucket_size));
        }
        if self.kary_factor == 0 {
            return Err(ConfigError::KaryFactor(self.kary_factor));
        }
        Ok(())
    }
}

/// Parameters shared by the 128-bit-ID overlays (kadcast, eth).
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct KademliaParams {
    /// Max peers kept per XOR bucket.
    #[arg(long = "kad-bucket-cap", default_value_t = 8)]
    pub bucket_cap: usize,

    /// Peers forwarded to per bucket (kadcast) or per non-empty bucket
    /// (eth).
    #[arg(long = "kad-fanout", default_value_t = 6)]
    pub fanout: usize,
}

impl Default for KademliaParams {
    fn default() -> Self {
        KademliaParams {
            bucket_cap: 8,
            fanout: 6,
        }
    }
}

impl KademliaParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_cap == 0 {
            return Err(ConfigError::BucketSize(self.bucket_cap));
        }
        if self.fanout == 0 {
            return Err(ConfigError::Fanout(self.fanout));
        }
        Ok(())
    }
}
