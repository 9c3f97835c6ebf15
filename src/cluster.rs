//! K-means clustering over geographic or virtual coordinates.
//!
//! Plain Lloyd's algorithm: centers start at k distinct nodes drawn from
//! the caller's generator, assignment uses haversine delay for geographic
//! coordinates and Euclidean distance for Vivaldi vectors, and centers are
//! recomputed as component-wise means. Iteration count is fixed rather
//! than convergence-tested, matching the reference.

use rand::Rng;
use serde::Serialize;

use crate::error::ConfigError;
use crate::geo::{euclidean, haversine_delay_ms, GeoCoord};
use crate::vivaldi::VivaldiCoord;
use crate::NodeId;

/// Assignment of every node to one of `k` clusters.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterResult {
    pub k: usize,
    /// `cluster_id[node]` is the cluster the node belongs to.
    pub cluster_id: Vec<usize>,
    /// `members[c]` lists the nodes of cluster c, ascending.
    pub members: Vec<Vec<NodeId>>,
    /// `counts[c] == members[c].len()`.
    pub counts: Vec<usize>,
}

impl ClusterResult {
    fn from_assignment(k: usize, cluster_id: Vec<usize>) -> Self {
        let mut members = vec![Vec::new(); k];
        let mut counts = vec![0usize; k];
        for (node, &c) in cluster_id.iter().enumerate() {
            members[c].push(node);
            counts[c] += 1;
        }
        ClusterResult {
            k,
            cluster_id,
            members,
            counts,
        }
    }
}

fn validate(k: usize, n: usize) -> Result<(), ConfigError> {
    if n == 0 {
        return Err(ConfigError::NoNodes);
    }
    if k == 0 || k > n {
        return Err(ConfigError::ClusterCount { k, n });
    }
    Ok(())
}

/// Pick `k` distinct node indices as initial centers.
fn pick_centers<R: Rng + ?Sized>(k: usize, n: usize, rng: &mut R) -> Vec<NodeId> {
    let mut picked: Vec<NodeId> = Vec::with_capacity(k);
    while picked.len() < k {
        let u = rng.gen_range(0..n);
        if !picked.contains(&u) {
            picked.push(u);
        }
    }
    picked
}

/// K-means over geographic coordinates.
pub fn kmeans_geo<R: Rng + ?Sized>(
    coords: &[GeoCoord],
    k: usize,
    max_iter: usize,
    rng: &mut R,
) -> Result<ClusterResult, ConfigError> {
    let n = coords.len();
    validate(k, n)?;

    let mut centers: Vec<GeoCoord> = pick_centers(k, n, rng)
        .into_iter()
        .map(|u| coords[u])
        .collect();
    let mut cluster_id = vec![0usize; n];

    for _ in 0..max_iter {
        for (i, &coord) in coords.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::MAX;
            for (c, &center) in centers.iter().enumerate() {
                let d = haversine_delay_ms(center, coord);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            cluster_id[i] = best;
        }

        let mut sums = vec![(0.0f64, 0.0f64); k];
        let mut counts = vec![0usize; k];
        for (i, &c) in cluster_id.iter().enumerate() {
            sums[c].0 += coords[i].lat;
            sums[c].1 += coords[i].lon;
            counts[c] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                centers[c] = GeoCoord::new(
                    sums[c].0 / counts[c] as f64,
                    sums[c].1 / counts[c] as f64,
                );
            }
        }
    }

    Ok(ClusterResult::from_assignment(k, cluster_id))
}

/// K-means over Vivaldi coordinate vectors (heights ignored).
pub fn kmeans_virtual<R: Rng + ?Sized>(
    coords: &[VivaldiCoord],
    k: usize,
    max_iter: usize,
    rng: &mut R,
) -> Result<ClusterResult, ConfigError> {
    let n = coords.len();
    validate(k, n)?;
    let dim = coords[0].vector.len();

    let mut centers: Vec<Vec<f64>> = pick_centers(k, n, rng)
        .into_iter()
        .map(|u| coords[u].vector.clone())
        .collect();
    let mut cluster_id = vec![0usize; n];

    for _ in 0..max_iter {
        for (i, coord) in coords.iter().enumerate() {
            let mut best = 0;
            let mut best_dist = f64::MAX;
            for (c, center) in centers.iter().enumerate() {
                let d = euclidean(center, &coord.vector);
                if d < best_dist {
                    best_dist = d;
                    best = c;
                }
            }
            cluster_id[i] = best;
        }

        let mut sums = vec![vec![0.0f64; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, &c) in cluster_id.iter().enumerate() {
            for d in 0..dim {
                sums[c][d] += coords[i].vector[d];
            }
            counts[c] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                for d in 0..dim {
                    centers[c][d] = sums[c][d] / counts[c] as f64;
                }
            }
        }
    }

    Ok(ClusterResult::from_assignment(k, cluster_id))
}

/// Within-cluster sum of squared distances, for diagnosing cluster counts.
pub fn inertia_geo(coords: &[GeoCoord], result: &ClusterResult) -> f64 {
    let mut centers = vec![(0.0f64, 0.0f64); result.k];
    for c in 0..result.k {
        if result.counts[c] == 0 {
            continue;
        }
        for &node in &result.members[c] {
            centers[c].0 += coords[node].lat;
            centers[c].1 += coords[node].lon;
        }
        centers[c].0 /= result.counts[c] as f64;
        centers[c].1 /= result.counts[c] as f64;
    }

    coords
        .iter()
        .zip(&result.cluster_id)
        .map(|(&coord, &c)| {
            let d = haversine_delay_ms(GeoCoord::new(centers[c].0, centers[c].1), coord);
            d * d
        })
        .sum()
}
