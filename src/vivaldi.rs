//! Vivaldi virtual coordinates: the spring-model embedding that learns to
//! predict pairwise RTTs from repeated observations.
//!
//! Each node carries a low-dimensional Euclidean vector, a non-negative
//! height (modelling access-link cost), and a local error estimate that
//! weights how strongly new observations move the coordinate. The learning
//! loop here replays geographic RTTs (haversine delay plus the fixed
//! processing budget) between sampled peers; every random draw comes from
//! the caller's generator, so a run is reproducible from its seed.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geo::{euclidean, haversine_delay_ms, GeoCoord, FIXED_DELAY_MS};
use crate::NodeId;

/// Coordinate dimensionality.
pub const VIVALDI_DIM: usize = 3;
/// Coordinate step constant.
pub const VIVALDI_CC: f64 = 0.25;
/// Error-update constant.
pub const VIVALDI_CE: f64 = 0.5;
/// Floor for the local error estimate.
pub const MIN_ERROR: f64 = 0.01;
/// Initial local error estimate.
pub const INIT_ERROR: f64 = 1.0;
/// Observations per node per learning round.
pub const SAMPLE_PER_ROUND: usize = 16;
/// Size of the fixed per-node candidate peer set, when one is used.
pub const FIXED_PEER_SET_SIZE: usize = 128;
/// Default learning rounds.
pub const DEFAULT_ROUNDS: usize = 100;

/// A Vivaldi coordinate: Euclidean vector, height, and error estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VivaldiCoord {
    pub vector: Vec<f64>,
    /// Non-negative access-link component added to every prediction.
    pub height: f64,
    /// Local error estimate in `[MIN_ERROR, 1]`.
    pub error: f64,
}

impl VivaldiCoord {
    /// Coordinate at the origin with the initial error estimate.
    pub fn new(dim: usize) -> Self {
        VivaldiCoord {
            vector: vec![0.0; dim],
            height: 0.0,
            error: INIT_ERROR,
        }
    }

    /// Coordinate at an explicit position.
    pub fn with_position(vector: Vec<f64>, height: f64) -> Self {
        VivaldiCoord {
            vector,
            height,
            error: INIT_ERROR,
        }
    }

    /// Randomized starting coordinate for the learning loop.
    pub fn random<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        let vector = (0..dim).map(|_| rng.gen::<f64>() * 1000.0).collect();
        VivaldiCoord {
            vector,
            height: rng.gen::<f64>() * 100.0,
            error: INIT_ERROR,
        }
    }

    /// Predicted RTT to another coordinate: vector distance plus both
    /// heights.
    pub fn predicted_rtt(&self, other: &VivaldiCoord) -> f64 {
        euclidean(&self.vector, &other.vector) + self.height + other.height
    }
}

/// One standard Vivaldi update of `local` from an observed `rtt` to a peer.
///
/// Degenerate observations are skipped term-by-term: a zero RTT contributes
/// no error signal, a zero predicted distance moves nothing, and equal
/// heights leave the height untouched.
pub fn observe(local: &mut VivaldiCoord, peer: &VivaldiCoord, rtt: f64) {
    let predicted = local.predicted_rtt(peer);

    let relative_error = if rtt < 1e-6 {
        0.0
    } else {
        (predicted - rtt).abs() / rtt
    };

    let w = (local.error / (local.error + peer.error)).clamp(0.0, 1.0);

    local.error =
        (relative_error * VIVALDI_CE * w + local.error * (1.0 - VIVALDI_CE * w))
            .clamp(MIN_ERROR, 1.0);

    let delta = (VIVALDI_CC * w).clamp(0.0, 1.0);
    let force = delta * (rtt - predicted);

    if predicted > 1e-6 {
        for d in 0..local.vector.len() {
            let direction = local.vector[d] - peer.vector[d];
            local.vector[d] += force * direction / predicted;
        }
    }

    let height_diff = local.height - peer.height;
    if height_diff.abs() > 1e-6 {
        local.height += force * height_diff.signum();
    }
    if local.height < 0.0 {
        local.height = 0.0;
    }
}

/// Learning-loop options.
#[derive(Debug, Clone)]
pub struct VivaldiOptions {
    pub rounds: usize,
    pub dim: usize,
    /// Observations per node per round.
    pub sample_per_round: usize,
    /// When set, each node samples from a fixed candidate set of this size
    /// instead of the whole population.
    pub fixed_peer_set: Option<usize>,
}

impl Default for VivaldiOptions {
    fn default() -> Self {
        VivaldiOptions {
            rounds: DEFAULT_ROUNDS,
            dim: VIVALDI_DIM,
            sample_per_round: SAMPLE_PER_ROUND,
            fixed_peer_set: None,
        }
    }
}

/// Build a fixed candidate peer set for every node: a random draw of
/// `size` distinct peers (all peers when the population is smaller).
pub fn build_peer_sets<R: Rng + ?Sized>(
    n: usize,
    size: usize,
    rng: &mut R,
) -> Vec<Vec<NodeId>> {
    (0..n)
        .map(|i| {
            let mut candidates: Vec<NodeId> = (0..n).filter(|&j| j != i).collect();
            candidates.shuffle(rng);
            candidates.truncate(size);
            candidates
        })
        .collect()
}

/// Run the standard Vivaldi learning loop over geographic ground truth.
///
/// The observed RTT for a pair is `haversine_delay + FIXED_DELAY_MS`.
/// Returns the learned coordinate of every node.
pub fn learn_coordinates<R: Rng + ?Sized>(
    coords: &[GeoCoord],
    opts: &VivaldiOptions,
    rng: &mut R,
) -> Vec<VivaldiCoord> {
    let n = coords.len();
    let mut models: Vec<VivaldiCoord> =
        (0..n).map(|_| VivaldiCoord::random(opts.dim, rng)).collect();
    if n < 2 {
        return models;
    }

    let peer_sets = opts
        .fixed_peer_set
        .map(|size| build_peer_sets(n, size, rng));

    info!(rounds = opts.rounds, dim = opts.dim, n, "learning vivaldi coordinates");

    for round in 0..opts.rounds {
        if round % 10 == 0 {
            debug!(round, total = opts.rounds, "vivaldi round");
        }
        for x in 0..n {
            let neighbors: Vec<NodeId> = match &peer_sets {
                Some(sets) => {
                    let mut shuffled = sets[x].clone();
                    shuffled.shuffle(rng);
                    shuffled.truncate(opts.sample_per_round);
                    shuffled
                }
                None => (0..opts.sample_per_round)
                    .map(|_| {
                        let mut y = rng.gen_range(0..n);
                        while y == x {
                            y = rng.gen_range(0..n);
                        }
                        y
                    })
                    .collect(),
            };

            for y in neighbors {
                let rtt = haversine_delay_ms(coords[x], coords[y]) + FIXED_DELAY_MS;
                let peer = models[y].clone();
                observe(&mut models[x], &peer, rtt);
            }
        }
    }

    models
}

/// Sampled comparison of predicted against true RTTs.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityReport {
    pub mean_relative_error: f64,
    pub max_relative_error: f64,
    pub samples: usize,
}

/// Estimate embedding quality over `sample_pairs` random node pairs.
pub fn evaluate_quality<R: Rng + ?Sized>(
    coords: &[GeoCoord],
    models: &[VivaldiCoord],
    sample_pairs: usize,
    rng: &mut R,
) -> QualityReport {
    let n = coords.len();
    let mut total = 0.0;
    let mut max = 0.0f64;
    let mut samples = 0;

    for _ in 0..sample_pairs {
        let i = rng.gen_range(0..n);
        let j = rng.gen_range(0..n);
        if i == j {
            continue;
        }
        let true_rtt = haversine_delay_ms(coords[i], coords[j]) + FIXED_DELAY_MS;
        let predicted = models[i].predicted_rtt(&models[j]);
        let rel = (predicted - true_rtt).abs() / true_rtt;
        total += rel;
        max = max.max(rel);
        samples += 1;
    }

    QualityReport {
        mean_relative_error: if samples > 0 { total / samples as f64 } else { 0.0 },
        max_relative_error: max,
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn prediction_adds_heights() {
        let a = VivaldiCoord::with_position(vec![0.0, 0.0, 0.0], 5.0);
        let b = VivaldiCoord::with_position(vec![3.0, 4.0, 0.0], 7.0);
        assert_eq!(a.predicted_rtt(&b), 17.0);
    }

    #[test]
    fn observe_moves_toward_underestimated_peer() {
        let mut a = VivaldiCoord::with_position(vec![100.0, 0.0, 0.0], 1.0);
        let b = VivaldiCoord::with_position(vec![0.0, 0.0, 0.0], 1.0);
        let before = euclidean(&a.vector, &b.vector);
        // True RTT far below the prediction pulls the coordinate closer.
        observe(&mut a, &b, 20.0);
        let after = euclidean(&a.vector, &b.vector);
        assert!(after < before, "{after} >= {before}");
    }

    #[test]
    fn error_and_height_respect_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut a = VivaldiCoord::random(3, &mut rng);
        for _ in 0..500 {
            let peer = VivaldiCoord::random(3, &mut rng);
            let rtt = rng.gen::<f64>() * 400.0;
            observe(&mut a, &peer, rtt);
            assert!(a.error >= MIN_ERROR && a.error <= 1.0, "error {}", a.error);
            assert!(a.height >= 0.0, "height {}", a.height);
        }
    }

    #[test]
    fn zero_rtt_contributes_no_error_signal() {
        let mut a = VivaldiCoord::with_position(vec![1.0, 0.0, 0.0], 0.0);
        let err_before = a.error;
        let b = VivaldiCoord::with_position(vec![2.0, 0.0, 0.0], 0.0);
        observe(&mut a, &b, 0.0);
        // relative error contributes zero, so the estimate only shrinks.
        assert!(a.error <= err_before);
    }

    #[test]
    fn square_layout_converges_under_ten_percent() {
        let coords = vec![
            GeoCoord::new(0.0, 0.0),
            GeoCoord::new(0.0, 10.0),
            GeoCoord::new(10.0, 0.0),
            GeoCoord::new(10.0, 10.0),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(100);
        let models = learn_coordinates(&coords, &VivaldiOptions::default(), &mut rng);

        let mut total_err = 0.0;
        let mut total_true = 0.0;
        let mut pairs = 0;
        for i in 0..4 {
            for j in (i + 1)..4 {
                let true_rtt = haversine_delay_ms(coords[i], coords[j]) + FIXED_DELAY_MS;
                let predicted = models[i].predicted_rtt(&models[j]);
                total_err += (predicted - true_rtt).abs();
                total_true += true_rtt;
                pairs += 1;
            }
        }
        let avg_err = total_err / pairs as f64;
        let avg_true = total_true / pairs as f64;
        assert!(
            avg_err <= 0.10 * avg_true,
            "avg error {avg_err:.2} ms vs 10% of {avg_true:.2} ms"
        );
    }

    #[test]
    fn learning_is_deterministic_per_seed() {
        let coords: Vec<GeoCoord> =
            (0..10).map(|i| GeoCoord::new(i as f64 * 3.0, 0.0)).collect();
        let opts = VivaldiOptions {
            rounds: 20,
            ..VivaldiOptions::default()
        };
        let a = learn_coordinates(&coords, &opts, &mut ChaCha8Rng::seed_from_u64(8));
        let b = learn_coordinates(&coords, &opts, &mut ChaCha8Rng::seed_from_u64(8));
        for (ca, cb) in a.iter().zip(&b) {
            assert_eq!(ca.vector, cb.vector);
            assert_eq!(ca.height, cb.height);
            assert_eq!(ca.error, cb.error);
        }
    }

    #[test]
    fn fixed_peer_sets_exclude_self_and_cap_size() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let sets = build_peer_sets(10, 4, &mut rng);
        for (i, set) in sets.iter().enumerate() {
            assert_eq!(set.len(), 4);
            assert!(!set.contains(&i));
        }
        let small = build_peer_sets(3, 128, &mut rng);
        assert!(small.iter().all(|s| s.len() == 2));
    }
}
