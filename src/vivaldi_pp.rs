//! Two-phase Vivaldi variant with outlier suppression and late-stage
//! damping.
//!
//! On top of the standard spring update, every node keeps per-peer RTT
//! windows (updates use the window median, not the raw sample), per-peer
//! coordinate histories (to score how much a peer oscillates), and a
//! stability verdict per peer. The learning run starts in the Early phase,
//! tuned for fast convergence, and switches to Late once the local error
//! has stayed low for several consecutive rounds or enough peers look
//! stable. Late adds three brakes: unstable peers are down-weighted,
//! observations that violate the triangle inequality through a trusted
//! reference peer are down-weighted, and the step size both anneals over
//! time and is hard-capped per update.

use std::collections::{HashMap, VecDeque};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geo::{haversine_delay_ms, GeoCoord, FIXED_DELAY_MS};
use crate::vivaldi::{VivaldiCoord, MIN_ERROR, SAMPLE_PER_ROUND, VIVALDI_CC, VIVALDI_CE};
use crate::NodeId;

/// Tuning parameters. The defaults reproduce the reference run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VivaldiPlusPlusConfig {
    pub dim: usize,
    pub cc: f64,
    pub ce: f64,
    /// Per-peer RTT window length (median filter).
    pub rtt_window: usize,
    /// Per-peer coordinate-history window length (oscillation score).
    pub coord_window: usize,
    /// Earliest round at which the phase switch may fire.
    pub r_min: usize,
    /// Local-error threshold for the switch condition.
    pub e_switch: f64,
    /// Consecutive rounds the error must stay below `e_switch`.
    pub persistence: usize,
    /// Alternative switch condition: this many stable peers.
    pub b_min: usize,
    /// Relative-oscillation threshold below which a peer counts as stable.
    pub osc_threshold: f64,
    /// Error cap a stable peer must also satisfy.
    pub stable_error_cap: f64,
    /// Triangle-inequality slack before down-weighting kicks in.
    pub tau: f64,
    /// Floor for the triangle-violation weight.
    pub eps_min: f64,
    /// Decay sharpness of the triangle-violation weight.
    pub alpha: f64,
    /// Weight applied to observations from unstable peers in Late phase.
    pub gamma: f64,
    /// Multiplicative step decay applied every `anneal_period` Late rounds.
    pub anneal_rate: f64,
    pub anneal_period: usize,
    /// Per-update displacement cap (vector norm and height) in Late phase.
    pub freeze_cap: f64,
    /// Fixed candidate-peer set size per node.
    pub fixed_neighbors: usize,
    /// Observations per node per round.
    pub sample_per_round: usize,
}

impl Default for VivaldiPlusPlusConfig {
    fn default() -> Self {
        VivaldiPlusPlusConfig {
            dim: 3,
            cc: VIVALDI_CC,
            ce: VIVALDI_CE,
            rtt_window: 15,
            coord_window: 15,
            r_min: 20,
            e_switch: 0.15,
            persistence: 7,
            b_min: 3,
            osc_threshold: 0.03,
            stable_error_cap: 0.15,
            tau: 0.1,
            eps_min: 0.1,
            alpha: 2.0,
            gamma: 0.4,
            anneal_rate: 0.3,
            anneal_period: 5,
            freeze_cap: 100.0,
            fixed_neighbors: 128,
            sample_per_round: SAMPLE_PER_ROUND,
        }
    }
}

/// Median of an unsorted sample (even lengths average the middle pair).
fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Bounded per-peer RTT history.
#[derive(Debug, Default)]
struct RttTracker {
    hist: HashMap<NodeId, VecDeque<f64>>,
    window: usize,
}

impl RttTracker {
    fn new(window: usize) -> Self {
        RttTracker {
            hist: HashMap::new(),
            window,
        }
    }

    fn add(&mut self, peer: NodeId, rtt: f64) {
        let h = self.hist.entry(peer).or_default();
        h.push_back(rtt);
        if h.len() > self.window {
            h.pop_front();
        }
    }

    /// Median RTT seen from this peer, if any samples exist.
    fn median_rtt(&self, peer: NodeId) -> Option<f64> {
        let h = self.hist.get(&peer)?;
        if h.is_empty() {
            return None;
        }
        let mut copy: Vec<f64> = h.iter().copied().collect();
        Some(median(&mut copy))
    }
}

/// Per-peer coordinate history, oscillation score, and stability verdict.
#[derive(Debug, Default)]
struct NeighborHistory {
    coord_hist: HashMap<NodeId, VecDeque<VivaldiCoord>>,
    delta_hist: HashMap<NodeId, VecDeque<f64>>,
    last_error: HashMap<NodeId, f64>,
    osc: HashMap<NodeId, f64>,
    stable: HashMap<NodeId, bool>,
    node_weight: HashMap<NodeId, f64>,
    window: usize,
}

impl NeighborHistory {
    fn new(window: usize) -> Self {
        NeighborHistory {
            window,
            ..NeighborHistory::default()
        }
    }

    /// Record a freshly observed peer coordinate.
    fn update(&mut self, peer: NodeId, coord: &VivaldiCoord) {
        let coords = self.coord_hist.entry(peer).or_default();
        self.node_weight.entry(peer).or_insert(1.0);

        if let Some(prev) = coords.back() {
            let delta = prev.predicted_rtt(coord);
            let deltas = self.delta_hist.entry(peer).or_default();
            deltas.push_back(delta);
            if deltas.len() > self.window {
                deltas.pop_front();
            }
        }

        coords.push_back(coord.clone());
        if coords.len() > self.window {
            coords.pop_front();
        }

        self.last_error.insert(peer, coord.error);
    }

    /// Re-score a peer: stable iff its median movement is small relative
    /// to its coordinate magnitude and its own error estimate is low.
    fn compute_stability(&mut self, peer: NodeId, cfg: &VivaldiPlusPlusConfig) {
        let osc = match self.delta_hist.get(&peer) {
            Some(deltas) if !deltas.is_empty() => {
                let mut copy: Vec<f64> = deltas.iter().copied().collect();
                median(&mut copy)
            }
            _ => 0.0,
        };
        self.osc.insert(peer, osc);

        let norm = self
            .coord_hist
            .get(&peer)
            .and_then(|h| h.back())
            .map(|c| {
                let vec_norm: f64 =
                    c.vector.iter().map(|v| v * v).sum::<f64>().sqrt();
                (vec_norm + c.height).max(1.0)
            })
            .unwrap_or(1.0);

        let error_ok = self
            .last_error
            .get(&peer)
            .is_some_and(|&e| e < cfg.stable_error_cap);
        let is_stable = osc / norm < cfg.osc_threshold && error_ok;

        self.stable.insert(peer, is_stable);
        self.node_weight
            .insert(peer, if is_stable { 1.0 } else { cfg.gamma });
    }

    fn stable_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .stable
            .iter()
            .filter(|(_, &s)| s)
            .map(|(&p, _)| p)
            .collect();
        peers.sort_unstable();
        peers
    }
}

/// Learning phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Early,
    Late,
}

/// Full per-node learner state.
#[derive(Debug)]
pub struct VivaldiPlusPlusState {
    pub node: NodeId,
    pub coord: VivaldiCoord,
    pub phase: Phase,
    /// Round at which the node entered Late phase.
    pub switch_round: Option<usize>,
    /// Fixed candidate peers this node samples from.
    pub fixed_neighbors: Vec<NodeId>,
    rtt: RttTracker,
    history: NeighborHistory,
    stable_set: Vec<NodeId>,
    phase_counter: usize,
    current_cc: f64,
    current_ce: f64,
}

impl VivaldiPlusPlusState {
    fn new<R: Rng + ?Sized>(
        node: NodeId,
        cfg: &VivaldiPlusPlusConfig,
        rng: &mut R,
    ) -> Self {
        VivaldiPlusPlusState {
            node,
            coord: VivaldiCoord::random(cfg.dim, rng),
            phase: Phase::Early,
            switch_round: None,
            fixed_neighbors: Vec::new(),
            rtt: RttTracker::new(cfg.rtt_window),
            history: NeighborHistory::new(cfg.coord_window),
            stable_set: Vec::new(),
            phase_counter: 0,
            current_cc: cfg.cc,
            current_ce: cfg.ce,
        }
    }

    /// Number of peers currently judged stable.
    pub fn stable_count(&self) -> usize {
        self.stable_set.len()
    }

    fn refresh_stable_set(&mut self) {
        self.stable_set = self.history.stable_peers();
    }

    /// The stable peer with the smallest oscillation score, used as the
    /// triangle-inequality reference point.
    fn reference_point(&self) -> Option<NodeId> {
        self.stable_set
            .iter()
            .copied()
            .min_by(|&a, &b| {
                let oa = self.history.osc.get(&a).copied().unwrap_or(f64::MAX);
                let ob = self.history.osc.get(&b).copied().unwrap_or(f64::MAX);
                oa.total_cmp(&ob)
            })
    }

    /// Evaluate the Early-to-Late switch at the top of a round. Returns
    /// whether the switch fired this round.
    fn maybe_switch(&mut self, round: usize, cfg: &VivaldiPlusPlusConfig) -> bool {
        if self.phase == Phase::Late || round < cfg.r_min {
            return false;
        }

        if self.coord.error < cfg.e_switch {
            self.phase_counter += 1;
        } else {
            self.phase_counter = 0;
        }

        let persistent = self.phase_counter >= cfg.persistence;
        let enough_stable = self.stable_set.len() >= cfg.b_min;
        if !(persistent || enough_stable) {
            return false;
        }

        self.phase = Phase::Late;
        self.switch_round = Some(round);
        self.current_cc = cfg.cc * 0.5;
        self.current_ce = cfg.ce * 0.9;
        true
    }

    /// Shrink the step size every `anneal_period` rounds after the switch.
    fn apply_annealing(&mut self, round: usize, cfg: &VivaldiPlusPlusConfig) {
        if self.phase != Phase::Late {
            return;
        }
        if let Some(switched) = self.switch_round {
            if (round - switched) % cfg.anneal_period == 0 {
                self.current_cc = (self.current_cc * cfg.anneal_rate).max(0.01);
            }
        }
    }

    /// One observation of `peer` at measured `rtt`.
    ///
    /// `geo` carries the ground-truth coordinates, used only as the RTT
    /// fallback for triangle legs this node has never sampled.
    fn observe(
        &mut self,
        peer: NodeId,
        peer_coord: &VivaldiCoord,
        rtt: f64,
        round: usize,
        cfg: &VivaldiPlusPlusConfig,
        geo: &[GeoCoord],
    ) {
        self.rtt.add(peer, rtt);
        self.history.update(peer, peer_coord);

        // Stability only matters near and after the switch.
        if self.phase == Phase::Late || round + 5 >= cfg.r_min {
            self.history.compute_stability(peer, cfg);
        }

        let median_rtt = self
            .rtt
            .median_rtt(peer)
            .filter(|&m| m >= 1e-6)
            .unwrap_or(rtt);

        let predicted = self.coord.predicted_rtt(peer_coord);
        let relative_error = if median_rtt < 1e-6 {
            0.0
        } else {
            (predicted - median_rtt).abs() / median_rtt
        };

        let w_base =
            (self.coord.error / (self.coord.error + peer_coord.error)).clamp(0.0, 1.0);

        // Unstable-peer down-weighting only applies once the system has
        // learnt which peers to trust.
        let w_node = match self.phase {
            Phase::Early => 1.0,
            Phase::Late => self.history.node_weight.get(&peer).copied().unwrap_or(1.0),
        };

        let w_tiv = if self.phase == Phase::Late {
            self.triangle_weight(peer, median_rtt, cfg, geo)
        } else {
            1.0
        };

        let w = w_base * w_node * w_tiv;

        self.coord.error = (self.current_ce * w * relative_error
            + (1.0 - self.current_ce * w) * self.coord.error)
            .clamp(MIN_ERROR, 1.0);

        let force = self.current_cc * w * (median_rtt - predicted);

        let dim = self.coord.vector.len();
        let mut delta = vec![0.0; dim];
        if predicted > 1e-6 {
            for d in 0..dim {
                let direction = self.coord.vector[d] - peer_coord.vector[d];
                delta[d] = force * direction / predicted;
            }
        }

        let height_diff = self.coord.height - peer_coord.height;
        let mut height_delta = if height_diff.abs() > 1e-6 {
            force * height_diff.signum()
        } else {
            0.0
        };

        if self.phase == Phase::Late {
            freeze(&mut delta, cfg.freeze_cap);
            if height_delta.abs() > cfg.freeze_cap {
                height_delta = cfg.freeze_cap.copysign(height_delta);
            }
        }

        for d in 0..dim {
            self.coord.vector[d] += delta[d];
        }
        self.coord.height = (self.coord.height + height_delta).max(0.0);
    }

    /// Triangle-inequality weight for an observation of `peer`, measured
    /// through the best stable reference peer. Weight 1 when no reference
    /// exists or the triangle holds within `tau` slack.
    fn triangle_weight(
        &self,
        peer: NodeId,
        t_ij: f64,
        cfg: &VivaldiPlusPlusConfig,
        geo: &[GeoCoord],
    ) -> f64 {
        let Some(reference) = self.reference_point() else {
            return 1.0;
        };

        let t_ib = self
            .rtt
            .median_rtt(reference)
            .filter(|&m| m >= 1e-6)
            .unwrap_or_else(|| {
                haversine_delay_ms(geo[self.node], geo[reference]) + FIXED_DELAY_MS
            });
        // This node never measures the reference-to-peer leg itself.
        let t_bj = haversine_delay_ms(geo[reference], geo[peer]) + FIXED_DELAY_MS;

        let denom = t_ib + t_bj;
        let lambda = if denom < 1e-6 { 1.0 } else { t_ij / denom };

        if lambda <= 1.0 + cfg.tau {
            1.0
        } else {
            (1.0 / (1.0 + cfg.alpha * (lambda - 1.0 - cfg.tau))).max(cfg.eps_min)
        }
    }
}

/// Scale a displacement vector down to `cap` magnitude if it exceeds it.
fn freeze(delta: &mut [f64], cap: f64) {
    let norm: f64 = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
    if norm > cap {
        let scale = cap / norm;
        for d in delta.iter_mut() {
            *d *= scale;
        }
    }
}

/// Run the full two-phase learning loop and return the per-node states.
pub fn learn_states<R: Rng + ?Sized>(
    coords: &[GeoCoord],
    rounds: usize,
    cfg: &VivaldiPlusPlusConfig,
    rng: &mut R,
) -> Vec<VivaldiPlusPlusState> {
    let n = coords.len();
    let mut states: Vec<VivaldiPlusPlusState> =
        (0..n).map(|i| VivaldiPlusPlusState::new(i, cfg, rng)).collect();
    if n < 2 {
        return states;
    }

    for i in 0..n {
        let mut candidates: Vec<NodeId> = (0..n).filter(|&j| j != i).collect();
        candidates.shuffle(rng);
        candidates.truncate(cfg.fixed_neighbors);
        states[i].fixed_neighbors = candidates;
    }

    info!(rounds, n, "learning vivaldi++ coordinates");

    for round in 0..rounds {
        if round % 10 == 0 {
            debug!(round, total = rounds, "vivaldi++ round");
        }

        for i in 0..n {
            states[i].maybe_switch(round, cfg);
            // Early refreshes every round once stability scoring has begun
            // (so the stable-neighbor switch condition can fire at all);
            // Late refreshes on a coarser cadence.
            let refresh_due = match states[i].phase {
                Phase::Early => round + 5 >= cfg.r_min,
                Phase::Late => round % 3 == 0,
            };
            if refresh_due {
                states[i].refresh_stable_set();
            }

            let neighbors = select_neighbors(&states[i], cfg, rng);
            for j in neighbors {
                let rtt = haversine_delay_ms(coords[i], coords[j]) + FIXED_DELAY_MS;
                let peer_coord = states[j].coord.clone();
                states[i].observe(j, &peer_coord, rtt, round, cfg, coords);
            }

            states[i].apply_annealing(round, cfg);
        }
    }

    let late = states.iter().filter(|s| s.phase == Phase::Late).count();
    info!(late, n, "vivaldi++ learning finished");

    states
}

/// Convenience wrapper returning only the learned coordinates.
pub fn learn_coordinates_pp<R: Rng + ?Sized>(
    coords: &[GeoCoord],
    rounds: usize,
    cfg: &VivaldiPlusPlusConfig,
    rng: &mut R,
) -> Vec<VivaldiCoord> {
    learn_states(coords, rounds, cfg, rng)
        .into_iter()
        .map(|s| s.coord)
        .collect()
}

/// Pick this round's observation targets: Early samples the fixed set
/// uniformly; Late visits stable peers first and fills up from the rest.
fn select_neighbors<R: Rng + ?Sized>(
    state: &VivaldiPlusPlusState,
    cfg: &VivaldiPlusPlusConfig,
    rng: &mut R,
) -> Vec<NodeId> {
    let want = cfg.sample_per_round;
    match state.phase {
        Phase::Early => {
            let mut shuffled = state.fixed_neighbors.clone();
            shuffled.shuffle(rng);
            shuffled.truncate(want);
            shuffled
        }
        Phase::Late => {
            let mut stable: Vec<NodeId> = state
                .fixed_neighbors
                .iter()
                .copied()
                .filter(|p| state.stable_set.contains(p))
                .collect();
            stable.shuffle(rng);
            stable.truncate(want);

            if stable.len() < want {
                let mut rest: Vec<NodeId> = state
                    .fixed_neighbors
                    .iter()
                    .copied()
                    .filter(|p| !stable.contains(p))
                    .collect();
                rest.shuffle(rng);
                stable.extend(rest.into_iter().take(want - stable.len()));
            }
            stable
        }
    }
}
