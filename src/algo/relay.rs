//! Redundancy-aware relay selection over Vivaldi++ coordinates.
//!
//! Every node scores each of its peers with two EWMAs learned from
//! message arrivals: an earliness score (does this peer tend to deliver
//! new messages early) and a forwarding-observability score (how often is
//! this peer the one a message actually came through). Scores calibrate a
//! relay probability; selection then fills a bounded fan-out from three
//! pools: a random-exploration floor, a minimum quota into every foreign
//! cluster, and the remaining budget by ascending probability (peers the
//! model thinks are unlikely to hear the message otherwise come first).
//!
//! The overlay is warmed up before simulation: a burst of synthetic
//! transactions is propagated over the peer graph and the EWMAs are
//! seeded from the observed arrival ranks.

use std::collections::{BTreeMap, HashMap, VecDeque};

use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

use super::Algorithm;
use crate::cluster::kmeans_virtual;
use crate::error::ConfigError;
use crate::geo::{haversine_delay_ms, GeoCoord, FIXED_DELAY_MS};
use crate::queue::Message;
use crate::vivaldi_pp::{learn_coordinates_pp, VivaldiPlusPlusConfig};
use crate::NodeId;

/// Arrival-rank ties closer than this count as simultaneous.
const RANK_TIE_MS: f64 = 10.0;

/// Arrivals older than this window do not contribute to rank updates.
const ARRIVAL_WINDOW_MS: f64 = 100.0;

/// How earliness maps to a base relay probability.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum Calibration {
    Linear { a: f64, b: f64 },
    Sigmoid { alpha: f64, mu: f64 },
}

impl Calibration {
    fn apply(&self, earliness: f64) -> f64 {
        match *self {
            Calibration::Linear { a, b } => (a * earliness + b).clamp(0.0, 1.0),
            Calibration::Sigmoid { alpha, mu } => {
                (1.0 / (1.0 + (-alpha * (earliness - mu)).exp())).clamp(0.0, 1.0)
            }
        }
    }
}

/// Relay-strategy tuning.
#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    /// EWMA coefficient of the earliness score.
    pub rho_earliness: f64,
    /// EWMA coefficient of the observability score.
    pub rho_observability: f64,
    pub calibration: Calibration,
    /// Strength of the sender-conditioned correction.
    pub sender_correction: f64,
    /// Strength of the low-observability correction.
    pub observability_correction: f64,
    /// Score both EWMAs start from.
    pub neutral_prior: f64,
    /// Global fan-out cap per reception.
    pub fanout_cap: usize,
    /// Fraction of the cap reserved for random exploration.
    pub eta_random: f64,
    /// Guaranteed picks into every foreign cluster.
    pub min_cross_per_cluster: usize,
    /// Cap on same-cluster picks from the remaining budget.
    pub self_cluster_cap: usize,
    /// Bounded per-peer rank history length.
    pub rank_history: usize,
    /// Peers each node maintains.
    pub peers_per_node: usize,
    /// Clusters for the cross-cluster quota.
    pub clusters: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            rho_earliness: 0.1,
            rho_observability: 0.05,
            calibration: Calibration::Linear { a: 0.5, b: 0.3 },
            sender_correction: 0.2,
            observability_correction: 0.2,
            neutral_prior: 0.5,
            fanout_cap: 16,
            eta_random: 0.1,
            min_cross_per_cluster: 1,
            self_cluster_cap: 8,
            rank_history: 100,
            peers_per_node: 20,
            clusters: 8,
        }
    }
}

/// Per-peer learned statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NeighborStats {
    /// Earliness EWMA in `[0, 1]`.
    pub earliness: f64,
    /// Forwarding-observability EWMA in `[0, 1]`.
    pub observability: f64,
    /// Simulated time of the last update, ms.
    pub last_update_ms: f64,
    /// Recent arrival ranks, bounded.
    pub rank_history: VecDeque<RankRecord>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RankRecord {
    pub broadcast: u64,
    pub rank: usize,
    pub score: f64,
}

impl NeighborStats {
    fn neutral(prior: f64) -> Self {
        NeighborStats {
            earliness: prior,
            observability: prior,
            last_update_ms: 0.0,
            rank_history: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct NodeRelayState {
    cluster: usize,
    peers: Vec<NodeId>,
    stats: HashMap<NodeId, NeighborStats>,
}

pub struct RelayStrategy {
    states: Vec<NodeRelayState>,
    cluster_id: Vec<usize>,
    cfg: RelayConfig,
    rng: ChaCha8Rng,
    /// First-arrival times of the broadcast in flight.
    arrivals: HashMap<NodeId, f64>,
    broadcast_seq: u64,
    tree_root: NodeId,
}

impl RelayStrategy {
    /// Build the overlay: learn Vivaldi++ coordinates, cluster them, draw
    /// the peer graph, and warm the per-peer statistics up with
    /// `warmup_rounds * warmup_txs` synthetic transactions.
    pub fn new(
        coords: &[GeoCoord],
        cfg: RelayConfig,
        vivaldi_cfg: &VivaldiPlusPlusConfig,
        vivaldi_rounds: usize,
        warmup_rounds: usize,
        warmup_txs: usize,
        mut rng: ChaCha8Rng,
    ) -> Result<Self, ConfigError> {
        let n = coords.len();
        if n == 0 {
            return Err(ConfigError::NoNodes);
        }
        if cfg.fanout_cap == 0 {
            return Err(ConfigError::Fanout(cfg.fanout_cap));
        }

        info!(n, vivaldi_rounds, "building relay overlay");
        let virtual_coords = learn_coordinates_pp(coords, vivaldi_rounds, vivaldi_cfg, &mut rng);

        let k = cfg.clusters.min(n);
        let clusters = kmeans_virtual(&virtual_coords, k, 100, &mut rng)?;

        let mut states = Vec::with_capacity(n);
        for i in 0..n {
            let mut candidates: Vec<NodeId> = (0..n).filter(|&j| j != i).collect();
            candidates.shuffle(&mut rng);
            candidates.truncate(cfg.peers_per_node);
            let stats = candidates
                .iter()
                .map(|&p| (p, NeighborStats::neutral(cfg.neutral_prior)))
                .collect();
            states.push(NodeRelayState {
                cluster: clusters.cluster_id[i],
                peers: candidates,
                stats,
            });
        }

        let mut strategy = RelayStrategy {
            states,
            cluster_id: clusters.cluster_id.clone(),
            cfg,
            rng,
            arrivals: HashMap::new(),
            broadcast_seq: 0,
            tree_root: 0,
        };
        strategy.warmup(coords, warmup_rounds, warmup_txs);
        Ok(strategy)
    }

    pub fn stats_of(&self, u: NodeId, peer: NodeId) -> Option<&NeighborStats> {
        self.states[u].stats.get(&peer)
    }

    pub fn peers_of(&self, u: NodeId) -> &[NodeId] {
        &self.states[u].peers
    }

    /// Root of the broadcast currently in flight.
    pub fn root(&self) -> NodeId {
        self.tree_root
    }

    /// Calibrated relay probability for `peer` as seen from `u`.
    fn relay_probability(&self, u: NodeId, peer: NodeId, sender: Option<NodeId>) -> f64 {
        let cfg = &self.cfg;
        let stats = &self.states[u].stats[&peer];
        let base = cfg.calibration.apply(stats.earliness);
        let conditioned = match sender.and_then(|s| self.states[u].stats.get(&s)) {
            Some(sender_stats) => {
                (base + cfg.sender_correction * (sender_stats.earliness - 0.5)).clamp(0.0, 1.0)
            }
            None => base,
        };
        (conditioned + cfg.observability_correction * (1.0 - stats.observability))
            .clamp(0.0, 1.0)
    }

    /// Pick the forwarding set for a reception at `u` from `sender`.
    fn select_relays(&mut self, u: NodeId, sender: Option<NodeId>) -> Vec<NodeId> {
        let cfg = self.cfg.clone();

        let candidates: Vec<NodeId> = self.states[u]
            .peers
            .iter()
            .copied()
            .filter(|&p| Some(p) != sender)
            .collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let probs: HashMap<NodeId, f64> = candidates
            .iter()
            .map(|&p| (p, self.relay_probability(u, p, sender)))
            .collect();
        let by_prob_asc = |a: &NodeId, b: &NodeId| {
            probs[a].total_cmp(&probs[b]).then(a.cmp(b))
        };

        // Random-exploration floor.
        let want_random = ((cfg.eta_random * cfg.fanout_cap as f64).ceil() as usize)
            .min(candidates.len());
        let mut picked: Vec<NodeId> = candidates
            .choose_multiple(&mut self.rng, want_random)
            .copied()
            .collect();

        // Minimum quota into every foreign cluster, least-likely first.
        let own_cluster = self.states[u].cluster;
        let mut foreign: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        let mut same_cluster: Vec<NodeId> = Vec::new();
        for &p in &candidates {
            if self.cluster_id[p] == own_cluster {
                same_cluster.push(p);
            } else {
                foreign.entry(self.cluster_id[p]).or_default().push(p);
            }
        }
        for members in foreign.values_mut() {
            members.sort_by(by_prob_asc);
            for &p in members.iter().take(cfg.min_cross_per_cluster) {
                if !picked.contains(&p) {
                    picked.push(p);
                }
            }
        }

        // Fill the remaining budget: foreign peers first, then the own
        // cluster up to its cap, all by ascending probability.
        if picked.len() < cfg.fanout_cap {
            let mut rest: Vec<NodeId> = foreign
                .values()
                .flatten()
                .copied()
                .filter(|p| !picked.contains(p))
                .collect();
            rest.sort_by(by_prob_asc);
            for p in rest {
                if picked.len() >= cfg.fanout_cap {
                    break;
                }
                picked.push(p);
            }

            same_cluster.sort_by(by_prob_asc);
            let mut own_used = 0;
            for p in same_cluster {
                if picked.len() >= cfg.fanout_cap || own_used >= cfg.self_cluster_cap {
                    break;
                }
                if !picked.contains(&p) {
                    picked.push(p);
                    own_used += 1;
                }
            }
        }

        // The exploration floor survives truncation; the rest competes by
        // ascending probability.
        if picked.len() > cfg.fanout_cap {
            let floor: Vec<NodeId> = picked[..want_random].to_vec();
            let mut rest: Vec<NodeId> = picked[want_random..].to_vec();
            rest.sort_by(by_prob_asc);
            let mut result = floor;
            for p in rest {
                if result.len() >= cfg.fanout_cap {
                    break;
                }
                if !result.contains(&p) {
                    result.push(p);
                }
            }
            return result;
        }

        picked
    }

    /// Fold one broadcast's peer arrivals into `u`'s statistics.
    fn update_stats(&mut self, u: NodeId, peer_arrivals: &[(NodeId, f64)], now_ms: f64) {
        if peer_arrivals.is_empty() {
            return;
        }
        let cfg = self.cfg.clone();
        let seq = self.broadcast_seq;

        let ranks = compute_ranks(peer_arrivals);
        let k = ranks.len();

        for &(peer, rank) in &ranks {
            let score = if k > 1 {
                1.0 - (rank - 1) as f64 / (k - 1) as f64
            } else {
                1.0
            };
            let Some(stats) = self.states[u].stats.get_mut(&peer) else {
                continue;
            };
            stats.earliness =
                (cfg.rho_earliness * score + (1.0 - cfg.rho_earliness) * stats.earliness)
                    .clamp(0.0, 1.0);
            stats.last_update_ms = now_ms;
            stats.rank_history.push_back(RankRecord {
                broadcast: seq,
                rank,
                score,
            });
            if stats.rank_history.len() > cfg.rank_history {
                stats.rank_history.pop_front();
            }
        }

        // The earliest peer is the one the message effectively came
        // through; everyone else's observability decays slowly.
        let earliest = peer_arrivals
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|&(p, _)| p);
        if let Some(first) = earliest {
            for (&peer, stats) in self.states[u].stats.iter_mut() {
                let rho = if peer == first {
                    cfg.rho_observability
                } else {
                    cfg.rho_observability * 0.1
                };
                let target = if peer == first { 1.0 } else { 0.0 };
                stats.observability =
                    (rho * target + (1.0 - rho) * stats.observability).clamp(0.0, 1.0);
            }
        }
    }

    /// Seed the EWMAs with synthetic two-hop transactions over the peer
    /// graph.
    fn warmup(&mut self, coords: &[GeoCoord], rounds: usize, txs_per_round: usize) {
        let n = coords.len();
        if n < 2 {
            return;
        }
        info!(rounds, txs_per_round, "warming up relay statistics");

        for round in 0..rounds {
            if round % 10 == 0 {
                debug!(round, total = rounds, "warmup round");
            }
            for _ in 0..txs_per_round {
                self.broadcast_seq += 1;
                let source = self.rng.gen_range(0..n);

                let mut arrival: HashMap<NodeId, f64> = HashMap::new();
                arrival.insert(source, 0.0);

                let first_hop = self.select_relays(source, None);
                for &v in &first_hop {
                    let t = haversine_delay_ms(coords[source], coords[v]) + FIXED_DELAY_MS;
                    record_min(&mut arrival, v, t);
                }

                for &v in &first_hop {
                    let t_v = arrival[&v];
                    for w in self.select_relays(v, Some(source)) {
                        let t = t_v + haversine_delay_ms(coords[v], coords[w]) + FIXED_DELAY_MS;
                        record_min(&mut arrival, w, t);
                    }
                }

                let mut receivers: Vec<NodeId> =
                    arrival.keys().copied().filter(|&v| v != source).collect();
                receivers.sort_unstable();
                for v in receivers {
                    let now = arrival[&v];
                    let peer_arrivals: Vec<(NodeId, f64)> = self.states[v]
                        .peers
                        .iter()
                        .filter_map(|&p| arrival.get(&p).map(|&t| (p, t)))
                        .filter(|&(_, t)| t <= now)
                        .collect();
                    self.update_stats(v, &peer_arrivals, now);
                }
            }
        }
    }
}

/// Rank peer arrivals ascending by time; arrivals within `RANK_TIE_MS` of
/// their predecessor share its rank.
fn compute_ranks(peer_arrivals: &[(NodeId, f64)]) -> Vec<(NodeId, usize)> {
    let mut sorted: Vec<(NodeId, f64)> = peer_arrivals.to_vec();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let mut ranks = Vec::with_capacity(sorted.len());
    let mut current = 1;
    for (i, &(peer, t)) in sorted.iter().enumerate() {
        if i > 0 && t - sorted[i - 1].1 > RANK_TIE_MS {
            current = i + 1;
        }
        ranks.push((peer, current));
    }
    ranks
}

fn record_min(arrival: &mut HashMap<NodeId, f64>, node: NodeId, t: f64) {
    arrival
        .entry(node)
        .and_modify(|existing| {
            if t < *existing {
                *existing = t;
            }
        })
        .or_insert(t);
}

impl Algorithm for RelayStrategy {
    fn respond(&mut self, msg: &Message) -> Vec<NodeId> {
        let u = msg.dst;
        self.arrivals.entry(u).or_insert(msg.recv_time);

        // Learn from whichever of our peers the broadcast has already
        // reached inside the collection window.
        let peer_arrivals: Vec<(NodeId, f64)> = self.states[u]
            .peers
            .iter()
            .filter_map(|&p| self.arrivals.get(&p).map(|&t| (p, t)))
            .filter(|&(_, t)| t <= msg.recv_time && msg.recv_time - t <= ARRIVAL_WINDOW_MS)
            .collect();
        self.update_stats(u, &peer_arrivals, msg.recv_time);

        let sender = if msg.src == u { None } else { Some(msg.src) };
        self.select_relays(u, sender)
    }

    fn set_root(&mut self, root: NodeId) {
        self.tree_root = root;
        self.arrivals.clear();
        self.broadcast_seq += 1;
    }

    fn name(&self) -> String {
        "vivaldi_relay".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn grid(n: usize) -> Vec<GeoCoord> {
        (0..n)
            .map(|i| GeoCoord::new(((i % 6) * 10) as f64, ((i / 6) * 10) as f64))
            .collect()
    }

    fn quick(n: usize) -> RelayStrategy {
        let vcfg = VivaldiPlusPlusConfig::default();
        RelayStrategy::new(
            &grid(n),
            RelayConfig::default(),
            &vcfg,
            10,
            2,
            5,
            ChaCha8Rng::seed_from_u64(9),
        )
        .unwrap()
    }

    #[test]
    fn ranks_break_on_the_tie_window() {
        let arrivals = vec![(1, 0.0), (2, 5.0), (3, 40.0), (4, 41.0)];
        let ranks: HashMap<NodeId, usize> =
            compute_ranks(&arrivals).into_iter().collect();
        // 1 and 2 tie, 3 opens a new rank, 4 ties with 3.
        assert_eq!(ranks[&1], 1);
        assert_eq!(ranks[&2], 1);
        assert_eq!(ranks[&3], 3);
        assert_eq!(ranks[&4], 3);
    }

    #[test]
    fn ewmas_stay_in_unit_interval() {
        let mut strategy = quick(24);
        for u in 0..24 {
            let peers = strategy.peers_of(u).to_vec();
            for p in peers {
                let s = strategy.stats_of(u, p).unwrap();
                assert!((0.0..=1.0).contains(&s.earliness), "{}", s.earliness);
                assert!((0.0..=1.0).contains(&s.observability));
            }
        }
        // A burst of extreme updates cannot escape the interval.
        let arrivals: Vec<(NodeId, f64)> = strategy.peers_of(0)
            .iter()
            .enumerate()
            .map(|(i, &p)| (p, i as f64 * 50.0))
            .collect();
        for _ in 0..200 {
            strategy.update_stats(0, &arrivals, 1000.0);
        }
        for &(p, _) in &arrivals {
            let s = strategy.stats_of(0, p).unwrap();
            assert!((0.0..=1.0).contains(&s.earliness));
            assert!((0.0..=1.0).contains(&s.observability));
        }
    }

    #[test]
    fn selection_respects_cap_and_excludes_sender() {
        let mut strategy = quick(30);
        strategy.set_root(0);
        for u in 0..30 {
            let sender = strategy.peers_of(u).first().copied();
            let relays = strategy.select_relays(u, sender);
            assert!(relays.len() <= strategy.cfg.fanout_cap);
            if let Some(s) = sender {
                assert!(!relays.contains(&s));
            }
            let mut sorted = relays.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), relays.len(), "duplicate relay");
        }
    }

    #[test]
    fn foreign_clusters_get_their_quota() {
        let strategy = &mut quick(30);
        let u = 0;
        let relays = strategy.select_relays(u, None);
        let own = strategy.states[u].cluster;
        // Every foreign cluster with a candidate peer appears in the
        // selection, as long as the cap leaves room.
        let mut foreign_present: BTreeMap<usize, bool> = BTreeMap::new();
        for &p in strategy.peers_of(u) {
            let c = strategy.cluster_id[p];
            if c != own {
                foreign_present.insert(c, false);
            }
        }
        if relays.len() < strategy.cfg.fanout_cap {
            for &p in &relays {
                let c = strategy.cluster_id[p];
                if c != own {
                    foreign_present.insert(c, true);
                }
            }
            assert!(foreign_present.values().all(|&present| present));
        }
    }

    #[test]
    fn respond_marks_arrivals_and_forwards() {
        let mut strategy = quick(24);
        strategy.set_root(3);
        let relays = strategy.respond(&Message::new(3, 3, 3, 0, 0.0, 0.0));
        assert!(!relays.is_empty());
        assert!(strategy.arrivals.contains_key(&3));

        let v = relays[0];
        let relayed = strategy.respond(&Message::new(3, 3, v, 1, 100.0, 260.0));
        // The sender never reappears, and a node never relays to itself.
        assert!(!relayed.contains(&3));
        assert!(!relayed.contains(&v));
    }

    #[test]
    fn set_root_clears_broadcast_state() {
        let mut strategy = quick(24);
        strategy.set_root(0);
        strategy.respond(&Message::new(0, 0, 0, 0, 0.0, 0.0));
        assert!(!strategy.arrivals.is_empty());
        strategy.set_root(1);
        assert_eq!(strategy.root(), 1);
        assert!(strategy.arrivals.is_empty());
    }
}
