//! Per-broadcast result aggregation.
//!
//! A `TestResult` holds the metrics of one broadcast trial; the multi-root
//! driver sums trial results and averages them at the end. Nodes a trial
//! failed to cover are carried through the latency percentiles as the
//! `INF_LATENCY` sentinel, and the averaging step divides each percentile
//! slot by the number of runs that actually covered it.

use serde::Serialize;

use crate::NodeId;

/// Depth histogram range: depths `0..MAX_DEPTH`.
pub const MAX_DEPTH: usize = 40;

/// Sentinel latency for a node the broadcast never reached.
pub const INF_LATENCY: f64 = 1e8;

/// Number of latency percentile slots (5%, 10%, .., 100%).
pub const PERCENTILE_COUNT: usize = 20;

/// Metrics of one broadcast trial (or, after averaging, of a whole run).
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    /// Mean messages delivered per covered node; 1.0 means no redundancy.
    pub avg_bandwidth: f64,
    /// Mean first-reception latency over covered nodes, ms.
    pub avg_latency: f64,
    /// Order statistics of first-reception times at 5% steps, uncovered
    /// nodes included at `INF_LATENCY`.
    pub latency_percentiles: Vec<f64>,
    /// Fraction of the percentile population received at each depth.
    pub depth_cdf: Vec<f64>,
    /// Mean (recv_time - send_time) of first receptions, per depth.
    pub depth_avg_interval: Vec<f64>,
    /// Mean depth of covered nodes per cluster.
    pub cluster_avg_depth: Vec<f64>,
    /// Mean latency of covered nodes per cluster.
    pub cluster_avg_latency: Vec<f64>,
    /// `forward_tree[src]` lists the nodes whose first reception came
    /// from `src` (the successful forwarding edges of the trial).
    pub forward_tree: Vec<Vec<NodeId>>,
}

impl TestResult {
    pub fn new(n: usize, clusters: usize) -> Self {
        TestResult {
            avg_bandwidth: 0.0,
            avg_latency: 0.0,
            latency_percentiles: vec![0.0; PERCENTILE_COUNT],
            depth_cdf: vec![0.0; MAX_DEPTH],
            depth_avg_interval: vec![0.0; MAX_DEPTH],
            cluster_avg_depth: vec![0.0; clusters],
            cluster_avg_latency: vec![0.0; clusters],
            forward_tree: vec![Vec::new(); n],
        }
    }

    /// Mean depth implied by the depth distribution.
    pub fn avg_depth(&self) -> f64 {
        self.depth_cdf
            .iter()
            .enumerate()
            .map(|(d, &f)| d as f64 * f)
            .sum()
    }
}

/// Extract the percentile vector from receive times sorted ascending:
/// slot `s` holds the `⌊n·p⌋`-th order statistic for `p = (s+1)·0.05`.
pub fn percentiles_from_sorted(sorted_times: &[f64]) -> Vec<f64> {
    let n = sorted_times.len();
    let mut out = vec![0.0; PERCENTILE_COUNT];
    if n == 0 {
        return out;
    }
    for (slot, value) in out.iter_mut().enumerate() {
        let p = (slot + 1) as f64 * 0.05;
        let idx = ((n as f64 * p) as usize).min(n - 1);
        *value = sorted_times[idx];
    }
    out
}

/// Add one trial's metrics into an accumulator. The forwarding tree is
/// per-trial and is not accumulated.
pub fn accumulate(dst: &mut TestResult, src: &TestResult) {
    dst.avg_bandwidth += src.avg_bandwidth;
    dst.avg_latency += src.avg_latency;
    for (d, s) in dst
        .latency_percentiles
        .iter_mut()
        .zip(&src.latency_percentiles)
    {
        *d += s;
    }
    for (d, s) in dst.depth_cdf.iter_mut().zip(&src.depth_cdf) {
        *d += s;
    }
    for (d, s) in dst.depth_avg_interval.iter_mut().zip(&src.depth_avg_interval) {
        *d += s;
    }
    for (d, s) in dst.cluster_avg_depth.iter_mut().zip(&src.cluster_avg_depth) {
        *d += s;
    }
    for (d, s) in dst
        .cluster_avg_latency
        .iter_mut()
        .zip(&src.cluster_avg_latency)
    {
        *d += s;
    }
}

/// Average an accumulator over `runs` trials.
///
/// Percentile slots discount sentinel hits: a slot that was uncovered in
/// some runs divides by the covered-run count only, and a slot uncovered
/// in every run stays at the sentinel. Sentinel recovery relies on real
/// latencies being far below `INF_LATENCY`, which a simulated network
/// cannot reach.
pub fn average(result: &mut TestResult, runs: usize) {
    if runs == 0 {
        return;
    }
    let frun = runs as f64;

    result.avg_bandwidth /= frun;
    result.avg_latency /= frun;

    for slot in result.latency_percentiles.iter_mut() {
        let sentinel_hits = (*slot / INF_LATENCY) as usize;
        let covered = runs.saturating_sub(sentinel_hits);
        if covered == 0 {
            *slot = INF_LATENCY;
        } else {
            *slot = (*slot - sentinel_hits as f64 * INF_LATENCY) / covered as f64;
        }
    }

    for v in result.depth_cdf.iter_mut() {
        *v /= frun;
    }
    for v in result.depth_avg_interval.iter_mut() {
        *v /= frun;
    }
    for v in result.cluster_avg_depth.iter_mut() {
        *v /= frun;
    }
    for v in result.cluster_avg_latency.iter_mut() {
        *v /= frun;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_are_non_decreasing() {
        let times: Vec<f64> = (0..137).map(|i| (i * 7 % 1000) as f64).collect();
        let mut sorted = times.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p = percentiles_from_sorted(&sorted);
        assert_eq!(p.len(), PERCENTILE_COUNT);
        for w in p.windows(2) {
            assert!(w[0] <= w[1]);
        }
        // The last slot is the maximum.
        assert_eq!(p[PERCENTILE_COUNT - 1], *sorted.last().unwrap());
    }

    #[test]
    fn percentiles_of_single_element() {
        let p = percentiles_from_sorted(&[42.0]);
        assert!(p.iter().all(|&v| v == 42.0));
    }

    #[test]
    fn accumulate_then_average_recovers_the_mean() {
        let mut total = TestResult::new(4, 2);
        for latency in [100.0, 200.0, 300.0] {
            let mut one = TestResult::new(4, 2);
            one.avg_bandwidth = 1.5;
            one.avg_latency = latency;
            one.latency_percentiles = vec![latency; PERCENTILE_COUNT];
            one.depth_cdf[1] = 0.5;
            accumulate(&mut total, &one);
        }
        average(&mut total, 3);
        assert!((total.avg_bandwidth - 1.5).abs() < 1e-9);
        assert!((total.avg_latency - 200.0).abs() < 1e-9);
        assert!((total.latency_percentiles[0] - 200.0).abs() < 1e-9);
        assert!((total.depth_cdf[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn averaging_discounts_sentinel_runs() {
        let mut total = TestResult::new(2, 1);
        let mut covered = TestResult::new(2, 1);
        covered.latency_percentiles = vec![400.0; PERCENTILE_COUNT];
        let mut uncovered = TestResult::new(2, 1);
        uncovered.latency_percentiles = vec![INF_LATENCY; PERCENTILE_COUNT];

        accumulate(&mut total, &covered);
        accumulate(&mut total, &uncovered);
        accumulate(&mut total, &covered);
        average(&mut total, 3);

        // Two covered runs at 400 ms; the sentinel run is discounted.
        assert!((total.latency_percentiles[5] - 400.0).abs() < 1e-6);
    }

    #[test]
    fn slot_uncovered_in_every_run_stays_sentinel() {
        let mut total = TestResult::new(2, 1);
        for _ in 0..4 {
            let mut one = TestResult::new(2, 1);
            one.latency_percentiles = vec![INF_LATENCY; PERCENTILE_COUNT];
            accumulate(&mut total, &one);
        }
        average(&mut total, 4);
        assert!(total
            .latency_percentiles
            .iter()
            .all(|&v| v == INF_LATENCY));
    }

    #[test]
    fn zero_latency_survives_averaging() {
        let mut total = TestResult::new(1, 1);
        let mut one = TestResult::new(1, 1);
        one.latency_percentiles = vec![0.0; PERCENTILE_COUNT];
        accumulate(&mut total, &one);
        average(&mut total, 1);
        assert!(total.latency_percentiles.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn avg_depth_weights_the_distribution() {
        let mut r = TestResult::new(1, 1);
        r.depth_cdf[0] = 0.5;
        r.depth_cdf[2] = 0.5;
        assert!((r.avg_depth() - 1.0).abs() < 1e-9);
    }
}
