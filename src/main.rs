use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use geocast::algo::relay::{RelayConfig, RelayStrategy};
use geocast::algo::{Algorithm, BlockP2p, Eth, Kadcast, Mercator, RandomFlood};
use geocast::cluster::kmeans_geo;
use geocast::config::{AlgorithmKind, AttackConfig, KademliaParams, MercatorParams, SimConfig};
use geocast::dataset::read_coordinates;
use geocast::sim::{generate_fake_coords, run_simulation};
use geocast::vivaldi::{self, VivaldiOptions};
use geocast::vivaldi_pp::{self, VivaldiPlusPlusConfig};
use geocast::{report, GeoCoord};

/// Discrete-event simulator for geographically-aware broadcast overlays.
#[derive(Debug, Parser)]
#[command(name = "geocast", version)]
struct Cli {
    /// Coordinate dataset: line 1 the node count, then one "lat lon" pair
    /// per line.
    coords: PathBuf,

    /// Overlay algorithm to simulate.
    #[arg(long, value_enum, default_value = "mercator")]
    algorithm: AlgorithmKind,

    /// Directory the CSV result files are appended under.
    #[arg(long, default_value = "results")]
    out_dir: PathBuf,

    /// Learning rounds for virtual-coordinate overlays.
    #[arg(long, default_value_t = 100)]
    vivaldi_rounds: usize,

    /// Warmup sweeps for the relay overlay.
    #[arg(long, default_value_t = 100)]
    warmup_rounds: usize,

    /// Synthetic transactions per warmup sweep.
    #[arg(long, default_value_t = 200)]
    warmup_txs: usize,

    /// Compare plain and two-phase coordinate learning on this dataset,
    /// report both embeddings' accuracy, and exit.
    #[arg(long)]
    compare_vivaldi: bool,

    /// Per-node flood fan-out of the random baseline.
    #[arg(long, default_value_t = 8)]
    random_fanout: usize,

    #[command(flatten)]
    sim: SimConfig,

    #[command(flatten)]
    attack: AttackConfig,

    #[command(flatten)]
    mercator: MercatorParams,

    #[command(flatten)]
    kademlia: KademliaParams,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("geocast broadcast simulator");

    let mut coords = read_coordinates(&cli.coords)
        .with_context(|| format!("loading {}", cli.coords.display()))?;
    if coords.len() > cli.sim.max_nodes {
        info!(
            loaded = coords.len(),
            cap = cli.sim.max_nodes,
            "truncating dataset to the node cap"
        );
        coords.truncate(cli.sim.max_nodes);
    }
    let n = coords.len();
    anyhow::ensure!(n > 0, "dataset holds no nodes");

    if cli.compare_vivaldi {
        return compare_vivaldi(&coords, cli.vivaldi_rounds, cli.sim.random_seed);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(cli.sim.random_seed);

    let clusters = kmeans_geo(&coords, cli.sim.k_clusters.min(n), 100, &mut rng)
        .context("clustering the dataset")?;

    // Overlays route by what nodes claim; liars claim somewhere else.
    let display_coords = if cli.attack.fake_coord_ratio > 0.0 {
        let (fake, flags) = generate_fake_coords(
            &coords,
            cli.attack.fake_coord_ratio,
            cli.attack.fake_coord_offset_deg,
            &mut rng,
        );
        info!(
            liars = flags.iter().filter(|&&f| f).count(),
            "applied fake coordinates"
        );
        fake
    } else {
        coords.clone()
    };

    let mut algo: Box<dyn Algorithm> = match cli.algorithm {
        AlgorithmKind::Mercator => Box::new(
            Mercator::new(coords.clone(), display_coords, cli.mercator.clone())
                .context("building the mercator overlay")?,
        ),
        AlgorithmKind::Random => Box::new(RandomFlood::new(
            n,
            cli.random_fanout,
            cli.sim.root_fanout,
            ChaCha8Rng::seed_from_u64(cli.sim.random_seed),
        )),
        AlgorithmKind::Blockp2p => Box::new(BlockP2p::new(n, &clusters)),
        AlgorithmKind::Kadcast => Box::new(
            Kadcast::new(
                n,
                cli.kademlia.clone(),
                ChaCha8Rng::seed_from_u64(cli.sim.random_seed),
            )
            .context("building the kadcast overlay")?,
        ),
        AlgorithmKind::Eth => Box::new(
            Eth::new(
                n,
                cli.kademlia.clone(),
                ChaCha8Rng::seed_from_u64(cli.sim.random_seed),
            )
            .context("building the eth overlay")?,
        ),
        AlgorithmKind::Relay => Box::new(
            RelayStrategy::new(
                &coords,
                RelayConfig::default(),
                &VivaldiPlusPlusConfig::default(),
                cli.vivaldi_rounds,
                cli.warmup_rounds,
                cli.warmup_txs,
                ChaCha8Rng::seed_from_u64(cli.sim.random_seed),
            )
            .context("building the relay overlay")?,
        ),
    };

    std::fs::create_dir_all(&cli.out_dir)
        .with_context(|| format!("creating {}", cli.out_dir.display()))?;
    let mut tree_writer = report::ForwardTreeWriter::create(&cli.out_dir.join("forward_tree.csv"))
        .context("opening the forwarding-tree file")?;

    info!(algorithm = %algo.name(), n, "starting simulation");
    let result = run_simulation(
        algo.as_mut(),
        &coords,
        &cli.attack,
        &cli.sim,
        Some(&clusters),
        Some(&mut tree_writer),
    );

    let name = algo.name();
    report::write_summary(
        &cli.out_dir.join("sim_summary.csv"),
        &name,
        n,
        cli.attack.malicious_ratio,
        &result,
    )
    .context("writing the summary file")?;
    report::write_depth_profile(&cli.out_dir.join("depth_profile.csv"), &name, &result)
        .context("writing the depth profile")?;
    report::write_cluster_stats(&cli.out_dir.join("cluster_stats.csv"), &name, &result)
        .context("writing the cluster statistics")?;

    info!(
        algorithm = %name,
        bandwidth = result.avg_bandwidth,
        avg_latency_ms = result.avg_latency,
        avg_depth = result.avg_depth(),
        out_dir = %cli.out_dir.display(),
        "simulation complete"
    );
    Ok(())
}

/// Learn both embeddings over the same ground truth and report how well
/// each predicts pairwise RTTs.
fn compare_vivaldi(coords: &[GeoCoord], rounds: usize, seed: u64) -> anyhow::Result<()> {
    let samples = (coords.len() * coords.len() / 10).clamp(10, 1000);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let opts = VivaldiOptions {
        rounds,
        ..VivaldiOptions::default()
    };
    let plain = vivaldi::learn_coordinates(coords, &opts, &mut rng);
    let plain_quality = vivaldi::evaluate_quality(coords, &plain, samples, &mut rng);
    info!(
        mean_rel_error = plain_quality.mean_relative_error,
        max_rel_error = plain_quality.max_relative_error,
        samples = plain_quality.samples,
        "plain vivaldi embedding"
    );

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let cfg = VivaldiPlusPlusConfig::default();
    let two_phase = vivaldi_pp::learn_coordinates_pp(coords, rounds, &cfg, &mut rng);
    let two_phase_quality = vivaldi::evaluate_quality(coords, &two_phase, samples, &mut rng);
    info!(
        mean_rel_error = two_phase_quality.mean_relative_error,
        max_rel_error = two_phase_quality.max_relative_error,
        samples = two_phase_quality.samples,
        "two-phase vivaldi embedding"
    );

    Ok(())
}
