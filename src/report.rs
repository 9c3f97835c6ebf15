//! CSV result files.
//!
//! One file per metric family, append-friendly so parameter sweeps
//! accumulate rows across invocations. A header row is written only when
//! a file is created fresh.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::stats::TestResult;
use crate::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

/// Open `path` for appending. Returns the writer and whether the file is
/// brand new (and so still needs a header).
fn appender(path: &Path) -> Result<(csv::Writer<File>, bool), ReportError> {
    let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    Ok((writer, fresh))
}

/// Append one summary row: run identity, bandwidth, latency aggregates,
/// and the 20 latency percentiles.
pub fn write_summary(
    path: &Path,
    algorithm: &str,
    nodes: usize,
    malicious_ratio: f64,
    result: &TestResult,
) -> Result<(), ReportError> {
    let (mut writer, fresh) = appender(path)?;
    if fresh {
        let mut header = vec![
            "algorithm".to_owned(),
            "nodes".to_owned(),
            "malicious_ratio".to_owned(),
            "bandwidth".to_owned(),
            "avg_latency".to_owned(),
            "avg_depth".to_owned(),
        ];
        for slot in 0..result.latency_percentiles.len() {
            header.push(format!("p{:02}", (slot + 1) * 5));
        }
        writer.write_record(&header)?;
    }

    let mut row = vec![
        algorithm.to_owned(),
        nodes.to_string(),
        format!("{malicious_ratio:.2}"),
        format!("{:.4}", result.avg_bandwidth),
        format!("{:.2}", result.avg_latency),
        format!("{:.2}", result.avg_depth()),
    ];
    for &p in &result.latency_percentiles {
        row.push(format!("{p:.2}"));
    }
    writer.write_record(&row)?;
    writer.flush()?;
    Ok(())
}

/// Append the per-depth distribution: one row per depth level.
pub fn write_depth_profile(
    path: &Path,
    algorithm: &str,
    result: &TestResult,
) -> Result<(), ReportError> {
    let (mut writer, fresh) = appender(path)?;
    if fresh {
        writer.write_record(["algorithm", "depth", "cdf", "avg_interval_ms"])?;
    }
    for (depth, (&cdf, &interval)) in result
        .depth_cdf
        .iter()
        .zip(&result.depth_avg_interval)
        .enumerate()
    {
        writer.write_record([
            algorithm.to_owned(),
            depth.to_string(),
            format!("{cdf:.6}"),
            format!("{interval:.2}"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Append per-cluster averages: one row per cluster.
pub fn write_cluster_stats(
    path: &Path,
    algorithm: &str,
    result: &TestResult,
) -> Result<(), ReportError> {
    let (mut writer, fresh) = appender(path)?;
    if fresh {
        writer.write_record(["algorithm", "cluster", "avg_depth", "avg_latency_ms"])?;
    }
    for (cluster, (&depth, &latency)) in result
        .cluster_avg_depth
        .iter()
        .zip(&result.cluster_avg_latency)
        .enumerate()
    {
        writer.write_record([
            algorithm.to_owned(),
            cluster.to_string(),
            format!("{depth:.2}"),
            format!("{latency:.2}"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Streaming writer for per-trial forwarding trees: one row per node that
/// successfully delivered to at least one child, children joined by `|`.
pub struct ForwardTreeWriter {
    writer: csv::Writer<File>,
}

impl ForwardTreeWriter {
    pub fn create(path: &Path) -> Result<Self, ReportError> {
        let (mut writer, fresh) = appender(path)?;
        if fresh {
            writer.write_record(["root", "src", "num_children", "children"])?;
        }
        Ok(ForwardTreeWriter { writer })
    }

    pub fn write_run(
        &mut self,
        root: NodeId,
        forward_tree: &[Vec<NodeId>],
    ) -> Result<(), ReportError> {
        for (src, children) in forward_tree.iter().enumerate() {
            if children.is_empty() {
                continue;
            }
            let joined = children
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("|");
            self.writer.write_record([
                &root.to_string(),
                &src.to_string(),
                &children.len().to_string(),
                &joined,
            ])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::PERCENTILE_COUNT;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("geocast-report-{tag}-{}.csv", std::process::id()))
    }

    fn sample_result() -> TestResult {
        let mut r = TestResult::new(4, 2);
        r.avg_bandwidth = 1.25;
        r.avg_latency = 321.5;
        r.latency_percentiles = (0..PERCENTILE_COUNT).map(|i| i as f64 * 10.0).collect();
        r.depth_cdf[0] = 0.25;
        r.depth_cdf[1] = 0.75;
        r.forward_tree[0] = vec![1, 2];
        r.forward_tree[2] = vec![3];
        r
    }

    #[test]
    fn summary_appends_rows_without_repeating_headers() {
        let path = temp_path("summary");
        let _ = std::fs::remove_file(&path);

        write_summary(&path, "mercator", 4, 0.0, &sample_result()).unwrap();
        write_summary(&path, "random_flood", 4, 0.1, &sample_result()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("algorithm,nodes"));
        assert!(lines[1].starts_with("mercator,4,"));
        assert!(lines[2].starts_with("random_flood,4,"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn depth_profile_writes_one_row_per_depth() {
        let path = temp_path("depth");
        let _ = std::fs::remove_file(&path);
        write_depth_profile(&path, "mercator", &sample_result()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        // Header plus one row per depth bucket.
        assert_eq!(content.lines().count(), 1 + crate::stats::MAX_DEPTH);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn forward_tree_rows_skip_childless_nodes() {
        let path = temp_path("tree");
        let _ = std::fs::remove_file(&path);
        let mut writer = ForwardTreeWriter::create(&path).unwrap();
        writer.write_run(0, &sample_result().forward_tree).unwrap();
        drop(writer);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "0,0,2,1|2");
        assert_eq!(lines[2], "0,2,1,3");
        let _ = std::fs::remove_file(&path);
    }
}
