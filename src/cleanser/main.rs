use anyhow::{Context, Result};
use clap::Parser;
use linework::memory_iter::SystemHeapGauge;
use linework::store::geojson_io;
use linework::{CancelToken, CleanseConfig, LogProgress, Pipeline};
use log::info;
use std::path::PathBuf;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Clean up the topology of a line network", long_about = None)]
struct Args {
    /// GeoJSON FeatureCollection of LineString / MultiLineString features
    input: PathBuf,

    /// Where to write the cleaned FeatureCollection
    output: PathBuf,

    /// JSON config file; missing fields take their defaults
    #[arg(long, env = "CLEANSE_CONFIG")]
    config: Option<PathBuf>,

    /// Write the per-stage report as JSON
    #[arg(long, env = "CLEANSE_REPORT")]
    report: Option<PathBuf>,

    #[arg(long)]
    min_length: Option<f64>,

    /// Pseudo-node intersection tolerance (0 = exact)
    #[arg(long)]
    intersection_tolerance: Option<f64>,

    #[arg(long)]
    simplify_tolerance: Option<f64>,

    /// Cycles shorter than this are removed; negative removes all
    #[arg(long, allow_hyphen_values = true)]
    cycle_length: Option<f64>,

    #[arg(long)]
    node_tolerance: Option<f64>,

    /// Maximum envelope area of an end-node cluster that may be snapped
    #[arg(long)]
    cluster_area: Option<f64>,

    /// Also remove near-duplicate lines after the standard stages
    #[arg(long, env = "CLEANSE_SIMILAR_LINES")]
    similar_lines: bool,

    /// Restart iteration when available memory falls below this many MiB
    #[arg(long, env = "CLEANSE_MEMORY_FLOOR_MB")]
    memory_floor_mb: Option<u64>,
}

impl Args {
    fn apply_overrides(&self, config: &mut CleanseConfig) {
        if let Some(v) = self.min_length {
            config.min_length.min_length = v;
        }
        if let Some(v) = self.intersection_tolerance {
            config.pseudo_nodes.intersection_tolerance = v;
        }
        if let Some(v) = self.simplify_tolerance {
            config.simplify.distance_tolerance = v;
        }
        if let Some(v) = self.cycle_length {
            config.cycles.length_tolerance = v;
        }
        if let Some(v) = self.node_tolerance {
            config.node_insertion.distance_tolerance = v;
            config.end_nodes.distance_tolerance = v;
        }
        if let Some(v) = self.cluster_area {
            config.end_nodes.area_tolerance = v;
        }
        if self.similar_lines {
            config.similar_lines.enabled = true;
        }
        if let Some(mb) = self.memory_floor_mb {
            config.memory.floor_bytes = mb.saturating_mul(1024 * 1024);
        }
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CleanseConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CleanseConfig::default(),
    };
    args.apply_overrides(&mut config);
    let pipeline = Pipeline::new(config).context("Invalid configuration")?;

    info!("Loading {}", args.input.display());
    let mut store = geojson_io::load_geojson_file(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    info!("Loaded {} line features", store.len());

    let token = CancelToken::new();
    let gauge = SystemHeapGauge::new();
    let mut progress = LogProgress::default();
    let report = pipeline.run(&mut store, &mut progress, &token, &gauge)?;

    geojson_io::save_geojson_file(&store, &args.output)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    info!("Wrote {} features to {}", store.len(), args.output.display());

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Wrote report to {}", path.display());
    }

    for stage in &report.stages {
        println!("{}", stage.summary());
    }
    println!(
        "{} features remain; {} flagged for review",
        store.len(),
        report.flagged()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_reach_the_config() {
        let args = Args::parse_from(["cleanser", "in.geojson", "out.geojson", "--cycle-length", "-1", "--node-tolerance", "2.5"]);
        let mut config = CleanseConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.cycles.length_tolerance, -1.0);
        assert_eq!(config.node_insertion.distance_tolerance, 2.5);
        assert_eq!(config.end_nodes.distance_tolerance, 2.5);
    }

    #[test]
    fn huge_memory_floor_saturates() {
        let max = u64::MAX.to_string();
        let args = Args::parse_from(["cleanser", "in.geojson", "out.geojson", "--memory-floor-mb", max.as_str()]);
        let mut config = CleanseConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.memory.floor_bytes, u64::MAX);
    }
}
