use anyhow::{Context, anyhow};
use chrono::Utc;
use clap::Parser;
use env_logger::Builder;
use log::{LevelFilter, info, warn};
use std::path::PathBuf;

use cdma_phy_simulator::common::config::PhyConfig;
use cdma_phy_simulator::common::scene::{build_simulation, load_scene};
use cdma_phy_simulator::simulation::log_capture::{self, TeeLogger};
use cdma_phy_simulator::simulation::stats::RunReport;

/// Discrete-event simulator of a CDMA physical layer.
#[derive(Parser, Debug)]
#[command(name = "cdma-phy-simulator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the scene JSON file
    scene: String,

    /// PHY configuration (TOML); defaults to `config.toml` beside the scene
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the JSON run report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

fn init_logging() -> anyhow::Result<()> {
    let logger = Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("cdma_phy_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .build();
    let tee = TeeLogger::new(logger);
    log::set_max_level(tee.filter());
    log::set_boxed_logger(Box::new(tee)).context("Failed to install logger")?;
    log_capture::init_log_capture();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging()?;
    let started_at = Utc::now();

    info!("Loading scene {}", args.scene);
    let scene = load_scene(&args.scene)?;

    let config_path = args.config.unwrap_or_else(|| PhyConfig::config_path_from_scene(&args.scene));
    let config = if config_path.exists() {
        PhyConfig::load(&config_path).map_err(|e| anyhow!(e))?
    } else {
        warn!("No config at {}, using defaults", config_path.display());
        PhyConfig::default()
    };

    let mut simulation = build_simulation(&scene, &config).context("Failed to build simulation")?;
    simulation.run_until(scene.duration()).context("Simulation aborted")?;
    let summary = simulation.finalize();

    let mut report = RunReport::new(started_at, summary.seed, summary.simulated_until, summary.events_processed);
    report.devices = summary.devices;
    report.apply_log_tallies(&log_capture::tally(&log_capture::drain_captured_logs()));

    let json = report.to_json().context("Failed to serialise report")?;
    match args.report {
        Some(path) => {
            std::fs::write(&path, json).with_context(|| format!("Failed to write report: {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
