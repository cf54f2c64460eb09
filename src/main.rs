//! CLI Entry Point for sndaq
//!
//! Provides command-line interface for:
//! - Replaying archived scaler files through the burst search
//! - Inspecting record headers of an archive file
//! - Writing synthetic scaler archives for dry runs
//! - Printing the default configuration
//!
//! # Usage
//!
//! ```bash
//! sndaq replay --config sndaq.toml --detector modules.txt /data/sn/run_00131 --alerts alerts.jsonl
//! sndaq inspect sn_131_000001_0_999.dat --limit 5
//! sndaq simulate --output sn_1_000000_0_0.dat --detector-out modules.txt --step-at 600 --step-hz 185
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sndaq::config::SnConfig;
use sndaq::detector::DetectorModel;
use sndaq::logging::{self, OutputFormat, TracingConfig};
use sndaq::payload::{scan_archive_dir, PayloadReader, PayloadWriter, UTIME_PER_SECOND};
use sndaq::pipeline::Pipeline;
use sndaq::publish::{spawn_forwarder, AlertPublisher, AlertSink, JsonLinesSink, TracingSink};
use sndaq::simulate::{synthetic_detector, RateStep, SyntheticConfig, SyntheticStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "sndaq")]
#[command(about = "Supernova burst search over module scaler telemetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run archive files through the burst search
    Replay {
        /// Configuration file (TOML); defaults plus SNDAQ_ env vars if omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Detector module table
        #[arg(long)]
        detector: PathBuf,

        /// Archive files or directories, processed in (run, seq) order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Append alerts as JSON lines to this file instead of logging them
        #[arg(long)]
        alerts: Option<PathBuf>,
    },

    /// Print decoded record headers
    Inspect {
        /// Archive file
        file: PathBuf,

        /// Records to print
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Write a synthetic archive and matching detector table
    Simulate {
        /// Archive file to write
        #[arg(long)]
        output: PathBuf,

        /// Detector table to write
        #[arg(long)]
        detector_out: Option<PathBuf>,

        /// Number of modules
        #[arg(long, default_value = "3")]
        modules: usize,

        /// Background rate per module (Hz)
        #[arg(long, default_value = "800")]
        rate: f64,

        /// Stream length (s)
        #[arg(long, default_value = "900")]
        duration: f64,

        /// Time of a rate step (s from start)
        #[arg(long)]
        step_at: Option<f64>,

        /// Rate added per module at the step (Hz)
        #[arg(long, default_value = "0")]
        step_hz: f64,

        /// RNG seed
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Print the default configuration as TOML
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            config,
            detector,
            inputs,
            alerts,
        } => replay(config, detector, inputs, alerts).await,
        Commands::Inspect { file, limit } => {
            init_cli_logging()?;
            inspect(&file, limit)
        }
        Commands::Simulate {
            output,
            detector_out,
            modules,
            rate,
            duration,
            step_at,
            step_hz,
            seed,
        } => {
            init_cli_logging()?;
            let config = SyntheticConfig {
                step: step_at.map(|at| RateStep {
                    at: (at * UTIME_PER_SECOND as f64) as u64,
                    extra_hz: step_hz,
                }),
                seed,
                ..SyntheticConfig::flat(modules, rate, duration)
            };
            simulate(config, &output, detector_out.as_deref())
        }
        Commands::DefaultConfig => {
            println!("{}", SnConfig::default().to_toml()?);
            Ok(())
        }
    }
}

fn init_cli_logging() -> Result<()> {
    logging::init(TracingConfig::new(Level::INFO).with_format(OutputFormat::Compact))
        .map_err(anyhow::Error::msg)
}

/// Expand directories into their archive files; explicit files are kept as given.
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let found = scan_archive_dir(input)
                .with_context(|| format!("Failed to scan {}", input.display()))?;
            files.extend(found.into_iter().map(|(_, path)| path));
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

async fn replay(
    config_path: Option<PathBuf>,
    detector_path: PathBuf,
    inputs: Vec<PathBuf>,
    alerts: Option<PathBuf>,
) -> Result<()> {
    let config = match &config_path {
        Some(path) => SnConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SnConfig::load_env().context("Failed to load config from environment")?,
    };
    config.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let detector = Arc::new(
        DetectorModel::load(&detector_path)
            .with_context(|| format!("Failed to load detector table {}", detector_path.display()))?,
    );
    let files = collect_inputs(&inputs)?;
    info!(modules = detector.len(), files = files.len(), "Starting replay");

    let publisher = Arc::new(AlertPublisher::new(config.publish.queue_capacity));
    let sink: Arc<dyn AlertSink> = match &alerts {
        Some(path) => Arc::new(
            JsonLinesSink::open(path)
                .with_context(|| format!("Failed to open alert file {}", path.display()))?,
        ),
        None => Arc::new(TracingSink),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let forwarder = spawn_forwarder(publisher.clone(), sink, shutdown_rx);

    let mut pipeline = Pipeline::new(config, detector)?.with_publisher(publisher);
    for path in &files {
        let mut reader = PayloadReader::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        pipeline
            .replay(&mut reader)
            .await
            .with_context(|| format!("Replay of {} aborted", path.display()))?;
    }
    pipeline.finish()?;

    // The forwarder drains what is queued before it stops
    let _ = shutdown_tx.send(true);
    let delivered = forwarder.await.context("Alert forwarder failed")?;
    info!(delivered, "Alerts delivered");

    println!("{}", serde_json::to_string_pretty(&pipeline.counters())?);
    Ok(())
}

fn inspect(path: &Path, limit: usize) -> Result<()> {
    let reader =
        PayloadReader::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    for record in reader.take(limit) {
        let record = record?;
        println!(
            "module {:012x}  utime {:>20}  clock {:>15}  slots {:>5}  hits {:>6}",
            record.module_id,
            record.record_time,
            record.module_clock,
            record.scaler_counts.len(),
            record.hit_sum()
        );
    }
    Ok(())
}

fn simulate(config: SyntheticConfig, output: &Path, detector_out: Option<&Path>) -> Result<()> {
    if let Some(path) = detector_out {
        let detector = synthetic_detector(&config.module_ids)?;
        std::fs::write(path, detector.to_table())
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    let mut writer = PayloadWriter::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    for record in SyntheticStream::new(config) {
        writer.append(&record)?;
    }
    writer.flush()?;
    info!(
        records = writer.records_written(),
        bytes = writer.bytes_written(),
        path = %output.display(),
        "Synthetic archive written"
    );
    Ok(())
}
