//! xbench CLI
//!
//! Launches one node of a vendor benchmark case and reports its throughput.

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use xbench_config::{EffectiveConfig, ModelConstants};
use xbench_harness::{
    job::run_job,
    metrics::{self, ThroughputParams},
    reconcile,
    runner::Launcher,
    spec::JobSpec,
};

#[derive(Parser)]
#[command(name = "xbench", about = "Vendor-neutral training benchmark launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile config, run this node's training process, and report metrics
    Launch {
        #[command(flatten)]
        spec: JobSpec,
    },

    /// Merge a vendor config onto a base config
    Merge {
        /// Base config (JSON or TOML)
        #[arg(long)]
        base: PathBuf,

        /// Vendor override (JSON or TOML)
        #[arg(long)]
        vendor: PathBuf,

        /// Where to write the merged JSON
        #[arg(long)]
        out: PathBuf,
    },

    /// Extract step metrics from an existing training log
    Extract {
        /// Training log to scan
        #[arg(long)]
        log: PathBuf,

        /// Effective config holding the model constants
        #[arg(long)]
        config: PathBuf,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        nnodes: u32,

        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        nproc: u32,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber the spinner
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Launch { spec } => {
            tracing::info!(
                vendor = %spec.vendor,
                case = %spec.case_name,
                round = spec.round,
                node_rank = spec.node_rank,
                "Starting {} benchmark for {}",
                spec.framework,
                spec.model_name
            );

            let launcher = Launcher::new(format!("rank{}", spec.node_rank));
            let outcome = run_job(&spec, &launcher).await?;

            return Ok(ExitCode::from(outcome.process_exit_code()));
        }

        Commands::Merge { base, vendor, out } => {
            let merged = reconcile::merge_files(&base, &vendor)?;
            reconcile::write_effective(&merged, &out)?;
            println!("{}", out.display());
        }

        Commands::Extract {
            log,
            config,
            nnodes,
            nproc,
        } => {
            let constants = ModelConstants::from_config(&EffectiveConfig::load(&config)?)?;
            let params = ThroughputParams::new(&constants, nnodes * nproc);
            let step_metrics = metrics::extract(&log, &params);
            println!("{}", serde_json::to_string_pretty(&step_metrics)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
