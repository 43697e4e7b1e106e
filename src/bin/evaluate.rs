//! Evaluate the models described in a JSON configuration on a CSV log.
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use failure::ResultExt;
use serde::Deserialize;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rankeval::datasets::{load_csv, write_results_csv};
use rankeval::evaluation::{EvaluationConfig, EvaluationPipeline};
use rankeval::models::{ModelSpec, RecommenderModel};

#[derive(Parser, Debug)]
#[command(name = "evaluate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Split an interaction log, fit models and score their recommendations")]
struct Args {
    /// CSV log with user_id, item_id, timestamp and an optional value column
    #[arg(short, long)]
    data: PathBuf,

    /// JSON evaluation configuration with a `models` list
    #[arg(short, long)]
    config: PathBuf,

    /// Write the result table to this CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Deserialize, Debug)]
struct RunConfig {
    #[serde(flatten)]
    evaluation: EvaluationConfig,
    models: Vec<ModelSpec>,
}

fn load_config(path: &PathBuf) -> Result<RunConfig, failure::Error> {
    let file = File::open(path).context("Failed to open configuration")?;
    let config = serde_json::from_reader(BufReader::new(file))
        .context("Failed to parse configuration")?;

    Ok(config)
}

fn main() -> Result<(), failure::Error> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = load_config(&args.config)?;

    info!("Loading interactions from {}", args.data.display());
    let start = Instant::now();
    let log = load_csv(&args.data)?;
    info!(
        interactions = log.len(),
        users = log.num_users(),
        items = log.num_items(),
        elapsed = ?start.elapsed(),
        "Loaded interactions"
    );

    let mut models = config
        .models
        .iter()
        .map(ModelSpec::build)
        .collect::<Result<Vec<Box<dyn RecommenderModel>>, _>>()?;

    let pipeline = EvaluationPipeline::new(config.evaluation);
    let table = pipeline.compare(&log, &mut models)?;

    print!("{}", table);

    if let Some(output) = args.output {
        write_results_csv(&output, &table)?;
        info!("Wrote results to {}", output.display());
    }

    Ok(())
}
