use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::info;

use pomcp::experiment::{Experiment, ExperimentKind};

/// Influence-augmented online planning experiments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kind of experiment to run
    #[arg(value_enum)]
    experiment: ExperimentKind,

    /// Path to the experiment configuration file
    config: PathBuf,

    /// Directory where results, logs, and replays are written
    results: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.results)
        .with_context(|| format!("creating results directory {}", args.results.display()))?;

    info!("experiment: {:?}", args.experiment);
    info!("configuration: {}", args.config.display());
    info!("results: {}", args.results.display());

    let begin = Instant::now();
    let experiment = Experiment::new(&args.config, &args.results)
        .context("loading the experiment configuration")?;
    experiment
        .run(args.experiment)
        .context("running the experiment")?;

    info!("experiment finished in {:.2}s", begin.elapsed().as_secs_f64());
    Ok(())
}
