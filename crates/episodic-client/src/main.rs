//! `episodic-client` binary

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use episodic_client::{prepare_output_dir, Config, Scheduler};
use episodic_plant::SimulatedPlant;

#[derive(Parser)]
#[command(name = "episodic-client")]
#[command(about = "Episodic model-based RL on a shared plant", version)]
struct Cli {
    /// Experiment configuration (TOML)
    config: PathBuf,

    /// Act with the learned policies only, no optimization
    #[arg(short, long)]
    playback: bool,

    /// Only run these tasks
    #[arg(short, long, num_args = 1..)]
    tasks: Vec<String>,

    /// Resume from the experience saved in the output directory
    #[arg(short = 'e', long)]
    load_experience: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let specs = config.select(&cli.tasks)?;
    if specs.is_empty() {
        bail!("no runnable tasks in {}", cli.config.display());
    }

    // playback acts with the saved policies
    let resume = cli.load_experience || cli.playback;
    let output_dir = config.output_directory.clone();
    prepare_output_dir(&output_dir, resume)
        .await
        .with_context(|| format!("preparing {}", output_dir.display()))?;

    let mut scheduler = Scheduler::new(
        Box::new(SimulatedPlant::default()),
        config.backends()?,
        config.scheduler.clone(),
        output_dir.clone(),
    );
    if cli.playback {
        scheduler = scheduler.playback();
    }
    for spec in specs {
        let task = Scheduler::load_task(spec, &output_dir, resume).await?;
        scheduler.add_task(task)?;
    }

    let summary = scheduler.run().await?;
    for status in &summary.tasks {
        tracing::info!(
            task = %status.name,
            state = %status.state,
            episodes = status.episodes,
            iterations = status.iterations,
            failures = status.failures,
            abandoned = status.abandoned,
            "final status"
        );
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
