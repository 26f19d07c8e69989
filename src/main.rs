//! ship-rs CLI: Needle-In-A-Haystack under attention head sparsification

use anyhow::Result;
use clap::Parser;
use ship_rs::niah::{self, NiahConfig, Stage};
use ship_rs::{load_tokenizer, ShipModel};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "ship-rs")]
#[command(about = "Sparse Head Inference Probing: NIAH benchmark with top-k head sparsification")]
#[command(version)]
struct Cli {
    /// Benchmark config (JSON)
    config: PathBuf,

    /// Build prompts.json from the haystack
    #[arg(long)]
    prompt: bool,

    /// Generate predictions for every run
    #[arg(long)]
    pred: bool,

    /// Score predictions into results.json
    #[arg(long)]
    eval: bool,

    /// Render score heatmaps
    #[arg(long)]
    vis: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Selected stages in pipeline order; none selected means all
    fn stages(&self) -> Vec<Stage> {
        let selected: Vec<Stage> = [
            (self.prompt, Stage::Prompt),
            (self.pred, Stage::Pred),
            (self.eval, Stage::Eval),
            (self.vis, Stage::Vis),
        ]
        .into_iter()
        .filter_map(|(on, stage)| on.then_some(stage))
        .collect();
        if selected.is_empty() {
            Stage::ALL.to_vec()
        } else {
            selected
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = NiahConfig::load(&cli.config)?;
    let stages = cli.stages();

    println!("=== ship-rs: Needle In A Haystack ===");
    println!("Model:  {}", config.model);
    println!("Task:   {}", config.task);
    println!("Output: {}", config.output_dir.display());
    println!("Stages: {stages:?}");
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    for stage in stages {
        match stage {
            Stage::Prompt => {
                info!("Running prompt stage...");
                let tokenizer = load_tokenizer(&config.model)?;
                niah::run_prompts(&config, &tokenizer)?;
            }
            Stage::Pred => {
                info!("Running pred stage...");
                let mut model = ShipModel::from_pretrained_with_device(&config.model, cli.cpu)?;
                info!(
                    "Model: {} layers, {} heads, {} hidden",
                    model.n_layers(),
                    model.n_heads(),
                    model.d_model()
                );
                niah::run_predictions(&config, &mut model)?;
            }
            Stage::Eval => {
                info!("Running eval stage...");
                let results = niah::run_eval(&config)?;
                if let Some(runs) = results.get(&config.task) {
                    println!("\n=== Results: {} ===", config.task);
                    for (run, scores) in runs {
                        println!("{run:>8}: {:.3}", scores.mean);
                    }
                }
            }
            Stage::Vis => {
                info!("Running vis stage...");
                for (_, map) in niah::run_vis(&config)? {
                    println!("\n{map}");
                }
            }
        }
    }

    info!("NIAH workflow completed");
    Ok(())
}
