//! Head Sparsification Sweep
//!
//! Measures how far keeping only the top-k heads per token moves the
//! next-token distribution away from full attention, then records one layer's
//! decode-phase attention during a short sparsified generation.
//!
//! Usage:
//!   cargo run --release --example head_sweep
//!   cargo run --release --example head_sweep -- --model "meta-llama/Llama-3.2-1B" --metric entropy
//!   cargo run --release --example head_sweep -- --layer 4 --save recordings/decode.safetensors

use anyhow::Result;
use clap::Parser;
use ship_rs::{kl_divergence, HeadMetric, Phase, RecordSite, RetentionPolicy, ShipModel};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "head_sweep")]
#[command(about = "KL divergence from full attention as a function of kept heads")]
struct Args {
    /// HuggingFace model ID
    #[arg(short, long, default_value = "Qwen/Qwen2.5-0.5B-Instruct")]
    model: String,

    /// Use CPU instead of CUDA
    #[arg(long)]
    cpu: bool,

    /// Head score: l2 or entropy
    #[arg(long, default_value = "l2")]
    metric: HeadMetric,

    /// Heads kept per token (default: 0, 1, 2, 4, ... up to all heads)
    #[arg(short, long, value_delimiter = ',')]
    k: Vec<i64>,

    /// Layer whose decode attention is recorded
    #[arg(long, default_value_t = 0)]
    layer: usize,

    /// Tokens generated in the recording pass
    #[arg(long, default_value_t = 8)]
    max_tokens: usize,

    /// Write the decode recording to this safetensors file
    #[arg(long)]
    save: Option<PathBuf>,
}

const PROMPT: &str = "The capital of France is Paris. The capital of Germany is Berlin. \
                      The capital of Italy is";

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    println!("=== Head Sparsification Sweep ===\n");
    println!("Loading {}...", args.model);
    let mut model = ShipModel::from_pretrained_with_device(&args.model, args.cpu)?;
    let n_heads = model.n_heads();
    println!(
        "Model loaded: {} layers, {} heads\n",
        model.n_layers(),
        n_heads
    );

    let k_values = if args.k.is_empty() {
        default_k_values(n_heads)
    } else {
        args.k.clone()
    };

    let baseline = model.next_token_logits(PROMPT)?;
    println!("Metric: {}  (prefill sparsification on)\n", args.metric);
    println!("{:>6}  {:>10}", "k", "KL(full||k)");
    for &k in &k_values {
        model.enable_head_sparsification(k, args.metric, true)?;
        let logits = model.next_token_logits(PROMPT)?;
        println!("{k:>6}  {:>10.5}", kl_divergence(&baseline, &logits)?);
    }
    model.disable_head_sparsification();

    // Decode-only sparsification with the smallest nonzero k
    let k = k_values.iter().copied().find(|&k| k > 0).unwrap_or(1);
    model.enable_head_sparsification(k, args.metric, false)?;
    model.attach_recorder(args.layer, RecordSite::AttnWeights, RetentionPolicy::All)?;

    let stop_tokens = model.stop_token_ids();
    let result = model.generate_with_details(PROMPT, args.max_tokens, 0.0, &stop_tokens)?;
    println!("\nGeneration with k={k} during decode: {:?}", result.generated_text);

    match &args.save {
        Some(path) => {
            let n = model.save_recordings(Phase::Decode, path)?;
            println!("Saved {n} decode tensors to {}", path.display());
        }
        None => {
            if let Some(recorded) =
                model.read_recording(args.layer, RecordSite::AttnWeights, Phase::Decode)?
            {
                println!(
                    "Layer {} recorded {} decode steps, first {:?}",
                    args.layer,
                    recorded.len(),
                    recorded.into_tensors().first().map(|t| t.dims().to_vec())
                );
            }
        }
    }

    Ok(())
}

/// 0, then powers of two, then all heads
fn default_k_values(n_heads: usize) -> Vec<i64> {
    let mut ks = vec![0];
    let mut k = 1;
    while k < n_heads {
        ks.push(k as i64);
        k *= 2;
    }
    ks.push(n_heads as i64);
    ks
}
