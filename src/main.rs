//! Runs a Memory Transformer-XL over random tokens, threading memory between steps.
//!
//! Usage:
//!   mtxl --preset tiny --steps 4
//!   mtxl --config model.json --batch 2 --step-len 64 --json
//!   RUST_LOG=memory_transformer_xl=debug mtxl --preset small --save-config small.json

use std::{error::Error, path::PathBuf, time::Instant};

use burn::{config::Config, prelude::*, tensor::Distribution};
use clap::Parser;
use memory_transformer_xl::{DefaultBackend, Memory, MemoryTransformerXlConfig};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mtxl", about = "Memory Transformer-XL step runner")]
struct Args {
    /// JSON model configuration. Overrides --preset.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "tiny")]
    preset: String,

    #[arg(long, default_value = "256")]
    num_tokens: usize,

    #[arg(long, default_value = "4")]
    steps: usize,

    #[arg(long, default_value = "1")]
    batch: usize,

    /// Tokens per step. Defaults to the configured maximum.
    #[arg(long)]
    step_len: Option<usize>,

    /// Write the resolved configuration to this path.
    #[arg(long)]
    save_config: Option<PathBuf>,

    #[arg(long, default_value = "false")]
    json: bool,
}

#[derive(Serialize)]
struct StepReport {
    step: usize,
    batch: usize,
    step_len: usize,
    logits: [usize; 3],
    short_memory: [usize; 4],
    long_memory: [usize; 4],
    time_ms: f64,
}

fn make_config(args: &Args) -> Result<MemoryTransformerXlConfig, Box<dyn Error>> {
    if let Some(path) = &args.config {
        return Ok(MemoryTransformerXlConfig::load(path)?);
    }

    match args.preset.to_lowercase().as_str() {
        "tiny" => Ok(MemoryTransformerXlConfig::tiny(args.num_tokens)),
        "small" => Ok(MemoryTransformerXlConfig::small(args.num_tokens)),
        other => Err(format!("Unknown preset: {other}. Use: tiny, small").into()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = make_config(&args)?;

    if let Some(path) = &args.save_config {
        config.save(path)?;
        tracing::info!(path = %path.display(), "saved configuration");
    }

    let device = Default::default();
    let model = config.init::<DefaultBackend>(&device)?;
    let step_len = args.step_len.unwrap_or(config.seq_len);

    let mut memory: Option<Memory<DefaultBackend>> = None;
    for step in 0..args.steps {
        let tokens = Tensor::<DefaultBackend, 2, Int>::random(
            [args.batch, step_len],
            Distribution::Uniform(0.0, config.num_tokens as f64),
            &device,
        );

        let start = Instant::now();
        let (logits, next) = model.forward(tokens, memory.take(), None)?;
        DefaultBackend::sync(&device);
        let time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let report = StepReport {
            step,
            batch: args.batch,
            step_len,
            logits: logits.dims(),
            short_memory: next.short.dims(),
            long_memory: next.long.dims(),
            time_ms,
        };

        if args.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!(
                "step {step}: logits {:?}, short memory {:?}, long memory {:?} in {time_ms:.2}ms",
                report.logits, report.short_memory, report.long_memory
            );
        }

        memory = Some(next);
    }

    Ok(())
}
