//! tinyinfer CLI - run LLaMA2 float32 checkpoints from the command line
//!
//! # Commands
//!
//! - `generate` - Continue a prompt with a checkpoint and tokenizer
//! - `info` - Print a checkpoint's hyperparameters as JSON

use std::{
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use tinyinfer::{
    error::{InferError, Result},
    generate::{generate, GenerationConfig, Sampler},
    tokenizer::Tokenizer,
    Checkpoint, Model,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// tinyinfer - single-sequence LLaMA2 inference in pure Rust
#[derive(Parser)]
#[command(name = "tinyinfer")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text from a prompt
    ///
    /// Examples:
    ///   tinyinfer generate stories15M.bin
    ///   tinyinfer generate stories15M.bin -t 0.8 -n 128 -i "Once upon a time"
    Generate {
        /// Checkpoint file
        #[arg(value_name = "CHECKPOINT")]
        checkpoint: PathBuf,

        /// Tokenizer file
        #[arg(short = 'z', long, default_value = "tokenizer.bin")]
        tokenizer: PathBuf,

        /// Sampling temperature (0.0 = greedy)
        #[arg(short, long, default_value = "1.0")]
        temperature: f32,

        /// Top-p mass for nucleus sampling (1.0 = off)
        #[arg(short = 'p', long, default_value = "0.9")]
        topp: f32,

        /// RNG seed (0 = random)
        #[arg(short, long, default_value = "0")]
        seed: u64,

        /// Number of steps, prompt included (0 = context length)
        #[arg(short = 'n', long, default_value = "256")]
        steps: usize,

        /// Prompt text
        #[arg(short = 'i', long, default_value = "Once upon a time")]
        prompt: String,
    },
    /// Show checkpoint hyperparameters
    Info {
        /// Checkpoint file
        #[arg(value_name = "CHECKPOINT")]
        checkpoint: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Generate {
            checkpoint,
            tokenizer,
            temperature,
            topp,
            seed,
            steps,
            prompt,
        } => {
            let config = GenerationConfig {
                temperature,
                topp,
                steps,
                seed: if seed == 0 { rand::random::<u64>() | 1 } else { seed },
            };
            run_generate(&checkpoint, &tokenizer, &config, &prompt)?;
        },
        Commands::Info { checkpoint } => {
            let checkpoint = Checkpoint::open(&checkpoint)?;
            let json = serde_json::json!({
                "config": checkpoint.config(),
                "shared_weights": checkpoint.shared_weights(),
                "head_size": checkpoint.config().head_size(),
                "kv_dim": checkpoint.config().kv_dim(),
                "weights": checkpoint.weights().len(),
            });
            let text = serde_json::to_string_pretty(&json).map_err(|e| InferError::FormatError {
                reason: format!("Failed to serialize config: {e}"),
            })?;
            println!("{text}");
        },
    }

    Ok(())
}

fn run_generate(
    checkpoint_path: &Path,
    tokenizer_path: &Path,
    config: &GenerationConfig,
    prompt: &str,
) -> Result<()> {
    config.validate()?;

    let checkpoint = Checkpoint::open(checkpoint_path)?;
    let model = Model::from_checkpoint(&checkpoint)?;
    let vocab_size = model.config().vocab_size;
    let tokenizer = Tokenizer::from_file(tokenizer_path, vocab_size)?;
    let mut sampler = Sampler::from_config(vocab_size, config)?;
    info!(seed = config.seed, ?config, "Sampler ready");

    let mut stdout = io::stdout().lock();
    let stats = generate(&model, &tokenizer, &mut sampler, prompt, config.steps, &mut stdout)?;
    writeln!(stdout)?;

    if let Some(tok_s) = stats.tokens_per_second() {
        eprintln!("achieved tok/s: {tok_s:.6}");
    }
    Ok(())
}
