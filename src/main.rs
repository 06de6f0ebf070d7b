//! ulmfit-rs CLI: build a model and run one forward pass on random tokens

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use ulmfit_rs::{
    get_language_model, get_text_classifier, ArchConfig, ClassifierOptions, LmOptions,
    ModelRegistry,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Task {
    /// Language model: arch + tied linear decoder
    Lm,
    /// Text classifier: chunked encoder + pooling head
    Classifier,
}

#[derive(Parser)]
#[command(name = "ulmfit-rs")]
#[command(about = "Recurrent language models and text classifiers in Rust")]
#[command(version)]
struct Cli {
    /// Model to build
    #[arg(value_enum)]
    task: Task,

    /// Registered architecture name
    #[arg(short, long, default_value = "awd_lstm")]
    arch: String,

    /// Vocabulary size (ids 0 and 1 are reserved, 1 is padding)
    #[arg(long, default_value_t = 1000)]
    vocab_size: usize,

    /// Number of classes (classifier only)
    #[arg(long, default_value_t = 2)]
    n_class: usize,

    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    /// Tokens per row of the random batch
    #[arg(long, default_value_t = 140)]
    seq_len: usize,

    /// Chunk length for the classifier's sentence encoder
    #[arg(long, default_value_t = 70)]
    bptt: usize,

    /// Multiplier for every dropout probability
    #[arg(long, default_value_t = 1.0)]
    drop_mult: f64,

    /// JSON object of config overrides (replaces the LM config, merges into the classifier config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for the random token batch
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn random_tokens(cli: &Cli, device: &Device) -> Result<Tensor> {
    ensure!(cli.vocab_size > 2, "vocab size must leave room for non-pad tokens");
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let ids: Vec<u32> = (0..cli.batch_size * cli.seq_len)
        .map(|_| rng.gen_range(2..cli.vocab_size as u32))
        .collect();
    Ok(Tensor::from_vec(ids, (cli.batch_size, cli.seq_len), device)?)
}

fn print_groups(name: &str, groups: &[Vec<candle_core::Var>]) {
    println!("{name} parameter groups:");
    for (i, group) in groups.iter().enumerate() {
        let params: usize = group.iter().map(|v| v.elem_count()).sum();
        println!("  group {i}: {} tensors, {params} parameters", group.len());
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
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

    println!("=== ulmfit-rs ===");
    println!("Task:   {:?}", cli.task);
    println!("Arch:   {}", cli.arch);
    println!("Batch:  {} x {}", cli.batch_size, cli.seq_len);

    let overrides = cli
        .config
        .as_ref()
        .map(ArchConfig::from_json_file)
        .transpose()?;
    if let Some(path) = &cli.config {
        info!("Config overrides from {}", path.display());
    }

    let device = Device::Cpu;
    let registry = ModelRegistry::default();
    let meta = registry.meta(&cli.arch)?;
    let varmap = VarMap::new();
    let input = random_tokens(&cli, &device)?;

    match cli.task {
        Task::Lm => {
            let options = LmOptions {
                config: overrides,
                drop_mult: cli.drop_mult,
            };
            let mut model =
                get_language_model(&registry, &cli.arch, cli.vocab_size, &options, &varmap, &device)?;
            let out = model.forward(&input)?;
            println!("\nLogits: {:?}", out.output.dims());
            println!("Raw:    {:?}", out.raw.dims());
            print_groups("LM", &(meta.split_lm)(&varmap)?);
        }
        Task::Classifier => {
            let options = ClassifierOptions {
                seq_len: cli.bptt,
                config: overrides,
                drop_mult: cli.drop_mult,
                ..Default::default()
            };
            let mut model = get_text_classifier(
                &registry,
                &cli.arch,
                cli.vocab_size,
                cli.n_class,
                &options,
                &varmap,
                &device,
            )?;
            let chunks = model.encoder().chunk_plan(&input)?;
            info!(
                "{} chunks, {} retained",
                chunks.len(),
                chunks.iter().filter(|c| c.retained).count()
            );
            let out = model.forward(&input)?;
            println!("\nPredictions: {:?}", out.output.dims());
            println!("Encoded:     {:?}", out.raw.dims());
            print_groups("Classifier", &(meta.split_clas)(&varmap)?);
        }
    }

    Ok(())
}
