use clap::Parser;
use log::{error, info, LevelFilter};
use nnif_rs::logging::init_logging;
use nnif_rs::{
    AttackKind, FsStore, InMemoryFeeder, NNIFError, Pipeline, Result, RunConfig, Selection, SetKind,
    SoftmaxClassifier,
};
use std::path::PathBuf;
use std::process;

const CHECKPOINT_FILE: &str = "best_model.json";
const DATASET_FILE: &str = "dataset.json";

#[derive(Parser)]
#[command(name = "nnif", about = "Influence vs. nearest-neighbor forensics of adversarial examples")]
#[command(version)]
struct Cli {
    /// JSON run configuration; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset identifier
    #[arg(short, long)]
    dataset: Option<String>,

    /// Evaluation set: val or test
    #[arg(short, long)]
    set: Option<SetKind>,

    /// Attack identifier: deepfool, jsma, cw, fgsm, pgd or ead
    #[arg(short, long)]
    attack: Option<AttackKind>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Directory holding best_model.json, dataset.json and all cached artifacts
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    /// Score every example of the set instead of only the attack-flipped ones
    #[arg(long)]
    all: bool,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = match (&cli.config, &cli.dataset, cli.attack) {
        (Some(path), _, _) => RunConfig::from_json_file(path)?,
        (None, Some(dataset), Some(attack)) => RunConfig::new(dataset, attack),
        _ => {
            return Err(NNIFError::config(
                "either --config or both --dataset and --attack are required",
            ))
        }
    };
    if let Some(dataset) = &cli.dataset {
        config.dataset = dataset.clone();
    }
    if let Some(attack) = cli.attack {
        config.attack = attack;
    }
    if let Some(set) = cli.set {
        config.set = set;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(dir) = &cli.checkpoint_dir {
        config.checkpoint_dir = Some(dir.clone());
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if cli.all {
        config.selection = Selection::All;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: &Cli) -> Result<()> {
    let config = build_config(cli)?;
    let model_dir = config.model_dir();
    info!("model directory: {}", model_dir.display());

    let model = SoftmaxClassifier::load_checkpoint(&model_dir.join(CHECKPOINT_FILE))?;
    info!("loaded {}", model);
    let feeder = InMemoryFeeder::from_json_file(model_dir.join(DATASET_FILE))?;
    let attack = config.attack.builtin()?;

    let mut pipeline = Pipeline::new(&config, FsStore::new(&model_dir), &model, &feeder, &attack)?;
    let report = pipeline.run()?;
    info!(
        "{} samples computed, {} already present",
        report.num_computed(),
        report.num_skipped()
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = init_logging(level, cli.log_file.as_deref()) {
        eprintln!("{}", e);
        process::exit(2);
    }
    if let Err(e) = run(&cli) {
        error!("{}", e);
        process::exit(1);
    }
}
