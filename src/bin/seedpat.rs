//! seedpat command line
//!
//! ```bash
//! # Learn phrases and patterns, writing outputs under `out_dir`
//! seedpat run --config disease.toml
//!
//! # Build and save the sentence index only
//! seedpat index --config disease.toml --out index/
//!
//! # Score a saved model against the gold labels of the corpus
//! seedpat eval --config disease.toml --model model/
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use seedpat::eval::{self, Report};
use seedpat::{BootstrapController, Config};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "seedpat", version, about = "Bootstrapped pattern-based entity extraction")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every bootstrapping iteration
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Read the corpus and save its sentence index
    Index {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Evaluate a saved model
    Eval {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        model: PathBuf,
    },
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_toml_file(path).with_context(|| format!("reading config {}", path.display()))
}

fn report(controller: &BootstrapController) -> Result<Report> {
    let config = controller.config();
    let labels = &controller.state().labels;
    let mut report = Report {
        labels: eval::evaluate_corpus(controller.corpus(), labels).context("scoring corpus labels")?,
        learned_words: BTreeMap::new(),
    };
    if let Some(manifest) = &config.gold_entities_files {
        let gold = eval::read_gold_manifest(manifest).context("reading gold entity files")?;
        for (label, judgements) in &gold {
            if let Some(words) = controller.learned_words(label) {
                report
                    .learned_words
                    .insert(label.clone(), eval::evaluate_learned_words(words, judgements));
            }
        }
    }
    Ok(report)
}

fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut controller = BootstrapController::from_config(config).context("building controller")?;
    controller.run_with(|c, iteration| {
        info!(iteration, "writing iteration outputs");
        c.write_iteration_outputs()
    })?;
    controller.write_outputs().context("writing outputs")?;
    if let Some(dir) = controller.config().save_model_dir.clone() {
        controller
            .save_model(&dir)
            .with_context(|| format!("saving model to {}", dir.display()))?;
    }
    println!("{}", controller.summary());
    if controller.config().evaluate {
        print!("{}", report(&controller)?);
    }
    Ok(())
}

fn index(config_path: &Path, out: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut controller = BootstrapController::from_config(config).context("building controller")?;
    controller.init().context("reading corpus")?;
    controller
        .index()
        .save(out)
        .with_context(|| format!("saving index to {}", out.display()))?;
    info!(out = %out.display(), "index saved");
    Ok(())
}

fn evaluate(config_path: &Path, model: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let mut controller = BootstrapController::from_config(config).context("building controller")?;
    controller
        .load_model(model)
        .with_context(|| format!("loading model from {}", model.display()))?;
    print!("{}", report(&controller)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run { config } => run(&config),
        Command::Index { config, out } => index(&config, &out),
        Command::Eval { config, model } => evaluate(&config, &model),
    }
}
