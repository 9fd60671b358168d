//! Command line for training and sampling Matryoshka GANs.

use clap::{Parser, Subcommand};
use matryoshka_gan::config::RunConfig;
use matryoshka_gan::data::{ImageSet, MinMaxScale};
use matryoshka_gan::serialization::save_safetensors;
use matryoshka_gan::training::{GanTrainer, ImageSampler};
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "Train and sample Matryoshka GANs", long_about = None)]
struct Args {
    /// Log level: error, warn, info, debug or trace.
    #[arg(short, long, global = true, default_value = "info")]
    verbosity: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on a safetensors archive holding an `images` tensor.
    Train {
        #[arg(long)]
        data: PathBuf,
        /// JSON run configuration; missing keys take the SVHN defaults.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Epochs to run, default niter + niter_decay.
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Continue from the checkpoints saved after this epoch.
        #[arg(long)]
        resume: Option<usize>,
    },
    /// Generate images from a generator checkpoint.
    Sample {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long, default_value_t = 200)]
        count: usize,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Write the default configuration as JSON.
    InitConfig {
        #[arg(long)]
        output: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>, seed: Option<u64>) -> Result<RunConfig, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(seed) = seed {
        config.seed = seed;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let subscriber = FmtSubscriber::builder().with_max_level(args.verbosity).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Train {
            data,
            config,
            epochs,
            seed,
            resume,
        } => {
            let config = load_config(config.as_ref(), seed)?;
            let images = ImageSet::load(&data, config.nc, config.npx)?;
            let scale = MinMaxScale::fit(images.images())?;
            let (min, max) = scale.range();
            info!(min, max, "rescaling images into [-1, 1]");

            let total = config.total_epochs();
            let mut trainer = GanTrainer::new(config)?;
            if let Some(epoch) = resume {
                trainer.resume(epoch)?;
            }
            let epochs = epochs.unwrap_or_else(|| total.saturating_sub(trainer.n_epochs()));
            let mut loader = trainer.loader(images.map(&scale))?;
            let records = trainer.fit(&mut loader, epochs)?;
            if let Some(last) = records.last() {
                info!(
                    epochs = last.n_epochs,
                    updates = last.n_updates,
                    seconds = last.n_seconds,
                    "training finished"
                );
            }
        }
        Command::Sample {
            checkpoint,
            count,
            out,
            config,
            seed,
        } => {
            let config = load_config(config.as_ref(), seed)?;
            let mut sampler = ImageSampler::new(&config.generator_config(), config.seed)?;
            let info = sampler.load_checkpoint(&checkpoint)?;
            let images = sampler.generate(count)?;
            let metadata = HashMap::from([
                ("epoch".to_string(), info.epoch.to_string()),
                ("checkpoint".to_string(), checkpoint.display().to_string()),
            ]);
            save_safetensors(&out, &[("samples".to_string(), images)], metadata)?;
            info!(count, out = %out.display(), "wrote samples");
        }
        Command::InitConfig { output } => {
            RunConfig::default().save(&output)?;
            info!(path = %output.display(), "wrote default configuration");
        }
    }
    Ok(())
}
