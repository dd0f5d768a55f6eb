//! supcon CLI - train and inspect contrastive models

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use supcon::{
    config::ConfigManager,
    diagnostics::Diagnostics,
    error::{ContrastError, ContrastResult},
    init,
    nn::losses::{LossFactory, LossKind},
    version, ContrastConfig, Trainer,
};

#[derive(Parser)]
#[command(name = "supcon")]
#[command(about = "Supervised and partial-supervised contrastive training")]
#[command(version = version())]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seed for data generation, initialization and shuffling
    #[arg(long, global = true)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the projection head and classifier
    Train {
        /// Contrastive loss (no-op, simclr, supcon, partial-supcon)
        #[arg(short, long)]
        loss: Option<LossKind>,

        #[arg(short, long)]
        epochs: Option<usize>,

        /// Global batch size
        #[arg(short, long)]
        batch_size: Option<usize>,

        #[arg(long)]
        lr: Option<f32>,

        /// Epochs at which the learning rate decays by 10x
        #[arg(long, value_delimiter = ',')]
        lr_decays: Option<Vec<usize>>,

        /// Number of data-parallel workers
        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Resume from the checkpoint in the output directory
        #[arg(long)]
        load: bool,

        /// Do not write checkpoints
        #[arg(long)]
        no_checkpoint: bool,

        /// Write similarity histograms and embeddings after training
        #[arg(long)]
        diagnose: bool,
    },

    /// Evaluate the checkpoint in the output directory on validation data
    Eval {
        #[arg(short, long)]
        out_dir: Option<PathBuf>,
    },

    /// Write similarity-type histograms and embeddings for a checkpoint
    Diagnose {
        #[arg(short, long)]
        out_dir: Option<PathBuf>,

        /// Histogram bins
        #[arg(long)]
        bins: Option<usize>,
    },

    /// Generate a configuration file with defaults
    Config {
        #[arg(short, long, default_value = "./supcon_config.json")]
        output: PathBuf,
    },

    /// Validate the configuration and report the resolved setup
    Check,
}

#[tokio::main]
async fn main() -> ContrastResult<()> {
    let cli = Cli::parse();
    init(cli.verbose)?;

    // overrides apply to this run only, never to the loaded file
    let mut manager = ConfigManager::new();
    if let Some(path) = &cli.config {
        manager.load_from_file(path)?;
    }
    let mut config = manager.into_config();
    if let Some(seed) = cli.seed {
        config.seed = seed;
        info!("Random seed set to {}", seed);
    }

    match cli.command {
        Commands::Train {
            loss,
            epochs,
            batch_size,
            lr,
            lr_decays,
            workers,
            out_dir,
            load,
            no_checkpoint,
            diagnose,
        } => {
            if let Some(loss) = loss {
                config.loss.variant = loss;
            }
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.training.batch_size = batch_size;
            }
            if let Some(lr) = lr {
                config.training.learning_rate = lr;
            }
            if let Some(decays) = lr_decays {
                config.training.lr_decays = decays;
            }
            if let Some(workers) = workers {
                config.distributed.num_workers = workers;
            }
            if let Some(out_dir) = out_dir {
                config.output.out_dir = out_dir;
            }
            config.output.load |= load;
            config.output.checkpoint &= !no_checkpoint;
            train(config, diagnose).await?;
        }

        Commands::Eval { out_dir } => {
            if let Some(out_dir) = out_dir {
                config.output.out_dir = out_dir;
            }
            evaluate(config).await?;
        }

        Commands::Diagnose { out_dir, bins } => {
            if let Some(out_dir) = out_dir {
                config.output.out_dir = out_dir;
            }
            if let Some(bins) = bins {
                config.output.histogram_bins = bins;
            }
            let trainer = restored_trainer(config).await?;
            diagnose(&trainer).await?;
        }

        Commands::Config { output } => {
            let mut manager = ConfigManager::new();
            manager.set_config(config)?;
            manager.save_to_file(&output)?;
        }

        Commands::Check => {
            check(&config)?;
        }
    }

    Ok(())
}

async fn train(config: ContrastConfig, diagnose_after: bool) -> ContrastResult<()> {
    let mut trainer = Trainer::new(config)?;

    let stop = trainer.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            stop.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    if trainer.prepare_output().await? {
        info!("Resuming at epoch {}", trainer.state().epoch);
    }
    let history = trainer.fit().await?;
    if let Some(last) = history.last() {
        info!(
            "Finished epoch {}: train loss {:.4}, train acc {:.3}, val acc {:.3}",
            last.epoch, last.train_loss, last.train_acc, last.val_acc
        );
    }

    if diagnose_after {
        diagnose(&trainer).await?;
    }
    Ok(())
}

async fn restored_trainer(mut config: ContrastConfig) -> ContrastResult<Trainer> {
    config.output.load = true;
    let mut trainer = Trainer::new(config)?;
    if !trainer.restore().await? {
        return Err(ContrastError::ConfigurationError(format!(
            "no checkpoint found in {:?}",
            trainer.out_dir()
        )));
    }
    Ok(trainer)
}

async fn evaluate(config: ContrastConfig) -> ContrastResult<()> {
    let trainer = restored_trainer(config).await?;
    let report = trainer.evaluate().await?;
    info!(
        "Validation over {} batches (+{} tail examples): accuracy {:.4}, {} loss {:.4}",
        report.steps,
        report.tail_examples,
        report.accuracy,
        trainer.engine().kind(),
        report.contrastive_loss
    );
    Ok(())
}

async fn diagnose(trainer: &Trainer) -> ContrastResult<()> {
    let config = trainer.config();
    let diagnostics = Diagnostics::collect(
        trainer.model(),
        trainer.val_loader(),
        config.distributed.num_workers,
        config.output.histogram_bins,
    )?;
    diagnostics.save(&trainer.out_dir()).await
}

fn check(config: &ContrastConfig) -> ContrastResult<()> {
    config.validate()?;
    info!("Configuration is valid");
    info!("Loss: {} (scale {})", config.loss.variant, config.loss.temperature_scale);
    info!(
        "Batch: {} global over {} worker(s), {} per worker, collector {:?}",
        config.training.batch_size,
        config.distributed.num_workers,
        config.local_batch_size(),
        config.collector_kind()
    );
    info!("Available losses: {}", LossFactory::available_losses().join(", "));
    Ok(())
}
