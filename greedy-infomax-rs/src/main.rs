//! CLI entry point for greedy-infomax-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use greedy_infomax_rs::checkpoint::latest_checkpoint;
use greedy_infomax_rs::data::SignalDataset;
use greedy_infomax_rs::{ExecutionContext, GimConfig, GreedyTrainer, Result};

#[derive(Parser)]
#[command(name = "gim")]
#[command(about = "Greedy InfoMax: layer-wise contrastive representation learning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Number of synthetic signals to train on
        #[arg(long, default_value_t = 64)]
        synthetic: usize,
        /// Resume from a checkpoint directory ("latest" picks the newest epoch)
        #[arg(long)]
        resume: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (cpc, gim, test)
        #[arg(long, default_value = "gim")]
        preset: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = GimConfig::from_file(&config)?;
            config.validate()?;
            let lengths = config.latent_lengths()?;
            println!("✓ Configuration is valid");
            println!("  Modules: {}", config.architecture.modules.len());
            println!("  Sequence length: {}", config.data.sequence_length);
            for (idx, (module, len)) in config.architecture.modules.iter().zip(&lengths).enumerate() {
                println!(
                    "  Module {}: latent length {}, latent dim {}, context dim {}, K={}",
                    idx + 1,
                    len,
                    module.cnn_hidden_dim,
                    module.context_dim(),
                    module.prediction_step
                );
            }
        }
        Commands::Train {
            config,
            synthetic,
            resume,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = GimConfig::from_file(&config)?;
            config.validate()?;

            let ctx = ExecutionContext::from_env(config.seed);
            let checkpoint = match resume.as_deref() {
                Some("latest") => {
                    let found = latest_checkpoint(&config.output_dir)?;
                    if found.is_none() {
                        tracing::warn!(
                            "No checkpoint found in {}; starting a fresh run",
                            config.output_dir
                        );
                    }
                    found
                }
                Some(dir) => Some(dir.into()),
                None => None,
            };
            let mut trainer = match checkpoint {
                Some(dir) => {
                    tracing::info!("Resuming from: {}", dir.display());
                    GreedyTrainer::resume(config.clone(), dir, ctx)?
                }
                None => GreedyTrainer::with_context(config.clone(), ctx)?,
            };

            // signals a little longer than the crop so crops differ per epoch
            let length = config.data.sequence_length + config.data.sequence_length / 4;
            let dataset =
                SignalDataset::synthetic(synthetic, length, config.data.sample_rate, config.seed);
            let (train, held_out) = dataset.split(0.1)?;
            let validation = (held_out.len() >= config.data.batch_size).then_some(&held_out);

            let history = trainer.train(&train, validation)?;
            if let Some(last) = history.last() {
                for m in &last.train {
                    println!(
                        "✓ Module {}: loss {:.4}, accuracy {:.3}",
                        m.module, m.loss, m.accuracy
                    );
                }
            }
            println!("✓ Checkpoints written to: {}", config.output_dir);
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = GimConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
