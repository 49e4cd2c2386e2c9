//! CLI entry point for fusion-affect-rs.

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fusion_affect_rs::config::{DatasetKind, Task};
use fusion_affect_rs::{ExperimentConfig, Result, RunSelection, Trainer};

#[derive(Parser)]
#[command(name = "fusion-affect")]
#[command(about = "Text/EEG affect classifiers with modality fusion")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Run selection shared by `train` and `validate`.
#[derive(Args)]
struct RunArgs {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,
    /// Model kind (transformer, biLSTM, MLP, resnet, fusion, CCA_fusion, WD_fusion, CCA_ds, WD_ds)
    #[arg(long)]
    model: Option<String>,
    /// Modality (text, eeg, fusion)
    #[arg(long)]
    modality: Option<String>,
    /// Dataset (KEmoCon, ZuCo)
    #[arg(long)]
    dataset: Option<String>,
    /// Task (SA, RD)
    #[arg(long)]
    task: Option<String>,
    /// Granularity level (word, concatword, sentence)
    #[arg(long)]
    level: Option<String>,
    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,
    /// Output directory for checkpoints and metrics
    #[arg(long)]
    output_dir: Option<String>,
}

impl RunArgs {
    fn resolve(self) -> Result<ExperimentConfig> {
        let selection = RunSelection {
            model: self.model,
            modality: self.modality,
            dataset: self.dataset,
            task: self.task,
            level: self.level,
            epochs: self.epochs,
            output_dir: self.output_dir,
        };
        let config = match self.config {
            Some(path) => {
                tracing::info!("Loading configuration: {}", path);
                selection.apply(ExperimentConfig::from_file(&path)?)?
            }
            None => selection.into_config()?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a model/dataset combination without reading data
    Validate(RunArgs),
    /// Train, validate and test one combination
    Train(RunArgs),
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Dataset preset (KEmoCon, ZuCo)
        #[arg(long, default_value = "KEmoCon")]
        dataset: String,
        /// Task for ZuCo (SA, RD)
        #[arg(long, default_value = "SA")]
        task: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate(args) => {
            let config = args.resolve()?;
            println!("✓ Configuration is valid");
            println!("  Run: {}", config.run_tag()?);
            println!("  {}", config.describe());
            println!("  Table: {}", config.dataset.resolved_path().display());
        }
        Commands::Train(args) => {
            let config = args.resolve()?;
            tracing::info!("Starting training: {}", config.describe());

            let mut trainer = Trainer::new(config)?;
            let summary = trainer.run()?;
            println!(
                "✓ Best epoch {} ({:.4}); test accuracy {:.4}",
                summary.best_epoch + 1,
                summary.best_indicator,
                summary.test.accuracy
            );
            println!("  Outputs: {}", trainer.store().run_dir().display());
        }
        Commands::Init {
            output,
            dataset,
            task,
        } => {
            let dataset: DatasetKind = dataset.parse()?;
            let task: Task = task.parse()?;
            tracing::info!("Generating config for {} {}", dataset.as_str(), task.as_str());
            ExperimentConfig::for_dataset(dataset, task).to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
