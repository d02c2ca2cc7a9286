//! CLI entry point for aux-tasks-rs.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aux_tasks_rs::{Result, SyntheticConfig, Trainer};

#[derive(Parser)]
#[command(name = "aux-tasks")]
#[command(about = "Learn principal subspaces with SGD and implicit weight estimators")]
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
    /// Start or resume training
    Train {
        /// Path to configuration file
        config: String,
        /// Directory for checkpoints, metrics and trajectories
        #[arg(long, default_value = "runs/default")]
        workdir: String,
        /// Hide the progress bar
        #[arg(long)]
        quiet: bool,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Method preset (explicit, oracle, naive, naive++, lissa)
        #[arg(long, default_value = "explicit")]
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
            let config = SyntheticConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!("  Method: {}", config.method);
            println!(
                "  Problem: S={} T={} d={}",
                config.num_states, config.num_tasks, config.feature_dim
            );
            println!("  Epochs: {}", config.num_epochs);
        }
        Commands::Train {
            config,
            workdir,
            quiet,
        } => {
            tracing::info!("Starting training with config: {}", config);
            let config = SyntheticConfig::from_file(&config)?;
            let outcome = Trainer::new(config, &workdir)?.with_progress(!quiet).run()?;
            println!("✓ Training finished at step {}", outcome.final_step);
            println!("  Artifacts written to: {workdir}");
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = SyntheticConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
    }

    Ok(())
}
