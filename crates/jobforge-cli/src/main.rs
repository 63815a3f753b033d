//! jobforge CLI tool.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use jobforge_config::{SystemConfig, load_system_config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Run CI jobs in isolated sandboxes", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "JOBFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Sandbox backend, overriding the configuration
    #[arg(long, value_enum)]
    sandbox: Option<Backend>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Local,
    Docker,
}

impl Backend {
    fn as_str(self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Docker => "docker",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue jobs and run them to completion
    Run {
        /// Job definition files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Validate job definition files
    Validate {
        /// Paths to job files
        #[arg(default_value = "job.kdl")]
        files: Vec<PathBuf>,
    },
    /// Inspect and maintain dependency caches
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print the cache key for a build
    Key {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        commit: String,
        /// Manifest files to hash, in order
        #[arg(long = "manifest")]
        manifests: Vec<String>,
        /// Checkout to read manifests from
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// List stored caches
    List,
    /// Delete caches older than the retention period
    Prune {
        /// Maximum age in days, overriding the configuration
        #[arg(long)]
        days: Option<u64>,
    },
}

fn load_config(cli: &Cli) -> Result<SystemConfig> {
    let mut config = match &cli.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(backend) = cli.sandbox {
        config.sandbox.backend = backend.as_str().to_string();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { files } => {
            commands::run::run_jobs(&config, &files).await?;
        }
        Commands::Validate { files } => {
            commands::validate(&files)?;
        }
        Commands::Cache { command } => match command {
            CacheCommands::Key {
                repo,
                commit,
                manifests,
                dir,
            } => {
                commands::cache::key(&repo, &commit, &manifests, dir).await?;
            }
            CacheCommands::List => {
                commands::cache::list(&config).await?;
            }
            CacheCommands::Prune { days } => {
                commands::cache::prune(&config, days).await?;
            }
        },
    }

    Ok(())
}
