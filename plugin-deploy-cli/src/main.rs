//! plugin-deploy: offline planning for process plugin deployments.
//!
//! Usage:
//!   plugin-deploy plan --config deploy.yaml --snapshot node.yaml
//!   plugin-deploy check-config --config deploy.yaml
//!
//! Log verbosity follows RUST_LOG, defaulting to `plugin_deploy=info`.

mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugin_deploy_core::{DeployConfig, Deployer};
use tracing_subscriber::EnvFilter;

use crate::snapshot::Snapshot;

#[derive(Parser, Debug)]
#[command(name = "plugin-deploy")]
#[command(about = "Reconcile process plugins against the registry and artifact store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the state changes and batch a pass would produce
    Plan {
        /// Deployment config (YAML)
        #[arg(long, short = 'c', env = "PLUGIN_DEPLOY_CONFIG")]
        config: PathBuf,

        /// Node snapshot: plugins, prior state, definitions, stored resources
        #[arg(long, short = 's')]
        snapshot: PathBuf,
    },
    /// Load a config and print it with defaults filled in
    CheckConfig {
        #[arg(long, short = 'c', env = "PLUGIN_DEPLOY_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "plugin_deploy=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Plan { config, snapshot } => plan(config, snapshot).await,
        Command::CheckConfig { config } => check_config(config),
    }
}

async fn plan(config: PathBuf, snapshot: PathBuf) -> Result<()> {
    let config = DeployConfig::load_from_file(&config)?;
    let seeded = Snapshot::load_from_file(&snapshot)?.seed()?;
    tracing::info!(
        "Loaded snapshot {}: {} plugin(s)",
        snapshot.display(),
        seeded.plugins.len()
    );

    let deployer = Deployer::new(
        Arc::new(seeded.registry),
        Arc::new(seeded.state),
        Arc::new(seeded.resources),
        config,
    );
    let plan = deployer.plan(&seeded.plugins).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&plan).context("Serializing plan")?
    );
    Ok(())
}

fn check_config(config: PathBuf) -> Result<()> {
    let loaded = DeployConfig::load_from_file(&config)?;
    tracing::info!("{} is valid", config.display());
    print!(
        "{}",
        serde_yaml::to_string(&loaded).context("Serializing config")?
    );
    Ok(())
}
