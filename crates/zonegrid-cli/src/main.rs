//! zonegrid — operator CLI for the placement engine.
//!
//! # Usage
//!
//! ```text
//! zonegrid plan --cloud-config cloud.toml --manifest cf.toml --state state.redb
//! zonegrid leases --state state.redb --deployment cf
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "zonegrid",
    about = "zonegrid — instance placement and IP reservation",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a deployment without committing anything.
    ///
    /// Reads committed instances and leases from the state file and prints
    /// what the next deploy would create, keep, update or delete.
    Plan {
        /// Cloud config (AZs and networks), TOML
        #[arg(long)]
        cloud_config: PathBuf,
        /// Deployment manifest, TOML
        #[arg(long)]
        manifest: PathBuf,
        /// State database
        #[arg(long, default_value = "zonegrid.redb")]
        state: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// List committed IP leases.
    Leases {
        /// State database
        #[arg(long, default_value = "zonegrid.redb")]
        state: PathBuf,
        /// Only show leases of this deployment
        #[arg(short, long)]
        deployment: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("zonegrid=info".parse()?)
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Plan {
            cloud_config,
            manifest,
            state,
            format,
        } => commands::plan::plan(&cloud_config, &manifest, &state, &format).await,
        Commands::Leases {
            state,
            deployment,
            format,
        } => commands::leases::leases(&state, deployment.as_deref(), &format),
    }
}
