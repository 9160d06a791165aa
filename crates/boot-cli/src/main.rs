//! cargo-boot - bootstrap a crate and its dependencies without cargo.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use boot_core::registry::{RegistryClient, index};
use boot_core::{BootstrapOptions, bootstrap};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a crate and its transitive dependencies from the local cache
    Build {
        /// Directory of the root crate (holds Cargo.toml and Cargo.lock)
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Directory of downloaded .crate archives
        #[arg(long)]
        cache: PathBuf,

        /// Directory receiving build artifacts
        #[arg(long)]
        target_dir: PathBuf,

        /// Target triple passed to every compile
        #[arg(long)]
        target: String,

        /// Compiler driver to invoke
        #[arg(long, default_value = "rustc")]
        rustc: PathBuf,

        /// Dependency names to skip (repeatable)
        #[arg(long = "blacklist")]
        blacklist: Vec<String>,

        /// Optional dependencies to enable (repeatable)
        #[arg(long = "enable")]
        optionals: Vec<String>,
    },

    /// Download a .crate archive from the registry into the cache
    Fetch {
        /// Crate name
        name: String,

        /// Exact version to download
        version: String,

        /// Directory of downloaded .crate archives
        #[arg(long)]
        cache: PathBuf,
    },

    /// Maintain a local registry index checkout
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },
}

#[derive(Subcommand, Debug)]
enum IndexCommands {
    /// Publish or republish a version's index entry
    Update {
        /// Root of the index checkout
        #[arg(long)]
        root: PathBuf,

        /// Crate name
        name: String,

        /// Version the entry describes
        version: String,

        /// File holding the JSON index line
        #[arg(long)]
        entry: PathBuf,
    },

    /// Remove a version's index entry
    Remove {
        /// Root of the index checkout
        #[arg(long)]
        root: PathBuf,

        /// Crate name
        name: String,

        /// Version to remove
        version: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            root,
            cache,
            target_dir,
            target,
            rustc,
            blacklist,
            optionals,
        } => {
            let outcome = bootstrap(BootstrapOptions {
                root_dir: root,
                cache_dir: cache,
                out_dir: target_dir,
                target,
                rustc: Some(rustc),
                blacklist,
                optionals,
            })?;
            println!("built {}", outcome.name);
            Ok(())
        }
        Commands::Fetch {
            name,
            version,
            cache,
        } => {
            let client = RegistryClient::new();
            let dest = client
                .fetch_crate_archive(&name, &version, &cache)
                .await
                .with_context(|| format!("failed to fetch {name} {version}"))?;
            println!("{}", dest.display());
            Ok(())
        }
        Commands::Index { command } => match command {
            IndexCommands::Update {
                root,
                name,
                version,
                entry,
            } => {
                let line = std::fs::read_to_string(&entry)
                    .with_context(|| format!("failed to read {}", entry.display()))?;
                let file = index::index_path(&root, &name);
                index::update(&file, &version, line.trim_end())
                    .with_context(|| format!("failed to update index for {name}"))?;
                Ok(())
            }
            IndexCommands::Remove {
                root,
                name,
                version,
            } => {
                let file = index::index_path(&root, &name);
                index::remove(&file, &version)
                    .with_context(|| format!("failed to update index for {name}"))?;
                Ok(())
            }
        },
    }
}
