use anyhow::{Context, Result};
use blobtree::{Artifact, Storage, StorageConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "blobtree")]
#[command(about = "Path-addressed blob storage", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(long, global = true, env = "BLOBTREE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file under a key
    Put {
        /// Destination key, e.g. /dir/1
        key: String,

        /// Path to the file to store
        file: PathBuf,
    },

    /// Write a blob to stdout
    Get {
        key: String,
    },

    /// List the immediate children of a key
    Ls {
        #[arg(default_value = "/")]
        key: String,
    },

    /// Remove a blob
    Rm {
        key: String,

        /// Remove the key and everything below it
        #[arg(short, long)]
        recursive: bool,
    },

    /// Print the size of a blob in bytes
    Size {
        key: String,
    },

    /// Exit with status 0 if a blob exists, 1 otherwise
    Exists {
        key: String,
    },
}

async fn load_config(path: Option<&PathBuf>) -> Result<StorageConfig> {
    match path {
        Some(path) => StorageConfig::from_file(path).await,
        None => StorageConfig::load().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref()).await?;
    tracing::debug!("Using storage root: {}", config.root.display());

    let storage = blobtree::open(&config)
        .await
        .with_context(|| format!("Failed to open storage at {}", config.root.display()))?;

    run(storage.as_ref(), cli.command).await
}

async fn run(storage: &dyn Storage, command: Commands) -> Result<()> {
    match command {
        Commands::Put { key, file } => {
            let mut source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open file: {}", file.display()))?;

            let mut stored = 0;
            storage
                .put_reader(
                    &key,
                    &mut source,
                    Box::new(|artifact: &dyn Artifact| -> Result<()> {
                        stored = artifact.size()?;
                        Ok(())
                    }),
                )
                .await
                .with_context(|| format!("Failed to store {}", key))?;

            println!("{} ({} bytes)", key, stored);
            Ok(())
        }
        Commands::Get { key } => {
            let mut reader = storage.get_reader(&key).await?;
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut reader, &mut stdout)
                .await
                .context("Failed to write blob to stdout")?;
            stdout.flush().await?;
            Ok(())
        }
        Commands::Ls { key } => {
            let mut children = storage.list(&key).await?;
            children.sort();
            for child in children {
                println!("{}", child);
            }
            Ok(())
        }
        Commands::Rm { key, recursive } => {
            if recursive {
                storage.remove_all(&key).await?;
            } else {
                storage.remove(&key).await?;
            }
            Ok(())
        }
        Commands::Size { key } => {
            println!("{}", storage.size(&key).await?);
            Ok(())
        }
        Commands::Exists { key } => {
            if storage.exists(&key).await {
                Ok(())
            } else {
                tracing::debug!("No blob at {}", key);
                std::process::exit(1);
            }
        }
    }
}
