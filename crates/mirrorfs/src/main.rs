//! mirrorfs binary
//!
//! Small front end over the mirroring layer, mostly for trying out a
//! destination and an eviction config.
//!
//! ```bash
//! # Copy a file into the layer and wait until it reached the destination
//! mirrorfs --dest /srv/archive put ./report.csv reports/q1.csv
//!
//! # Run one eviction pass over an existing temporary directory
//! mirrorfs --dest /srv/archive --temp /var/tmp/spool --config mirrorfs.toml gc
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mirrorfs::vfs::write_fully;
use mirrorfs::{Behavior, LocalBackend, MirrorConfig, MirrorFs};

/// Write-behind mirroring filesystem.
#[derive(Parser, Debug)]
#[command(name = "mirrorfs")]
#[command(about = "Write-behind mirror of a destination directory")]
struct Args {
    /// Destination directory (durable side)
    #[arg(long)]
    dest: PathBuf,

    /// Temporary directory (fast side). Defaults to a private temp dir
    #[arg(long)]
    temp: Option<PathBuf>,

    /// Behavior config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a local file into the layer at PATH
    Put {
        /// File to read
        local: PathBuf,
        /// Path inside the layer
        path: PathBuf,
        /// Permissions for the new file
        #[arg(long, default_value = "644", value_parser = parse_mode)]
        mode: u32,
    },
    /// Run one garbage collection pass and print the counters
    Gc,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|e| format!("invalid octal mode {s:?}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let behavior = match &args.config {
        Some(path) => Behavior::load(path)?,
        None => Behavior::default(),
    };

    std::fs::create_dir_all(&args.dest)
        .with_context(|| format!("creating destination {}", args.dest.display()))?;
    let mut config = MirrorConfig::new(Arc::new(LocalBackend::new(&args.dest))).with_behavior(behavior);
    if let Some(temp) = &args.temp {
        std::fs::create_dir_all(temp)
            .with_context(|| format!("creating temporary directory {}", temp.display()))?;
        config = config.with_temporary(Arc::new(LocalBackend::new(temp)));
    }

    let fs = MirrorFs::new(config)?;

    let result = match args.command {
        Command::Put { local, path, mode } => put(&fs, local, path, mode).await,
        Command::Gc => {
            let stats = fs.collect_garbage().await?;
            println!(
                "kept {} deleted {} failed {}",
                stats.kept, stats.deleted, stats.failed
            );
            Ok(())
        }
    };

    fs.close().await?;
    result
}

async fn put(fs: &MirrorFs, local: PathBuf, path: PathBuf, mode: u32) -> Result<()> {
    let data = tokio::fs::read(&local)
        .await
        .with_context(|| format!("reading {}", local.display()))?;

    let mut file = fs.create(&path, mode).await?;
    write_fully(file.as_mut(), &data).await?;
    file.close().await?;

    fs.sync().await?;
    tracing::info!(path = %path.display(), bytes = data.len(), pending = fs.pending(), "file mirrored");
    println!("{} -> {} ({} bytes)", local.display(), path.display(), data.len());
    Ok(())
}
