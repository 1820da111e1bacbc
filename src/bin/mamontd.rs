//! Overlay daemon.
//!
//! Mounts one sync pair from command-line arguments and runs until
//! interrupted, saving all persistent state on the way out.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use overlay_mamont::config::Config;
use overlay_mamont::engine::{Engine, PairConfig};
use overlay_mamont::vfs::NullAdapterFactory;

#[derive(Parser, Debug)]
#[command(name = "mamontd", about = "Hybrid local/external overlay sync daemon")]
struct Args {
    /// TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stable identifier of the sync pair.
    #[arg(long, default_value = "default")]
    pair: String,

    /// Fast local backing directory.
    #[arg(long)]
    local: PathBuf,

    /// Slow external backing directory, when present.
    #[arg(long)]
    external: Option<PathBuf>,

    /// Directory where the overlay is mounted.
    #[arg(long)]
    target: PathBuf,

    /// Directory for the catalog, sync state and activity log.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Volume name of the external disk, matched against disk events.
    #[arg(long)]
    disk_name: Option<String>,
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    if args.state_dir.is_some() {
        config.state_dir = args.state_dir.clone();
    }

    let engine = Engine::new(config, Arc::new(NullAdapterFactory)).await?;
    engine.start().await?;
    engine
        .add_pair(
            &args.pair,
            PairConfig {
                local_dir: args.local,
                external_dir: args.external,
                target_dir: args.target,
                disk_name: args.disk_name,
            },
        )
        .await?;

    tracing::info!(pair = %args.pair, "running, ctrl-c stops");
    tokio::signal::ctrl_c().await?;
    engine.shutdown().await;
    Ok(())
}
