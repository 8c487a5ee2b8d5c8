//! swarm-dl command-line front-end
//!
//! Usage: `swarm-dl --source <path-or-magnet> [--out <dir>]`

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use swarm_dl::{ClientConfig, Download};

/// Download a torrent from a .torrent file or a magnet link
#[derive(Debug, Parser)]
#[command(name = "swarm-dl", version)]
struct Args {
    /// Path to a .torrent file, or a magnet link
    #[arg(long)]
    source: String,

    /// Output directory
    #[arg(long, default_value = "./")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let result = async {
        let download = Download::new(&args.source, ClientConfig::default()).await?;
        tracing::info!(
            "downloading {} ({} pieces) from {} peers",
            download
                .descriptor()
                .display_name
                .as_deref()
                .unwrap_or("torrent"),
            download.descriptor().piece_hashes.len(),
            download.peer_count(),
        );
        download.run(&args.out).await
    }
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("swarm-dl: {}", error);
            ExitCode::FAILURE
        }
    }
}
