use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use leech::config::Config;
use leech::coordinator::{DownloadCoordinator, DownloadReport};
use leech::torrent::Torrent;

#[derive(Parser, Debug)]
#[command(version, about = "Command-line BitTorrent download client")]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Configuration file (TOML); built-in defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to download into, overriding the configured path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

async fn run(args: Args) -> leech::Result<DownloadReport> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(output) = args.output {
        config.download_path = output;
    }

    let torrent = Torrent::from_file(&args.torrent)?;
    torrent.log_summary();

    DownloadCoordinator::new(torrent, config)?.run().await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(report) => {
            println!(
                "Downloaded {} pieces ({} bytes) from {} peers",
                report.pieces, report.bytes, report.peers_tried
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "download failed");
            ExitCode::FAILURE
        }
    }
}
