//! Inspect the gatefs caching layer from the command line.
use std::{
    io,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use gatefs::{config::Config, stream::StreamCache};
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, error, warn};

mod trc;

use crate::trc::Trc;

/// Size of each read issued against a streaming buffer.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(
    version,
    about = "Caching and stream-buffering layer of the gatefs gateway."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a gatefs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a file through a shared buffer and copy it to stdout as it grows.
    Tail {
        /// The file to stream.
        file: PathBuf,
    },

    /// Print the effective configuration.
    ShowConfig,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    if let Err(e) = Trc::default().init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    match args.command {
        Command::ShowConfig => match config.to_toml() {
            Ok(rendered) => print!("{rendered}"),
            Err(e) => {
                error!("Failed to render configuration: {e}");
                std::process::exit(1);
            }
        },
        Command::Tail { file } => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to start the async runtime: {e}");
                    std::process::exit(1);
                }
            };

            if let Err(e) = runtime.block_on(tail(&config, &file)) {
                error!("Tail failed: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn tail(config: &Config, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let streams = StreamCache::from_config(config);
    let key = file.display().to_string();
    let path = file.to_path_buf();

    let buffer = streams
        .open(&key, move || async move { tokio::fs::File::open(path).await })
        .await?;
    debug!(name = buffer.name(), size = buffer.size(), "Stream ready.");

    let idle = config.stream.buffer_options().idle_confirm;
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut offset = 0u64;
    let mut stdout = tokio::io::stdout();

    loop {
        match buffer.read_at(&mut chunk, offset) {
            Ok(0) => break,
            Ok(n) => {
                stdout.write_all(&chunk[..n]).await?;
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => tokio::time::sleep(idle).await,
            Err(e) => {
                warn!(name = buffer.name(), "Stream ended early: {e}");
                break;
            }
        }
    }
    stdout.flush().await?;

    buffer.close().await?;
    streams.flush().await;
    Ok(())
}
