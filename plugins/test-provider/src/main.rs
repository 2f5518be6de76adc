// Test provider plugin binary
//
// Launched by the engine it prints the handshake line and serves until
// SIGTERM. With --reattach-file it serves unmanaged and writes the discovery
// manifest the engine attaches with.

use clap::Parser;
use harvest_sdk::serve::serve_managed;
use std::path::PathBuf;
use std::sync::Arc;
use test_provider::{serve_test_plugin, TestProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "test-provider")]
#[command(version, about = "Harvest test provider", long_about = None)]
struct Args {
    /// Serve unmanaged and write the discovery manifest to this path
    #[arg(long, value_name = "PATH")]
    reattach_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the handshake line
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.reattach_file {
        Some(path) => {
            let shutdown = CancellationToken::new();
            let (manifest, server) = serve_test_plugin(shutdown.clone()).await?;
            manifest.write_to(&path)?;
            tracing::info!("Wrote discovery manifest to {}", path.display());

            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            server.await??;
            let _ = std::fs::remove_file(&path);
        }
        None => serve_managed(Arc::new(TestProvider::new())).await?,
    }

    Ok(())
}
