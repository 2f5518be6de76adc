// Harvest data collection engine
// Main entry point for the harvest binary

use clap::Parser;
use harvest_engine::cli::{Cli, Command, PolicyAction};
use harvest_engine::config::Config;
use harvest_engine::handlers::{
    handle_fetch, handle_policy_run, handle_provider_config, handle_schema, handle_verify,
    OutputFormat,
};
use harvest_engine::telemetry::{init_telemetry, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let (format, log_format) = if cli.json {
        (OutputFormat::Json, LogFormat::Json)
    } else {
        (OutputFormat::Text, LogFormat::Text)
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry(level, log_format);

    tracing::debug!("Harvest Engine v{}", env!("CARGO_PKG_VERSION"));

    // Handle commands
    match cli.command {
        Command::Fetch {
            providers,
            resources,
            timeout,
        } => handle_fetch(providers, resources, timeout, &config, format).await,

        Command::Schema { provider } => handle_schema(provider, &config, format).await,

        Command::ProviderConfig { provider } => {
            handle_provider_config(provider, &config, format).await
        }

        Command::Policy { action } => match action {
            PolicyAction::Run {
                path,
                stop_on_failure,
                timeout,
            } => {
                let passed =
                    handle_policy_run(path, stop_on_failure, timeout, &config, format).await?;
                if !passed {
                    std::process::exit(1);
                }
                Ok(())
            }
        },

        Command::Verify { provider } => handle_verify(provider, &config, format).await,
    }
}
