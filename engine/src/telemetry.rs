//! Logging setup for the `harvest` binary
//!
//! All log output goes to stderr; stdout is reserved for command output
//! such as schemas, sample configurations and policy reports.
//!
//! Provider processes log through the engine: their stderr is re-emitted
//! under the `harvest_engine::plugin` target with a `provider` field, so a
//! single filter directive controls how chatty plugins are.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact human readable lines
    Text,
    /// One JSON object per event, for `--json` runs
    Json,
}

/// Filter used when `RUST_LOG` is unset
///
/// Engine, sdk and hub crates log at `log_level`. Forwarded plugin output
/// and the SQL driver are capped at `warn` unless `log_level` asks for
/// `debug` or more, since both are noisy per fetched row.
pub fn default_filter(log_level: &str) -> String {
    let verbose = matches!(log_level, "debug" | "trace");
    let chatty = if verbose { log_level } else { "warn" };
    format!(
        "warn,harvest_engine={level},harvest_sdk={level},harvest_hub={level},\
         harvest_engine::plugin={chatty},sqlx={chatty}",
        level = log_level,
        chatty = chatty,
    )
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides [`default_filter`]. Calling this twice is harmless;
/// the second call is ignored.
pub fn init_telemetry(log_level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match format {
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(cfg!(debug_assertions))
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.ok();
}
