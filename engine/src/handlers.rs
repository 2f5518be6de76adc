//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - fetch: Pull resources from providers into the store
//! - schema: Show the tables of a provider
//! - provider-config: Print a provider's sample configuration
//! - policy run: Evaluate a policy file
//! - verify: Run the trust gate over an installed provider
//!
//! Command output goes to stdout, logs go to stderr.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::{Client, FetchRequest, ProviderSelection};
use crate::config::Config;
use crate::context::CallContext;
use crate::policy::{ExecutePolicyRequest, PolicyReport};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Fetch resources from the selected providers
///
/// An empty provider list selects every configured provider. A non-empty
/// resource list overrides the configured resources of every selection.
pub async fn handle_fetch(
    providers: Vec<String>,
    resources: Vec<String>,
    timeout: Option<u64>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let request = if providers.is_empty() {
        FetchRequest::all(config)
    } else {
        FetchRequest::new(providers.into_iter().map(ProviderSelection::new).collect())
    };
    let request = FetchRequest::new(
        request
            .providers
            .into_iter()
            .map(|selection| selection.with_resources(resources.iter().cloned()))
            .collect(),
    );

    if request.providers.is_empty() {
        anyhow::bail!("No providers configured");
    }

    let names: Vec<String> = request.providers.iter().map(|p| p.name.clone()).collect();
    let ctx = interruptible(timeout);

    let mut client = connect(config).await?;
    let result = match client.initialize(&ctx).await {
        Ok(()) => client.fetch(&ctx, request).await,
        Err(e) => Err(e),
    };
    client.close().await.context("Failed to close store")?;

    match (&result, format) {
        (Ok(()), OutputFormat::Text) => {
            println!("✓ Fetched {} in {:.1}s", names.join(", "), ctx.elapsed().as_secs_f64());
        }
        (Ok(()), OutputFormat::Json) => {
            let output = json!({
                "status": "completed",
                "providers": names,
                "duration_ms": ctx.elapsed().as_millis() as u64,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        (Err(e), OutputFormat::Text) => println!("✗ Fetch failed: {}", e),
        (Err(e), OutputFormat::Json) => {
            let output = json!({
                "status": "failed",
                "providers": names,
                "error": e.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    result.context("Fetch failed")
}

/// Show the table schema of a provider
pub async fn handle_schema(provider: String, config: &Config, format: OutputFormat) -> Result<()> {
    let ctx = interruptible(None);
    let client = connect(config).await?;
    let result = client.get_provider_schema(&ctx, &provider).await;
    client.close().await.context("Failed to close store")?;
    let schema = result.with_context(|| format!("Failed to get schema of '{}'", provider))?;

    match format {
        OutputFormat::Text => {
            println!("{} {}", schema.name, schema.version);
            for table in &schema.resource_tables {
                println!();
                if table.description.is_empty() {
                    println!("{}", table.name);
                } else {
                    println!("{} - {}", table.name, table.description);
                }
                for column in &table.columns {
                    println!("  {:<24} {}", column.name, column.column_type.sql_type());
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

/// Print the sample configuration of a provider
pub async fn handle_provider_config(
    provider: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let ctx = interruptible(None);
    let client = connect(config).await?;
    let result = client.get_provider_configuration(&ctx, &provider).await;
    client.close().await.context("Failed to close store")?;
    let configuration =
        result.with_context(|| format!("Failed to get configuration of '{}'", provider))?;

    match format {
        OutputFormat::Text => print!("{}", configuration.config),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&configuration)?),
    }

    Ok(())
}

/// Evaluate a policy file against the store
///
/// Returns whether every evaluated check passed.
pub async fn handle_policy_run(
    path: PathBuf,
    stop_on_failure: bool,
    timeout: Option<u64>,
    config: &Config,
    format: OutputFormat,
) -> Result<bool> {
    let ctx = interruptible(timeout);
    let client = connect(config).await?;
    let request = ExecutePolicyRequest {
        policy_path: path,
        stop_on_failure,
    };
    let result = client.execute_policy(&ctx, &request).await;
    client.close().await.context("Failed to close store")?;
    let report = result.context("Policy execution failed")?;

    match format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(report.passed)
}

/// Run the trust gate over a locally installed provider
pub async fn handle_verify(provider: String, config: &Config, format: OutputFormat) -> Result<()> {
    let client = connect(config).await?;
    let result = client.verify_install(&provider).await;
    client.close().await.context("Failed to close store")?;

    match (result, format) {
        (Ok(record), OutputFormat::Text) => {
            println!("✓ {} is trusted", provider);
            println!("  SHA-256: {}", record.digest);
            println!("  Signed by key {}", record.key_fingerprint);
            Ok(())
        }
        (Ok(record), OutputFormat::Json) => {
            let output = json!({
                "provider": provider,
                "trusted": true,
                "record": record,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        (Err(e), OutputFormat::Text) => {
            println!("✗ {} is not trusted: {}", provider, e);
            Err(e).context("Verification failed")
        }
        (Err(e), OutputFormat::Json) => {
            let output = json!({
                "provider": provider,
                "trusted": false,
                "error": e.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Err(e).context("Verification failed")
        }
    }
}

fn print_report(report: &PolicyReport) {
    println!("Policy: {}", report.policy);
    println!();

    for result in &report.results {
        let mark = if result.passed { "✓" } else { "✗" };
        let label = if result.label.is_empty() {
            &result.name
        } else {
            &result.label
        };
        println!("{} {}", mark, label);

        for violation in &result.violations {
            let fields: Vec<String> = violation
                .fields
                .iter()
                .map(|(name, value)| format!("{}={}", name, value.as_deref().unwrap_or("NULL")))
                .collect();
            println!("    {}", fields.join(" "));
        }
    }

    if report.skipped > 0 {
        println!();
        println!("{} checks skipped after the first failure", report.skipped);
    }

    println!();
    println!("{}", if report.passed { "PASSED" } else { "FAILED" });
}

async fn connect(config: &Config) -> Result<Client> {
    Client::builder(config.clone())
        .build()
        .await
        .context("Failed to start engine client")
}

/// Context bounded by `timeout` seconds that Ctrl-C cancels
fn interruptible(timeout: Option<u64>) -> CallContext {
    let ctx = match timeout {
        Some(secs) => CallContext::with_timeout(Duration::from_secs(secs)),
        None => CallContext::background(),
    };

    let cancel = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    ctx
}
