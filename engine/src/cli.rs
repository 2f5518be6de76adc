//! CLI interface for Harvest
//!
//! This module provides the command-line interface using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Harvest data collection engine
///
/// Runs provider plugins that pull data from external sources into a shared
/// store, and evaluates policies against that store.
#[derive(Parser, Debug)]
#[command(name = "harvest")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch resources from configured providers into the store
    Fetch {
        /// Providers to fetch (default: all configured)
        #[arg(short, long = "provider", value_name = "NAME")]
        providers: Vec<String>,

        /// Resources to fetch, overriding the configured ones
        #[arg(short, long = "resource", value_name = "NAME")]
        resources: Vec<String>,

        /// Give up after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Show the table schema of a provider
    Schema {
        /// Provider name
        provider: String,
    },

    /// Print the sample configuration of a provider
    ProviderConfig {
        /// Provider name
        provider: String,
    },

    /// Evaluate policies against the store
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Run the trust gate over an installed provider
    Verify {
        /// Provider name
        provider: String,
    },
}

/// Policy actions
#[derive(Subcommand, Debug)]
pub enum PolicyAction {
    /// Run a policy file
    Run {
        /// Path to the policy file (YAML or TOML)
        path: PathBuf,

        /// Stop at the first failing check
        #[arg(long)]
        stop_on_failure: bool,

        /// Give up after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}
