//! Harvest Engine Library
//!
//! This library provides the core functionality of the Harvest engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Deadline and cancellation propagation
pub mod context;

/// Plugin artifact verification (checksums and signatures)
pub mod trust;

/// Shared SQL store
pub mod store;

/// Provider process lifecycle and RPC client
pub mod plugin;

/// Concurrent fetch orchestration
pub mod fetch;

/// Policy evaluation against the store
pub mod policy;

/// Engine client tying the components together
pub mod client;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

pub use client::{Client, ClientBuilder, FetchRequest, ProviderSelection};
pub use context::CallContext;
