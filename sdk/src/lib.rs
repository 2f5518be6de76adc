//! Harvest SDK
//!
//! Shared library providing the provider trait, wire protocol and types used
//! by both the Harvest engine and provider plugins.

/// Error types and handling
pub mod errors;

/// Schema, configuration and fetch types
pub mod types;

/// Endpoint and discovery manifest types
pub mod manifest;

/// Provider RPC wire protocol
pub mod protocol;

/// Provider trait
pub mod provider;

/// Provider-side RPC harness
pub mod serve;

// Re-export commonly used types
pub use errors::{EngineError, HarvestErrorExt, ProviderError};
pub use manifest::{Endpoint, ReattachManifest, Transport};
pub use provider::Provider;
pub use types::{
    Column, ColumnType, ConfigureRequest, FetchProgress, FetchSummary, ProviderConfiguration,
    ProviderSchema, ResourceTable,
};
