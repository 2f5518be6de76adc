//! Provider trait
//!
//! A provider is an out-of-process plugin that pulls data from one external
//! source into the shared store. Plugin authors implement [`Provider`] and
//! hand it to one of the [`crate::serve`] entry points.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::ProviderError;
use crate::types::{
    ConfigureRequest, FetchProgress, FetchSummary, ProviderConfiguration, ProviderSchema,
};

/// Contract every provider plugin implements
///
/// The engine calls `configure` once per handle before `fetch`. Schema and
/// configuration queries do not require prior configuration.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name, as referenced from the engine configuration
    fn name(&self) -> &str;

    /// Provider version
    fn version(&self) -> &str;

    /// Describe the tables this provider writes
    async fn schema(&self) -> Result<ProviderSchema, ProviderError>;

    /// Render a sample configuration document
    async fn configuration(&self) -> Result<ProviderConfiguration, ProviderError>;

    /// Receive the store DSN and provider-specific configuration
    async fn configure(&self, request: ConfigureRequest) -> Result<(), ProviderError>;

    /// Fetch the selected resources into the store
    ///
    /// Progress updates are best effort; a closed channel must not abort the
    /// fetch.
    async fn fetch(
        &self,
        resources: Vec<String>,
        progress: mpsc::Sender<FetchProgress>,
    ) -> Result<FetchSummary, ProviderError>;
}
