//! Harvest provider hub
//!
//! This crate resolves a provider's (organization, name, version) triple to
//! its distribution metadata and answers whether the hub recognises the
//! provider at all. It never downloads, launches or validates binaries; it
//! only supplies the data the engine's trust gate and process manager use.
//!
//! Two implementations ship with the crate:
//! - [`RemoteHub`]: talks to the hosted catalog over HTTP
//! - [`StaticHub`]: deterministic, in-memory answers for tests and offline use

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod registry;

pub use registry::{RemoteHub, StaticHub};

/// Distribution metadata for one provider version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDetails {
    pub organization: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Where the provider archive can be downloaded from
    #[serde(default)]
    pub download_url: Option<String>,
    /// Location of the `<sha256>  <platform>` checksum manifest
    #[serde(default)]
    pub checksums_url: Option<String>,
    /// Location of the detached signature
    #[serde(default)]
    pub signature_url: Option<String>,
}

impl ProviderDetails {
    /// Details carrying only the identity triple
    pub fn new(
        organization: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            download_url: None,
            checksums_url: None,
            signature_url: None,
        }
    }
}

/// Hub errors
#[derive(Debug, Error)]
pub enum HubError {
    #[error("provider {organization}/{name}@{version} not found on hub")]
    NotFound {
        organization: String,
        name: String,
        version: String,
    },

    #[error("hub request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("hub returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid hub URL: {0}")]
    InvalidUrl(String),
}

/// Capability set of a provider registry
///
/// Implementations are chosen when the engine client is constructed and are
/// never swapped afterwards.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Quick legitimacy check of a provider version
    async fn verify_provider(&self, organization: &str, name: &str, version: &str) -> bool;

    /// Resolve distribution metadata of a provider version
    async fn get_provider(
        &self,
        organization: &str,
        name: &str,
        version: &str,
    ) -> Result<ProviderDetails, HubError>;
}
