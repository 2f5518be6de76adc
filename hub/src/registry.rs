//! Registry implementations: hosted catalog and static fallback

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, warn};

use crate::{HubError, ProviderDetails, Registry};

/// Default hosted catalog
pub const DEFAULT_HUB_URL: &str = "https://hub.harvest.dev";

/// Registry backed by the hosted provider catalog
pub struct RemoteHub {
    base_url: Url,
    client: reqwest::Client,
}

impl RemoteHub {
    /// Create a hub client for the given catalog base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self, HubError> {
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| HubError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(HubError::InvalidUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("harvest-hub/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { base_url, client })
    }

    /// Catalog URL of a provider version
    ///
    /// Every identity part is pushed as one escaped path segment.
    fn provider_url(&self, organization: &str, name: &str, version: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "v1",
                "orgs",
                organization,
                "providers",
                name,
                "versions",
                version,
            ]);
        }
        url
    }
}

#[async_trait]
impl Registry for RemoteHub {
    async fn verify_provider(&self, organization: &str, name: &str, version: &str) -> bool {
        match self.get_provider(organization, name, version).await {
            Ok(_) => true,
            Err(HubError::NotFound { .. }) => false,
            Err(e) => {
                warn!(
                    "Failed to verify provider {}/{}@{}: {}",
                    organization, name, version, e
                );
                false
            }
        }
    }

    async fn get_provider(
        &self,
        organization: &str,
        name: &str,
        version: &str,
    ) -> Result<ProviderDetails, HubError> {
        let url = self.provider_url(organization, name, version);
        debug!("Resolving provider from hub: {}", url);

        let response = self.client.get(url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(HubError::NotFound {
                organization: organization.to_string(),
                name: name.to_string(),
                version: version.to_string(),
            });
        }

        let details: ProviderDetails = response.error_for_status()?.json().await?;
        if details.name != name || details.organization != organization {
            return Err(HubError::InvalidResponse(format!(
                "asked for {}/{}, hub answered {}/{}",
                organization, name, details.organization, details.name
            )));
        }

        Ok(details)
    }
}

/// Registry answering from memory
///
/// `StaticHub::permissive()` accepts every triple and echoes it back;
/// `StaticHub::with_providers` only knows the listed versions.
#[derive(Debug, Clone, Default)]
pub struct StaticHub {
    providers: Option<Vec<ProviderDetails>>,
}

impl StaticHub {
    /// Hub that recognises any provider
    pub fn permissive() -> Self {
        Self { providers: None }
    }

    /// Hub that recognises exactly the given providers
    pub fn with_providers(providers: Vec<ProviderDetails>) -> Self {
        Self {
            providers: Some(providers),
        }
    }

    fn find(&self, organization: &str, name: &str, version: &str) -> Option<ProviderDetails> {
        match &self.providers {
            None => Some(ProviderDetails::new(organization, name, version)),
            Some(providers) => providers
                .iter()
                .find(|p| p.organization == organization && p.name == name && p.version == version)
                .cloned(),
        }
    }
}

#[async_trait]
impl Registry for StaticHub {
    async fn verify_provider(&self, organization: &str, name: &str, version: &str) -> bool {
        self.find(organization, name, version).is_some()
    }

    async fn get_provider(
        &self,
        organization: &str,
        name: &str,
        version: &str,
    ) -> Result<ProviderDetails, HubError> {
        self.find(organization, name, version)
            .ok_or_else(|| HubError::NotFound {
                organization: organization.to_string(),
                name: name.to_string(),
                version: version.to_string(),
            })
    }
}
