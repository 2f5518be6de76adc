//! Engine client
//!
//! Wires the hub, trust gate, process manager, store, fetch orchestrator and
//! policy engine together behind the operations callers use. The hub
//! implementation and the discovery source are fixed when the client is
//! built.
//!
//! # Examples
//!
//! ```no_run
//! use harvest_engine::client::{Client, FetchRequest, ProviderSelection};
//! use harvest_engine::config::Config;
//! use harvest_engine::context::CallContext;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! let mut client = Client::builder(config).build().await?;
//! client.initialize(&CallContext::background()).await?;
//!
//! let ctx = CallContext::with_timeout(Duration::from_secs(600));
//! client
//!     .fetch(&ctx, FetchRequest::new(vec![ProviderSelection::new("aws")]))
//!     .await?;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use harvest_hub::{HubError, ProviderDetails, Registry, RemoteHub, StaticHub};
use harvest_sdk::errors::EngineError;
use harvest_sdk::types::{ProviderConfiguration, ProviderSchema};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, ProviderConfig};
use crate::context::CallContext;
use crate::fetch::{FetchOrchestrator, FetchPlan, ProviderFetch};
use crate::plugin::{DiscoverySource, PluginHandle, PluginId, ProcessManager, ProcessManagerConfig};
use crate::policy::{ExecutePolicyRequest, PolicyEngine, PolicyReport};
use crate::store::Store;
use crate::trust::{PluginArtifacts, TrustRecord, TrustValidator};

/// A provider to fetch with and an optional resource override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    /// Name of a configured provider
    pub name: String,
    /// Resources to fetch, the configured ones when empty
    pub resources: Vec<String>,
}

impl ProviderSelection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
        }
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }
}

/// Providers to fetch in one call
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub providers: Vec<ProviderSelection>,
}

impl FetchRequest {
    pub fn new(providers: Vec<ProviderSelection>) -> Self {
        Self { providers }
    }

    /// Every configured provider with its configured resources
    pub fn all(config: &Config) -> Self {
        Self {
            providers: config
                .providers
                .iter()
                .map(|p| ProviderSelection::new(&p.name))
                .collect(),
        }
    }
}

/// Builder for [`Client`]
pub struct ClientBuilder {
    config: Config,
    hub: Option<Arc<dyn Registry>>,
    discovery: Option<DiscoverySource>,
    trust: Option<TrustValidator>,
}

impl ClientBuilder {
    /// Use this hub instead of the configured one
    pub fn hub<R: Registry + 'static>(mut self, hub: R) -> Self {
        self.hub = Some(Arc::new(hub));
        self
    }

    /// Use this discovery source instead of the configured one
    pub fn discovery(mut self, discovery: DiscoverySource) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Use this trust validator instead of the embedded keyring
    pub fn trust(mut self, trust: TrustValidator) -> Self {
        self.trust = Some(trust);
        self
    }

    /// Connect to the store and assemble the client
    pub async fn build(self) -> Result<Client, EngineError> {
        let Self {
            config,
            hub,
            discovery,
            trust,
        } = self;

        let hub: Arc<dyn Registry> = match hub {
            Some(hub) => hub,
            None if config.hub.offline => Arc::new(StaticHub::permissive()),
            None => Arc::new(
                RemoteHub::new(config.hub.url.clone())
                    .map_err(|e| EngineError::Registry(e.to_string()))?,
            ),
        };

        let trust = Arc::new(match trust {
            Some(trust) => trust,
            None => TrustValidator::new()?,
        });

        let discovery = discovery.unwrap_or_else(|| DiscoverySource::from_config(&config.plugins));
        let manager = Arc::new(ProcessManager::new(
            ProcessManagerConfig::from(&config.plugins),
            discovery,
            Arc::clone(&trust),
        ));

        let dsn = config.dsn();
        let store = Store::connect(&dsn, &config.connection).await?;
        let fetcher = FetchOrchestrator::new(
            Arc::clone(&manager),
            dsn,
            config.fetch.max_parallel_providers,
        );
        let policy = PolicyEngine::new(store.clone());

        Ok(Client {
            config,
            hub,
            trust,
            manager,
            store,
            fetcher,
            policy,
            resolved: HashMap::new(),
        })
    }
}

/// Engine client
pub struct Client {
    config: Config,
    hub: Arc<dyn Registry>,
    trust: Arc<TrustValidator>,
    manager: Arc<ProcessManager>,
    store: Store,
    fetcher: FetchOrchestrator,
    policy: PolicyEngine,
    resolved: HashMap<String, ProviderDetails>,
}

impl Client {
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder {
            config,
            hub: None,
            discovery: None,
            trust: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Hub details resolved by [`Client::initialize`]
    pub fn resolved(&self, name: &str) -> Option<&ProviderDetails> {
        self.resolved.get(name)
    }

    /// Verify every configured provider with the hub and create its tables
    pub async fn initialize(&mut self, ctx: &CallContext) -> Result<(), EngineError> {
        info!("Initializing {} providers", self.config.providers.len());

        for provider in &self.config.providers {
            let details = ctx
                .run(self.resolve(provider))
                .await
                .map_err(|interrupted| interrupted.into_error(&provider.name, "resolve"))??;
            self.resolved.insert(provider.name.clone(), details);
        }

        for provider in &self.config.providers {
            let schema = self
                .with_handle(ctx, provider, |handle, ctx| Box::pin(handle.get_schema(ctx)))
                .await?;
            self.store.sync_tables(&schema).await?;
        }

        Ok(())
    }

    /// Fetch the selected providers into the store
    ///
    /// Each selection is matched by name against the configuration; a
    /// non-empty resource list overrides the configured one.
    pub async fn fetch(&self, ctx: &CallContext, request: FetchRequest) -> Result<(), EngineError> {
        let mut plan = FetchPlan::default();
        for selection in request.providers {
            let provider = self.provider_config(&selection.name)?;
            let resources = if selection.resources.is_empty() {
                provider.resources.clone()
            } else {
                selection.resources
            };

            plan.providers.push(ProviderFetch {
                id: plugin_id(provider),
                resources,
                configuration: provider.configuration.clone(),
            });
        }

        let outcomes = self.fetcher.fetch(ctx, plan).await?;
        let rows: u64 = outcomes.iter().map(|o| o.rows_written).sum();
        info!("Fetched {} providers, {} rows written", outcomes.len(), rows);
        Ok(())
    }

    /// Table schema of a configured provider
    pub async fn get_provider_schema(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<ProviderSchema, EngineError> {
        let provider = self.provider_config(name)?;
        self.with_handle(ctx, provider, |handle, ctx| Box::pin(handle.get_schema(ctx)))
            .await
    }

    /// Rendered sample configuration of a configured provider
    pub async fn get_provider_configuration(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<ProviderConfiguration, EngineError> {
        let provider = self.provider_config(name)?;
        self.with_handle(ctx, provider, |handle, ctx| {
            Box::pin(handle.get_configuration(ctx))
        })
        .await
    }

    /// Evaluate a policy file against the store
    pub async fn execute_policy(
        &self,
        ctx: &CallContext,
        request: &ExecutePolicyRequest,
    ) -> Result<PolicyReport, EngineError> {
        self.policy.execute(ctx, request).await
    }

    /// Run the trust gate over a locally installed provider
    pub async fn verify_install(&self, name: &str) -> Result<TrustRecord, EngineError> {
        let provider = self.provider_config(name)?;
        let artifacts = PluginArtifacts::in_dir(&self.manager.install_dir(&plugin_id(provider)));
        let trust = Arc::clone(&self.trust);

        tokio::task::spawn_blocking(move || trust.validate(&artifacts))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
    }

    /// Close the store
    pub async fn close(self) -> Result<(), EngineError> {
        self.store.close().await
    }

    fn provider_config(&self, name: &str) -> Result<&ProviderConfig, EngineError> {
        self.config
            .provider(name)
            .ok_or_else(|| EngineError::ProviderNotFound(name.to_string()))
    }

    async fn resolve(&self, provider: &ProviderConfig) -> Result<ProviderDetails, EngineError> {
        let (organization, name, version) = (&provider.source, &provider.name, &provider.version);

        if !self.hub.verify_provider(organization, name, version).await {
            return Err(EngineError::ProviderNotVerified {
                organization: organization.clone(),
                name: name.clone(),
                version: version.clone(),
            });
        }

        let details = self
            .hub
            .get_provider(organization, name, version)
            .await
            .map_err(|e| match e {
                HubError::NotFound { .. } => EngineError::ProviderNotVerified {
                    organization: organization.clone(),
                    name: name.clone(),
                    version: version.clone(),
                },
                other => EngineError::Registry(other.to_string()),
            })?;

        debug!("Resolved {}/{}@{}", organization, name, version);
        Ok(details)
    }

    /// Acquire a handle, run one call on it and close it again
    async fn with_handle<T, F>(
        &self,
        ctx: &CallContext,
        provider: &ProviderConfig,
        call: F,
    ) -> Result<T, EngineError>
    where
        F: for<'h> FnOnce(
            &'h mut PluginHandle,
            &'h CallContext,
        ) -> futures::future::BoxFuture<'h, Result<T, EngineError>>,
    {
        let mut handle = self.manager.acquire(ctx, &plugin_id(provider)).await?;
        let result = call(&mut handle, ctx).await;

        if let Err(e) = handle.close().await {
            warn!("Failed to close provider '{}': {}", provider.name, e);
        }

        result
    }
}

fn plugin_id(provider: &ProviderConfig) -> PluginId {
    PluginId::new(&provider.source, &provider.name, &provider.version)
}
