//! Fetch orchestration
//!
//! Drives the fetch RPC of every requested provider under one caller
//! context. Up to `max_parallel` providers run at once. The first failure
//! cancels the remaining providers and is returned; there is no rollback of
//! what already reached the store.

use futures::stream::{self, StreamExt};
use harvest_sdk::errors::EngineError;
use harvest_sdk::types::ConfigureRequest;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::plugin::{PluginHandle, PluginId, ProcessManager};

/// One provider to fetch with
#[derive(Debug, Clone)]
pub struct ProviderFetch {
    pub id: PluginId,
    pub resources: Vec<String>,
    /// Provider specific configuration block, forwarded as is
    pub configuration: serde_json::Value,
}

/// Providers to fetch in one call
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    pub providers: Vec<ProviderFetch>,
}

/// Result of one successful provider fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcome {
    pub provider: String,
    pub resources: Vec<String>,
    pub rows_written: u64,
    pub duration: Duration,
}

/// Runs provider fetches
pub struct FetchOrchestrator {
    manager: Arc<ProcessManager>,
    dsn: String,
    max_parallel: usize,
}

impl FetchOrchestrator {
    pub fn new(manager: Arc<ProcessManager>, dsn: impl Into<String>, max_parallel: usize) -> Self {
        Self {
            manager,
            dsn: dsn.into(),
            max_parallel: max_parallel.max(1),
        }
    }

    /// Fetch every provider in `plan`
    ///
    /// Returns the outcomes of all providers, or the first error. Providers
    /// still running when that error occurs are cancelled.
    pub async fn fetch(
        &self,
        ctx: &CallContext,
        plan: FetchPlan,
    ) -> Result<Vec<ProviderOutcome>, EngineError> {
        let group = ctx.child();

        let mut running = stream::iter(plan.providers.into_iter().map(|provider| {
            let group = group.clone();
            async move {
                let result = self.fetch_provider(&group, provider).await;
                if result.is_err() {
                    group.cancel();
                }
                result
            }
        }))
        .buffer_unordered(self.max_parallel);

        let mut outcomes = Vec::new();
        let mut first_error = None;
        while let Some(result) = running.next().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => debug!("Additional fetch failure after cancellation: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    async fn fetch_provider(
        &self,
        ctx: &CallContext,
        provider: ProviderFetch,
    ) -> Result<ProviderOutcome, EngineError> {
        let started = Instant::now();
        let name = provider.id.name.clone();
        debug!("Fetching {} resources {:?}", provider.id, provider.resources);

        let mut handle = self.manager.acquire(ctx, &provider.id).await?;
        let result = self.drive(ctx, &mut handle, &provider).await;

        if let Err(e) = handle.close().await {
            warn!("Failed to close provider '{}': {}", name, e);
        }

        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                warn!(provider = %name, error = %e, "Provider fetch failed");
                return Err(e);
            }
        };

        // A late success under a dead context still counts as failure.
        if let Some(interrupted) = ctx.interruption() {
            return Err(interrupted.into_error(&name, "fetch"));
        }

        let outcome = ProviderOutcome {
            provider: name,
            resources: summary.resources,
            rows_written: summary.rows_written,
            duration: started.elapsed(),
        };
        info!(
            provider = %outcome.provider,
            rows = outcome.rows_written,
            duration_ms = outcome.duration.as_millis() as u64,
            "Provider fetch finished"
        );

        Ok(outcome)
    }

    async fn drive(
        &self,
        ctx: &CallContext,
        handle: &mut PluginHandle,
        provider: &ProviderFetch,
    ) -> Result<harvest_sdk::types::FetchSummary, EngineError> {
        handle
            .configure(
                ctx,
                ConfigureRequest {
                    dsn: self.dsn.clone(),
                    configuration: provider.configuration.clone(),
                },
            )
            .await?;

        let name = handle.provider().to_string();
        let stream = handle.fetch(ctx, provider.resources.clone()).await?;
        stream
            .finish(|progress| {
                debug!(
                    provider = %name,
                    resource = %progress.resource,
                    rows = progress.rows_written,
                    finished = progress.finished,
                    "Fetch progress"
                );
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{DiscoverySource, ProcessManagerConfig};
    use crate::trust::TrustValidator;
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir) -> FetchOrchestrator {
        let config = ProcessManagerConfig {
            plugin_dir: dir.path().to_path_buf(),
            handshake_timeout: Duration::from_secs(1),
            attach_timeout: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
        };
        let manager = ProcessManager::new(
            config,
            DiscoverySource::Launch,
            Arc::new(TrustValidator::new().unwrap()),
        );
        FetchOrchestrator::new(Arc::new(manager), "sqlite::memory:", 0)
    }

    #[tokio::test]
    async fn test_empty_request_succeeds() {
        let dir = TempDir::new().unwrap();
        let outcomes = orchestrator(&dir)
            .fetch(&CallContext::background(), FetchPlan::default())
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_missing_provider_fails() {
        let dir = TempDir::new().unwrap();
        let request = FetchPlan {
            providers: vec![ProviderFetch {
                id: PluginId::new("harvest", "absent", "v1.0.0"),
                resources: vec![],
                configuration: serde_json::Value::Null,
            }],
        };

        let result = orchestrator(&dir)
            .fetch(&CallContext::background(), request)
            .await;
        assert!(matches!(result, Err(EngineError::PluginUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let dir = TempDir::new().unwrap();
        let ctx = CallContext::background();
        ctx.cancel();

        let request = FetchPlan {
            providers: vec![ProviderFetch {
                id: PluginId::new("harvest", "absent", "v1.0.0"),
                resources: vec![],
                configuration: serde_json::Value::Null,
            }],
        };

        let result = orchestrator(&dir).fetch(&ctx, request).await;
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    }
}
