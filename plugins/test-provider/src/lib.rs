//! Test provider
//!
//! A deterministic provider used by the engine's integration tests and as a
//! reference for plugin authors. It exposes three resources:
//!
//! - `slow_resource`: writes one row after about 4 seconds
//! - `very_slow_resource`: writes one row after about 5 seconds
//! - `error_resource`: always fails
//!
//! Requested resources are fetched concurrently.

use async_trait::async_trait;
use futures::future::try_join_all;
use harvest_sdk::errors::ProviderError;
use harvest_sdk::manifest::ReattachManifest;
use harvest_sdk::provider::Provider;
use harvest_sdk::serve::serve_unmanaged;
use harvest_sdk::types::{
    Column, ColumnType, ConfigureRequest, FetchProgress, FetchSummary, ProviderConfiguration,
    ProviderSchema, ResourceTable,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const PROVIDER_NAME: &str = "test";
pub const PROVIDER_VERSION: &str = "v0.0.0";

pub const SLOW_RESOURCE: &str = "slow_resource";
pub const VERY_SLOW_RESOURCE: &str = "very_slow_resource";
pub const ERROR_RESOURCE: &str = "error_resource";

/// Every resource, in schema order
pub const RESOURCES: [&str; 3] = [SLOW_RESOURCE, VERY_SLOW_RESOURCE, ERROR_RESOURCE];

/// Sample configuration returned by `get_configuration`
pub const SAMPLE_CONFIGURATION: &str = r#"
[[providers]]
name = "test"
version = "v0.0.0"
resources = ["slow_resource", "very_slow_resource", "error_resource"]

[providers.configuration]
regions = ["adsa"]

[[providers.configuration.accounts]]
id = "1"
regions = ["asdas"]
resources = ["ab", "c"]
"#;

/// The test provider
#[derive(Default)]
pub struct TestProvider {
    pool: RwLock<Option<SqlitePool>>,
}

impl TestProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated latency of a resource
    fn delay(resource: &str) -> Option<Duration> {
        match resource {
            SLOW_RESOURCE => Some(Duration::from_secs(4)),
            VERY_SLOW_RESOURCE => Some(Duration::from_secs(5)),
            _ => None,
        }
    }

    async fn fetch_resource(
        &self,
        pool: &SqlitePool,
        resource: &str,
        progress: &mpsc::Sender<FetchProgress>,
    ) -> Result<u64, ProviderError> {
        if resource == ERROR_RESOURCE {
            return Err(ProviderError::Resource {
                resource: resource.to_string(),
                message: "failed to fetch resource".to_string(),
            });
        }

        let delay =
            Self::delay(resource).ok_or_else(|| ProviderError::UnknownResource(resource.to_string()))?;
        debug!("Fetching {} ({:?})", resource, delay);
        tokio::time::sleep(delay).await;

        // Table names come from the fixed resource list above.
        let insert = format!(
            "INSERT INTO \"{}\" (id, some_bool) VALUES (lower(hex(randomblob(16))), 1)",
            resource
        );
        sqlx::query(&insert)
            .execute(pool)
            .await
            .map_err(|e| ProviderError::Store(e.to_string()))?;

        // Progress is best effort.
        let _ = progress
            .send(FetchProgress {
                resource: resource.to_string(),
                rows_written: 1,
                finished: true,
            })
            .await;

        Ok(1)
    }
}

#[async_trait]
impl Provider for TestProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn version(&self) -> &str {
        PROVIDER_VERSION
    }

    async fn schema(&self) -> Result<ProviderSchema, ProviderError> {
        Ok(ProviderSchema {
            name: PROVIDER_NAME.to_string(),
            version: PROVIDER_VERSION.to_string(),
            resource_tables: RESOURCES.iter().map(|name| table(name)).collect(),
        })
    }

    async fn configuration(&self) -> Result<ProviderConfiguration, ProviderError> {
        Ok(ProviderConfiguration {
            config: SAMPLE_CONFIGURATION.to_string(),
        })
    }

    async fn configure(&self, request: ConfigureRequest) -> Result<(), ProviderError> {
        let options = SqliteConnectOptions::from_str(&request.dsn)
            .map_err(|e| ProviderError::Store(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| ProviderError::Store(e.to_string()))?;

        for name in RESOURCES {
            let create = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\" (\"id\" TEXT, \"some_bool\" BOOLEAN)",
                name
            );
            sqlx::query(&create)
                .execute(&pool)
                .await
                .map_err(|e| ProviderError::Store(e.to_string()))?;
        }

        debug!("Configured with {}", request.configuration);
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn fetch(
        &self,
        resources: Vec<String>,
        progress: mpsc::Sender<FetchProgress>,
    ) -> Result<FetchSummary, ProviderError> {
        let pool = self
            .pool
            .read()
            .await
            .clone()
            .ok_or(ProviderError::NotConfigured)?;

        let resources = if resources.is_empty() {
            RESOURCES.iter().map(|r| r.to_string()).collect()
        } else {
            resources
        };

        let rows = try_join_all(
            resources
                .iter()
                .map(|resource| self.fetch_resource(&pool, resource, &progress)),
        )
        .await?;

        let summary = FetchSummary {
            resources,
            rows_written: rows.iter().sum(),
        };
        info!(
            "Fetched {} resources, {} rows",
            summary.resources.len(),
            summary.rows_written
        );
        Ok(summary)
    }
}

fn table(name: &str) -> ResourceTable {
    ResourceTable::new(
        name,
        vec![
            Column::new("id", ColumnType::Uuid),
            Column::new("some_bool", ColumnType::Bool),
        ],
    )
}

/// Serve the test provider unmanaged on a loopback port
///
/// Returns the manifest the engine attaches with. Serving stops when
/// `shutdown` fires.
pub async fn serve_test_plugin(
    shutdown: CancellationToken,
) -> io::Result<(ReattachManifest, JoinHandle<io::Result<()>>)> {
    serve_unmanaged(Arc::new(TestProvider::new()), shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_schema_has_three_tables() {
        let schema = TestProvider::new().schema().await.unwrap();
        assert_eq!(schema.name, "test");
        assert_eq!(schema.version, "v0.0.0");
        assert_eq!(schema.resource_tables.len(), 3);
        assert!(schema.table(SLOW_RESOURCE).is_some());
    }

    #[tokio::test]
    async fn test_sample_configuration_is_toml() {
        let configuration = TestProvider::new().configuration().await.unwrap();
        let parsed: toml::Value = toml::from_str(&configuration.config).unwrap();
        assert!(parsed.get("providers").is_some());
    }

    #[tokio::test]
    async fn test_fetch_requires_configure() {
        let (tx, _rx) = mpsc::channel(4);
        let result = TestProvider::new()
            .fetch(vec![SLOW_RESOURCE.to_string()], tx)
            .await;
        assert!(matches!(result, Err(ProviderError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_error_resource_fails() {
        let dir = TempDir::new().unwrap();
        let provider = TestProvider::new();
        provider
            .configure(ConfigureRequest {
                dsn: format!("sqlite://{}", dir.path().join("store.db").display()),
                configuration: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let result = provider.fetch(vec![ERROR_RESOURCE.to_string()], tx).await;
        assert!(matches!(result, Err(ProviderError::Resource { .. })));
    }

    #[tokio::test]
    async fn test_slow_resource_writes_a_row() {
        let dir = TempDir::new().unwrap();
        let provider = TestProvider::new();
        provider
            .configure(ConfigureRequest {
                dsn: format!("sqlite://{}", dir.path().join("store.db").display()),
                configuration: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let summary = provider
            .fetch(vec![SLOW_RESOURCE.to_string()], tx)
            .await
            .unwrap();
        assert_eq!(summary.rows_written, 1);

        let progress = rx.recv().await.unwrap();
        assert_eq!(progress.resource, SLOW_RESOURCE);
        assert!(progress.finished);
    }
}
