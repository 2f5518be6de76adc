//! Example provider plugin
//!
//! A provider with a single `greetings` table that reports progress but
//! writes nothing. Build it, install it under
//! `<plugin_dir>/<org>/static/v0.1.0/plugin` with its checksum manifest and
//! signature, and the engine launches it like any other provider.

use async_trait::async_trait;
use harvest_sdk::serve::serve_managed;
use harvest_sdk::{
    Column, ColumnType, ConfigureRequest, FetchProgress, FetchSummary, Provider,
    ProviderConfiguration, ProviderError, ProviderSchema, ResourceTable,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const GREETINGS: &str = "greetings";

/// Provider that answers from constants
#[derive(Default)]
struct StaticProvider {
    dsn: Mutex<Option<String>>,
}

#[async_trait]
impl Provider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    fn version(&self) -> &str {
        "v0.1.0"
    }

    async fn schema(&self) -> Result<ProviderSchema, ProviderError> {
        Ok(ProviderSchema {
            name: self.name().to_string(),
            version: self.version().to_string(),
            resource_tables: vec![ResourceTable::new(
                GREETINGS,
                vec![
                    Column::new("id", ColumnType::Uuid),
                    Column::new("message", ColumnType::Text),
                ],
            )
            .with_description("Friendly messages")],
        })
    }

    async fn configuration(&self) -> Result<ProviderConfiguration, ProviderError> {
        Ok(ProviderConfiguration {
            config: "[[providers]]\nname = \"static\"\nversion = \"v0.1.0\"\n".to_string(),
        })
    }

    async fn configure(&self, request: ConfigureRequest) -> Result<(), ProviderError> {
        *self.dsn.lock().await = Some(request.dsn);
        Ok(())
    }

    async fn fetch(
        &self,
        resources: Vec<String>,
        progress: mpsc::Sender<FetchProgress>,
    ) -> Result<FetchSummary, ProviderError> {
        if self.dsn.lock().await.is_none() {
            return Err(ProviderError::NotConfigured);
        }

        for resource in &resources {
            if resource != GREETINGS {
                return Err(ProviderError::UnknownResource(resource.clone()));
            }
            let _ = progress
                .send(FetchProgress {
                    resource: resource.clone(),
                    rows_written: 0,
                    finished: true,
                })
                .await;
        }

        Ok(FetchSummary {
            resources,
            rows_written: 0,
        })
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    serve_managed(Arc::new(StaticProvider::default())).await
}
