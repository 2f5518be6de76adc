/// Shared relational store
///
/// Providers write fetched resources into this store and policy checks query
/// it. The engine only creates tables from provider schemas and hands out
/// pooled connections; row contents are owned by the providers.
///
/// The store is SQLite in WAL mode so that provider processes can write
/// while the engine reads.
use harvest_sdk::errors::EngineError;
use harvest_sdk::types::{ProviderSchema, ResourceTable};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Sqlite};
use std::str::FromStr;
use tracing::{debug, info};

use crate::config::ConnectionConfig;

/// Pooled connection to the store
pub type StoreConnection = PoolConnection<Sqlite>;

/// Store connection pool
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    dsn: String,
}

impl Store {
    /// Open the store described by `dsn`
    ///
    /// The database file is created if missing and switched to WAL mode.
    pub async fn connect(dsn: &str, config: &ConnectionConfig) -> Result<Self, EngineError> {
        info!("Connecting to store: {}", dsn);

        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| EngineError::Database(format!("Invalid DSN '{}': {}", dsn, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to connect to store: {}", e)))?;

        debug!("Store connection established");

        Ok(Self {
            pool,
            dsn: dsn.to_string(),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// DSN the store was opened with, forwarded untouched to providers
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    /// Acquire a pooled connection
    ///
    /// The connection returns to the pool when dropped.
    pub async fn acquire(&self) -> Result<StoreConnection, EngineError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to acquire connection: {}", e)))
    }

    /// Create the tables a provider writes into
    ///
    /// Existing tables are left untouched.
    pub async fn sync_tables(&self, schema: &ProviderSchema) -> Result<(), EngineError> {
        info!(
            "Synchronising {} tables for provider '{}' {}",
            schema.resource_tables.len(),
            schema.name,
            schema.version
        );

        let mut conn = self.acquire().await?;
        for table in &schema.resource_tables {
            let statement = create_table_statement(table);
            debug!("{}", statement);
            sqlx::query(&statement)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    EngineError::Database(format!(
                        "Failed to create table '{}': {}",
                        table.name, e
                    ))
                })?;
        }

        Ok(())
    }

    /// Flush the WAL to disk
    pub async fn flush_wal(&self) -> Result<(), EngineError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to flush WAL: {}", e)))?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close all connections in the pool
    pub async fn close(&self) -> Result<(), EngineError> {
        info!("Closing store connection");

        self.flush_wal().await?;
        self.pool.close().await;

        Ok(())
    }
}

/// Quote an SQL identifier
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn create_table_statement(table: &ResourceTable) -> String {
    let columns = table
        .columns
        .iter()
        .map(|column| {
            format!(
                "{} {}",
                quote_identifier(&column.name),
                column.column_type.sql_type()
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(&table.name),
        columns
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_sdk::types::{Column, ColumnType};
    use tempfile::TempDir;

    fn dsn_in(dir: &TempDir) -> String {
        format!("sqlite://{}", dir.path().join("store.db").display())
    }

    fn schema() -> ProviderSchema {
        ProviderSchema {
            name: "test".to_string(),
            version: "v0.0.0".to_string(),
            resource_tables: vec![ResourceTable::new(
                "slow_resource",
                vec![
                    Column::new("id", ColumnType::Uuid),
                    Column::new("some_bool", ColumnType::Bool),
                ],
            )],
        }
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_table_statement() {
        let statement = create_table_statement(&schema().resource_tables[0]);
        assert_eq!(
            statement,
            "CREATE TABLE IF NOT EXISTS \"slow_resource\" (\"id\" TEXT, \"some_bool\" BOOLEAN)"
        );
    }

    #[tokio::test]
    async fn test_store_creation_and_wal() {
        let dir = TempDir::new().unwrap();
        let store = Store::connect(&dsn_in(&dir), &ConnectionConfig::default())
            .await
            .unwrap();

        assert!(dir.path().join("store.db").exists());

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_tables_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = Store::connect(&dsn_in(&dir), &ConnectionConfig::default())
            .await
            .unwrap();

        store.sync_tables(&schema()).await.unwrap();
        store.sync_tables(&schema()).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(tables, vec!["slow_resource".to_string()]);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let dir = TempDir::new().unwrap();
        let dsn = format!(
            "sqlite://{}",
            dir.path().join("missing").join("store.db").display()
        );
        let result = Store::connect(&dsn, &ConnectionConfig::default()).await;
        assert!(matches!(result, Err(EngineError::Database(_))));
    }
}
