//! Integration tests for configuration management
//!
//! These tests verify that the Config struct can be loaded from disk,
//! validated, and processed with path expansion and directory creation.

use harvest_engine::config::{Config, ProviderConfig};
use proptest::prelude::*;
use tempfile::TempDir;

#[test]
fn test_load_from_path() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let config_path = dir.path().join("config.toml");

    std::fs::write(
        &config_path,
        format!(
            r#"
[core]
log_level = "debug"
data_dir = "{}"

[fetch]
max_parallel_providers = 2

[[providers]]
name = "aws"
version = "v0.10.3"
resources = ["ec2.instances", "s3.buckets"]

[providers.configuration]
regions = ["us-east-1"]

[[providers]]
name = "test"
source = "local"
version = "0.0.0"
"#,
            data_dir.display()
        ),
    )
    .unwrap();

    let config = Config::load_from_path(&config_path).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.fetch.max_parallel_providers, 2);
    assert!(data_dir.is_dir(), "data directory should be created");
    assert_eq!(
        config.dsn(),
        format!("sqlite://{}?mode=rwc", data_dir.join("harvest.db").display())
    );

    let aws = config.provider("aws").unwrap();
    assert_eq!(aws.source, "harvest");
    assert_eq!(aws.resources, vec!["ec2.instances", "s3.buckets"]);
    assert_eq!(aws.configuration["regions"][0], "us-east-1");

    let test = config.provider("test").unwrap();
    assert_eq!(test.source, "local");
    assert!(test.resources.is_empty());
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let result = Config::load_from_path(&dir.path().join("absent.toml"));
    assert!(matches!(
        result,
        Err(harvest_sdk::errors::EngineError::Config(_))
    ));
}

#[test]
fn test_explicit_dsn_wins() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml(&format!(
        "[core]\ndata_dir = \"{}\"\n\n[connection]\ndsn = \"sqlite::memory:\"\n",
        dir.path().display()
    ))
    .unwrap();
    assert_eq!(config.dsn(), "sqlite::memory:");
}

proptest! {
    #[test]
    fn test_config_parsing_round_trip(
        log_level in "error|warn|info|debug|trace",
        max_parallel in 1..=64usize,
        max_connections in 1..=32u32,
        major in 0..100u64,
        minor in 0..100u64,
        patch in 0..100u64,
        offline in any::<bool>(),
    ) {
        let mut config = Config::default();
        config.core.log_level = log_level;
        config.fetch.max_parallel_providers = max_parallel;
        config.connection.max_connections = max_connections;
        config.hub.offline = offline;
        config.providers = vec![
            ProviderConfig::new("aws", format!("v{}.{}.{}", major, minor, patch))
                .with_resources(["ec2.instances"]),
        ];

        // Serialize the config object to TOML
        let toml_string = toml::to_string(&config).expect("Failed to serialize Config to string");

        // Parse it back to a struct
        let parsed: Config = toml::from_str(&toml_string).expect("Failed to deserialize TOML to Config");

        prop_assert_eq!(&config.core.log_level, &parsed.core.log_level);
        prop_assert_eq!(config.fetch.max_parallel_providers, parsed.fetch.max_parallel_providers);
        prop_assert_eq!(config.connection.max_connections, parsed.connection.max_connections);
        prop_assert_eq!(config.hub.offline, parsed.hub.offline);
        prop_assert_eq!(&config.providers[0].version, &parsed.providers[0].version);
        prop_assert_eq!(&config.providers[0].resources, &parsed.providers[0].resources);
    }
}
