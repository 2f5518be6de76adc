#![cfg(unix)]
/// Integration tests for managed provider launches
///
/// The "plugin" is a shell script that prints a handshake pointing at an
/// in-process test provider, then idles until it is terminated. This covers:
/// - Trust validation before spawn
/// - Handshake parsing and RPC over the announced endpoint
/// - Graceful shutdown of the child
use ed25519_dalek::{Signer, SigningKey};
use harvest_engine::context::CallContext;
use harvest_engine::plugin::{DiscoverySource, PluginId, ProcessManager, ProcessManagerConfig};
use harvest_engine::trust::{current_platform, sha256_file, PluginArtifacts, TrustValidator};
use harvest_sdk::errors::EngineError;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use test_provider::serve_test_plugin;
use tokio_util::sync::CancellationToken;

fn plugin_id() -> PluginId {
    PluginId::new("harvest", "test", "v0.0.0")
}

fn manager(plugin_dir: &Path, trusted: &SigningKey) -> ProcessManager {
    manager_with_handshake(plugin_dir, trusted, Duration::from_secs(5))
}

fn manager_with_handshake(
    plugin_dir: &Path,
    trusted: &SigningKey,
    handshake_timeout: Duration,
) -> ProcessManager {
    let config = ProcessManagerConfig {
        plugin_dir: plugin_dir.to_path_buf(),
        handshake_timeout,
        attach_timeout: Duration::from_secs(1),
        probe_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
    };
    let trust = TrustValidator::with_keys(vec![trusted.verifying_key()])
        .with_platform(current_platform());
    ProcessManager::new(config, DiscoverySource::Launch, Arc::new(trust))
}

/// Write a signed script plugin into its install directory
fn install_script(dir: &Path, handshake: &str, marker: &Path, signer: &SigningKey) {
    std::fs::create_dir_all(dir).unwrap();
    let artifacts = PluginArtifacts::in_dir(dir);

    let script = format!(
        "#!/bin/sh\ntouch '{}'\necho '{}'\nexec sleep 30\n",
        marker.display(),
        handshake
    );
    std::fs::write(&artifacts.binary, &script).unwrap();
    std::fs::set_permissions(&artifacts.binary, std::fs::Permissions::from_mode(0o755)).unwrap();

    let digest = sha256_file(&artifacts.binary).unwrap();
    std::fs::write(
        &artifacts.checksums,
        format!("{}  {}\n", digest, current_platform()),
    )
    .unwrap();
    std::fs::write(&artifacts.signature, signer.sign(script.as_bytes()).to_bytes()).unwrap();
}

/// Write a signed plugin that never prints a handshake
fn install_silent(dir: &Path, signer: &SigningKey) {
    std::fs::create_dir_all(dir).unwrap();
    let artifacts = PluginArtifacts::in_dir(dir);
    let script = "#!/bin/sh\nexec sleep 30\n";
    std::fs::write(&artifacts.binary, script).unwrap();
    std::fs::set_permissions(&artifacts.binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    let digest = sha256_file(&artifacts.binary).unwrap();
    std::fs::write(
        &artifacts.checksums,
        format!("{}  {}\n", digest, current_platform()),
    )
    .unwrap();
    std::fs::write(&artifacts.signature, signer.sign(script.as_bytes()).to_bytes()).unwrap();
}

#[tokio::test]
async fn test_trusted_plugin_launches_and_serves() {
    let dir = TempDir::new().unwrap();
    let shutdown = CancellationToken::new();
    let (manifest, _server) = serve_test_plugin(shutdown.clone()).await.unwrap();
    let handshake = manifest.get("test").unwrap().to_handshake().unwrap();

    let key = SigningKey::from_bytes(&[7u8; 32]);
    let manager = manager(dir.path(), &key);
    let marker = dir.path().join("started");
    install_script(&manager.install_dir(&plugin_id()), &handshake, &marker, &key);

    let ctx = CallContext::with_timeout(Duration::from_secs(30));
    let mut handle = manager.acquire(&ctx, &plugin_id()).await.unwrap();

    assert!(handle.is_managed());
    assert!(handle.trust_record().unwrap().signature_matched);
    assert!(marker.exists());

    let schema = handle.get_schema(&ctx).await.unwrap();
    assert_eq!(schema.resource_tables.len(), 3);

    handle.close().await.unwrap();
    shutdown.cancel();
}

#[tokio::test]
async fn test_untrusted_plugin_is_never_spawned() {
    let dir = TempDir::new().unwrap();
    let trusted = SigningKey::from_bytes(&[7u8; 32]);
    let stranger = SigningKey::from_bytes(&[8u8; 32]);

    let manager = manager(dir.path(), &trusted);
    let marker = dir.path().join("started");
    let handshake = r#"{"transport":"tcp","address":"127.0.0.1:9","protocol_version":1}"#;
    install_script(&manager.install_dir(&plugin_id()), handshake, &marker, &stranger);

    let result = manager
        .acquire(&CallContext::background(), &plugin_id())
        .await;

    assert!(matches!(result, Err(EngineError::SignatureInvalid { .. })));
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_plugin_without_handshake_times_out() {
    let dir = TempDir::new().unwrap();
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let manager = manager(dir.path(), &key);
    install_silent(&manager.install_dir(&plugin_id()), &key);

    let ctx = CallContext::with_timeout(Duration::from_secs(2));
    let result = manager.acquire(&ctx, &plugin_id()).await;
    assert!(
        matches!(result, Err(EngineError::DeadlineExceeded { .. })),
        "unexpected result: {:?}",
        result
    );
}

#[tokio::test]
async fn test_handshake_timeout_makes_plugin_unavailable() {
    let dir = TempDir::new().unwrap();
    let key = SigningKey::from_bytes(&[7u8; 32]);
    let manager = manager_with_handshake(dir.path(), &key, Duration::from_secs(1));
    install_silent(&manager.install_dir(&plugin_id()), &key);

    let started = std::time::Instant::now();
    let result = manager
        .acquire(&CallContext::background(), &plugin_id())
        .await;

    assert!(
        matches!(
            result,
            Err(EngineError::PluginUnavailable { ref provider, ref reason })
                if provider == "test" && reason.contains("handshake")
        ),
        "unexpected result: {:?}",
        result
    );
    assert!(started.elapsed() < Duration::from_secs(10));
}
