//! Plugin process management
//!
//! Turns a provider identity into a live [`PluginHandle`]. Providers are
//! either launched as managed child processes or, when a reattach manifest is
//! in play, attached to as already-running processes.
//!
//! # Managed launch
//!
//! 1. Locate `<plugin_dir>/<org>/<name>/<version>/{plugin, checksums.txt, plugin.sig}`
//! 2. Run the trust gate; a failure is fatal and the binary is never spawned
//! 3. Spawn the binary and wait (bounded) for the handshake line on stdout
//! 4. Check the protocol version and connect
//!
//! # Reattach
//!
//! The manifest comes from the configured [`DiscoverySource`]. A provider
//! missing from it falls back to a managed launch when it is installed
//! locally.

pub mod rpc;

use harvest_sdk::errors::EngineError;
use harvest_sdk::manifest::{Endpoint, ReattachManifest};
use harvest_sdk::protocol::PROTOCOL_VERSION;
use harvest_sdk::types::{ConfigureRequest, ProviderConfiguration, ProviderSchema};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PluginsConfig;
use crate::context::CallContext;
use crate::trust::{PluginArtifacts, TrustRecord, TrustValidator};

pub use rpc::{FetchEvent, FetchStream, RpcClient};

/// Interval between checks for a reattach manifest file
const MANIFEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where endpoints of running providers come from
#[derive(Debug, Clone)]
pub enum DiscoverySource {
    /// Launch every provider as a managed child process
    Launch,
    /// Read a reattach manifest from this file, waiting for it to appear
    ManifestFile(PathBuf),
    /// Receive the reattach manifest from an in-process publisher
    Channel(watch::Receiver<Option<ReattachManifest>>),
}

impl DiscoverySource {
    /// Source described by the plugin configuration and environment
    pub fn from_config(config: &PluginsConfig) -> Self {
        match config.reattach_manifest_path() {
            Some(path) => Self::ManifestFile(path),
            None => Self::Launch,
        }
    }
}

/// Process manager settings
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    pub plugin_dir: PathBuf,
    pub handshake_timeout: Duration,
    pub attach_timeout: Duration,
    pub probe_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl From<&PluginsConfig> for ProcessManagerConfig {
    fn from(config: &PluginsConfig) -> Self {
        Self {
            plugin_dir: config.directory.clone(),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            attach_timeout: Duration::from_secs(config.attach_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        }
    }
}

/// Identity of the provider version to acquire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginId {
    pub organization: String,
    pub name: String,
    pub version: String,
}

impl PluginId {
    pub fn new(
        organization: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.organization, self.name, self.version)
    }
}

/// Launches and attaches to provider processes
pub struct ProcessManager {
    config: ProcessManagerConfig,
    discovery: DiscoverySource,
    trust: Arc<TrustValidator>,
}

impl ProcessManager {
    pub fn new(
        config: ProcessManagerConfig,
        discovery: DiscoverySource,
        trust: Arc<TrustValidator>,
    ) -> Self {
        Self {
            config,
            discovery,
            trust,
        }
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    pub fn discovery(&self) -> &DiscoverySource {
        &self.discovery
    }

    /// Install directory of a provider version
    pub fn install_dir(&self, id: &PluginId) -> PathBuf {
        self.config
            .plugin_dir
            .join(&id.organization)
            .join(&id.name)
            .join(&id.version)
    }

    /// Obtain a live handle to the provider
    ///
    /// Bound by `ctx` as a whole; an abandoned launch kills the child.
    pub async fn acquire(&self, ctx: &CallContext, id: &PluginId) -> Result<PluginHandle, EngineError> {
        ctx.run(self.acquire_inner(id))
            .await
            .map_err(|interrupted| interrupted.into_error(&id.name, "acquire"))?
    }

    async fn acquire_inner(&self, id: &PluginId) -> Result<PluginHandle, EngineError> {
        let manifest = match &self.discovery {
            DiscoverySource::Launch => return self.launch(id).await,
            DiscoverySource::ManifestFile(path) => self.wait_for_manifest_file(id, path).await?,
            DiscoverySource::Channel(receiver) => self.wait_for_channel(id, receiver.clone()).await?,
        };

        match manifest.get(&id.name) {
            Some(endpoint) => {
                info!("Reattaching to provider '{}' at {}", id.name, endpoint.address);
                let client = self.connect(id, endpoint).await?;
                Ok(PluginHandle {
                    provider: id.name.clone(),
                    endpoint: endpoint.clone(),
                    client,
                    child: None,
                    trust: None,
                    shutdown_grace: self.config.shutdown_grace,
                })
            }
            None if PluginArtifacts::in_dir(&self.install_dir(id)).exists() => {
                debug!(
                    "Provider '{}' not in reattach manifest, launching local install",
                    id.name
                );
                self.launch(id).await
            }
            None => Err(EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: "not in the reattach manifest and not installed locally".to_string(),
            }),
        }
    }

    /// Validate, spawn and handshake with a locally installed provider
    pub async fn launch(&self, id: &PluginId) -> Result<PluginHandle, EngineError> {
        let dir = self.install_dir(id);
        let artifacts = PluginArtifacts::in_dir(&dir);
        if !artifacts.binary.is_file() {
            return Err(EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: format!("{} is not installed at {}", id, dir.display()),
            });
        }

        let trust = Arc::clone(&self.trust);
        let checked = artifacts.clone();
        let record = tokio::task::spawn_blocking(move || trust.validate(&checked))
            .await
            .map_err(|e| EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: format!("trust validation aborted: {}", e),
            })??;

        info!("Launching provider {} from {}", id, artifacts.binary.display());

        let mut child = Command::new(&artifacts.binary)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: format!("failed to start {}: {}", artifacts.binary.display(), e),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| EngineError::PluginUnavailable {
            provider: id.name.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(id.name.clone(), stderr);
        }

        let readiness = read_handshake(id.name.clone(), stdout);
        let endpoint = match timeout(self.config.handshake_timeout, readiness).await {
            Ok(Ok(Ok(endpoint))) => endpoint,
            Ok(Ok(Err(message))) => {
                return Err(EngineError::Protocol {
                    provider: id.name.clone(),
                    message,
                })
            }
            Ok(Err(_)) => {
                return Err(EngineError::PluginUnavailable {
                    provider: id.name.clone(),
                    reason: "exited before completing the handshake".to_string(),
                })
            }
            Err(_) => {
                warn!(
                    "Provider '{}' sent no handshake within {:?}",
                    id.name, self.config.handshake_timeout
                );
                return Err(EngineError::PluginUnavailable {
                    provider: id.name.clone(),
                    reason: format!("no handshake within {:?}", self.config.handshake_timeout),
                });
            }
        };

        let client = self.connect(id, &endpoint).await?;
        Ok(PluginHandle {
            provider: id.name.clone(),
            endpoint,
            client,
            child: Some(child),
            trust: Some(record),
            shutdown_grace: self.config.shutdown_grace,
        })
    }

    /// Protocol check plus a bounded connection attempt
    async fn connect(&self, id: &PluginId, endpoint: &Endpoint) -> Result<RpcClient, EngineError> {
        if endpoint.protocol_version != PROTOCOL_VERSION {
            return Err(EngineError::Protocol {
                provider: id.name.clone(),
                message: format!(
                    "provider speaks protocol {}, engine speaks {}",
                    endpoint.protocol_version, PROTOCOL_VERSION
                ),
            });
        }

        match timeout(self.config.probe_timeout, RpcClient::connect(&id.name, endpoint)).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(e)) => Err(EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: format!("cannot connect to {}: {}", endpoint.address, e),
            }),
            Err(_) => Err(EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: format!(
                    "no connection to {} within {:?}",
                    endpoint.address, self.config.probe_timeout
                ),
            }),
        }
    }

    async fn wait_for_manifest_file(
        &self,
        id: &PluginId,
        path: &Path,
    ) -> Result<ReattachManifest, EngineError> {
        let wait = async {
            loop {
                match tokio::fs::read_to_string(path).await {
                    Ok(content) => match ReattachManifest::from_json(&content) {
                        Ok(manifest) => return manifest,
                        Err(e) => debug!("Reattach manifest {} not ready: {}", path.display(), e),
                    },
                    Err(e) => debug!("Reattach manifest {} not ready: {}", path.display(), e),
                }
                tokio::time::sleep(MANIFEST_POLL_INTERVAL).await;
            }
        };

        timeout(self.config.attach_timeout, wait)
            .await
            .map_err(|_| EngineError::PluginUnavailable {
                provider: id.name.clone(),
                reason: format!(
                    "reattach manifest {} not available within {:?}",
                    path.display(),
                    self.config.attach_timeout
                ),
            })
    }

    async fn wait_for_channel(
        &self,
        id: &PluginId,
        mut receiver: watch::Receiver<Option<ReattachManifest>>,
    ) -> Result<ReattachManifest, EngineError> {
        let unavailable = |reason: String| EngineError::PluginUnavailable {
            provider: id.name.clone(),
            reason,
        };

        let announced = match timeout(self.config.attach_timeout, receiver.wait_for(Option::is_some)).await {
            Ok(Ok(manifest)) => manifest.clone(),
            Ok(Err(_)) => {
                return Err(unavailable(
                    "reattach publisher went away before announcing providers".to_string(),
                ))
            }
            Err(_) => {
                return Err(unavailable(format!(
                    "no reattach manifest within {:?}",
                    self.config.attach_timeout
                )))
            }
        };

        announced.ok_or_else(|| unavailable("reattach manifest withdrawn".to_string()))
    }
}

/// Read the handshake line, then keep draining stdout into the log
///
/// The returned receiver resolves with the parsed endpoint, or drops if the
/// process closes stdout first.
fn read_handshake(provider: String, stdout: ChildStdout) -> oneshot::Receiver<Result<Endpoint, String>> {
    let (ready, readiness) = oneshot::channel();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut ready = Some(ready);

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match ready.take() {
                Some(ready) => {
                    let parsed = Endpoint::from_handshake(&line)
                        .map_err(|e| format!("invalid handshake {:?}: {}", line, e));
                    let _ = ready.send(parsed);
                }
                None => debug!(target: "harvest_engine::plugin", provider = %provider, "{}", line),
            }
        }
    });

    readiness
}

fn forward_stderr(provider: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "harvest_engine::plugin", provider = %provider, "{}", line);
        }
    });
}

/// Live binding to a provider process
///
/// Exclusively owned: RPC methods take `&mut self`. Dropping a handle of a
/// managed provider kills the process; [`PluginHandle::close`] shuts it down
/// gracefully instead.
pub struct PluginHandle {
    provider: String,
    endpoint: Endpoint,
    client: RpcClient,
    child: Option<Child>,
    trust: Option<TrustRecord>,
    shutdown_grace: Duration,
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("managed", &self.is_managed())
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the engine launched and owns the process
    pub fn is_managed(&self) -> bool {
        self.child.is_some()
    }

    /// Trust gate outcome of a managed launch
    pub fn trust_record(&self) -> Option<&TrustRecord> {
        self.trust.as_ref()
    }

    pub async fn get_schema(&mut self, ctx: &CallContext) -> Result<ProviderSchema, EngineError> {
        self.client.get_schema(ctx).await
    }

    pub async fn get_configuration(
        &mut self,
        ctx: &CallContext,
    ) -> Result<ProviderConfiguration, EngineError> {
        self.client.get_configuration(ctx).await
    }

    pub async fn configure(
        &mut self,
        ctx: &CallContext,
        request: ConfigureRequest,
    ) -> Result<(), EngineError> {
        self.client.configure(ctx, request).await
    }

    pub async fn fetch(
        &mut self,
        ctx: &CallContext,
        resources: Vec<String>,
    ) -> Result<FetchStream<'_>, EngineError> {
        self.client.fetch(ctx, resources).await
    }

    /// Release the connection and stop a managed process
    ///
    /// Managed processes get SIGTERM and are killed if they outlive the
    /// grace period. Reattached processes keep running.
    pub async fn close(self) -> Result<(), EngineError> {
        let Self {
            provider,
            client,
            child,
            shutdown_grace,
            ..
        } = self;
        drop(client);

        let Some(mut child) = child else {
            debug!("Detached from provider '{}'", provider);
            return Ok(());
        };

        request_shutdown(&provider, &mut child).await?;

        match timeout(shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Provider '{}' exited with {}", provider, status);
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::Io(e)),
            Err(_) => {
                warn!(
                    "Provider '{}' did not exit within {:?}, killing it",
                    provider, shutdown_grace
                );
                child.kill().await.map_err(EngineError::Io)
            }
        }
    }
}

#[cfg(unix)]
async fn request_shutdown(provider: &str, child: &mut Child) -> Result<(), EngineError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // `id` is gone once the process has been reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };

    debug!("Sending SIGTERM to provider '{}' ({})", provider, pid);
    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(EngineError::Io(std::io::Error::other(format!(
            "Failed to send SIGTERM: {}",
            e
        )))),
    }
}

#[cfg(not(unix))]
async fn request_shutdown(_provider: &str, child: &mut Child) -> Result<(), EngineError> {
    child.start_kill().map_err(EngineError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(plugin_dir: &Path, discovery: DiscoverySource) -> ProcessManager {
        let config = ProcessManagerConfig {
            plugin_dir: plugin_dir.to_path_buf(),
            handshake_timeout: Duration::from_secs(2),
            attach_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
        };
        ProcessManager::new(config, discovery, Arc::new(TrustValidator::new().unwrap()))
    }

    #[test]
    fn test_install_dir_layout() {
        let manager = manager(Path::new("/plugins"), DiscoverySource::Launch);
        let id = PluginId::new("harvest", "aws", "v1.0.0");
        assert_eq!(
            manager.install_dir(&id),
            PathBuf::from("/plugins/harvest/aws/v1.0.0")
        );
        assert_eq!(id.to_string(), "harvest/aws@v1.0.0");
    }

    #[tokio::test]
    async fn test_launch_requires_install() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path(), DiscoverySource::Launch);

        let result = manager
            .acquire(&CallContext::background(), &PluginId::new("harvest", "aws", "v1.0.0"))
            .await;
        assert!(matches!(result, Err(EngineError::PluginUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_missing_manifest_file_times_out() {
        let dir = TempDir::new().unwrap();
        let manager = manager(
            dir.path(),
            DiscoverySource::ManifestFile(dir.path().join("reattach.json")),
        );

        let result = manager
            .acquire(&CallContext::background(), &PluginId::new("harvest", "test", "v0.0.0"))
            .await;
        assert!(matches!(result, Err(EngineError::PluginUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_provider_absent_from_channel_manifest() {
        let dir = TempDir::new().unwrap();
        let (_publisher, receiver) = watch::channel(Some(ReattachManifest::single(
            "other",
            Endpoint::tcp("127.0.0.1:1"),
        )));
        let manager = manager(dir.path(), DiscoverySource::Channel(receiver));

        let result = manager
            .acquire(&CallContext::background(), &PluginId::new("harvest", "test", "v0.0.0"))
            .await;
        assert!(matches!(
            result,
            Err(EngineError::PluginUnavailable { reason, .. }) if reason.contains("reattach manifest")
        ));
    }

    #[tokio::test]
    async fn test_protocol_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut endpoint = Endpoint::tcp("127.0.0.1:1");
        endpoint.protocol_version = PROTOCOL_VERSION + 1;
        let (_publisher, receiver) = watch::channel(Some(ReattachManifest::single("test", endpoint)));
        let manager = manager(dir.path(), DiscoverySource::Channel(receiver));

        let result = manager
            .acquire(&CallContext::background(), &PluginId::new("harvest", "test", "v0.0.0"))
            .await;
        assert!(matches!(result, Err(EngineError::Protocol { .. })));
    }
}
