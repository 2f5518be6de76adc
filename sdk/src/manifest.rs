//! Endpoint and discovery manifest types
//!
//! An [`Endpoint`] is what a provider process announces when it is ready:
//! managed children print it as their handshake line, unmanaged providers
//! publish it in a [`ReattachManifest`] keyed by provider name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Transport a provider listens on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Unix,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

/// Reachable RPC endpoint of a running provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub transport: Transport,
    pub address: String,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl Endpoint {
    /// Endpoint for a TCP listener
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::Tcp,
            address: address.into(),
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            pid: Some(std::process::id()),
        }
    }

    /// Endpoint for a unix socket listener
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            transport: Transport::Unix,
            address: path.into(),
            protocol_version: crate::protocol::PROTOCOL_VERSION,
            pid: Some(std::process::id()),
        }
    }

    /// Parse a handshake line printed by a managed provider
    pub fn from_handshake(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Render this endpoint as a handshake line (no trailing newline)
    pub fn to_handshake(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Externally supplied map of already-running providers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachManifest {
    pub providers: BTreeMap<String, Endpoint>,
}

impl ReattachManifest {
    /// Manifest with a single provider
    pub fn single(name: impl Into<String>, endpoint: Endpoint) -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(name.into(), endpoint);
        Self { providers }
    }

    /// Look up the endpoint of a provider
    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.providers.get(name)
    }

    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write the manifest atomically so readers never observe a partial file
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }
}
