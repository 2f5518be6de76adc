//! Error types and handling
//!
//! This module provides the error types shared by the Harvest engine and the
//! provider plugins. All engine errors implement the `HarvestErrorExt` trait,
//! which provides user-friendly hints and indicates whether an error is worth
//! retrying by the caller.
//!
//! The taxonomy is closed: callers branch on the variant, never on the
//! rendered message.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Trait for Harvest error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information.
pub trait HarvestErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors may succeed if the caller retries them. The engine
    /// itself never retries.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Trust gate**: checksum and signature failures (always fatal)
/// - **Plugin lifecycle**: discovery, handshake and protocol failures
/// - **Deadlines**: RPC calls outliving their governing context
/// - **Provider**: errors reported by the plugin itself
/// - **Policy**: unparseable policies and failing check queries
/// - **Configuration / registry / store**: ambient failures
///
/// # Examples
///
/// ```
/// use harvest_sdk::errors::{EngineError, HarvestErrorExt};
///
/// let error = EngineError::SignatureInvalid {
///     path: "plugin".into(),
///     reason: "no trusted key matched".to_string(),
/// };
/// assert!(!error.is_recoverable());
/// println!("Hint: {}", error.user_hint());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Trust gate errors
    #[error("checksum mismatch for {path:?}: expected {expected} got {computed}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        computed: String,
    },

    #[error("no checksum for platform '{platform}' found for {path:?}")]
    PlatformNotFound { path: PathBuf, platform: String },

    #[error("checksum manifest line {line} is malformed: {content:?}")]
    ManifestFormatInvalid { line: usize, content: String },

    #[error("signature verification failed for {path:?}: {reason}")]
    SignatureInvalid { path: PathBuf, reason: String },

    // Plugin lifecycle errors
    #[error("plugin '{provider}' unavailable: {reason}")]
    PluginUnavailable { provider: String, reason: String },

    #[error("protocol error talking to '{provider}': {message}")]
    Protocol { provider: String, message: String },

    // Deadline errors
    #[error("deadline exceeded after {elapsed:?} during {operation} on '{provider}'")]
    DeadlineExceeded {
        provider: String,
        operation: String,
        elapsed: Duration,
    },

    #[error("{operation} on '{provider}' was cancelled")]
    Cancelled { provider: String, operation: String },

    // Provider errors
    #[error("provider '{provider}' failed to fetch: {message}")]
    ProviderFetchFailed { provider: String, message: String },

    #[error("provider '{provider}' rejected {operation}: {message}")]
    ProviderRequestFailed {
        provider: String,
        operation: String,
        message: String,
    },

    #[error("provider '{0}' is not configured")]
    ProviderNotFound(String),

    #[error("provider {organization}/{name}@{version} could not be verified by the hub")]
    ProviderNotVerified {
        organization: String,
        name: String,
        version: String,
    },

    // Policy errors
    #[error("failed to parse policy {path:?}: {message}")]
    PolicyParse { path: PathBuf, message: String },

    #[error("policy check '{check}' failed to execute: {message}")]
    PolicyCheckExecution { check: String, message: String },

    // Ambient errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error is one of the trust gate failures
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::PlatformNotFound { .. }
                | Self::ManifestFormatInvalid { .. }
                | Self::SignatureInvalid { .. }
        )
    }
}

impl HarvestErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Trust gate errors
            Self::ChecksumMismatch { .. } => {
                "Plugin binary does not match its published checksum. Reinstall it"
            }
            Self::PlatformNotFound { .. } => "No plugin build is published for this platform",
            Self::ManifestFormatInvalid { .. } => "Checksum manifest is corrupted. Reinstall it",
            Self::SignatureInvalid { .. } => "Security verification failed. File may be tampered",

            // Plugin lifecycle errors
            Self::PluginUnavailable { .. } => {
                "Plugin could not be started or reached. Check that it is installed and running"
            }
            Self::Protocol { .. } => "Plugin speaks an incompatible protocol. Upgrade it",

            // Deadline errors
            Self::DeadlineExceeded { .. } => "Operation took too long. Increase the timeout",
            Self::Cancelled { .. } => "Operation was cancelled",

            // Provider errors
            Self::ProviderFetchFailed { .. } => "Provider failed while fetching. Check its logs",
            Self::ProviderRequestFailed { .. } => "Provider rejected the request",
            Self::ProviderNotFound(_) => "Add the provider to your configuration file",
            Self::ProviderNotVerified { .. } => "Provider is not published on the hub",

            // Policy errors
            Self::PolicyParse { .. } => "Check the policy file for syntax errors",
            Self::PolicyCheckExecution { .. } => "A policy query is invalid for this store",

            // Ambient errors
            Self::Config(_) => "Check your harvest.toml file for errors",
            Self::Registry(_) => "Hub unavailable. Check your network",
            Self::Database(_) => "Store operation failed. Check the connection settings",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::ChecksumMismatch { .. }
            | Self::PlatformNotFound { .. }
            | Self::ManifestFormatInvalid { .. }
            | Self::SignatureInvalid { .. }
            | Self::Protocol { .. }
            | Self::ProviderNotVerified { .. }
            | Self::PolicyParse { .. }
            | Self::Config(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}

/// Errors reported by a provider implementation
///
/// These travel over the wire as a failure code plus message and are turned
/// back into an [`EngineError`] on the engine side.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("provider has not been configured")]
    NotConfigured,

    #[error("resource '{resource}' failed: {message}")]
    Resource { resource: String, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("{0}")]
    Internal(String),
}
