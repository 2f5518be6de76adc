//! Plugin trust gate
//!
//! Before a provider binary may be executed it must pass two independent
//! checks:
//! - **Integrity**: its SHA-256 digest matches the entry for the current
//!   platform in the published checksum manifest
//! - **Authenticity**: a detached Ed25519 signature over the binary verifies
//!   against one of the embedded trusted keys
//!
//! # Security
//!
//! The trusted keys are embedded at compile time. Development builds also
//! trust a well-known test key; builds with the `production` feature do not.
//! Every failure is fatal and is never retried.

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use harvest_sdk::errors::EngineError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Release signing keys
const PRODUCTION_KEYS: &[&str] = &[
    "4d133fe189fbf144bfba1652c8244d62a6f1dd8ddc40bdb7292b93053bb131c0",
    "daccf47fc35eeb4cc4ffebc245567680f9f3746f16b4351a5fb439eda3854a7a",
];

// Public half of the test key derived from the seed `[7u8; 32]`.
#[cfg(not(feature = "production"))]
const DEVELOPMENT_KEY: &str = "ea4a6c63e29c520abef5507b132ec5f9954776aebebe7b92421eea691446d22c";

/// Name of the binary inside a plugin install directory
pub const PLUGIN_BINARY: &str = "plugin";

/// Name of the checksum manifest inside a plugin install directory
pub const CHECKSUMS_FILE: &str = "checksums.txt";

/// Name of the detached signature inside a plugin install directory
pub const SIGNATURE_FILE: &str = "plugin.sig";

/// Platform identifier matched against checksum manifest entries
pub fn current_platform() -> &'static str {
    std::env::consts::OS
}

/// Files that make up one installed plugin version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginArtifacts {
    pub binary: PathBuf,
    pub checksums: PathBuf,
    pub signature: PathBuf,
}

impl PluginArtifacts {
    /// Standard layout of an install directory
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            binary: dir.join(PLUGIN_BINARY),
            checksums: dir.join(CHECKSUMS_FILE),
            signature: dir.join(SIGNATURE_FILE),
        }
    }

    /// Whether all three files are present
    pub fn exists(&self) -> bool {
        self.binary.is_file() && self.checksums.is_file() && self.signature.is_file()
    }
}

/// Outcome of a successful validation
///
/// Only produced when both checks passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustRecord {
    /// Lowercase hex SHA-256 of the binary
    pub digest: String,
    pub digest_matched: bool,
    pub signature_matched: bool,
    /// Fingerprint of the trusted key that verified the signature
    pub key_fingerprint: String,
}

/// Checksum and signature validator
///
/// # Examples
///
/// ```no_run
/// use harvest_engine::trust::{PluginArtifacts, TrustValidator};
/// use std::path::Path;
///
/// let validator = TrustValidator::new().unwrap();
/// let artifacts = PluginArtifacts::in_dir(Path::new("/opt/harvest/plugins/harvest/aws/v1.0.0"));
/// let record = validator.validate(&artifacts).unwrap();
/// println!("trusted by key {}", record.key_fingerprint);
/// ```
#[derive(Debug, Clone)]
pub struct TrustValidator {
    keys: Vec<VerifyingKey>,
    platform: String,
}

impl TrustValidator {
    /// Validator over the embedded keyring
    ///
    /// # Errors
    ///
    /// Returns an error if an embedded key is corrupted. This should never
    /// happen in a properly built binary.
    pub fn new() -> Result<Self, EngineError> {
        #[allow(unused_mut)]
        let mut encoded: Vec<&str> = PRODUCTION_KEYS.to_vec();
        #[cfg(not(feature = "production"))]
        encoded.push(DEVELOPMENT_KEY);

        let keys = encoded
            .into_iter()
            .map(parse_public_key)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Trust validator initialized with {} embedded keys", keys.len());
        Ok(Self::with_keys(keys))
    }

    /// Validator over an explicit keyring
    pub fn with_keys(keys: Vec<VerifyingKey>) -> Self {
        Self {
            keys,
            platform: current_platform().to_string(),
        }
    }

    /// Match checksum entries against another platform identifier
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Fingerprints of every trusted key
    pub fn fingerprints(&self) -> Vec<String> {
        self.keys.iter().map(fingerprint).collect()
    }

    /// Run both checks, checksum first
    pub fn validate(&self, artifacts: &PluginArtifacts) -> Result<TrustRecord, EngineError> {
        let digest = self.validate_checksum(&artifacts.binary, &artifacts.checksums)?;
        let key_fingerprint = self.validate_signature(&artifacts.binary, &artifacts.signature)?;

        tracing::info!(
            "Plugin {} trusted (sha256 {}, key {})",
            artifacts.binary.display(),
            digest,
            key_fingerprint
        );

        Ok(TrustRecord {
            digest,
            digest_matched: true,
            signature_matched: true,
            key_fingerprint,
        })
    }

    /// Check the binary against the manifest entry for this platform
    ///
    /// Lines are `<sha256-hex>  <platform>`. The first line whose platform
    /// field contains the current platform decides the outcome; a line that
    /// does not split into exactly two fields aborts the scan.
    ///
    /// Returns the computed digest on success.
    pub fn validate_checksum(&self, binary: &Path, manifest: &Path) -> Result<String, EngineError> {
        tracing::debug!("Verifying checksum of {}", binary.display());

        let computed = sha256_file(binary)?;
        let content = std::fs::read_to_string(manifest)?;

        for (index, line) in content.lines().enumerate() {
            let fields: Vec<&str> = line.split("  ").collect();
            let [expected, platform] = fields.as_slice() else {
                return Err(EngineError::ManifestFormatInvalid {
                    line: index + 1,
                    content: line.to_string(),
                });
            };

            if !platform.contains(self.platform.as_str()) {
                continue;
            }

            if *expected == computed {
                tracing::debug!("Checksum verified for {}", binary.display());
                return Ok(computed);
            }

            tracing::error!(
                "Checksum mismatch for {}: expected {}, got {}",
                binary.display(),
                expected,
                computed
            );
            return Err(EngineError::ChecksumMismatch {
                path: binary.to_path_buf(),
                expected: expected.to_string(),
                computed,
            });
        }

        Err(EngineError::PlatformNotFound {
            path: binary.to_path_buf(),
            platform: self.platform.clone(),
        })
    }

    /// Verify the detached signature over the binary's bytes
    ///
    /// Any trusted key may have produced it. Returns the fingerprint of the
    /// key that matched.
    pub fn validate_signature(&self, binary: &Path, signature: &Path) -> Result<String, EngineError> {
        tracing::debug!("Verifying signature of {}", binary.display());

        let message = std::fs::read(binary)?;
        let raw = std::fs::read(signature)?;
        let signature = parse_signature(&raw).map_err(|reason| EngineError::SignatureInvalid {
            path: binary.to_path_buf(),
            reason,
        })?;

        match self
            .keys
            .iter()
            .find(|key| key.verify_strict(&message, &signature).is_ok())
        {
            Some(key) => Ok(fingerprint(key)),
            None => {
                tracing::error!("No trusted key verified the signature of {}", binary.display());
                Err(EngineError::SignatureInvalid {
                    path: binary.to_path_buf(),
                    reason: "no trusted key matched".to_string(),
                })
            }
        }
    }
}

/// Short identifier of a public key: first 8 bytes of its SHA-256, in hex
pub fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Lowercase hex SHA-256 of a file's full contents
pub fn sha256_file(path: &Path) -> Result<String, EngineError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn parse_public_key(encoded: &str) -> Result<VerifyingKey, EngineError> {
    let bytes = hex::decode(encoded)
        .map_err(|e| EngineError::Config(format!("Invalid trusted key encoding: {}", e)))?;
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        EngineError::Config(format!(
            "Invalid trusted key length: expected {}, got {}",
            PUBLIC_KEY_LENGTH,
            bytes.len()
        ))
    })?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| EngineError::Config(format!("Invalid trusted key: {}", e)))
}

/// Parse a signature file: raw 64 bytes, or hex text with an optional
/// `ed25519:` prefix
fn parse_signature(raw: &[u8]) -> Result<Signature, String> {
    if raw.len() == SIGNATURE_LENGTH {
        let bytes: [u8; SIGNATURE_LENGTH] = raw
            .try_into()
            .map_err(|_| "invalid signature length".to_string())?;
        return Ok(Signature::from_bytes(&bytes));
    }

    let text = std::str::from_utf8(raw)
        .map_err(|_| format!("signature is neither {} raw bytes nor text", SIGNATURE_LENGTH))?
        .trim();
    let hex_part = text.strip_prefix("ed25519:").unwrap_or(text);
    let bytes = hex::decode(hex_part).map_err(|e| format!("invalid signature hex: {}", e))?;
    let bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().map_err(|bytes: Vec<u8>| {
        format!(
            "invalid signature length: expected {}, got {}",
            SIGNATURE_LENGTH,
            bytes.len()
        )
    })?;

    Ok(Signature::from_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_embedded_keys_parse() {
        let validator = TrustValidator::new().unwrap();
        assert!(validator.fingerprints().len() >= PRODUCTION_KEYS.len());
        assert_eq!(validator.platform(), current_platform());
    }

    #[test]
    fn test_sha256_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"test content").unwrap();
        file.flush().unwrap();

        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }

    #[test]
    fn test_parse_signature_forms() {
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let signature = key.sign(b"payload");
        let bytes = signature.to_bytes();

        assert_eq!(parse_signature(&bytes).unwrap(), signature);

        let armored = format!("ed25519:{}\n", hex::encode(bytes));
        assert_eq!(parse_signature(armored.as_bytes()).unwrap(), signature);

        let bare = hex::encode(bytes);
        assert_eq!(parse_signature(bare.as_bytes()).unwrap(), signature);

        assert!(parse_signature(b"ed25519:abcd").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = SigningKey::from_bytes(&[1u8; 32]).verifying_key();
        assert_eq!(fingerprint(&key), fingerprint(&key));
        assert_eq!(fingerprint(&key).len(), 16);
    }
}
