/// Integration tests for plugin trust validation
///
/// Tests the full checksum and signature gate over artifacts on disk:
/// - Checksum match, mismatch and missing platform entries
/// - Signatures from any trusted key, raw or armored
/// - Rejection of tampered binaries and untrusted keys
use ed25519_dalek::{Signer, SigningKey};
use harvest_engine::trust::{
    current_platform, fingerprint, sha256_file, PluginArtifacts, TrustValidator,
};
use harvest_sdk::errors::EngineError;
use proptest::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const BINARY: &[u8] = b"#!/bin/sh\necho provider\n";

fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Install a plugin signed by `key` with a manifest entry for `platform`
fn install(dir: &Path, binary: &[u8], key: &SigningKey, platform: &str) -> PluginArtifacts {
    let artifacts = PluginArtifacts::in_dir(dir);
    std::fs::write(&artifacts.binary, binary).unwrap();

    let digest = sha256_file(&artifacts.binary).unwrap();
    std::fs::write(
        &artifacts.checksums,
        format!("{}  darwin_arm64\n{}  {}_amd64\n", "0".repeat(64), digest, platform),
    )
    .unwrap();

    let signature = key.sign(binary);
    std::fs::write(&artifacts.signature, signature.to_bytes()).unwrap();

    artifacts
}

fn validator(keys: &[&SigningKey]) -> TrustValidator {
    TrustValidator::with_keys(keys.iter().map(|k| k.verifying_key()).collect())
        .with_platform("linux")
}

#[test]
fn test_trusted_plugin_validates() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(1);
    let artifacts = install(dir.path(), BINARY, &key, "linux");

    let record = validator(&[&key]).validate(&artifacts).unwrap();
    assert!(record.digest_matched);
    assert!(record.signature_matched);
    assert_eq!(record.digest, sha256_file(&artifacts.binary).unwrap());
    assert_eq!(record.key_fingerprint, fingerprint(&key.verifying_key()));
}

#[test]
fn test_checksum_mismatch_reports_both_digests() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(1);
    let artifacts = install(dir.path(), BINARY, &key, "linux");
    let expected = sha256_file(&artifacts.binary).unwrap();

    std::fs::write(&artifacts.binary, b"tampered").unwrap();
    let computed = sha256_file(&artifacts.binary).unwrap();

    match validator(&[&key]).validate(&artifacts) {
        Err(EngineError::ChecksumMismatch {
            expected: e,
            computed: c,
            ..
        }) => {
            assert_eq!(e, expected);
            assert_eq!(c, computed);
        }
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
}

#[test]
fn test_missing_platform_entry() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(1);
    let artifacts = install(dir.path(), BINARY, &key, "windows");

    let result = validator(&[&key]).validate(&artifacts);
    assert!(matches!(
        result,
        Err(EngineError::PlatformNotFound { ref platform, .. }) if platform == "linux"
    ));
}

#[test]
fn test_malformed_manifest_line() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(1);
    let artifacts = install(dir.path(), BINARY, &key, "linux");
    std::fs::write(&artifacts.checksums, "deadbeef linux\n").unwrap();

    let result = validator(&[&key]).validate(&artifacts);
    assert!(matches!(
        result,
        Err(EngineError::ManifestFormatInvalid { line: 1, .. })
    ));
}

#[test]
fn test_any_trusted_key_may_sign() {
    let dir = TempDir::new().unwrap();
    let first = signing_key(1);
    let second = signing_key(2);
    let artifacts = install(dir.path(), BINARY, &second, "linux");

    let record = validator(&[&first, &second]).validate(&artifacts).unwrap();
    assert_eq!(record.key_fingerprint, fingerprint(&second.verifying_key()));
}

#[test]
fn test_untrusted_key_is_rejected() {
    let dir = TempDir::new().unwrap();
    let trusted = signing_key(1);
    let stranger = signing_key(9);
    let artifacts = install(dir.path(), BINARY, &stranger, "linux");

    let result = validator(&[&trusted]).validate(&artifacts);
    assert!(matches!(result, Err(EngineError::SignatureInvalid { .. })));
}

#[test]
fn test_signature_over_different_bytes_is_rejected() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(1);
    let artifacts = install(dir.path(), BINARY, &key, "linux");

    let other = key.sign(b"some other binary");
    std::fs::write(&artifacts.signature, other.to_bytes()).unwrap();

    let result = validator(&[&key]).validate(&artifacts);
    assert!(matches!(result, Err(EngineError::SignatureInvalid { .. })));
}

#[test]
fn test_armored_signature_is_accepted() {
    let dir = TempDir::new().unwrap();
    let key = signing_key(1);
    let artifacts = install(dir.path(), BINARY, &key, "linux");

    let armored = format!("ed25519:{}\n", hex::encode(key.sign(BINARY).to_bytes()));
    std::fs::write(&artifacts.signature, armored).unwrap();

    assert!(validator(&[&key]).validate(&artifacts).is_ok());
}

#[test]
fn test_default_keyring_and_platform() {
    let validator = TrustValidator::new().unwrap();
    assert_eq!(validator.platform(), current_platform());
    assert!(validator.fingerprints().len() >= 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_any_content_change_breaks_the_checksum(
        content in proptest::collection::vec(any::<u8>(), 1..256),
        flip in any::<prop::sample::Index>(),
    ) {
        let dir = TempDir::new().unwrap();
        let key = signing_key(3);
        let artifacts = install(dir.path(), &content, &key, "linux");
        let validator = validator(&[&key]);

        prop_assert!(validator.validate(&artifacts).is_ok());

        let mut tampered = content.clone();
        let index = flip.index(tampered.len());
        tampered[index] ^= 0xff;
        std::fs::write(&artifacts.binary, &tampered).unwrap();

        let is_mismatch = matches!(
            validator.validate(&artifacts),
            Err(EngineError::ChecksumMismatch { .. })
        );
        prop_assert!(is_mismatch);
    }
}
