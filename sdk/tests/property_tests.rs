use harvest_sdk::errors::{EngineError, HarvestErrorExt};
use harvest_sdk::manifest::{Endpoint, ReattachManifest, Transport};
use proptest::prelude::*;
use std::path::PathBuf;
use std::time::Duration;

// Hints are static text and never echo caller-controlled data
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            EngineError::Config(error_str.clone()),
            EngineError::Database(error_str.clone()),
            EngineError::Registry(error_str.clone()),
            EngineError::ProviderNotFound(error_str.clone()),
            EngineError::PluginUnavailable {
                provider: error_str.clone(),
                reason: error_str.clone(),
            },
            EngineError::DeadlineExceeded {
                provider: error_str.clone(),
                operation: "fetch".to_string(),
                elapsed: Duration::from_secs(3),
            },
            EngineError::ChecksumMismatch {
                path: PathBuf::from(&error_str),
                expected: error_str.clone(),
                computed: error_str.clone(),
            },
            EngineError::PolicyCheckExecution {
                check: error_str.clone(),
                message: error_str.clone(),
            },
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            if error_str.len() > 8 {
                prop_assert!(!hint.contains(error_str.as_str()));
            }
        }
    }
}

proptest! {
    #[test]
    fn test_reattach_manifest_parsing(
        names in prop::collection::btree_set("[a-z][a-z0-9_]{0,15}", 1..5),
        port in 1u16..u16::MAX,
        pid in proptest::option::of(1u32..100_000),
    ) {
        let mut manifest = ReattachManifest::default();
        for name in &names {
            manifest.providers.insert(name.clone(), Endpoint {
                transport: Transport::Tcp,
                address: format!("127.0.0.1:{}", port),
                protocol_version: 1,
                pid,
            });
        }

        let parsed = ReattachManifest::from_json(&manifest.to_json().unwrap()).unwrap();
        for name in &names {
            let endpoint = parsed.get(name).unwrap();
            prop_assert_eq!(&endpoint.address, &format!("127.0.0.1:{}", port));
            prop_assert_eq!(endpoint.pid, pid);
        }
    }
}
