/// Integration tests for policy execution
///
/// Covers check ordering, stop-on-failure, violation rendering and failure
/// modes against a real SQLite store.
use harvest_engine::config::ConnectionConfig;
use harvest_engine::context::CallContext;
use harvest_engine::policy::{ExecutePolicyRequest, Policy, PolicyEngine};
use harvest_engine::store::Store;
use harvest_sdk::errors::EngineError;
use std::time::Duration;
use tempfile::TempDir;

const MIXED_POLICY: &str = r#"
name: mixed
checks:
  - name: passes
    label: Nothing is wrong
    query: SELECT 1 AS one WHERE 1 = 0
  - name: first_failure
    label: Items are named
    query: SELECT id, name FROM items WHERE name IS NULL
  - name: second_failure
    query: SELECT 'always' AS reason
"#;

async fn store(dir: &TempDir) -> Store {
    let dsn = format!("sqlite://{}?mode=rwc", dir.path().join("policy.db").display());
    let store = Store::connect(&dsn, &ConnectionConfig::default())
        .await
        .unwrap();

    sqlx::query("CREATE TABLE items (id INTEGER, name TEXT)")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query("INSERT INTO items (id, name) VALUES (1, 'a'), (2, NULL)")
        .execute(store.pool())
        .await
        .unwrap();

    store
}

#[tokio::test]
async fn test_stop_on_failure_halts_at_first_failure() {
    let dir = TempDir::new().unwrap();
    let engine = PolicyEngine::new(store(&dir).await);
    let policy = Policy::from_yaml(MIXED_POLICY).unwrap();

    let report = engine
        .evaluate(&CallContext::background(), &policy, true)
        .await
        .unwrap();

    assert!(!report.passed);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.skipped, 1);
    assert!(report.results[0].passed);
    assert_eq!(report.results[1].name, "first_failure");
}

#[tokio::test]
async fn test_all_checks_run_without_stop_on_failure() {
    let dir = TempDir::new().unwrap();
    let engine = PolicyEngine::new(store(&dir).await);
    let policy = Policy::from_yaml(MIXED_POLICY).unwrap();

    let report = engine
        .evaluate(&CallContext::background(), &policy, false)
        .await
        .unwrap();

    assert!(!report.passed);
    assert_eq!(report.skipped, 0);
    let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["passes", "first_failure", "second_failure"]);
    assert_eq!(report.failures().count(), 2);
}

#[tokio::test]
async fn test_violations_carry_row_values() {
    let dir = TempDir::new().unwrap();
    let engine = PolicyEngine::new(store(&dir).await);
    let policy = Policy::from_yaml(MIXED_POLICY).unwrap();

    let report = engine
        .evaluate(&CallContext::background(), &policy, false)
        .await
        .unwrap();

    let violations = &report.results[1].violations;
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].get("id"), Some("2"));
    assert_eq!(violations[0].get("name"), None);
}

#[tokio::test]
async fn test_policy_file_from_disk() {
    let dir = TempDir::new().unwrap();
    let engine = PolicyEngine::new(store(&dir).await);

    let path = dir.path().join("named.toml");
    std::fs::write(
        &path,
        r#"
name = "named"

[[checks]]
name = "all_named"
query = "SELECT id FROM items WHERE name IS NULL"
"#,
    )
    .unwrap();

    let request = ExecutePolicyRequest {
        policy_path: path,
        stop_on_failure: false,
    };
    let report = engine
        .execute(&CallContext::background(), &request)
        .await
        .unwrap();
    assert_eq!(report.policy, "named");
    assert!(!report.passed);
}

#[tokio::test]
async fn test_broken_query_is_an_error() {
    let dir = TempDir::new().unwrap();
    let engine = PolicyEngine::new(store(&dir).await);
    let policy = Policy::from_yaml(
        "name: broken\nchecks:\n  - name: bad\n    query: SELECT * FROM no_such_table\n",
    )
    .unwrap();

    let result = engine
        .evaluate(&CallContext::background(), &policy, false)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::PolicyCheckExecution { ref check, .. }) if check == "bad"
    ));
}

#[tokio::test]
async fn test_expired_context_stops_evaluation() {
    let dir = TempDir::new().unwrap();
    let engine = PolicyEngine::new(store(&dir).await);
    let policy = Policy::from_yaml(MIXED_POLICY).unwrap();

    let ctx = CallContext::with_timeout(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = engine.evaluate(&ctx, &policy, false).await;
    assert!(matches!(result, Err(EngineError::DeadlineExceeded { .. })));
}
