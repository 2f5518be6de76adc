//! Policy execution
//!
//! A policy is an ordered list of named checks. Each check is a query against
//! the store: no rows means the check passed, every returned row is a
//! violation. Checks run strictly in the declared order, each on its own
//! pooled connection, and `stop_on_failure` halts at the first failing one.
//!
//! Policies are YAML documents (or TOML, chosen by file extension):
//!
//! ```yaml
//! name: inventory
//! description: Basic inventory sanity
//! checks:
//!   - name: instances_present
//!     label: At least one instance was fetched
//!     query: SELECT 'no instances' AS reason WHERE NOT EXISTS (SELECT 1 FROM instances)
//! ```

use harvest_sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use sqlx::{Column, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::store::Store;

/// Operation name used when a check runs out of time
const STORE: &str = "store";

/// A named, ordered list of checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub checks: Vec<PolicyCheck>,
}

/// One check of a policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub name: String,
    /// Human readable description of what passing means
    #[serde(default)]
    pub label: String,
    /// Query returning one row per violation
    pub query: String,
}

impl Policy {
    /// Load a policy file, TOML for `.toml` files and YAML otherwise
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::PolicyParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_yaml(&content)
        };

        parsed.map_err(|message| EngineError::PolicyParse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let policy: Self = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse from TOML string
    pub fn from_toml(source: &str) -> Result<Self, String> {
        let policy: Self = toml::from_str(source).map_err(|e| e.to_string())?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> Result<(), String> {
        if self.checks.is_empty() {
            return Err(format!("policy '{}' declares no checks", self.name));
        }

        let mut seen = HashSet::new();
        for check in &self.checks {
            if check.query.trim().is_empty() {
                return Err(format!("check '{}' has an empty query", check.name));
            }
            if !seen.insert(check.name.as_str()) {
                return Err(format!("check '{}' is declared more than once", check.name));
            }
        }

        Ok(())
    }
}

/// Request to evaluate one policy file
#[derive(Debug, Clone)]
pub struct ExecutePolicyRequest {
    pub policy_path: PathBuf,
    /// Stop at the first failing check
    pub stop_on_failure: bool,
}

/// One row returned by a check query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Column name and rendered value, in query order
    pub fields: Vec<(String, Option<String>)>,
}

impl Violation {
    /// Rendered value of a column
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .and_then(|(_, value)| value.as_deref())
    }
}

/// Outcome of one evaluated check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub label: String,
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub duration: Duration,
}

/// Outcome of a policy run
#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    pub policy: String,
    /// All evaluated checks passed
    pub passed: bool,
    /// Evaluated checks, in declared order
    pub results: Vec<CheckResult>,
    /// Checks not evaluated because of `stop_on_failure`
    pub skipped: usize,
}

impl PolicyReport {
    /// Results of the checks that failed
    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|result| !result.passed)
    }
}

/// Evaluates policies against the store
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    store: Store,
}

impl PolicyEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Load and evaluate the policy file named by `request`
    ///
    /// Failing checks are reported in the result, not as errors.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        request: &ExecutePolicyRequest,
    ) -> Result<PolicyReport, EngineError> {
        let policy = Policy::from_file(&request.policy_path)?;
        self.evaluate(ctx, &policy, request.stop_on_failure).await
    }

    /// Evaluate an already loaded policy
    pub async fn evaluate(
        &self,
        ctx: &CallContext,
        policy: &Policy,
        stop_on_failure: bool,
    ) -> Result<PolicyReport, EngineError> {
        info!(
            "Executing policy '{}' ({} checks)",
            policy.name,
            policy.checks.len()
        );

        let mut results = Vec::with_capacity(policy.checks.len());
        for check in &policy.checks {
            let result = self.run_check(ctx, check).await?;
            let failed = !result.passed;
            results.push(result);

            if failed && stop_on_failure {
                break;
            }
        }

        let skipped = policy.checks.len() - results.len();
        let passed = results.iter().all(|result| result.passed);

        if passed {
            info!("Policy '{}' passed", policy.name);
        } else {
            warn!(
                "Policy '{}' failed ({} of {} evaluated checks failing, {} skipped)",
                policy.name,
                results.iter().filter(|r| !r.passed).count(),
                results.len(),
                skipped
            );
        }

        Ok(PolicyReport {
            policy: policy.name.clone(),
            passed,
            results,
            skipped,
        })
    }

    async fn run_check(
        &self,
        ctx: &CallContext,
        check: &PolicyCheck,
    ) -> Result<CheckResult, EngineError> {
        let started = Instant::now();
        let operation = format!("policy check '{}'", check.name);

        let mut conn = ctx
            .run(self.store.acquire())
            .await
            .map_err(|interrupted| interrupted.into_error(STORE, &operation))??;

        let rows = ctx
            .run(sqlx::query(&check.query).fetch_all(&mut *conn))
            .await
            .map_err(|interrupted| interrupted.into_error(STORE, &operation))?
            .map_err(|e| EngineError::PolicyCheckExecution {
                check: check.name.clone(),
                message: e.to_string(),
            })?;

        let violations: Vec<Violation> = rows
            .iter()
            .map(|row| Violation {
                fields: row
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(index, column)| {
                        let value = row.try_get_unchecked::<Option<String>, _>(index).ok().flatten();
                        (column.name().to_string(), value)
                    })
                    .collect(),
            })
            .collect();

        let passed = violations.is_empty();
        debug!(
            "Check '{}' {} with {} violations",
            check.name,
            if passed { "passed" } else { "failed" },
            violations.len()
        );

        Ok(CheckResult {
            name: check.name.clone(),
            label: check.label.clone(),
            passed,
            violations,
            duration: started.elapsed(),
        })
    }
}
