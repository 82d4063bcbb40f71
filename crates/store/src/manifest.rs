//! YAML manifests seeding a store with secrets and issues.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Secret, TrackedIssue};

/// Objects to load into a store.
///
/// ```yaml
/// secrets:
///   - metadata: { name: github-token, namespace: default }
///     stringData: { token: ghp_xxx }
/// issues:
///   - metadata: { name: flaky-test, namespace: default }
///     spec:
///       repo: octo/hello
///       title: Flaky test in CI
///       labels: [bug]
///       tokenSecretRef: github-token
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub issues: Vec<TrackedIssue>,
}

impl Manifest {
    /// Parse a manifest from YAML.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }
}
