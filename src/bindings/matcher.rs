//! Selection of the bindings that apply to a Pod.

use std::sync::Arc;

use kube::ResourceExt;

use crate::bindings::cache::BindingCache;
use crate::crd::{ContainerOverride, DatabaseCredentialBinding};
use crate::error::Result;

/// Mount path used when a binding does not set `outputPath`
pub const DEFAULT_OUTPUT_PATH: &str = "/etc/database";

/// A binding resolved for one Pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchedCredential {
    pub database: String,
    pub role: String,
    /// Where application containers mount the credential volume
    pub output_path: String,
    /// File name the sidecar writes, if the binding sets one
    pub output_file: Option<String>,
    pub container: Option<ContainerOverride>,
}

impl MatchedCredential {
    fn from_binding(binding: &DatabaseCredentialBinding) -> Self {
        let spec = &binding.spec;
        Self {
            database: spec.database.clone(),
            role: spec.role.clone(),
            output_path: spec
                .output_path
                .clone()
                .filter(|path| !path.is_empty())
                .unwrap_or_else(|| DEFAULT_OUTPUT_PATH.to_string()),
            output_file: spec.output_file.clone().filter(|file| !file.is_empty()),
            container: spec.container.clone(),
        }
    }

    /// Two credentials with the same key are the same logical binding.
    /// The container override is deliberately not part of it.
    pub fn same_credential(&self, other: &Self) -> bool {
        self.database == other.database
            && self.role == other.role
            && self.output_path == other.output_path
            && self.output_file == other.output_file
    }
}

/// Resolve the credentials a Pod running as `service_account` in `namespace`
/// is entitled to.
///
/// Snapshot order is preserved. When two bindings resolve to the same
/// credential the first one wins, including its container override.
pub fn match_bindings(
    bindings: &[DatabaseCredentialBinding],
    namespace: &str,
    service_account: &str,
) -> Vec<MatchedCredential> {
    let mut matched: Vec<MatchedCredential> = Vec::new();

    for binding in bindings
        .iter()
        .filter(|b| b.namespace().as_deref() == Some(namespace))
        .filter(|b| b.service_account() == Some(service_account))
    {
        let credential = MatchedCredential::from_binding(binding);
        if matched.iter().any(|m| m.same_credential(&credential)) {
            continue;
        }
        matched.push(credential);
    }

    matched
}

/// Matches Pods against the current contents of a binding cache
#[derive(Clone)]
pub struct BindingMatcher {
    cache: Arc<BindingCache>,
}

impl BindingMatcher {
    pub fn new(cache: Arc<BindingCache>) -> Self {
        Self { cache }
    }

    /// Credentials for a Pod; an empty result means nothing to inject
    pub fn matches(&self, namespace: &str, service_account: &str) -> Result<Vec<MatchedCredential>> {
        let snapshot = self.cache.snapshot()?;
        Ok(match_bindings(&snapshot, namespace, service_account))
    }
}
