//! DatabaseCredentialBinding Custom Resource Definition.
//!
//! A binding grants the Pods running as a given service account in the
//! binding's namespace access to a Vault database credential. The webhook only
//! ever reads these objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// DatabaseCredentialBinding declares which service account may fetch which
/// database credential.
///
/// Example:
/// ```yaml
/// apiVersion: vaultwebhook.uswitch.com/v1
/// kind: DatabaseCredentialBinding
/// metadata:
///   name: orders-readonly
///   namespace: shop
/// spec:
///   database: orders
///   role: readonly
///   serviceAccount: orders-api
///   outputPath: /etc/database
///   outputFile: orders.json
///   container:
///     lifecycle:
///       preStop:
///         sleep:
///           seconds: 10
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "vaultwebhook.uswitch.com",
    version = "v1",
    kind = "DatabaseCredentialBinding",
    plural = "databasecredentialbindings",
    shortname = "dcb",
    namespaced,
    printcolumn = r#"{"name":"Database", "type":"string", "jsonPath":".spec.database"}"#,
    printcolumn = r#"{"name":"Role", "type":"string", "jsonPath":".spec.role"}"#,
    printcolumn = r#"{"name":"ServiceAccount", "type":"string", "jsonPath":".spec.serviceAccount"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseCredentialBindingSpec {
    /// Name of the database secrets engine mount in Vault.
    #[serde(default)]
    pub database: String,

    /// Vault role to request credentials for.
    #[serde(default)]
    pub role: String,

    /// Directory the credential volume is mounted at in application containers
    /// (default: /etc/database).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    /// File name the sidecar writes the credential to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,

    /// Service account the binding applies to. A binding without one never
    /// matches any Pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Overrides for the injected sidecar container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerOverride>,
}

/// Sidecar container overrides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleOverride>,
}

/// Lifecycle hooks for the sidecar container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleOverride {
    /// Hook run before the sidecar is stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<PreStopHook>,
}

/// Shutdown action for the sidecar. Only `exec` and `sleep` are supported.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PreStopHook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecHook>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep: Option<SleepHook>,
}

/// Command executed inside the sidecar container.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ExecHook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

/// Pause before the sidecar receives SIGTERM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SleepHook {
    #[serde(default)]
    pub seconds: i64,
}

impl DatabaseCredentialBinding {
    /// Service account the binding applies to, if one is declared.
    pub fn service_account(&self) -> Option<&str> {
        self.spec
            .service_account
            .as_deref()
            .filter(|sa| !sa.is_empty())
    }
}
