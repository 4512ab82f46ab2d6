//! Credential sidecar container generation.
//!
//! Every matched credential produces two containers: a long-running sidecar
//! that keeps the lease renewed, and an init variant that writes the first set
//! of credentials before the application starts.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ExecAction, Lifecycle, LifecycleHandler, ObjectFieldSelector,
    Pod, ResourceRequirements, SleepAction, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::bindings::MatchedCredential;
use crate::config::SidecarConfig;
use crate::crd::ContainerOverride;

/// Shared emptyDir volume the sidecars write credentials into
pub const CREDS_VOLUME: &str = "vault-creds";
/// Where the sidecars mount the credential volume
pub const SIDECAR_OUTPUT_DIR: &str = "/creds/output";

/// Template volume supplied by the Pod author; the webhook never adds it
pub const TEMPLATE_VOLUME: &str = "vault-template";
/// Where the sidecars mount the template volume
pub const SIDECAR_TEMPLATE_DIR: &str = "/creds/template";
const CONTAINER_PREFIX: &str = "vault-creds";
const INIT_SUFFIX: &str = "-init";

/// Owner kinds whose Pods run to completion
const JOB_OWNER_KINDS: [&str; 2] = ["Job", "Workflow"];

/// Regular and init sidecar for one credential
#[derive(Clone, Debug)]
pub struct CredentialSidecars {
    pub sidecar: Container,
    pub init: Container,
}

/// Container name for a credential. Underscores are not valid in container
/// names, so both parts are normalised to dashes.
pub fn container_name(database: &str, role: &str) -> String {
    format!(
        "{}-{}-{}",
        CONTAINER_PREFIX,
        database.replace('_', "-"),
        role.replace('_', "-")
    )
}

/// True when the Pod's first owner reference is a Job-like workload
pub fn is_job_owned(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_deref()
        .and_then(|owners| owners.first())
        .is_some_and(|owner| JOB_OWNER_KINDS.contains(&owner.kind.as_str()))
}

/// Convert a binding's preStop override into a lifecycle handler.
///
/// Returns `None` unless the override carries an exec hook with a non-empty
/// command or a sleep hook with a positive duration. Exec wins when both are
/// set since a handler may only hold one action.
pub fn pre_stop_handler(container: &ContainerOverride) -> Option<LifecycleHandler> {
    let pre_stop = container.lifecycle.as_ref()?.pre_stop.as_ref()?;

    if let Some(command) = pre_stop
        .exec
        .as_ref()
        .and_then(|exec| exec.command.as_ref())
        .filter(|command| !command.is_empty())
    {
        return Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(command.clone()),
            }),
            ..Default::default()
        });
    }

    pre_stop
        .sleep
        .as_ref()
        .filter(|sleep| sleep.seconds > 0)
        .map(|sleep| LifecycleHandler {
            sleep: Some(SleepAction {
                seconds: sleep.seconds,
            }),
            ..Default::default()
        })
}

/// Build the sidecar pair for a credential.
///
/// The init variant is derived before the job flag and lifecycle hook are
/// applied, so it never carries either.
pub fn build_sidecars(
    config: &SidecarConfig,
    credential: &MatchedCredential,
    namespace: &str,
    service_account: &str,
    job: bool,
) -> CredentialSidecars {
    let mut sidecar = Container {
        name: container_name(&credential.database, &credential.role),
        image: Some(config.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        args: Some(sidecar_args(config, credential, namespace, service_account)),
        env: Some(downward_env()),
        resources: Some(resource_requirements()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: TEMPLATE_VOLUME.to_string(),
                mount_path: SIDECAR_TEMPLATE_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: CREDS_VOLUME.to_string(),
                mount_path: SIDECAR_OUTPUT_DIR.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let mut init = sidecar.clone();
    init.name.push_str(INIT_SUFFIX);
    init.args.get_or_insert_with(Vec::new).push("--init".to_string());

    if job {
        sidecar.args.get_or_insert_with(Vec::new).push("--job".to_string());
    }

    if let Some(handler) = credential.container.as_ref().and_then(pre_stop_handler) {
        sidecar.lifecycle = Some(Lifecycle {
            pre_stop: Some(handler),
            ..Default::default()
        });
    }

    CredentialSidecars { sidecar, init }
}

fn sidecar_args(
    config: &SidecarConfig,
    credential: &MatchedCredential,
    namespace: &str,
    service_account: &str,
) -> Vec<String> {
    let database = &credential.database;
    let role = &credential.role;

    let out = match &credential.output_file {
        Some(file) => format!("{SIDECAR_OUTPUT_DIR}/{file}"),
        None => format!("{SIDECAR_OUTPUT_DIR}/{database}-{role}"),
    };

    vec![
        format!("--vault-addr={}", config.vault_addr),
        format!("--gateway-addr={}", config.gateway_addr),
        format!("--ca-cert={}", config.ca_cert),
        format!("--secret-path={}", config.secret_path(database, role)),
        format!("--login-path={}", config.login_path),
        format!("--auth-role={database}_{namespace}_{service_account}"),
        format!("--template={SIDECAR_TEMPLATE_DIR}/{database}-{role}"),
        format!("--out={out}"),
        format!("--completed-path={SIDECAR_OUTPUT_DIR}/completed"),
        "--renew-interval=1h".to_string(),
        "--lease-duration=12h".to_string(),
        "--json-log".to_string(),
    ]
}

fn downward_env() -> Vec<EnvVar> {
    [("POD_NAME", "metadata.name"), ("NAMESPACE", "metadata.namespace")]
        .into_iter()
        .map(|(name, field_path)| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: field_path.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

fn resource_requirements() -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };

    ResourceRequirements {
        requests: Some(quantities("10m", "20Mi")),
        limits: Some(quantities("30m", "50Mi")),
        ..Default::default()
    }
}
