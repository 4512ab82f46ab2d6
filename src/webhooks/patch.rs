//! JSON patch generation for credential injection.
//!
//! The patch always has the same shape: one volume operation, one operation
//! replacing the application containers (with mounts and sidecars added), and
//! one operation for the init containers.

use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Pod, Volume, VolumeMount};
use serde::Serialize;
use serde_json::Value;

use crate::bindings::MatchedCredential;
use crate::config::SidecarConfig;
use crate::error::Result;
use crate::webhooks::sidecar::{CREDS_VOLUME, build_sidecars, is_job_owned};

/// Builds the JSON patch that injects credential sidecars into a Pod
#[derive(Clone, Debug)]
pub struct PatchBuilder {
    sidecar: SidecarConfig,
}

impl PatchBuilder {
    pub fn new(sidecar: SidecarConfig) -> Self {
        Self { sidecar }
    }

    /// Operations injecting `credentials` into `pod`.
    ///
    /// The Pod itself is not modified.
    pub fn build(
        &self,
        pod: &Pod,
        namespace: &str,
        credentials: &[MatchedCredential],
    ) -> Result<Vec<PatchOperation>> {
        let spec = pod.spec.clone().unwrap_or_default();
        let service_account = spec.service_account_name.as_deref().unwrap_or_default();
        let job = is_job_owned(pod);

        let mut containers = spec.containers;
        let mut existing_init = spec.init_containers.unwrap_or_default();
        let had_containers = !containers.is_empty();
        let had_init = !existing_init.is_empty();

        add_volume_mounts(&mut containers, credentials);
        add_volume_mounts(&mut existing_init, credentials);

        let mut init_containers = Vec::with_capacity(credentials.len() + existing_init.len());
        for credential in credentials {
            let pair = build_sidecars(&self.sidecar, credential, namespace, service_account, job);
            containers.push(pair.sidecar);
            init_containers.push(pair.init);
        }
        init_containers.extend(existing_init);

        let has_volumes = spec.volumes.as_ref().is_some_and(|v| !v.is_empty());

        Ok(vec![
            volume_operation(has_volumes)?,
            set_operation(had_containers, &["spec", "containers"], &containers)?,
            set_operation(had_init, &["spec", "initContainers"], &init_containers)?,
        ])
    }

    /// Serialize operations into the JSON patch document sent to the API server
    pub fn encode(ops: &[PatchOperation]) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(ops)?)
    }
}

fn creds_volume() -> Volume {
    Volume {
        name: CREDS_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// `add /spec/volumes/-` appends to an existing list; without one the whole
/// list has to be created.
fn volume_operation(has_volumes: bool) -> Result<PatchOperation> {
    let volume = creds_volume();
    let (path, value) = if has_volumes {
        (
            PointerBuf::from_tokens(["spec", "volumes", "-"]),
            serde_json::to_value(&volume)?,
        )
    } else {
        (
            PointerBuf::from_tokens(["spec", "volumes"]),
            serde_json::to_value(vec![volume])?,
        )
    };
    Ok(PatchOperation::Add(AddOperation { path, value }))
}

/// Replace a list that already exists, add it otherwise
fn set_operation<T: Serialize>(exists: bool, tokens: &[&str], value: &T) -> Result<PatchOperation> {
    let path = PointerBuf::from_tokens(tokens.iter().copied());
    let value: Value = serde_json::to_value(value)?;
    Ok(if exists {
        PatchOperation::Replace(ReplaceOperation { path, value })
    } else {
        PatchOperation::Add(AddOperation { path, value })
    })
}

/// Mount the credential volume at every credential's output path, skipping
/// mounts a container already has.
pub fn add_volume_mounts(containers: &mut [Container], credentials: &[MatchedCredential]) {
    for container in containers.iter_mut() {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        for credential in credentials {
            let present = mounts
                .iter()
                .any(|m| m.name == CREDS_VOLUME && m.mount_path == credential.output_path);
            if !present {
                mounts.push(VolumeMount {
                    name: CREDS_VOLUME.to_string(),
                    mount_path: credential.output_path.clone(),
                    ..Default::default()
                });
            }
        }
    }
}
