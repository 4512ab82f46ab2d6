//! Patches produced for realistic Pods.
//!
//! Every patch is applied back onto the submitted Pod with `json_patch` to
//! check that the API server would accept it.

use k8s_openapi::api::core::v1::Pod;
use serde_json::{Value, json};

use vault_webhook::crd::{ContainerOverride, ExecHook, LifecycleOverride, PreStopHook, SleepHook};

use crate::fixtures::*;

fn apply(object: &Value, patch: Vec<Value>) -> Pod {
    let patch: json_patch::Patch = serde_json::from_value(Value::Array(patch)).unwrap();
    let mut doc = object.clone();
    json_patch::patch(&mut doc, &patch.0).unwrap();
    serde_json::from_value(doc).unwrap()
}

fn args(pod: &Pod, name: &str) -> Vec<String> {
    let spec = pod.spec.as_ref().unwrap();
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("container {name} not found"))
        .args
        .clone()
        .unwrap()
}

#[tokio::test]
async fn test_single_binding_injection() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);
    let object = pod("sa1");

    let result = webhook.review(create_review("ns1", object.clone())).await;
    assert!(result.allowed());
    assert_eq!(result.response()["patchType"], "JSONPatch");

    let patch = result.patch().unwrap();
    assert_eq!(patch.len(), 3);
    assert_eq!(patch[0]["op"], "add");
    assert_eq!(patch[0]["path"], "/spec/volumes");
    assert_eq!(patch[1]["op"], "replace");
    assert_eq!(patch[1]["path"], "/spec/containers");
    assert_eq!(patch[2]["op"], "add");
    assert_eq!(patch[2]["path"], "/spec/initContainers");

    let mutated = apply(&object, patch);
    let spec = mutated.spec.as_ref().unwrap();

    let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["app", "vault-creds-foo-bar"]);
    let app_mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
    assert_eq!(app_mounts[0].name, "vault-creds");
    assert_eq!(app_mounts[0].mount_path, "/etc/database");

    // The template volume is mounted by the sidecars but supplied by the Pod author
    let volumes: Vec<_> = spec.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
    assert_eq!(volumes, vec!["vault-creds"]);
    let sidecar_mounts = spec.containers[1].volume_mounts.as_ref().unwrap();
    assert!(sidecar_mounts.iter().any(|m| m.name == "vault-template" && m.mount_path == "/creds/template"));

    let init = spec.init_containers.as_ref().unwrap();
    assert_eq!(init.len(), 1);
    assert_eq!(init[0].name, "vault-creds-foo-bar-init");

    assert!(args(&mutated, "vault-creds-foo-bar-init").contains(&"--init".to_string()));
    assert!(args(&mutated, "vault-creds-foo-bar").contains(&"--auth-role=foo_ns1_sa1".to_string()));
    assert!(args(&mutated, "vault-creds-foo-bar").contains(&"--secret-path=foo/creds/bar".to_string()));

    let metrics = webhook.metrics.encode();
    assert!(metrics.contains("vault_webhook_admission_requests_total{outcome=\"mutated\"} 1"));
    assert!(metrics.contains("vault_webhook_injected_sidecars_total 2"));
}

#[tokio::test]
async fn test_multiple_bindings_share_one_volume() {
    let mut custom = binding("ns1", "orders", "rw", "sa1");
    custom.spec.output_path = Some("/etc/orders".to_string());
    custom.spec.output_file = Some("orders.json".to_string());
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1"), custom]);

    let mut object = pod("sa1");
    object["spec"]["volumes"] = json!([{"name": "config", "emptyDir": {}}]);
    object["spec"]["initContainers"] = json!([{"name": "migrate", "image": "migrate:latest"}]);

    let result = webhook.review(create_review("ns1", object.clone())).await;
    let patch = result.patch().unwrap();
    assert_eq!(patch[0]["path"], "/spec/volumes/-");
    assert_eq!(patch[2]["op"], "replace");

    let mutated = apply(&object, patch);
    let spec = mutated.spec.as_ref().unwrap();

    let volumes: Vec<_> = spec.volumes.as_ref().unwrap().iter().map(|v| v.name.as_str()).collect();
    assert_eq!(volumes, vec!["config", "vault-creds"]);

    let mount_paths: Vec<_> = spec.containers[0]
        .volume_mounts
        .as_ref()
        .unwrap()
        .iter()
        .map(|m| m.mount_path.as_str())
        .collect();
    assert_eq!(mount_paths.len(), 2);
    assert!(mount_paths.contains(&"/etc/database"));
    assert!(mount_paths.contains(&"/etc/orders"));

    let init_names: Vec<_> = spec
        .init_containers
        .as_ref()
        .unwrap()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(init_names.len(), 3);
    assert_eq!(init_names.last(), Some(&"migrate"));

    let migrate = spec.init_containers.as_ref().unwrap().last().unwrap();
    assert_eq!(migrate.volume_mounts.as_ref().unwrap().len(), 2);

    assert!(args(&mutated, "vault-creds-orders-rw").contains(&"--out=/creds/output/orders.json".to_string()));
}

#[tokio::test]
async fn test_job_pods_get_job_flag() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "foo", "bar", "sa1")]);

    for (kind, expected) in [("Job", true), ("Workflow", true), ("ReplicaSet", false)] {
        let mut object = pod("sa1");
        object["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "batch/v1",
            "kind": kind,
            "name": "owner",
            "uid": "d9607e19-f88f-11e6-a518-42010a800195"
        }]);

        let patch = webhook.review(create_review("ns1", object.clone())).await.patch().unwrap();
        let mutated = apply(&object, patch);

        assert_eq!(
            args(&mutated, "vault-creds-foo-bar").contains(&"--job".to_string()),
            expected,
            "owner kind {kind}"
        );
        assert!(!args(&mutated, "vault-creds-foo-bar-init").contains(&"--job".to_string()));
    }
}

#[tokio::test]
async fn test_pre_stop_override_on_sidecar_only() {
    let mut exec = binding("ns1", "foo", "bar", "sa1");
    exec.spec.container = Some(ContainerOverride {
        lifecycle: Some(LifecycleOverride {
            pre_stop: Some(PreStopHook {
                exec: Some(ExecHook {
                    command: Some(vec!["/bin/sh".into(), "-c".into(), "sleep 5".into()]),
                }),
                sleep: None,
            }),
        }),
    });
    let mut invalid = binding("ns1", "baz", "qux", "sa1");
    invalid.spec.container = Some(ContainerOverride {
        lifecycle: Some(LifecycleOverride {
            pre_stop: Some(PreStopHook {
                exec: None,
                sleep: Some(SleepHook { seconds: -10 }),
            }),
        }),
    });
    let webhook = TestWebhook::with_bindings(&[exec, invalid]);
    let object = pod("sa1");

    let patch = webhook.review(create_review("ns1", object.clone())).await.patch().unwrap();
    let mutated = apply(&object, patch);
    let spec = mutated.spec.unwrap();

    let find = |name: &str| spec.containers.iter().find(|c| c.name == name).unwrap();
    let hook = find("vault-creds-foo-bar").lifecycle.as_ref().unwrap().pre_stop.as_ref().unwrap();
    assert_eq!(hook.exec.as_ref().unwrap().command.as_ref().unwrap()[2], "sleep 5");
    assert!(find("vault-creds-baz-qux").lifecycle.is_none());

    assert!(spec.init_containers.unwrap().iter().all(|c| c.lifecycle.is_none()));
}

#[tokio::test]
async fn test_underscored_names_are_normalised() {
    let webhook = TestWebhook::with_bindings(&[binding("ns1", "my_db", "read_only", "sa1")]);
    let object = pod("sa1");

    let patch = webhook.review(create_review("ns1", object.clone())).await.patch().unwrap();
    let mutated = apply(&object, patch);

    let args = args(&mutated, "vault-creds-my-db-read-only");
    assert!(args.contains(&"--template=/creds/template/my_db-read_only".to_string()));
    assert!(args.contains(&"--auth-role=my_db_ns1_sa1".to_string()));
}
