// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for vault-webhook.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

mod crd_tests {
    use kube::CustomResourceExt;
    use vault_webhook::crd::DatabaseCredentialBinding;

    #[test]
    fn test_crd_manifest() {
        let crd = DatabaseCredentialBinding::crd();
        let yaml = serde_yaml::to_string(&crd).unwrap();

        assert!(yaml.contains("name: databasecredentialbindings.vaultwebhook.uswitch.com"));
        assert!(yaml.contains("scope: Namespaced"));
        assert!(yaml.contains("- dcb"));
    }

    #[test]
    fn test_crd_schema_fields() {
        let crd = DatabaseCredentialBinding::crd();
        let schema = serde_json::to_value(&crd.spec.versions[0].schema).unwrap();
        let spec = &schema["openAPIV3Schema"]["properties"]["spec"]["properties"];

        for field in ["database", "role", "serviceAccount", "outputPath", "outputFile", "container"] {
            assert!(spec.get(field).is_some(), "missing field {field}");
        }
    }

    #[test]
    fn test_binding_from_yaml() {
        let binding: DatabaseCredentialBinding = serde_yaml::from_str(
            r#"
apiVersion: vaultwebhook.uswitch.com/v1
kind: DatabaseCredentialBinding
metadata:
  name: orders-readonly
  namespace: shop
spec:
  database: orders
  role: readonly
  serviceAccount: orders-api
  container:
    lifecycle:
      preStop:
        exec:
          command: ["/bin/sh", "-c", "sleep 5"]
"#,
        )
        .unwrap();

        assert_eq!(binding.service_account(), Some("orders-api"));
        let pre_stop = binding
            .spec
            .container
            .unwrap()
            .lifecycle
            .unwrap()
            .pre_stop
            .unwrap();
        assert_eq!(pre_stop.exec.unwrap().command.unwrap().len(), 3);
    }
}

mod config_tests {
    use clap::Parser;
    use vault_webhook::config::Config;

    #[test]
    fn test_crd_flag_does_not_need_cluster() {
        let config = Config::try_parse_from(["vault-webhook", "--crd"]).unwrap();
        assert!(config.crd);
        assert!(config.cluster.is_none());
    }

    #[test]
    fn test_cluster_required_without_crd() {
        assert!(Config::try_parse_from(["vault-webhook"]).is_err());
    }

    #[test]
    fn test_sidecar_config_from_flags() {
        let config = Config::try_parse_from([
            "vault-webhook",
            "--cluster",
            "prod",
            "--vault-addr",
            "https://vault.example:8200",
            "--secret-path-format",
            "database/%s/creds/%s",
        ])
        .unwrap();
        config.validate().unwrap();

        let sidecar = config.sidecar();
        assert_eq!(sidecar.vault_addr, "https://vault.example:8200");
        assert_eq!(sidecar.secret_path("orders", "ro"), "database/orders/creds/ro");
    }

    #[test]
    fn test_invalid_secret_path_format() {
        let config = Config::try_parse_from([
            "vault-webhook",
            "--cluster",
            "prod",
            "--secret-path-format",
            "%s/creds",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }
}

mod matcher_tests {
    use vault_webhook::bindings::match_bindings;
    use vault_webhook::crd::{DatabaseCredentialBinding, DatabaseCredentialBindingSpec};

    fn binding(namespace: &str, database: &str, role: &str, sa: &str) -> DatabaseCredentialBinding {
        let mut binding = DatabaseCredentialBinding::new(
            database,
            DatabaseCredentialBindingSpec {
                database: database.to_string(),
                role: role.to_string(),
                service_account: Some(sa.to_string()),
                ..Default::default()
            },
        );
        binding.metadata.namespace = Some(namespace.to_string());
        binding
    }

    #[test]
    fn test_match_filters_namespace_and_service_account() {
        let bindings = vec![
            binding("foo", "db1", "ro", "sa"),
            binding("bah", "db2", "ro", "sa"),
            binding("foo", "db3", "ro", "other"),
        ];

        let matched = match_bindings(&bindings, "foo", "sa");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].database, "db1");
        assert_eq!(matched[0].output_path, "/etc/database");
    }

    #[test]
    fn test_duplicate_bindings_collapse() {
        let bindings = vec![binding("ns", "db", "ro", "sa"), binding("ns", "db", "ro", "sa")];
        assert_eq!(match_bindings(&bindings, "ns", "sa").len(), 1);
    }
}

mod error_tests {
    use vault_webhook::error::Error;

    #[test]
    fn test_fatal_errors() {
        assert!(Error::InitialSync("timeout".to_string()).is_fatal());
        assert!(Error::Config("bad".to_string()).is_fatal());
        assert!(
            !Error::Enumeration {
                key: "ns/name".to_string(),
                message: "bad".to_string(),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_enumeration_message_names_object() {
        let err = Error::Enumeration {
            key: "ns1/broken".to_string(),
            message: "invalid type".to_string(),
        };
        assert!(err.to_string().contains("ns1/broken"));
    }
}
