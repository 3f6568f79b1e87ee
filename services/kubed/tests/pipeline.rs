//! End-to-end tests of the config-to-desired-state pipeline.

use std::sync::Arc;
use std::time::Duration;

use keel_kubed::constants::SINGLETON_ID;
use keel_kubed::controllers;
use keel_kubed::resources::{
    BootstrapManifestsConfigSpec, ExtraManifestsConfigSpec, KubePrismEndpoint,
    KubePrismEndpointsSpec, MachineConfigSpec, MemberControlPlane, MemberSpec,
};
use keel_machine_config::MachineConfig;
use keel_resource::{ResourceSpec, Runtime, Store, TypedResource};
use tokio::sync::watch;

struct Harness {
    store: Arc<Store>,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(register: impl FnOnce(&mut Runtime)) -> Self {
        let store = Store::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx);
        register(&mut runtime);

        let handle = tokio::spawn(runtime.run());

        Self {
            store,
            shutdown_tx,
            handle,
        }
    }

    fn publish_machine_config(&self, yaml: &str) {
        let config = MachineConfig::from_yaml(yaml).unwrap();

        self.store
            .publish(SINGLETON_ID, MachineConfigSpec { config })
            .unwrap();
    }

    async fn wait_for<T: ResourceSpec>(&self, id: &str) -> TypedResource<T> {
        for _ in 0..300 {
            if let Some(res) = self.store.get::<T>(id).unwrap() {
                return res;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("{}/{id} did not appear", T::TYPE);
    }

    async fn wait_until<T: ResourceSpec>(
        &self,
        id: &str,
        pred: impl Fn(&T) -> bool,
    ) -> TypedResource<T> {
        for _ in 0..300 {
            if let Some(res) = self.store.get::<T>(id).unwrap() {
                if pred(&res.spec) {
                    return res;
                }
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("{}/{id} did not converge", T::TYPE);
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_default_control_plane_ipv4_only() {
    let harness = Harness::start(|runtime| {
        runtime.register(controllers::bootstrap_manifests_controller());
    });

    harness.publish_machine_config(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://foo:6443
"#,
    );

    let config: TypedResource<BootstrapManifestsConfigSpec> =
        harness.wait_for(SINGLETON_ID).await;

    assert_eq!(config.spec.dns_service_ip, "10.96.0.10");
    assert_eq!(config.spec.dns_service_ipv6, "");

    // default kube-proxy image is >= 1.31, so the proxy mode defaults to
    // nftables
    assert!(config
        .spec
        .proxy_args
        .contains(&"--proxy-mode=nftables".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_dual_stack_dns_service_ips() {
    let harness = Harness::start(|runtime| {
        runtime.register(controllers::bootstrap_manifests_controller());
    });

    harness.publish_machine_config(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://foo:6443
  network:
    serviceSubnets:
      - 10.96.0.0/12
      - fc00:db8:20::/112
"#,
    );

    let config: TypedResource<BootstrapManifestsConfigSpec> =
        harness.wait_for(SINGLETON_ID).await;

    assert_eq!(config.spec.dns_service_ip, "10.96.0.10");
    assert_eq!(config.spec.dns_service_ipv6, "fc00:db8:20::a");

    harness.stop().await;
}

#[tokio::test]
async fn test_kube_proxy_legacy_mode_for_old_image() {
    let harness = Harness::start(|runtime| {
        runtime.register(controllers::bootstrap_manifests_controller());
    });

    harness.publish_machine_config(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://foo:6443
  proxy:
    image: registry.k8s.io/kube-proxy:v1.30.0
"#,
    );

    let config: TypedResource<BootstrapManifestsConfigSpec> =
        harness.wait_for(SINGLETON_ID).await;

    assert!(config
        .spec
        .proxy_args
        .contains(&"--proxy-mode=iptables".to_string()));

    harness.stop().await;
}

#[tokio::test]
async fn test_kubeprism_endpoints_assembly() {
    let harness = Harness::start(|runtime| {
        runtime.register(controllers::KubePrismEndpointsController);
    });

    harness.publish_machine_config(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://example.com
    localAPIServerPort: 6445
"#,
    );

    harness
        .store
        .publish(
            "cp-1",
            MemberSpec {
                hostname: "cp-1".into(),
                addresses: vec!["192.168.3.4".parse().unwrap()],
                control_plane: Some(MemberControlPlane {
                    api_server_port: 6446,
                }),
            },
        )
        .unwrap();

    harness
        .store
        .publish(
            "cp-2",
            MemberSpec {
                hostname: "cp-2".into(),
                addresses: vec!["192.168.3.6".parse().unwrap()],
                control_plane: Some(MemberControlPlane {
                    api_server_port: 6443,
                }),
            },
        )
        .unwrap();

    harness
        .store
        .publish(
            "w-1",
            MemberSpec {
                hostname: "w-1".into(),
                addresses: vec!["192.168.3.5".parse().unwrap()],
                control_plane: None,
            },
        )
        .unwrap();

    let expected = vec![
        KubePrismEndpoint {
            host: "example.com".into(),
            port: 443,
        },
        KubePrismEndpoint {
            host: "localhost".into(),
            port: 6445,
        },
        KubePrismEndpoint {
            host: "192.168.3.4".into(),
            port: 6446,
        },
        KubePrismEndpoint {
            host: "192.168.3.6".into(),
            port: 6443,
        },
    ];

    harness
        .wait_until::<KubePrismEndpointsSpec>(SINGLETON_ID, |spec| spec.endpoints == expected)
        .await;

    harness.stop().await;
}

#[tokio::test]
async fn test_extra_manifest_priority_ordering() {
    let harness = Harness::start(|runtime| {
        runtime.register(controllers::extra_manifests_config_controller());
    });

    harness.publish_machine_config(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://foo:6443
  network:
    cni:
      name: custom
      urls:
        - https://cni.example.com/install.yaml
  externalCloudProvider:
    enabled: true
    manifests:
      - https://cloud.example.com/ccm.yaml
  extraManifests:
    - https://user.example.com/app.yaml
  inlineManifests:
    - name: my-config
      contents: |
        apiVersion: v1
        kind: ConfigMap
        metadata:
          name: my-config
"#,
    );

    let config: TypedResource<ExtraManifestsConfigSpec> = harness.wait_for(SINGLETON_ID).await;
    let manifests = &config.spec.extra_manifests;

    // CNI before cloud provider before user manifests, input order within
    // a priority class
    let priorities: Vec<&str> = manifests.iter().map(|m| m.priority.as_str()).collect();
    assert_eq!(priorities, vec!["05", "30", "99", "99"]);

    assert_eq!(manifests[0].url, "https://cni.example.com/install.yaml");
    assert_eq!(manifests[1].url, "https://cloud.example.com/ccm.yaml");
    assert_eq!(manifests[2].url, "https://user.example.com/app.yaml");
    assert_eq!(manifests[3].name, "my-config");
    assert!(manifests[3].url.is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn test_role_guard_drops_control_plane_outputs_on_worker() {
    let harness = Harness::start(|runtime| {
        runtime.register(controllers::bootstrap_manifests_controller());
    });

    harness.publish_machine_config(
        r#"
machine:
  type: controlplane
cluster:
  controlPlane:
    endpoint: https://foo:6443
"#,
    );

    harness
        .wait_for::<BootstrapManifestsConfigSpec>(SINGLETON_ID)
        .await;

    // demote the machine to a worker; the derived config must go away
    harness.publish_machine_config(
        r#"
machine:
  type: worker
cluster:
  controlPlane:
    endpoint: https://foo:6443
"#,
    );

    for _ in 0..300 {
        if harness
            .store
            .get::<BootstrapManifestsConfigSpec>(SINGLETON_ID)
            .unwrap()
            .is_none()
        {
            harness.stop().await;
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("control plane output survived the role change");
}
