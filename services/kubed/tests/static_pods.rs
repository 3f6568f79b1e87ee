//! Static pod rendering and secrets materialization, end to end.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use keel_kubed::constants::{
    ANNOTATION_SECRETS_VERSION, APISERVER_ID, SINGLETON_ID, STATIC_POD_STATUS_ID,
};
use keel_kubed::controllers::{RenderSecretsController, StaticPodController};
use keel_kubed::resources::{
    APIServerConfigSpec, ConfigStatusSpec, EtcdSecretsSpec, KubernetesCertsSpec,
    KubernetesRootSecretsSpec, PemPair, SecretsStatusSpec, ServiceHealthSpec, StaticPodSpec,
};
use keel_resource::{ResourceSpec, Runtime, Store, TypedResource};
use tokio::sync::watch;

async fn wait_for<T: ResourceSpec>(store: &Store, id: &str) -> TypedResource<T> {
    for _ in 0..300 {
        if let Some(res) = store.get::<T>(id).unwrap() {
            return res;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("{}/{id} did not appear", T::TYPE);
}

fn api_server_config() -> APIServerConfigSpec {
    APIServerConfigSpec {
        image: "registry.k8s.io/kube-apiserver:v1.31.1".into(),
        control_plane_endpoint: "https://foo:6443".into(),
        etcd_servers: vec!["https://localhost:2379".into()],
        local_port: 6443,
        service_cidrs: vec!["10.96.0.0/12".into()],
        advertised_address: "$(POD_IP)".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_secrets_rotation_restamps_pod_annotation() {
    let store = Store::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx);
    runtime.register(StaticPodController);
    let handle = tokio::spawn(runtime.run());

    store
        .publish(
            "etcd",
            ServiceHealthSpec {
                running: true,
                healthy: true,
            },
        )
        .unwrap();
    store
        .publish(
            STATIC_POD_STATUS_ID,
            SecretsStatusSpec {
                ready: true,
                version: "sec-1".into(),
            },
        )
        .unwrap();
    store
        .publish(
            STATIC_POD_STATUS_ID,
            ConfigStatusSpec {
                ready: true,
                version: "cfg-1".into(),
            },
        )
        .unwrap();
    store.publish(SINGLETON_ID, api_server_config()).unwrap();

    let pod: TypedResource<StaticPodSpec> = wait_for(&store, APISERVER_ID).await;
    let annotation = |pod: &StaticPodSpec| {
        pod.pod.metadata.annotations.as_ref().unwrap()[ANNOTATION_SECRETS_VERSION].clone()
    };

    assert_eq!(annotation(&pod.spec), "sec-1");

    // rotate the secrets: the pod annotation must follow, forcing kubelet
    // to restart the pod
    store
        .publish(
            STATIC_POD_STATUS_ID,
            SecretsStatusSpec {
                ready: true,
                version: "sec-2".into(),
            },
        )
        .unwrap();

    for _ in 0..300 {
        let pod = store.get::<StaticPodSpec>(APISERVER_ID).unwrap().unwrap();

        if annotation(&pod.spec) == "sec-2" {
            shutdown_tx.send(true).unwrap();
            handle.await.unwrap();
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("secrets version annotation was not restamped");
}

#[tokio::test]
async fn test_static_pods_torn_down_without_etcd() {
    let store = Store::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx);
    runtime.register(StaticPodController);
    let handle = tokio::spawn(runtime.run());

    store
        .publish(
            "etcd",
            ServiceHealthSpec {
                running: true,
                healthy: true,
            },
        )
        .unwrap();
    store
        .publish(
            STATIC_POD_STATUS_ID,
            SecretsStatusSpec {
                ready: true,
                version: "sec-1".into(),
            },
        )
        .unwrap();
    store
        .publish(
            STATIC_POD_STATUS_ID,
            ConfigStatusSpec {
                ready: true,
                version: "cfg-1".into(),
            },
        )
        .unwrap();
    store.publish(SINGLETON_ID, api_server_config()).unwrap();

    wait_for::<StaticPodSpec>(&store, APISERVER_ID).await;

    // etcd going away tears the static pods down
    store.remove::<ServiceHealthSpec>("etcd");

    for _ in 0..300 {
        if store.get::<StaticPodSpec>(APISERVER_ID).unwrap().is_none() {
            shutdown_tx.send(true).unwrap();
            handle.await.unwrap();
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("static pod survived etcd teardown");
}

#[tokio::test]
async fn test_secrets_materialized_with_tight_permissions() {
    let tempdir = tempfile::tempdir().unwrap();
    let store = Store::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx);
    runtime.register(RenderSecretsController::with_root(tempdir.path()));
    let handle = tokio::spawn(runtime.run());

    store
        .publish(
            SINGLETON_ID,
            KubernetesRootSecretsSpec {
                ca: PemPair {
                    crt: "CA-CRT".into(),
                    key: "CA-KEY".into(),
                },
                service_account: PemPair {
                    crt: "SA-PUB".into(),
                    key: "SA-KEY".into(),
                },
                aescbc_encryption_secret: "c2VjcmV0".into(),
                ..Default::default()
            },
        )
        .unwrap();
    store
        .publish(
            SINGLETON_ID,
            KubernetesCertsSpec {
                api_server: PemPair {
                    crt: "APISERVER-CRT".into(),
                    key: "APISERVER-KEY".into(),
                },
                controller_manager_kubeconfig: "CM-KUBECONFIG".into(),
                scheduler_kubeconfig: "SCHED-KUBECONFIG".into(),
                ..Default::default()
            },
        )
        .unwrap();
    store
        .publish(SINGLETON_ID, EtcdSecretsSpec::default())
        .unwrap();

    let status: TypedResource<SecretsStatusSpec> = wait_for(&store, STATIC_POD_STATUS_ID).await;
    assert!(status.spec.ready);

    let apiserver_cert = tempdir.path().join("kube-apiserver/apiserver.crt");
    assert_eq!(
        std::fs::read_to_string(&apiserver_cert).unwrap(),
        "APISERVER-CRT"
    );

    let mode = std::fs::metadata(&apiserver_cert).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o400);

    let scheduler_kubeconfig = tempdir.path().join("kube-scheduler/kubeconfig");
    assert_eq!(
        std::fs::read_to_string(scheduler_kubeconfig).unwrap(),
        "SCHED-KUBECONFIG"
    );

    // rotation bumps the published version
    let first_version = status.spec.version.clone();

    store
        .publish(
            SINGLETON_ID,
            KubernetesCertsSpec {
                api_server: PemPair {
                    crt: "APISERVER-CRT-2".into(),
                    key: "APISERVER-KEY-2".into(),
                },
                controller_manager_kubeconfig: "CM-KUBECONFIG".into(),
                scheduler_kubeconfig: "SCHED-KUBECONFIG".into(),
                ..Default::default()
            },
        )
        .unwrap();

    for _ in 0..300 {
        let status = store
            .get::<SecretsStatusSpec>(STATIC_POD_STATUS_ID)
            .unwrap()
            .unwrap();

        if status.spec.version != first_version {
            shutdown_tx.send(true).unwrap();
            handle.await.unwrap();
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("secrets version did not advance on rotation");
}
