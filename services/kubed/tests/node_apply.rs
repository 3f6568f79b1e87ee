//! Node object reconciliation against a mock API server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use keel_kubed::constants::{
    ANNOTATION_CORDONED_KEY, ANNOTATION_OWNED_LABELS, SINGLETON_ID,
};
use keel_kubed::controllers::{NodeApplyController, NodeClientProvider};
use keel_kubed::kubernetes::{ClientError, NodeClient};
use keel_kubed::resources::{
    MachineConfigSpec, NodeCordonedSpec, NodeLabelSpecSpec, NodenameSpec,
};
use keel_machine_config::MachineConfig;
use keel_resource::{Runtime, Store};
use tokio::sync::watch;

struct MockNodeClient {
    node: Mutex<Node>,
    conflicts: AtomicU32,
}

impl MockNodeClient {
    fn new(node: Node) -> Arc<Self> {
        Arc::new(Self {
            node: Mutex::new(node),
            conflicts: AtomicU32::new(0),
        })
    }

    fn snapshot(&self) -> Node {
        self.node.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn get_node(&self, _name: &str) -> Result<Node, ClientError> {
        Ok(self.snapshot())
    }

    async fn update_node(&self, node: &Node) -> Result<(), ClientError> {
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Conflict("object has been modified".into()));
        }

        *self.node.lock().unwrap() = node.clone();
        Ok(())
    }
}

struct MockProvider(Arc<MockNodeClient>);

#[async_trait]
impl NodeClientProvider for MockProvider {
    async fn client(
        &self,
        _control_plane: bool,
        _local_api_server_port: u16,
        _shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<Arc<dyn NodeClient>>> {
        Ok(Some(self.0.clone()))
    }
}

struct Harness {
    store: Arc<Store>,
    client: Arc<MockNodeClient>,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

fn base_node() -> Node {
    Node {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("cp-1".to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl Harness {
    fn start(node: Node) -> Self {
        let store = Store::new();
        let client = MockNodeClient::new(node);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut runtime = Runtime::new(Arc::clone(&store), shutdown_rx);
        runtime.register(NodeApplyController::with_provider(Arc::new(MockProvider(
            client.clone(),
        ))));

        let handle = tokio::spawn(runtime.run());

        let config = MachineConfig::from_yaml(
            "machine:\n  type: controlplane\ncluster:\n  controlPlane:\n    endpoint: https://foo:6443\n",
        )
        .unwrap();

        store
            .publish(SINGLETON_ID, MachineConfigSpec { config })
            .unwrap();
        store
            .publish(
                SINGLETON_ID,
                NodenameSpec {
                    nodename: "cp-1".into(),
                    skip_node_registration: false,
                },
            )
            .unwrap();

        Self {
            store,
            client,
            shutdown_tx,
            handle,
        }
    }

    async fn wait_node(&self, pred: impl Fn(&Node) -> bool) -> Node {
        for _ in 0..300 {
            let node = self.client.snapshot();

            if pred(&node) {
                return node;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!("node did not converge: {:#?}", self.client.snapshot());
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        self.handle.await.unwrap();
    }
}

fn labels(node: &Node) -> BTreeMap<String, String> {
    node.metadata.labels.clone().unwrap_or_default()
}

fn annotations(node: &Node) -> BTreeMap<String, String> {
    node.metadata.annotations.clone().unwrap_or_default()
}

#[tokio::test]
async fn test_label_applied_and_ownership_claimed() {
    let harness = Harness::start(base_node());

    harness
        .store
        .publish(
            "label1",
            NodeLabelSpecSpec {
                key: "label1".into(),
                value: "v1".into(),
            },
        )
        .unwrap();

    let node = harness
        .wait_node(|node| labels(node).get("label1").map(String::as_str) == Some("v1"))
        .await;

    assert_eq!(
        annotations(&node).get(ANNOTATION_OWNED_LABELS).unwrap(),
        r#"["label1"]"#
    );

    // value change on an owned label flows through, ownership unchanged
    harness
        .store
        .publish(
            "label1",
            NodeLabelSpecSpec {
                key: "label1".into(),
                value: "v2".into(),
            },
        )
        .unwrap();

    let node = harness
        .wait_node(|node| labels(node).get("label1").map(String::as_str) == Some("v2"))
        .await;

    assert_eq!(
        annotations(&node).get(ANNOTATION_OWNED_LABELS).unwrap(),
        r#"["label1"]"#
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_operator_label_not_clobbered() {
    let mut node = base_node();
    node.metadata.labels = Some(BTreeMap::from([(
        "env".to_string(),
        "operator-set".to_string(),
    )]));

    let harness = Harness::start(node);

    harness
        .store
        .publish(
            "env",
            NodeLabelSpecSpec {
                key: "env".into(),
                value: "machine-set".into(),
            },
        )
        .unwrap();

    // an unrelated owned label proves a reconcile has completed
    harness
        .store
        .publish(
            "probe",
            NodeLabelSpecSpec {
                key: "probe".into(),
                value: "x".into(),
            },
        )
        .unwrap();

    let node = harness
        .wait_node(|node| labels(node).contains_key("probe"))
        .await;

    // conflicting value with no ownership claim stays untouched
    assert_eq!(labels(&node).get("env").unwrap(), "operator-set");
    assert!(!annotations(&node)
        .get(keel_kubed::constants::ANNOTATION_OWNED_LABELS)
        .unwrap()
        .contains("env"));

    harness.stop().await;
}

#[tokio::test]
async fn test_owned_label_removed_when_spec_drops_it() {
    let harness = Harness::start(base_node());

    harness
        .store
        .publish(
            "label1",
            NodeLabelSpecSpec {
                key: "label1".into(),
                value: "v1".into(),
            },
        )
        .unwrap();

    harness
        .wait_node(|node| labels(node).contains_key("label1"))
        .await;

    harness.store.remove::<NodeLabelSpecSpec>("label1");

    let node = harness
        .wait_node(|node| !labels(node).contains_key("label1"))
        .await;

    assert!(!annotations(&node).contains_key(ANNOTATION_OWNED_LABELS));

    harness.stop().await;
}

#[tokio::test]
async fn test_cordon_and_uncordon() {
    let harness = Harness::start(base_node());

    harness
        .store
        .publish(SINGLETON_ID, NodeCordonedSpec {})
        .unwrap();

    let node = harness
        .wait_node(|node| {
            node.spec.as_ref().and_then(|s| s.unschedulable) == Some(true)
        })
        .await;

    assert_eq!(
        annotations(&node).get(ANNOTATION_CORDONED_KEY).map(String::as_str),
        Some("true")
    );

    harness.store.remove::<NodeCordonedSpec>(SINGLETON_ID);

    let node = harness
        .wait_node(|node| {
            node.spec.as_ref().and_then(|s| s.unschedulable) == Some(false)
        })
        .await;

    assert!(!annotations(&node).contains_key(ANNOTATION_CORDONED_KEY));

    harness.stop().await;
}

#[tokio::test]
async fn test_operator_cordon_not_lifted() {
    let mut node = base_node();
    node.spec = Some(k8s_openapi::api::core::v1::NodeSpec {
        unschedulable: Some(true),
        ..Default::default()
    });

    let harness = Harness::start(node);

    // no cordon spec, but also no marker annotation: the operator did this
    harness
        .store
        .publish(
            "probe",
            NodeLabelSpecSpec {
                key: "probe".into(),
                value: "x".into(),
            },
        )
        .unwrap();

    let node = harness
        .wait_node(|node| labels(node).contains_key("probe"))
        .await;

    assert_eq!(node.spec.as_ref().and_then(|s| s.unschedulable), Some(true));

    harness.stop().await;
}

#[tokio::test]
async fn test_conflicts_retried() {
    let harness = Harness::start(base_node());
    harness.client.conflicts.store(3, Ordering::SeqCst);

    harness
        .store
        .publish(
            "label1",
            NodeLabelSpecSpec {
                key: "label1".into(),
                value: "v1".into(),
            },
        )
        .unwrap();

    harness
        .wait_node(|node| labels(node).contains_key("label1"))
        .await;

    harness.stop().await;
}
