//! Reconciles the live Kubernetes Node object with the declared specs.
//!
//! Ownership of individual labels/annotations/taints is tracked in
//! well-known annotations on the Node itself so that operator-set values
//! are never clobbered: only keys this applier claimed get updated or
//! removed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::constants::{
    ANNOTATION_CORDONED_KEY, ANNOTATION_CORDONED_VALUE, ANNOTATION_OWNED_ANNOTATIONS,
    ANNOTATION_OWNED_LABELS, ANNOTATION_OWNED_TAINTS, KUBELET_KUBECONFIG,
    NODE_UPDATE_RETRY_STEP, NODE_UPDATE_RETRY_TIMEOUT, SINGLETON_ID,
};
use crate::kubernetes::{
    wait_for_kubelet_kubeconfig, ClientError, NodeClient, RestNodeClient,
};
use crate::resources::{
    MachineConfigSpec, NodeAnnotationSpecSpec, NodeCordonedSpec, NodeLabelSpecSpec,
    NodeStatusSpec, NodeTaintSpecSpec, NodenameSpec,
};

/// Chooses the node client for the machine's role.
#[async_trait]
pub trait NodeClientProvider: Send + Sync {
    /// Build a client, waiting for prerequisites (kubelet kubeconfig on
    /// workers). Returns `None` only when shutdown interrupts the wait.
    async fn client(
        &self,
        control_plane: bool,
        local_api_server_port: u16,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<Arc<dyn NodeClient>>>;
}

/// Default provider: privileged localhost client on control plane
/// machines, kubelet-kubeconfig-derived client on workers.
pub struct DefaultNodeClientProvider;

#[async_trait]
impl NodeClientProvider for DefaultNodeClientProvider {
    async fn client(
        &self,
        control_plane: bool,
        local_api_server_port: u16,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<Arc<dyn NodeClient>>> {
        // TLS identity comes from the trust store installed by PKI setup,
        // outside this subsystem
        let http = reqwest::Client::builder().use_rustls_tls().build()?;

        let base = if control_plane {
            format!("https://localhost:{local_api_server_port}")
        } else {
            let path = std::path::Path::new(KUBELET_KUBECONFIG);

            match wait_for_kubelet_kubeconfig(path, shutdown).await {
                Some(server) => server,
                None => return Ok(None),
            }
        };

        Ok(Some(Arc::new(RestNodeClient::new(http, base))))
    }
}

/// Applies declared labels, annotations, taints and the cordon flag to the
/// Node object.
pub struct NodeApplyController {
    provider: Arc<dyn NodeClientProvider>,
}

impl NodeApplyController {
    /// Build with the default client provider.
    pub fn new() -> Self {
        Self::with_provider(Arc::new(DefaultNodeClientProvider))
    }

    /// Build with a custom client provider (tests).
    pub fn with_provider(provider: Arc<dyn NodeClientProvider>) -> Self {
        Self { provider }
    }
}

impl Default for NodeApplyController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for NodeApplyController {
    fn name(&self) -> &'static str {
        "k8s.NodeApplyController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak::<NodeLabelSpecSpec>(),
            Input::weak::<NodeAnnotationSpecSpec>(),
            Input::weak::<NodeTaintSpecSpec>(),
            Input::weak::<NodeCordonedSpec>(),
            // NodeStatus changes retrigger the reconcile
            Input::weak::<NodeStatusSpec>(),
            Input::weak_id::<NodenameSpec>(SINGLETON_ID),
            Input::weak_id::<MachineConfigSpec>(SINGLETON_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(nodename) = ctx.get_by_id::<NodenameSpec>(SINGLETON_ID)? else {
                continue;
            };

            if nodename.spec.skip_node_registration {
                continue;
            }

            let Some(config) = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)? else {
                continue;
            };

            let labels: BTreeMap<String, String> = ctx
                .list_all::<NodeLabelSpecSpec>()?
                .into_iter()
                .map(|res| (res.spec.key, res.spec.value))
                .collect();

            let annotations: BTreeMap<String, String> = ctx
                .list_all::<NodeAnnotationSpecSpec>()?
                .into_iter()
                .map(|res| (res.spec.key, res.spec.value))
                .collect();

            let taints: Vec<NodeTaintSpecSpec> = ctx
                .list_all::<NodeTaintSpecSpec>()?
                .into_iter()
                .map(|res| res.spec)
                .collect();

            let should_cordon = !ctx.list_all::<NodeCordonedSpec>()?.is_empty();

            let client = self
                .provider
                .client(
                    config.spec.config.is_control_plane(),
                    config.spec.config.cluster.control_plane.local_port(),
                    ctx.shutdown(),
                )
                .await
                .map_err(ControllerError::Internal)?;

            let Some(client) = client else {
                // shutdown interrupted the client wait
                return Ok(());
            };

            sync(
                client.as_ref(),
                &nodename.spec.nodename,
                &labels,
                &annotations,
                &taints,
                should_cordon,
            )
            .await
            .map_err(|e| ControllerError::Internal(e.into()))?;

            ctx.reset_restart_backoff();
        }
    }
}

/// Bounded retry wrapper: conflict and forbidden resolve themselves
/// (concurrent writers, RBAC catching up with registration).
async fn sync(
    client: &dyn NodeClient,
    nodename: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    taints: &[NodeTaintSpecSpec],
    should_cordon: bool,
) -> Result<(), ClientError> {
    let deadline = tokio::time::Instant::now() + NODE_UPDATE_RETRY_TIMEOUT;

    loop {
        match sync_once(client, nodename, labels, annotations, taints, should_cordon).await {
            Err(e) if e.is_retryable() && tokio::time::Instant::now() < deadline => {
                debug!(error = %e, "node update retry");
                tokio::time::sleep(NODE_UPDATE_RETRY_STEP).await;
            }
            result => return result,
        }
    }
}

async fn sync_once(
    client: &dyn NodeClient,
    nodename: &str,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    taints: &[NodeTaintSpecSpec],
    should_cordon: bool,
) -> Result<(), ClientError> {
    let mut node = client.get_node(nodename).await?;

    apply_specs(&mut node, labels, annotations, taints, should_cordon)
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    client.update_node(&node).await
}

/// In-memory application of all spec classes to the node object.
pub fn apply_specs(
    node: &mut Node,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    taints: &[NodeTaintSpecSpec],
    should_cordon: bool,
) -> serde_json::Result<()> {
    let node_annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);

    let mut owned_labels = unmarshal_owned(node_annotations.get(ANNOTATION_OWNED_LABELS))?;
    let mut owned_annotations =
        unmarshal_owned(node_annotations.get(ANNOTATION_OWNED_ANNOTATIONS))?;
    let mut owned_taints = unmarshal_owned(node_annotations.get(ANNOTATION_OWNED_TAINTS))?;

    let node_labels = node.metadata.labels.get_or_insert_with(BTreeMap::new);
    apply_node_kv(node_labels, &mut owned_labels, labels);

    let node_annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
    apply_node_kv(node_annotations, &mut owned_annotations, annotations);

    let spec = node.spec.get_or_insert_default();
    let node_taints = spec.taints.get_or_insert_with(Vec::new);
    apply_taints(node_taints, &mut owned_taints, taints);

    apply_cordoned(node, should_cordon);

    let node_annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);

    marshal_owned(node_annotations, ANNOTATION_OWNED_LABELS, &owned_labels)?;
    marshal_owned(
        node_annotations,
        ANNOTATION_OWNED_ANNOTATIONS,
        &owned_annotations,
    )?;
    marshal_owned(node_annotations, ANNOTATION_OWNED_TAINTS, &owned_taints)?;

    Ok(())
}

fn unmarshal_owned(value: Option<&String>) -> serde_json::Result<BTreeSet<String>> {
    match value {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw),
        _ => Ok(BTreeSet::new()),
    }
}

fn marshal_owned(
    annotations: &mut BTreeMap<String, String>,
    key: &str,
    owned: &BTreeSet<String>,
) -> serde_json::Result<()> {
    if owned.is_empty() {
        annotations.remove(key);
    } else {
        // BTreeSet iterates sorted, so the marshaled list is stable
        annotations.insert(key.to_string(), serde_json::to_string(owned)?);
    }

    Ok(())
}

/// Key/value reconciliation shared by labels and annotations.
pub fn apply_node_kv(
    node_kv: &mut BTreeMap<String, String>,
    owned: &mut BTreeSet<String>,
    spec: &BTreeMap<String, String>,
) {
    for (key, value) in spec {
        match node_kv.get(key) {
            None => {
                // not set on the node yet, take it over
                node_kv.insert(key.clone(), value.clone());
                owned.insert(key.clone());
            }
            Some(current) if current == value => {
                // already converged; claim ownership silently
                owned.insert(key.clone());
            }
            Some(_) if !owned.contains(key) => {
                debug!(key = %key, "skipping update, key is not owned");
            }
            Some(_) => {
                node_kv.insert(key.clone(), value.clone());
            }
        }
    }

    // remove keys which are owned but left the spec
    owned.retain(|key| {
        if spec.contains_key(key) {
            return true;
        }

        node_kv.remove(key);
        false
    });
}

/// Taint reconciliation, keyed by taint key with `(value, effect)` as the
/// compared tuple.
pub fn apply_taints(
    node_taints: &mut Vec<Taint>,
    owned: &mut BTreeSet<String>,
    spec: &[NodeTaintSpecSpec],
) {
    for taint in spec {
        match node_taints.iter_mut().find(|t| t.key == taint.key) {
            None => {
                node_taints.push(Taint {
                    key: taint.key.clone(),
                    value: Some(taint.value.clone()),
                    effect: taint.effect.clone(),
                    time_added: None,
                });
                owned.insert(taint.key.clone());
            }
            Some(current) if owned.contains(&taint.key) => {
                current.value = Some(taint.value.clone());
                current.effect = taint.effect.clone();
            }
            Some(current)
                if current.value.as_deref() == Some(taint.value.as_str())
                    && current.effect == taint.effect =>
            {
                owned.insert(taint.key.clone());
            }
            Some(_) => {
                debug!(key = %taint.key, "skipping taint update, taint is not owned");
            }
        }
    }

    node_taints.retain(|taint| {
        if !owned.contains(&taint.key) {
            return true;
        }

        if spec.iter().any(|t| t.key == taint.key) {
            return true;
        }

        owned.remove(&taint.key);
        false
    });
}

/// Cordon/uncordon with the marker annotation distinguishing our cordons
/// from operator intent.
pub fn apply_cordoned(node: &mut Node, should_cordon: bool) {
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    let annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);

    if should_cordon && !unschedulable {
        node.spec.get_or_insert_default().unschedulable = Some(true);
        annotations.insert(
            ANNOTATION_CORDONED_KEY.to_string(),
            ANNOTATION_CORDONED_VALUE.to_string(),
        );

        info!("node cordoned");
    } else if !should_cordon && unschedulable {
        if !annotations.contains_key(ANNOTATION_CORDONED_KEY) {
            // cordoned by an operator, leave it alone
            return;
        }

        node.spec.get_or_insert_default().unschedulable = Some(false);
        annotations.remove(ANNOTATION_CORDONED_KEY);

        info!("node uncordoned");
    }
}
