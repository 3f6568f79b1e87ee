//! Kubernetes API client seams.
//!
//! The controllers are parameterized over narrow capability traits; the
//! REST implementations here are deliberately thin. Which trait object a
//! controller receives (privileged control plane client vs one derived
//! from the kubelet kubeconfig) is decided at construction time.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use thiserror::Error;
use tracing::debug;

/// Kubernetes API errors, reduced to the classes the controllers act on.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Optimistic concurrency conflict; retry with a fresh read.
    #[error("conflict: {0}")]
    Conflict(String),

    /// RBAC rejected the call; retried because permissions may lag node
    /// registration.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists (treated as success by create-once callers).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Any other API error.
    #[error("api error (status {status}): {message}")]
    Api {
        /// HTTP status.
        status: u16,
        /// Response body.
        message: String,
    },

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    /// Errors worth retrying inside a bounded loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Forbidden(_))
    }
}

/// Node object capabilities used by the node applier.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch a node by name.
    async fn get_node(&self, name: &str) -> Result<Node, ClientError>;

    /// Update a node under optimistic concurrency.
    async fn update_node(&self, node: &Node) -> Result<(), ClientError>;
}

/// An untyped Kubernetes object (one decoded manifest document).
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicObject(pub serde_json::Value);

impl DynamicObject {
    /// `apiVersion` field.
    pub fn api_version(&self) -> &str {
        self.0["apiVersion"].as_str().unwrap_or_default()
    }

    /// `kind` field.
    pub fn kind(&self) -> &str {
        self.0["kind"].as_str().unwrap_or_default()
    }

    /// `(group, version)` split of `apiVersion`.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version().split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version()),
        }
    }

    /// `metadata.name`.
    pub fn name(&self) -> &str {
        self.0["metadata"]["name"].as_str().unwrap_or_default()
    }

    /// `metadata.namespace`, if set.
    pub fn namespace(&self) -> Option<&str> {
        self.0["metadata"]["namespace"].as_str()
    }

    /// Set `metadata.namespace`.
    pub fn set_namespace(&mut self, namespace: &str) {
        self.0["metadata"]["namespace"] = serde_json::Value::String(namespace.to_string());
    }

    /// True for a `v1` Namespace.
    pub fn is_namespace(&self) -> bool {
        self.kind() == "Namespace" && self.api_version() == "v1"
    }

    /// True for a CustomResourceDefinition.
    pub fn is_crd(&self) -> bool {
        self.kind() == "CustomResourceDefinition"
            && self.group_version().0 == "apiextensions.k8s.io"
    }
}

/// Dynamic object capabilities used by the manifest applier.
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// Check whether an object exists.
    async fn get(&self, obj: &DynamicObject) -> Result<(), ClientError>;

    /// Create an object with the fixed field manager.
    async fn create(&self, obj: &DynamicObject) -> Result<(), ClientError>;
}

/// Cluster-wide critical section held in etcd.
#[async_trait]
pub trait ClusterLock: Send + Sync {
    /// Block until the lock is held.
    async fn acquire(&self, key: &str) -> Result<(), ClientError>;

    /// Release the lock.
    async fn release(&self, key: &str) -> Result<(), ClientError>;
}

/// REST implementation of [`NodeClient`] over one API server base URL.
pub struct RestNodeClient {
    client: reqwest::Client,
    base: String,
}

impl RestNodeClient {
    /// Wrap a preconfigured HTTP client (TLS identity wired by the caller).
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    fn node_url(&self, name: &str) -> String {
        format!("{}/api/v1/nodes/{name}", self.base.trim_end_matches('/'))
    }
}

#[async_trait]
impl NodeClient for RestNodeClient {
    async fn get_node(&self, name: &str) -> Result<Node, ClientError> {
        let response = self
            .client
            .get(self.node_url(name))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let response = check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn update_node(&self, node: &Node) -> Result<(), ClientError> {
        let name = node.metadata.name.as_deref().unwrap_or_default();

        let response = self
            .client
            .put(self.node_url(name))
            .json(node)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    let message = response.text().await.unwrap_or_default();

    Err(match status.as_u16() {
        404 => ClientError::NotFound(message),
        403 => ClientError::Forbidden(message),
        409 if message.contains("AlreadyExists") => ClientError::AlreadyExists(message),
        409 => ClientError::Conflict(message),
        status => ClientError::Api { status, message },
    })
}

/// REST implementation of [`DynamicClient`].
///
/// Builds the resource path from the group/version/kind without API
/// discovery: kinds pluralize by the regular English rules, which holds
/// for everything the bootstrap manifests ship.
pub struct RestDynamicClient {
    client: reqwest::Client,
    base: String,
}

impl RestDynamicClient {
    /// Wrap a preconfigured HTTP client.
    pub fn new(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    fn collection_url(&self, obj: &DynamicObject) -> String {
        let (group, version) = obj.group_version();
        let plural = pluralize(&obj.kind().to_lowercase());

        let prefix = if group.is_empty() {
            format!("{}/api/{version}", self.base.trim_end_matches('/'))
        } else {
            format!("{}/apis/{group}/{version}", self.base.trim_end_matches('/'))
        };

        match obj.namespace() {
            Some(namespace) => format!("{prefix}/namespaces/{namespace}/{plural}"),
            None => format!("{prefix}/{plural}"),
        }
    }
}

#[async_trait]
impl DynamicClient for RestDynamicClient {
    async fn get(&self, obj: &DynamicObject) -> Result<(), ClientError> {
        let url = format!("{}/{}", self.collection_url(obj), obj.name());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<(), ClientError> {
        let response = self
            .client
            .post(self.collection_url(obj))
            .query(&[("fieldManager", crate::constants::FIELD_MANAGER)])
            .json(&obj.0)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }
}

fn pluralize(kind: &str) -> String {
    if let Some(stem) = kind.strip_suffix('y') {
        format!("{stem}ies")
    } else if kind.ends_with('s') || kind.ends_with("ch") || kind.ends_with("sh") {
        format!("{kind}es")
    } else {
        format!("{kind}s")
    }
}

/// Wait until the kubelet has written its kubeconfig, then extract the
/// server URL out of it.
///
/// Worker machines have no local API server; their client must go through
/// the endpoint the kubelet bootstrapped against.
pub async fn wait_for_kubelet_kubeconfig(
    path: &Path,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Option<String> {
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if let Some(server) = kubeconfig_server(&contents) {
                return Some(server);
            }
        }

        debug!(path = %path.display(), "waiting for kubelet kubeconfig");

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return None;
                }
            }
        }
    }
}

/// First cluster server URL of a kubeconfig document.
pub fn kubeconfig_server(kubeconfig: &str) -> Option<String> {
    let doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig).ok()?;

    doc["clusters"][0]["cluster"]["server"]
        .as_str()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_object_classification() {
        let ns = DynamicObject(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "kube-system"},
        }));
        let crd = DynamicObject(serde_json::json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
        }));
        let deployment = DynamicObject(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "coredns", "namespace": "kube-system"},
        }));

        assert!(ns.is_namespace());
        assert!(!ns.is_crd());
        assert!(crd.is_crd());
        assert!(!deployment.is_namespace());
        assert_eq!(deployment.group_version(), ("apps", "v1"));
        assert_eq!(deployment.namespace(), Some("kube-system"));
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("deployment"), "deployments");
        assert_eq!(pluralize("networkpolicy"), "networkpolicies");
        assert_eq!(pluralize("storageclass"), "storageclasses");
    }

    #[test]
    fn test_kubeconfig_server_extraction() {
        let kubeconfig = r#"
apiVersion: v1
kind: Config
clusters:
  - name: default
    cluster:
      server: https://10.5.0.2:6443
"#;

        assert_eq!(
            kubeconfig_server(kubeconfig).as_deref(),
            Some("https://10.5.0.2:6443")
        );
        assert_eq!(kubeconfig_server("{}"), None);
    }
}
