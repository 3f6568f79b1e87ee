//! Applies the rendered manifests through the control plane endpoint.
//!
//! Only one node applies at a time: the whole pass runs under the
//! etcd-held cluster lock. Application is create-only and idempotent;
//! objects that already exist are skipped.

use std::sync::Arc;

use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use tracing::{info, warn};

use crate::constants::{MANIFEST_APPLY_MUTEX_KEY, SINGLETON_ID};
use crate::kubernetes::{ClientError, ClusterLock, DynamicClient, DynamicObject};
use crate::resources::{
    KubernetesCertsSpec, ManifestSpec, ManifestStatusSpec, ServiceHealthSpec,
};

/// Kinds that never carry a namespace; everything else gets the default
/// namespace when the manifest omits one.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "PriorityClass",
    "StorageClass",
    "PersistentVolume",
];

/// Applies `Manifest` resources to the cluster.
pub struct ManifestApplyController {
    client: Arc<dyn DynamicClient>,
    lock: Arc<dyn ClusterLock>,
}

impl ManifestApplyController {
    /// Build with the given client and cluster lock.
    pub fn new(client: Arc<dyn DynamicClient>, lock: Arc<dyn ClusterLock>) -> Self {
        Self { client, lock }
    }
}

#[async_trait]
impl Controller for ManifestApplyController {
    fn name(&self) -> &'static str {
        "k8s.ManifestApplyController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<KubernetesCertsSpec>(SINGLETON_ID),
            Input::weak::<ManifestSpec>(),
            Input::weak_id::<ServiceHealthSpec>("etcd"),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ManifestStatusSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            // the client authenticates with the cluster certs; wait for them
            if ctx.get_by_id::<KubernetesCertsSpec>(SINGLETON_ID)?.is_none() {
                continue;
            }

            // the lock lives in etcd; wait for it to be healthy
            let etcd_healthy = ctx
                .get_by_id::<ServiceHealthSpec>("etcd")?
                .is_some_and(|etcd| etcd.spec.healthy);

            if !etcd_healthy {
                continue;
            }

            // store order is id order, which is priority order
            let manifests = ctx.list_all::<ManifestSpec>()?;

            if !manifests.is_empty() {
                let objects = sort_objects(
                    manifests
                        .iter()
                        .flat_map(|m| m.spec.objects.iter().cloned().map(DynamicObject))
                        .collect(),
                );

                self.apply(&objects)
                    .await
                    .map_err(|e| ControllerError::Internal(e.into()))?;
            }

            let applied: Vec<String> = manifests
                .into_iter()
                .map(|m| m.metadata.id)
                .collect();

            ctx.modify::<ManifestStatusSpec>(SINGLETON_ID, |spec| {
                spec.manifests_applied = applied.clone();
            })?;

            ctx.reset_restart_backoff();
        }
    }
}

impl ManifestApplyController {
    async fn apply(&self, objects: &[DynamicObject]) -> Result<(), ClientError> {
        self.lock.acquire(MANIFEST_APPLY_MUTEX_KEY).await?;

        let result = self.apply_locked(objects).await;

        // release even when the apply failed half way through
        if let Err(e) = self.lock.release(MANIFEST_APPLY_MUTEX_KEY).await {
            warn!(error = %e, "error releasing manifest apply lock");
        }

        result
    }

    async fn apply_locked(&self, objects: &[DynamicObject]) -> Result<(), ClientError> {
        for obj in objects {
            let mut obj = obj.clone();

            if obj.namespace().is_none() && !CLUSTER_SCOPED_KINDS.contains(&obj.kind()) {
                obj.set_namespace("default");
            }

            let object_ref = format!(
                "{}/{}/{}",
                obj.api_version(),
                obj.kind(),
                obj.name()
            );

            match self.client.get(&obj).await {
                Ok(()) => continue,
                Err(ClientError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }

            match self.client.create(&obj).await {
                Ok(()) => {
                    info!(object = %object_ref, "created");
                }
                Err(ClientError::AlreadyExists(_)) => {
                    // another node won the race; that's convergence
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Namespaces first, then CRDs, then the rest; ties within the first two
/// classes break by name, the rest keeps input order.
pub fn sort_objects(mut objects: Vec<DynamicObject>) -> Vec<DynamicObject> {
    objects.sort_by(|left, right| {
        let class = |obj: &DynamicObject| {
            if obj.is_namespace() {
                0
            } else if obj.is_crd() {
                1
            } else {
                2
            }
        };

        match (class(left), class(right)) {
            (2, 2) => std::cmp::Ordering::Equal,
            (l, r) if l != r => l.cmp(&r),
            _ => left.name().cmp(right.name()),
        }
    });

    objects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(api_version: &str, kind: &str, name: &str) -> DynamicObject {
        DynamicObject(serde_json::json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": name},
        }))
    }

    #[test]
    fn test_sort_namespaces_then_crds_then_rest() {
        let sorted = sort_objects(vec![
            obj("apps/v1", "Deployment", "zz-app"),
            obj("apiextensions.k8s.io/v1", "CustomResourceDefinition", "b.example.com"),
            obj("v1", "Namespace", "zebra"),
            obj("apps/v1", "DaemonSet", "aa-agent"),
            obj("v1", "Namespace", "alpha"),
            obj("apiextensions.k8s.io/v1", "CustomResourceDefinition", "a.example.com"),
        ]);

        let names: Vec<&str> = sorted.iter().map(|o| o.name()).collect();

        assert_eq!(
            names,
            vec![
                "alpha",
                "zebra",
                "a.example.com",
                "b.example.com",
                // the rest keeps input order
                "zz-app",
                "aa-agent",
            ]
        );
    }
}
