//! Serves the rendered static pods to the kubelet over loopback HTTP.
//!
//! `GET /` returns the current pod set as a YAML `PodList`. The body is
//! recomputed on every `StaticPod` change and served out of a
//! mutex-guarded cache; the bind port is OS-chosen and published through
//! `StaticPodServerStatus`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use k8s_openapi::api::core::v1::Pod;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::constants::SINGLETON_ID;
use crate::resources::{StaticPodServerStatusSpec, StaticPodSpec};

type PodListCache = Arc<Mutex<Vec<u8>>>;

/// Serves the static pod list and publishes its URL.
pub struct StaticPodServerController;

#[async_trait]
impl Controller for StaticPodServerController {
    fn name(&self) -> &'static str {
        "k8s.StaticPodServerController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak::<StaticPodSpec>()]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<StaticPodServerStatusSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        let cache: PodListCache = Arc::new(Mutex::new(render_pod_list(&[])));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| {
                ControllerError::Internal(anyhow::anyhow!("error binding pod list server: {e}"))
            })?;

        let local_addr = listener.local_addr().map_err(|e| {
            ControllerError::Internal(anyhow::anyhow!("error reading bound address: {e}"))
        })?;

        let app = Router::new()
            .route("/", get(serve_pod_list))
            .with_state(Arc::clone(&cache));

        let mut drain = ctx.shutdown();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while drain.changed().await.is_ok() {
                        if *drain.borrow() {
                            return;
                        }
                    }
                })
                .await
        });

        let url = format!("http://{local_addr}/");
        info!(url = %url, "static pod list server started");

        ctx.modify::<StaticPodServerStatusSpec>(SINGLETON_ID, |spec| {
            spec.url = url.clone();
        })?;

        let mut shutdown = ctx.shutdown();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // graceful drain releases the port
                        let _ = (&mut server).await;
                        return Ok(());
                    }
                }
                _ = ctx.changed() => {
                    let pods: Vec<Pod> = ctx
                        .list_all::<StaticPodSpec>()?
                        .into_iter()
                        .map(|res| res.spec.pod)
                        .collect();

                    debug!(pods = pods.len(), "pod list refreshed");

                    *cache.lock().expect("pod list cache poisoned") = render_pod_list(&pods);
                    ctx.reset_restart_backoff();
                }
                result = &mut server => {
                    // the already-published list is stale from here on;
                    // restart the controller to rebind and republish
                    return Err(ControllerError::Internal(anyhow::anyhow!(
                        "pod list server exited unexpectedly: {result:?}"
                    )));
                }
            }
        }
    }
}

async fn serve_pod_list(State(cache): State<PodListCache>) -> ([(axum::http::HeaderName, &'static str); 1], Vec<u8>) {
    let body = cache.lock().expect("pod list cache poisoned").clone();

    ([(CONTENT_TYPE, "application/yaml")], body)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PodList<'a> {
    api_version: &'static str,
    kind: &'static str,
    items: &'a [Pod],
}

fn render_pod_list(pods: &[Pod]) -> Vec<u8> {
    let list = PodList {
        api_version: "v1",
        kind: "PodList",
        items: pods,
    };

    // Pod serialization can't fail; fall back to an empty list regardless
    serde_yaml::to_string(&list)
        .unwrap_or_else(|_| "apiVersion: v1\nkind: PodList\nitems: []\n".to_string())
        .into_bytes()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    #[test]
    fn test_pod_list_yaml_shape() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("kube-apiserver".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let body = String::from_utf8(render_pod_list(&[pod])).unwrap();

        assert!(body.contains("apiVersion: v1"));
        assert!(body.contains("kind: PodList"));
        assert!(body.contains("name: kube-apiserver"));
    }

    #[test]
    fn test_empty_pod_list() {
        let body = String::from_utf8(render_pod_list(&[])).unwrap();

        assert!(body.contains("kind: PodList"));
        assert!(body.contains("items: []"));
    }
}
