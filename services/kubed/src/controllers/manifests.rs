//! Renders the bootstrap manifests into `Manifest` resources.

use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};

use crate::constants::SINGLETON_ID;
use crate::resources::{BootstrapManifestsConfigSpec, ManifestSpec};
use crate::templates;

/// Decode a (possibly multi-document) YAML manifest into JSON objects.
///
/// Empty documents are dropped.
pub fn parse_manifest_documents(yaml: &str) -> anyhow::Result<Vec<serde_json::Value>> {
    use serde::Deserialize as _;

    let mut objects = Vec::new();

    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;

        if value.is_null() {
            continue;
        }

        objects.push(serde_json::to_value(&value)?);
    }

    Ok(objects)
}

/// Renders the built-in bootstrap manifests from the bootstrap config.
pub struct ManifestController;

#[async_trait]
impl Controller for ManifestController {
    fn name(&self) -> &'static str {
        "k8s.ManifestController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![Input::weak_id::<BootstrapManifestsConfigSpec>(SINGLETON_ID)]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<ManifestSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            ctx.start_tracking_outputs();

            if let Some(config) = ctx.get_by_id::<BootstrapManifestsConfigSpec>(SINGLETON_ID)? {
                let config = config.spec;

                let mut rendered: Vec<(&str, String)> =
                    vec![("01-csr-bootstrap-rbac", templates::csr_bootstrap_rbac())];

                if config.flannel_enabled {
                    rendered.push(("05-flannel", templates::flannel(&config)));
                }

                if config.proxy_enabled {
                    rendered.push(("10-kube-proxy", templates::kube_proxy(&config)));
                }

                if config.core_dns_enabled {
                    rendered.push(("11-core-dns", templates::coredns(&config)));
                    rendered.push(("11-kube-dns-service", templates::kube_dns_service(&config)));
                }

                for (name, yaml) in rendered {
                    let objects = parse_manifest_documents(&yaml)
                        .map_err(ControllerError::Internal)?;

                    ctx.modify::<ManifestSpec>(name, |spec| {
                        spec.objects = objects;
                    })?;
                }
            }

            // drop manifests disabled by the config change
            ctx.cleanup_outputs::<ManifestSpec>()?;
            ctx.reset_restart_backoff();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multi_document() {
        let objects = parse_manifest_documents(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: b\n",
        )
        .unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1]["metadata"]["name"], "b");
    }

    #[test]
    fn test_parse_drops_empty_documents() {
        let objects = parse_manifest_documents("---\n---\napiVersion: v1\nkind: Namespace\n").unwrap();

        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn test_parse_invalid_yaml_fails() {
        assert!(parse_manifest_documents("kind: [unclosed").is_err());
    }
}
