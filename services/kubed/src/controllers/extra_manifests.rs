//! Fetches extra manifests (URL or inline) into `Manifest` resources.

use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use tracing::{debug, info};

use crate::constants::SINGLETON_ID;
use crate::resources::{
    ExtraManifest, ExtraManifestsConfigSpec, ManifestSpec, NetworkStatusSpec,
};

use super::manifests::parse_manifest_documents;

/// Id of the network readiness status resource.
pub const NETWORK_STATUS_ID: &str = "status";

/// Materializes the extra manifest set.
pub struct ExtraManifestController {
    client: reqwest::Client,
    download_dir: PathBuf,
}

impl ExtraManifestController {
    /// Build the controller with a fresh download client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            download_dir: std::env::temp_dir().join(format!("keel-manifests-{}", std::process::id())),
        }
    }
}

impl Default for ExtraManifestController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for ExtraManifestController {
    fn name(&self) -> &'static str {
        "k8s.ExtraManifestController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<ExtraManifestsConfigSpec>(SINGLETON_ID),
            Input::weak_id::<NetworkStatusSpec>(NETWORK_STATUS_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<ManifestSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(config) = ctx.get_by_id::<ExtraManifestsConfigSpec>(SINGLETON_ID)? else {
                ctx.start_tracking_outputs();
                ctx.cleanup_outputs::<ManifestSpec>()?;
                continue;
            };

            let needs_network = config
                .spec
                .extra_manifests
                .iter()
                .any(|manifest| !manifest.url.is_empty());

            if needs_network {
                let ready = ctx
                    .get_by_id::<NetworkStatusSpec>(NETWORK_STATUS_ID)?
                    .is_some_and(|status| {
                        status.spec.address_ready && status.spec.connectivity_ready
                    });

                if !ready {
                    debug!("network not ready, postponing extra manifest downloads");
                    continue;
                }
            }

            ctx.start_tracking_outputs();

            for manifest in &config.spec.extra_manifests {
                let contents = if manifest.url.is_empty() {
                    manifest.inline_manifest.clone()
                } else {
                    self.download(manifest)
                        .await
                        .with_context(|| format!("error fetching {:?}", manifest.url))
                        .map_err(ControllerError::Internal)?
                };

                let objects =
                    parse_manifest_documents(&contents).map_err(ControllerError::Internal)?;

                let id = manifest_id(manifest);

                ctx.modify::<ManifestSpec>(&id, |spec| {
                    spec.objects = objects;
                })?;
            }

            ctx.cleanup_outputs::<ManifestSpec>()?;
            ctx.reset_restart_backoff();
        }
    }
}

impl ExtraManifestController {
    /// Download into the scratch directory, then read the file back.
    async fn download(&self, manifest: &ExtraManifest) -> anyhow::Result<String> {
        let mut request = self.client.get(&manifest.url);

        for (header, value) in &manifest.extra_headers {
            request = request.header(header, value);
        }

        let response = request.send().await?.error_for_status()?;
        let body = response.bytes().await?;

        tokio::fs::create_dir_all(&self.download_dir).await?;

        let path = self.download_dir.join(sanitize_filename(&manifest.name));
        tokio::fs::write(&path, &body).await?;

        info!(url = %manifest.url, path = %path.display(), "extra manifest downloaded");

        Ok(tokio::fs::read_to_string(&path).await?)
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Priority-prefixed manifest ids sort CNI → cloud provider → user.
pub fn manifest_id(manifest: &ExtraManifest) -> String {
    format!("{}-{}", manifest.priority, manifest.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_ids_sort_by_priority() {
        let cni = ExtraManifest {
            name: "https://cni.example.com/install.yaml".into(),
            priority: "05".into(),
            ..Default::default()
        };
        let cloud = ExtraManifest {
            name: "https://cloud.example.com/ccm.yaml".into(),
            priority: "30".into(),
            ..Default::default()
        };
        let user = ExtraManifest {
            name: "app".into(),
            priority: "99".into(),
            ..Default::default()
        };

        let mut ids = vec![manifest_id(&user), manifest_id(&cni), manifest_id(&cloud)];
        ids.sort();

        assert!(ids[0].starts_with("05-"));
        assert!(ids[1].starts_with("30-"));
        assert!(ids[2].starts_with("99-"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(
            sanitize_filename("https://example.com/a.yaml"),
            "https___example.com_a.yaml"
        );
    }
}
