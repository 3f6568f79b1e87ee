//! Materializes the control plane secrets onto disk.
//!
//! Writes the per-component secrets directories consumed by the static
//! pods via host-path mounts. `SecretsStatus.ready` flips true only after
//! every file of the iteration exists, which is what gates the static pod
//! renderer.

use std::fs;
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use tracing::{debug, info};

use crate::constants::{
    APISERVER_ID, APISERVER_RUN_USER, CONTROLLER_MANAGER_ID, CONTROLLER_MANAGER_RUN_USER,
    KUBERNETES_SECRETS_DIR, SCHEDULER_ID, SCHEDULER_RUN_USER, SINGLETON_ID, STATIC_POD_STATUS_ID,
};
use crate::resources::{
    EtcdSecretsSpec, KubernetesCertsSpec, KubernetesRootSecretsSpec, MachineConfigSpec,
    SecretsStatusSpec,
};

/// SELinux label applied to materialized secrets.
const SECRETS_SELINUX_LABEL: &str = "system_u:object_r:kube_secrets_t:s0";

/// One file to materialize.
struct SecretFile {
    filename: &'static str,
    contents: String,
}

/// One component's secrets directory.
struct ComponentSecrets {
    name: &'static str,
    run_user: u32,
    files: Vec<SecretFile>,
}

/// Materializes per-component secrets directories and emits
/// `SecretsStatus`.
pub struct RenderSecretsController {
    root: PathBuf,
    apply_ownership: bool,
}

impl RenderSecretsController {
    /// Materialize under the well-known secrets root.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(KUBERNETES_SECRETS_DIR),
            apply_ownership: true,
        }
    }

    /// Materialize under a custom root without chown (for tests).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            apply_ownership: false,
        }
    }
}

impl Default for RenderSecretsController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for RenderSecretsController {
    fn name(&self) -> &'static str {
        "k8s.RenderSecretsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<KubernetesRootSecretsSpec>(SINGLETON_ID),
            Input::weak_id::<KubernetesCertsSpec>(SINGLETON_ID),
            Input::weak_id::<EtcdSecretsSpec>(SINGLETON_ID),
            Input::weak_id::<MachineConfigSpec>(SINGLETON_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<SecretsStatusSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(root_secrets) = ctx.get_by_id::<KubernetesRootSecretsSpec>(SINGLETON_ID)?
            else {
                continue;
            };

            let Some(certs) = ctx.get_by_id::<KubernetesCertsSpec>(SINGLETON_ID)? else {
                continue;
            };

            let Some(etcd) = ctx.get_by_id::<EtcdSecretsSpec>(SINGLETON_ID)? else {
                continue;
            };

            let encryption_secret = ctx
                .get_by_id::<MachineConfigSpec>(SINGLETON_ID)?
                .and_then(|c| c.spec.config.cluster.aescbc_encryption_secret.clone())
                .unwrap_or_else(|| root_secrets.spec.aescbc_encryption_secret.clone());

            let layout = secrets_layout(&root_secrets.spec, &certs.spec, &etcd.spec, &encryption_secret);

            for component in &layout {
                self.write_component(component)
                    .with_context(|| format!("error materializing secrets for {}", component.name))
                    .map_err(ControllerError::Internal)?;
            }

            info!(version = %certs.version, "control plane secrets materialized");

            // ready only after every file is on disk
            ctx.modify::<SecretsStatusSpec>(STATIC_POD_STATUS_ID, |spec| {
                spec.ready = true;
                spec.version = certs.version.as_string();
            })?;

            ctx.reset_restart_backoff();
        }
    }
}

impl RenderSecretsController {
    fn write_component(&self, component: &ComponentSecrets) -> anyhow::Result<()> {
        let dir = self.root.join(component.name);

        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        apply_mac_label(&dir);

        for file in &component.files {
            let path = dir.join(file.filename);

            // the previous iteration left the file read-only
            let _ = fs::remove_file(&path);

            fs::write(&path, &file.contents)
                .with_context(|| format!("error writing {:?}", file.filename))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o400))?;
            apply_mac_label(&path);

            if self.apply_ownership {
                chown(&path, Some(component.run_user), Some(component.run_user))
                    .with_context(|| format!("error chowning {:?}", file.filename))?;
            }
        }

        Ok(())
    }
}

/// Best-effort SELinux label; a kernel without SELinux rejects the xattr.
fn apply_mac_label(path: &Path) {
    let Ok(path_c) = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()) else {
        return;
    };

    let attr = c"security.selinux";
    let value = SECRETS_SELINUX_LABEL.as_bytes();

    let rc = unsafe {
        libc::lsetxattr(
            path_c.as_ptr(),
            attr.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };

    if rc != 0 {
        debug!(path = %path.display(), "MAC label not applied");
    }
}

fn secrets_layout(
    root: &KubernetesRootSecretsSpec,
    certs: &KubernetesCertsSpec,
    etcd: &EtcdSecretsSpec,
    encryption_secret: &str,
) -> Vec<ComponentSecrets> {
    vec![
        ComponentSecrets {
            name: APISERVER_ID,
            run_user: APISERVER_RUN_USER,
            files: vec![
                SecretFile {
                    filename: "etcd-client-ca.crt",
                    contents: etcd.ca.crt.clone(),
                },
                SecretFile {
                    filename: "etcd-client.crt",
                    contents: etcd.client.crt.clone(),
                },
                SecretFile {
                    filename: "etcd-client.key",
                    contents: etcd.client.key.clone(),
                },
                SecretFile {
                    filename: "ca.crt",
                    contents: accepted_cas_bundle(root),
                },
                SecretFile {
                    filename: "apiserver.crt",
                    contents: certs.api_server.crt.clone(),
                },
                SecretFile {
                    filename: "apiserver.key",
                    contents: certs.api_server.key.clone(),
                },
                SecretFile {
                    filename: "apiserver-kubelet-client.crt",
                    contents: certs.api_server_kubelet_client.crt.clone(),
                },
                SecretFile {
                    filename: "apiserver-kubelet-client.key",
                    contents: certs.api_server_kubelet_client.key.clone(),
                },
                SecretFile {
                    filename: "service-account.pub",
                    contents: root.service_account.crt.clone(),
                },
                SecretFile {
                    filename: "service-account.key",
                    contents: root.service_account.key.clone(),
                },
                SecretFile {
                    filename: "aggregator-ca.crt",
                    contents: root.aggregator_ca.crt.clone(),
                },
                SecretFile {
                    filename: "front-proxy-client.crt",
                    contents: certs.front_proxy_client.crt.clone(),
                },
                SecretFile {
                    filename: "front-proxy-client.key",
                    contents: certs.front_proxy_client.key.clone(),
                },
                SecretFile {
                    filename: "encryptionconfig.yaml",
                    contents: encryption_config(encryption_secret),
                },
            ],
        },
        ComponentSecrets {
            name: CONTROLLER_MANAGER_ID,
            run_user: CONTROLLER_MANAGER_RUN_USER,
            files: vec![
                SecretFile {
                    filename: "ca.crt",
                    contents: root.ca.crt.clone(),
                },
                SecretFile {
                    filename: "ca.key",
                    contents: root.ca.key.clone(),
                },
                SecretFile {
                    filename: "service-account.key",
                    contents: root.service_account.key.clone(),
                },
                SecretFile {
                    filename: "kubeconfig",
                    contents: certs.controller_manager_kubeconfig.clone(),
                },
            ],
        },
        ComponentSecrets {
            name: SCHEDULER_ID,
            run_user: SCHEDULER_RUN_USER,
            files: vec![SecretFile {
                filename: "kubeconfig",
                contents: certs.scheduler_kubeconfig.clone(),
            }],
        },
    ]
}

/// The issuing CA plus every additionally accepted CA.
fn accepted_cas_bundle(root: &KubernetesRootSecretsSpec) -> String {
    let mut bundle = root.ca.crt.clone();

    for ca in &root.accepted_cas {
        if !bundle.ends_with('\n') && !bundle.is_empty() {
            bundle.push('\n');
        }

        bundle.push_str(ca);
    }

    bundle
}

fn encryption_config(secret: &str) -> String {
    format!(
        r#"apiVersion: apiserver.config.k8s.io/v1
kind: EncryptionConfiguration
resources:
  - resources:
      - secrets
    providers:
      - aescbc:
          keys:
            - name: key1
              secret: {secret}
      - identity: {{}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> (KubernetesRootSecretsSpec, KubernetesCertsSpec, EtcdSecretsSpec) {
        (
            KubernetesRootSecretsSpec {
                ca: crate::resources::PemPair {
                    crt: "ROOT-CA".into(),
                    key: "ROOT-CA-KEY".into(),
                },
                aggregator_ca: crate::resources::PemPair {
                    crt: "AGG-CA".into(),
                    key: String::new(),
                },
                service_account: crate::resources::PemPair {
                    crt: "SA-PUB".into(),
                    key: "SA-KEY".into(),
                },
                accepted_cas: vec!["EXTRA-CA".into()],
                aescbc_encryption_secret: "c2VjcmV0".into(),
            },
            KubernetesCertsSpec {
                api_server: crate::resources::PemPair {
                    crt: "APISERVER-CRT".into(),
                    key: "APISERVER-KEY".into(),
                },
                controller_manager_kubeconfig: "CM-KUBECONFIG".into(),
                scheduler_kubeconfig: "SCHED-KUBECONFIG".into(),
                ..Default::default()
            },
            EtcdSecretsSpec::default(),
        )
    }

    #[test]
    fn test_layout_covers_all_components() {
        let (root, certs, etcd) = sample_inputs();
        let layout = secrets_layout(&root, &certs, &etcd, "c2VjcmV0");

        let names: Vec<_> = layout.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec!["kube-apiserver", "kube-controller-manager", "kube-scheduler"]
        );

        let apiserver = &layout[0];
        let filenames: Vec<_> = apiserver.files.iter().map(|f| f.filename).collect();
        assert!(filenames.contains(&"apiserver.crt"));
        assert!(filenames.contains(&"service-account.pub"));
        assert!(filenames.contains(&"encryptionconfig.yaml"));
    }

    #[test]
    fn test_ca_bundle_includes_accepted_cas() {
        let (root, _, _) = sample_inputs();

        let bundle = accepted_cas_bundle(&root);
        assert!(bundle.starts_with("ROOT-CA"));
        assert!(bundle.contains("EXTRA-CA"));
    }

    #[test]
    fn test_encryption_config_is_valid_yaml() {
        let doc: serde_yaml::Value = serde_yaml::from_str(&encryption_config("c2VjcmV0")).unwrap();

        assert_eq!(doc["kind"], "EncryptionConfiguration");
        assert_eq!(
            doc["resources"][0]["providers"][0]["aescbc"]["keys"][0]["secret"],
            "c2VjcmV0"
        );
    }
}
