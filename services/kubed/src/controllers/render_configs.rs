//! Materializes the control plane configuration files onto disk.
//!
//! The peer of the secrets materializer: admission control, audit policy
//! and scheduler configuration serialized as YAML under the component
//! config directories, tracked through `ConfigStatus`.

use std::fs;
use std::os::unix::fs::{chown, PermissionsExt};
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use serde::Serialize;
use tracing::info;

use crate::constants::{
    APISERVER_ID, APISERVER_RUN_USER, KUBERNETES_CONFIG_DIR, SCHEDULER_ID, SCHEDULER_RUN_USER,
    SINGLETON_ID, STATIC_POD_STATUS_ID,
};
use crate::resources::{
    AdmissionControlConfigSpec, AuditPolicyConfigSpec, ConfigStatusSpec, SchedulerConfigSpec,
};

/// Materializes component config files and emits `ConfigStatus`.
pub struct RenderConfigsController {
    root: PathBuf,
    apply_ownership: bool,
}

impl RenderConfigsController {
    /// Materialize under the well-known config root.
    pub fn new() -> Self {
        Self {
            root: PathBuf::from(KUBERNETES_CONFIG_DIR),
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

impl Default for RenderConfigsController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for RenderConfigsController {
    fn name(&self) -> &'static str {
        "k8s.RenderConfigsController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<AdmissionControlConfigSpec>(SINGLETON_ID),
            Input::weak_id::<AuditPolicyConfigSpec>(SINGLETON_ID),
            Input::weak_id::<SchedulerConfigSpec>(SINGLETON_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<ConfigStatusSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(admission) = ctx.get_by_id::<AdmissionControlConfigSpec>(SINGLETON_ID)?
            else {
                continue;
            };

            let Some(audit) = ctx.get_by_id::<AuditPolicyConfigSpec>(SINGLETON_ID)? else {
                continue;
            };

            let Some(scheduler) = ctx.get_by_id::<SchedulerConfigSpec>(SINGLETON_ID)? else {
                continue;
            };

            self.write_file(
                APISERVER_ID,
                "admission-control-config.yaml",
                &admission_control_config(&admission.spec),
                APISERVER_RUN_USER,
            )
            .map_err(ControllerError::Internal)?;

            self.write_file(
                APISERVER_ID,
                "auditpolicy.yaml",
                &audit_policy_config(&audit.spec)?,
                APISERVER_RUN_USER,
            )
            .map_err(ControllerError::Internal)?;

            self.write_file(
                SCHEDULER_ID,
                "scheduler-config.yaml",
                &scheduler_config(&scheduler.spec)?,
                SCHEDULER_RUN_USER,
            )
            .map_err(ControllerError::Internal)?;

            // version token covering all three inputs
            let version = format!(
                "{}-{}-{}",
                admission.version, audit.version, scheduler.version
            );

            info!(version = %version, "control plane configs materialized");

            ctx.modify::<ConfigStatusSpec>(STATIC_POD_STATUS_ID, |spec| {
                spec.ready = true;
                spec.version = version.clone();
            })?;

            ctx.reset_restart_backoff();
        }
    }
}

impl RenderConfigsController {
    fn write_file(
        &self,
        component: &str,
        filename: &str,
        contents: &str,
        run_user: u32,
    ) -> anyhow::Result<()> {
        let dir = self.root.join(component);

        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;

        let path = dir.join(filename);

        // the previous iteration left the file read-only
        let _ = fs::remove_file(&path);

        fs::write(&path, contents).with_context(|| format!("error writing {filename:?}"))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o400))?;

        if self.apply_ownership {
            chown(&path, Some(run_user), Some(run_user))
                .with_context(|| format!("error chowning {filename:?}"))?;
        }

        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionConfigurationDoc {
    api_version: &'static str,
    kind: &'static str,
    plugins: Vec<AdmissionPluginDoc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdmissionPluginDoc {
    name: String,
    configuration: serde_yaml::Value,
}

fn admission_control_config(spec: &AdmissionControlConfigSpec) -> String {
    let doc = AdmissionConfigurationDoc {
        api_version: "apiserver.config.k8s.io/v1",
        kind: "AdmissionConfiguration",
        plugins: spec
            .config
            .iter()
            .map(|plugin| AdmissionPluginDoc {
                name: plugin.name.clone(),
                configuration: plugin.configuration.clone(),
            })
            .collect(),
    };

    serde_yaml::to_string(&doc).unwrap_or_default()
}

fn audit_policy_config(spec: &AuditPolicyConfigSpec) -> Result<String, ControllerError> {
    let policy = if spec.config.is_null() {
        // a policy file must exist; default to logging request metadata
        serde_yaml::from_str(
            r#"
apiVersion: audit.k8s.io/v1
kind: Policy
rules:
  - level: Metadata
"#,
        )
        .map_err(|e| ControllerError::Internal(e.into()))?
    } else {
        spec.config.clone()
    };

    serde_yaml::to_string(&policy).map_err(|e| ControllerError::Internal(e.into()))
}

fn scheduler_config(spec: &SchedulerConfigSpec) -> Result<String, ControllerError> {
    let config = if spec.config.is_null() {
        serde_yaml::from_str(
            r#"
apiVersion: kubescheduler.config.k8s.io/v1
kind: KubeSchedulerConfiguration
"#,
        )
        .map_err(|e| ControllerError::Internal(e.into()))?
    } else {
        spec.config.clone()
    };

    serde_yaml::to_string(&config).map_err(|e| ControllerError::Internal(e.into()))
}

#[cfg(test)]
mod tests {
    use crate::resources::AdmissionPluginSpec;

    use super::*;

    #[test]
    fn test_admission_config_document() {
        let spec = AdmissionControlConfigSpec {
            config: vec![AdmissionPluginSpec {
                name: "PodSecurity".into(),
                configuration: serde_yaml::from_str("defaults:\n  enforce: baseline").unwrap(),
            }],
        };

        let doc: serde_yaml::Value =
            serde_yaml::from_str(&admission_control_config(&spec)).unwrap();

        assert_eq!(doc["kind"], "AdmissionConfiguration");
        assert_eq!(doc["plugins"][0]["name"], "PodSecurity");
        assert_eq!(doc["plugins"][0]["configuration"]["defaults"]["enforce"], "baseline");
    }

    #[test]
    fn test_default_audit_policy() {
        let rendered = audit_policy_config(&AuditPolicyConfigSpec::default()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        assert_eq!(doc["kind"], "Policy");
        assert_eq!(doc["rules"][0]["level"], "Metadata");
    }

    #[test]
    fn test_default_scheduler_config() {
        let rendered = scheduler_config(&SchedulerConfigSpec::default()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();

        assert_eq!(doc["kind"], "KubeSchedulerConfiguration");
    }
}
