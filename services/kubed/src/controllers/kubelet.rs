//! Kubelet configuration and node name derivation.

use async_trait::async_trait;
use keel_machine_config::{default_image, dns_service_ips, Component};
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};

use crate::constants::SINGLETON_ID;
use crate::resources::{
    ExtraVolume, KubeletConfigSpec, MachineConfigSpec, NodenameSpec, StaticPodServerStatusSpec,
};

use super::transform::{any_machine, MachineConfigTransform};

/// Derives the node name this machine registers under.
pub type NodenameController = MachineConfigTransform<NodenameSpec>;

/// Build the nodename controller.
pub fn nodename_controller() -> NodenameController {
    MachineConfigTransform::new("k8s.NodenameController", any_machine, |config, spec| {
        let hostname = config
            .machine
            .network
            .hostname
            .clone()
            .unwrap_or_else(|| "localhost".to_string());

        *spec = NodenameSpec {
            // node names are DNS-1123; hostnames may carry uppercase
            nodename: hostname.to_lowercase(),
            skip_node_registration: config.machine.kubelet.skip_node_registration,
        };

        Ok(())
    })
}

/// Derives the kubelet configuration, including the static pod list URL
/// published by the static pod server.
pub struct KubeletConfigController;

#[async_trait]
impl Controller for KubeletConfigController {
    fn name(&self) -> &'static str {
        "k8s.KubeletConfigController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<MachineConfigSpec>(SINGLETON_ID),
            Input::weak_id::<StaticPodServerStatusSpec>(SINGLETON_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<KubeletConfigSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(config) = ctx.get_by_id::<MachineConfigSpec>(SINGLETON_ID)? else {
                ctx.destroy::<KubeletConfigSpec>(SINGLETON_ID)?;
                continue;
            };

            let Some(server_status) = ctx.get_by_id::<StaticPodServerStatusSpec>(SINGLETON_ID)?
            else {
                // kubelet can't start without a manifest source yet
                continue;
            };

            let config = config.spec.config;
            let kubelet = &config.machine.kubelet;

            let cluster_dns = if kubelet.cluster_dns.is_empty() {
                dns_service_ips(&config.cluster.network.service_cidrs())
                    .map_err(|e| ControllerError::Internal(e.into()))?
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect()
            } else {
                kubelet.cluster_dns.clone()
            };

            let spec = KubeletConfigSpec {
                image: kubelet
                    .image
                    .clone()
                    .unwrap_or_else(|| default_image(Component::Kubelet)),
                cluster_dns,
                cluster_domain: config.cluster.network.dns_domain.clone(),
                extra_args: kubelet.extra_args.clone(),
                extra_mounts: kubelet
                    .extra_mounts
                    .iter()
                    .map(|m| ExtraVolume {
                        name: m.name.clone(),
                        host_path: m.host_path.clone(),
                        mount_path: m.mount_path.clone(),
                        read_only: m.readonly,
                    })
                    .collect(),
                skip_node_registration: kubelet.skip_node_registration,
                static_pod_list_url: server_status.spec.url.clone(),
            };

            ctx.modify::<KubeletConfigSpec>(SINGLETON_ID, |slot| *slot = spec)?;
            ctx.reset_restart_backoff();
        }
    }
}

/// Build the kubelet config controller.
pub fn kubelet_config_controller() -> KubeletConfigController {
    KubeletConfigController
}
