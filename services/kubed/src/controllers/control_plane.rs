//! Config-to-desired-state pipeline for the control plane components.
//!
//! Each controller reads the machine configuration and emits exactly one
//! derived config resource; equal inputs produce byte-equal outputs, so
//! the store only bumps versions on real changes.

use anyhow::Context as _;
use keel_machine_config::{
    dns_service_ips, image_version_gte, ArgsBuilder, MachineConfig, MergePolicy, FLANNEL_CNI,
};

use crate::constants::ETCD_CLIENT_PORT;
use crate::resources::{
    APIServerConfigSpec, AdmissionControlConfigSpec, AdmissionPluginSpec, AuditPolicyConfigSpec,
    BootstrapManifestsConfigSpec, ControllerManagerConfigSpec, ExtraManifest,
    ExtraManifestsConfigSpec, ExtraVolume, Resources, SchedulerConfigSpec,
};

use super::transform::{control_plane_only, MachineConfigTransform};

/// Derives the kube-apiserver desired configuration.
pub type ApiServerConfigController = MachineConfigTransform<APIServerConfigSpec>;

/// Build the kube-apiserver config controller.
pub fn api_server_config_controller() -> ApiServerConfigController {
    MachineConfigTransform::new(
        "k8s.ApiServerConfigController",
        control_plane_only,
        |config, spec| {
            let cluster = &config.cluster;

            // skipping node registration also suppresses the advertised address
            let advertised_address = if config.machine.kubelet.skip_node_registration {
                String::new()
            } else {
                "$(POD_IP)".to_string()
            };

            *spec = APIServerConfigSpec {
                image: cluster.api_server.image(),
                cloud_provider: cloud_provider(config),
                control_plane_endpoint: cluster.control_plane.endpoint.clone(),
                etcd_servers: vec![format!("https://localhost:{ETCD_CLIENT_PORT}")],
                local_port: cluster.control_plane.local_port(),
                service_cidrs: cluster.network.service_cidrs(),
                extra_args: cluster.api_server.extra_args.clone(),
                extra_volumes: convert_volumes(&cluster.api_server.extra_volumes),
                environment_variables: cluster.api_server.env.clone(),
                advertised_address,
                resources: convert_resources(&cluster.api_server.resources),
            };

            Ok(())
        },
    )
}

/// Derives the kube-controller-manager desired configuration.
pub type ControllerManagerConfigController = MachineConfigTransform<ControllerManagerConfigSpec>;

/// Build the kube-controller-manager config controller.
pub fn controller_manager_config_controller() -> ControllerManagerConfigController {
    MachineConfigTransform::new(
        "k8s.ControllerManagerConfigController",
        control_plane_only,
        |config, spec| {
            let cluster = &config.cluster;

            *spec = ControllerManagerConfigSpec {
                enabled: !cluster.controller_manager.disabled,
                image: cluster.controller_manager.image(),
                cloud_provider: cloud_provider(config),
                pod_cidrs: cluster.network.pod_cidrs(),
                service_cidrs: cluster.network.service_cidrs(),
                extra_args: cluster.controller_manager.extra_args.clone(),
                extra_volumes: convert_volumes(&cluster.controller_manager.extra_volumes),
                environment_variables: cluster.controller_manager.env.clone(),
                resources: convert_resources(&cluster.controller_manager.resources),
            };

            Ok(())
        },
    )
}

/// Derives the kube-scheduler desired configuration.
pub type SchedulerConfigController = MachineConfigTransform<SchedulerConfigSpec>;

/// Build the kube-scheduler config controller.
pub fn scheduler_config_controller() -> SchedulerConfigController {
    MachineConfigTransform::new(
        "k8s.SchedulerConfigController",
        control_plane_only,
        |config, spec| {
            let cluster = &config.cluster;

            *spec = SchedulerConfigSpec {
                enabled: !cluster.scheduler.disabled,
                image: cluster.scheduler.image(),
                extra_args: cluster.scheduler.extra_args.clone(),
                extra_volumes: convert_volumes(&cluster.scheduler.extra_volumes),
                environment_variables: cluster.scheduler.env.clone(),
                resources: convert_resources(&cluster.scheduler.resources),
                config: cluster.scheduler.config.clone(),
            };

            Ok(())
        },
    )
}

/// Derives the bootstrap manifest parameters.
pub type BootstrapManifestsController = MachineConfigTransform<BootstrapManifestsConfigSpec>;

/// Build the bootstrap manifests config controller.
pub fn bootstrap_manifests_controller() -> BootstrapManifestsController {
    MachineConfigTransform::new(
        "k8s.BootstrapManifestsController",
        control_plane_only,
        |config, spec| {
            let cluster = &config.cluster;

            let service_cidrs = cluster.network.service_cidrs();
            let dns_ips =
                dns_service_ips(&service_cidrs).context("error calculating DNS service IPs")?;

            let mut dns_service_ip = String::new();
            let mut dns_service_ipv6 = String::new();

            for ip in dns_ips {
                if dns_service_ip.is_empty() && ip.is_ipv4() {
                    dns_service_ip = ip.to_string();
                }

                if dns_service_ipv6.is_empty() && ip.is_ipv6() {
                    dns_service_ipv6 = ip.to_string();
                }
            }

            let kube_prism = &config.machine.features.kube_prism;

            let (server, flannel_kube_service_host, flannel_kube_service_port) =
                if kube_prism.enabled {
                    (
                        format!("https://127.0.0.1:{}", kube_prism.port),
                        "127.0.0.1".to_string(),
                        kube_prism.port.to_string(),
                    )
                } else {
                    (
                        cluster.control_plane.endpoint.clone(),
                        String::new(),
                        String::new(),
                    )
                };

            *spec = BootstrapManifestsConfigSpec {
                server,
                cluster_domain: cluster.network.dns_domain.clone(),
                pod_cidrs: cluster.network.pod_cidrs(),
                proxy_enabled: cluster.proxy.enabled(),
                proxy_image: cluster.proxy.image(),
                proxy_args: proxy_args(config)?,
                core_dns_enabled: cluster.core_dns.enabled(),
                core_dns_image: cluster.core_dns.image(),
                dns_service_ip,
                dns_service_ipv6,
                flannel_enabled: cluster.network.cni.name == FLANNEL_CNI,
                flannel_image: keel_machine_config::default_image(
                    keel_machine_config::Component::Flannel,
                ),
                flannel_extra_args: cluster.network.cni.flannel_extra_args.clone(),
                flannel_kube_service_host,
                flannel_kube_service_port,
            };

            Ok(())
        },
    )
}

/// Derives the extra manifest set with fixed priority prefixes.
pub type ExtraManifestsConfigController = MachineConfigTransform<ExtraManifestsConfigSpec>;

/// Build the extra manifests config controller.
pub fn extra_manifests_config_controller() -> ExtraManifestsConfigController {
    MachineConfigTransform::new(
        "k8s.ExtraManifestsConfigController",
        control_plane_only,
        |config, spec| {
            let cluster = &config.cluster;
            let mut manifests = Vec::new();

            for url in &cluster.network.cni.urls {
                manifests.push(ExtraManifest {
                    name: url.clone(),
                    url: url.clone(),
                    // CNI comes up before anything else can schedule
                    priority: "05".to_string(),
                    ..Default::default()
                });
            }

            for url in &cluster.external_cloud_provider.manifests {
                manifests.push(ExtraManifest {
                    name: url.clone(),
                    url: url.clone(),
                    priority: "30".to_string(),
                    ..Default::default()
                });
            }

            for url in &cluster.extra_manifests {
                manifests.push(ExtraManifest {
                    name: url.clone(),
                    url: url.clone(),
                    priority: "99".to_string(),
                    extra_headers: cluster.extra_manifest_headers.clone(),
                    ..Default::default()
                });
            }

            for manifest in &cluster.inline_manifests {
                manifests.push(ExtraManifest {
                    name: manifest.name.clone(),
                    priority: "99".to_string(),
                    inline_manifest: manifest.contents.clone(),
                    ..Default::default()
                });
            }

            *spec = ExtraManifestsConfigSpec {
                extra_manifests: manifests,
            };

            Ok(())
        },
    )
}

/// Derives the admission control configuration.
pub type AdmissionControlController = MachineConfigTransform<AdmissionControlConfigSpec>;

/// Build the admission control config controller.
pub fn admission_control_controller() -> AdmissionControlController {
    MachineConfigTransform::new(
        "k8s.AdmissionControlController",
        control_plane_only,
        |config, spec| {
            *spec = AdmissionControlConfigSpec {
                config: config
                    .cluster
                    .api_server
                    .admission_control
                    .iter()
                    .map(|plugin| AdmissionPluginSpec {
                        name: plugin.name.clone(),
                        configuration: plugin.configuration.clone(),
                    })
                    .collect(),
            };

            Ok(())
        },
    )
}

/// Derives the audit policy configuration.
pub type AuditPolicyController = MachineConfigTransform<AuditPolicyConfigSpec>;

/// Build the audit policy config controller.
pub fn audit_policy_controller() -> AuditPolicyController {
    MachineConfigTransform::new(
        "k8s.AuditPolicyController",
        control_plane_only,
        |config, spec| {
            *spec = AuditPolicyConfigSpec {
                config: config.cluster.api_server.audit_policy.clone(),
            };

            Ok(())
        },
    )
}

fn cloud_provider(config: &MachineConfig) -> String {
    if config.cluster.external_cloud_provider.enabled {
        "external".to_string()
    } else {
        String::new()
    }
}

fn convert_volumes(volumes: &[keel_machine_config::ExtraVolumeConfig]) -> Vec<ExtraVolume> {
    volumes
        .iter()
        .map(|v| ExtraVolume {
            name: v.name.clone(),
            host_path: v.host_path.clone(),
            mount_path: v.mount_path.clone(),
            read_only: v.readonly,
        })
        .collect()
}

fn convert_resources(resources: &keel_machine_config::ResourcesConfig) -> Resources {
    Resources {
        requests: resources.requests.clone(),
        limits: resources.limits.clone(),
    }
}

/// Assemble the kube-proxy arguments.
///
/// The proxy mode defaults by kube-proxy version: `nftables` from 1.31.0,
/// `iptables` before.
pub fn proxy_args(config: &MachineConfig) -> anyhow::Result<Vec<String>> {
    let cluster = &config.cluster;

    let proxy_mode = match &cluster.proxy.mode {
        Some(mode) if !mode.is_empty() => mode.clone(),
        _ => {
            if image_version_gte(&cluster.proxy.image(), (1, 31, 0)) {
                "nftables".to_string()
            } else {
                "iptables".to_string()
            }
        }
    };

    let mut builder = ArgsBuilder::new::<&str, String>([
        ("cluster-cidr", cluster.network.pod_cidrs().join(",")),
        ("hostname-override", "$(NODE_NAME)".to_string()),
        ("kubeconfig", "/etc/kubernetes/kubeconfig".to_string()),
        ("proxy-mode", proxy_mode),
        ("conntrack-max-per-core", "0".to_string()),
    ]);

    builder.policy("kubeconfig", MergePolicy::Denied);
    builder.merge(cluster.proxy.extra_args.clone())?;

    Ok(builder.build())
}
