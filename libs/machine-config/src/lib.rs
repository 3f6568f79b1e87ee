//! Machine configuration document model.
//!
//! The machine configuration is the single declarative input of the node:
//! a YAML document with a `machine` section (role, kubelet, network
//! devices, features) and a `cluster` section (control plane endpoint,
//! networks, control plane component configuration, manifests).
//!
//! This library provides the serde model plus the derivation helpers the
//! controllers share: service-CIDR math, kube-proxy argument assembly and
//! component image defaults.

mod args;
mod images;
mod net;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use args::{ArgsBuilder, ArgsError, MergePolicy};
pub use images::{
    default_image, image_version_gte, version_from_image_ref, Component,
    DEFAULT_KUBERNETES_VERSION,
};
pub use net::{dns_service_ips, nth_ip_in_cidr, Cidr};

/// Configuration document errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Document failed to parse.
    #[error("error parsing machine config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Cluster endpoint is not a valid URL.
    #[error("invalid control plane endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        /// Configured endpoint.
        endpoint: String,
        /// Parse failure.
        reason: String,
    },

    /// Subnet failed to parse.
    #[error("invalid subnet {0:?}")]
    InvalidSubnet(String),
}

/// Machine role within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineType {
    /// Runs the Kubernetes control plane.
    ControlPlane,

    /// Runs workloads only.
    #[default]
    Worker,
}

impl MachineType {
    /// True for control plane machines.
    pub fn is_control_plane(self) -> bool {
        matches!(self, Self::ControlPlane)
    }
}

/// The top-level machine configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineConfig {
    /// Node-local configuration.
    pub machine: MachineSection,

    /// Cluster-wide configuration.
    pub cluster: ClusterSection,
}

impl MachineConfig {
    /// Parse a YAML document.
    pub fn from_yaml(doc: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(doc)?)
    }

    /// True when this machine hosts the control plane.
    pub fn is_control_plane(&self) -> bool {
        self.machine.machine_type.is_control_plane()
    }

    /// The cluster endpoint as host and port (scheme default applies).
    pub fn endpoint_host_port(&self) -> Result<(String, u16), ConfigError> {
        let endpoint = &self.cluster.control_plane.endpoint;
        let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;

        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: "missing host".into(),
            })?
            .to_string();

        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: "unknown port".into(),
            })?;

        Ok((host, port))
    }

    /// Every VIP configured on any device, top-level and per-VLAN.
    pub fn configured_vips(&self) -> Vec<String> {
        let mut vips = Vec::new();

        for device in &self.machine.network.interfaces {
            if let Some(vip) = &device.vip {
                vips.push(vip.ip.clone());
            }

            for vlan in &device.vlans {
                if let Some(vip) = &vlan.vip {
                    vips.push(vip.ip.clone());
                }
            }
        }

        vips
    }
}

/// The `machine` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineSection {
    /// Machine role.
    #[serde(rename = "type")]
    pub machine_type: MachineType,

    /// Kubelet configuration.
    pub kubelet: KubeletSection,

    /// Host network configuration.
    pub network: MachineNetwork,

    /// Feature toggles.
    pub features: Features,

    /// Labels to apply to this machine's Node object.
    pub node_labels: BTreeMap<String, String>,

    /// Annotations to apply to this machine's Node object.
    pub node_annotations: BTreeMap<String, String>,

    /// Taints to apply to this machine's Node object.
    pub node_taints: Vec<NodeTaint>,
}

/// A declared node taint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeTaint {
    /// Taint key.
    pub key: String,

    /// Taint value.
    pub value: String,

    /// Taint effect (`NoSchedule`, `PreferNoSchedule`, `NoExecute`).
    pub effect: String,
}

/// The `machine.kubelet` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubeletSection {
    /// Kubelet image override.
    pub image: Option<String>,

    /// Cluster DNS server override.
    #[serde(rename = "clusterDNS")]
    pub cluster_dns: Vec<String>,

    /// Extra kubelet command line arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host mounts for the kubelet container.
    pub extra_mounts: Vec<ExtraVolumeConfig>,

    /// Skip registering the node with the API server.
    pub skip_node_registration: bool,

    /// Node IP selection configuration.
    #[serde(rename = "nodeIP")]
    pub node_ip: NodeIpSection,
}

/// The `machine.kubelet.nodeIP` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NodeIpSection {
    /// Subnets the node IP must (or with a `!` prefix, must not) fall in.
    pub valid_subnets: Vec<String>,
}

/// The `machine.network` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MachineNetwork {
    /// Static hostname override.
    pub hostname: Option<String>,

    /// Network devices.
    pub interfaces: Vec<Device>,
}

/// A network device declaration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Device {
    /// Interface name.
    pub interface: String,

    /// Shared virtual IP on this device.
    pub vip: Option<VipConfig>,

    /// VLAN sub-interfaces.
    pub vlans: Vec<Vlan>,
}

/// A VLAN sub-interface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Vlan {
    /// VLAN id.
    pub vlan_id: u16,

    /// Shared virtual IP on this VLAN.
    pub vip: Option<VipConfig>,
}

/// A shared virtual IP declaration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VipConfig {
    /// The shared address.
    pub ip: String,
}

/// The `machine.features` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Features {
    /// On-node API server load balancer.
    pub kube_prism: KubePrismFeature,
}

/// KubePrism feature configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubePrismFeature {
    /// Whether the load balancer runs.
    pub enabled: bool,

    /// Loopback port to bind.
    pub port: u16,
}

/// Default KubePrism loopback port.
pub const DEFAULT_KUBEPRISM_PORT: u16 = 7445;

impl Default for KubePrismFeature {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_KUBEPRISM_PORT,
        }
    }
}

/// The `cluster` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterSection {
    /// Cluster name.
    pub cluster_name: String,

    /// Control plane endpoint settings.
    pub control_plane: ControlPlaneSection,

    /// Cluster networking.
    pub network: ClusterNetwork,

    /// kube-apiserver settings.
    pub api_server: ApiServerSection,

    /// kube-controller-manager settings.
    pub controller_manager: ComponentSection,

    /// kube-scheduler settings.
    pub scheduler: SchedulerSection,

    /// kube-proxy settings.
    pub proxy: ProxySection,

    /// CoreDNS settings.
    #[serde(rename = "coreDNS")]
    pub core_dns: CoreDnsSection,

    /// External cloud provider settings.
    pub external_cloud_provider: ExternalCloudProviderSection,

    /// URLs of extra manifests to fetch and apply.
    pub extra_manifests: Vec<String>,

    /// Extra request headers for the manifest downloads.
    pub extra_manifest_headers: BTreeMap<String, String>,

    /// Manifests declared inline in the configuration.
    pub inline_manifests: Vec<InlineManifest>,

    /// Allow workloads on control plane nodes (drops the default taint).
    pub allow_scheduling_on_control_planes: bool,

    /// Override of the etcd encryption-at-rest secret.
    pub aescbc_encryption_secret: Option<String>,
}

/// The `cluster.controlPlane` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControlPlaneSection {
    /// Cluster endpoint URL, e.g. `https://cluster.example.com:6443`.
    pub endpoint: String,

    /// Port the local API server binds.
    #[serde(rename = "localAPIServerPort")]
    pub local_api_server_port: Option<u16>,
}

/// Default local API server port.
pub const DEFAULT_LOCAL_API_SERVER_PORT: u16 = 6443;

impl ControlPlaneSection {
    /// The local API server port, with the default applied.
    pub fn local_port(&self) -> u16 {
        self.local_api_server_port
            .unwrap_or(DEFAULT_LOCAL_API_SERVER_PORT)
    }
}

/// The `cluster.network` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterNetwork {
    /// Cluster DNS domain.
    pub dns_domain: String,

    /// Pod subnets.
    pub pod_subnets: Vec<String>,

    /// Service subnets.
    pub service_subnets: Vec<String>,

    /// CNI selection.
    pub cni: CniSection,
}

/// Default cluster DNS domain.
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

/// Default pod subnet.
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";

/// Default service subnet.
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";

impl Default for ClusterNetwork {
    fn default() -> Self {
        Self {
            dns_domain: DEFAULT_DNS_DOMAIN.to_string(),
            pod_subnets: vec![DEFAULT_POD_SUBNET.to_string()],
            service_subnets: vec![DEFAULT_SERVICE_SUBNET.to_string()],
            cni: CniSection::default(),
        }
    }
}

impl ClusterNetwork {
    /// Pod subnets with the default applied.
    pub fn pod_cidrs(&self) -> Vec<String> {
        if self.pod_subnets.is_empty() {
            vec![DEFAULT_POD_SUBNET.to_string()]
        } else {
            self.pod_subnets.clone()
        }
    }

    /// Service subnets with the default applied.
    pub fn service_cidrs(&self) -> Vec<String> {
        if self.service_subnets.is_empty() {
            vec![DEFAULT_SERVICE_SUBNET.to_string()]
        } else {
            self.service_subnets.clone()
        }
    }
}

/// Built-in flannel CNI name.
pub const FLANNEL_CNI: &str = "flannel";

/// CNI name for externally-managed CNI.
pub const NONE_CNI: &str = "none";

/// The `cluster.network.cni` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CniSection {
    /// CNI name (`flannel`, `custom`, `none`).
    pub name: String,

    /// Manifest URLs for a custom CNI.
    pub urls: Vec<String>,

    /// Extra arguments for the built-in flannel daemonset.
    pub flannel_extra_args: Vec<String>,
}

impl Default for CniSection {
    fn default() -> Self {
        Self {
            name: FLANNEL_CNI.to_string(),
            urls: Vec::new(),
            flannel_extra_args: Vec::new(),
        }
    }
}

/// A host-path volume declared for a control plane component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtraVolumeConfig {
    /// Volume name.
    pub name: String,

    /// Host path.
    pub host_path: String,

    /// Mount path inside the container.
    pub mount_path: String,

    /// Read-only mount.
    pub readonly: bool,
}

/// Resource requests and limits for a control plane component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourcesConfig {
    /// Requests by resource name (`cpu`, `memory`).
    pub requests: BTreeMap<String, String>,

    /// Limits by resource name.
    pub limits: BTreeMap<String, String>,
}

/// An admission plugin declaration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdmissionPluginConfig {
    /// Plugin name.
    pub name: String,

    /// Plugin configuration document.
    pub configuration: serde_yaml::Value,
}

/// The `cluster.apiServer` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiServerSection {
    /// Image override.
    pub image: Option<String>,

    /// Extra command line arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host-path volumes.
    pub extra_volumes: Vec<ExtraVolumeConfig>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Resource requests/limits.
    pub resources: ResourcesConfig,

    /// Admission plugin configuration.
    pub admission_control: Vec<AdmissionPluginConfig>,

    /// Audit policy document.
    pub audit_policy: serde_yaml::Value,
}

impl ApiServerSection {
    /// Image with the default applied.
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| default_image(Component::ApiServer))
    }
}

/// A generic control plane component section (controller-manager).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ComponentSection {
    /// Disable the component entirely.
    pub disabled: bool,

    /// Image override.
    pub image: Option<String>,

    /// Extra command line arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host-path volumes.
    pub extra_volumes: Vec<ExtraVolumeConfig>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Resource requests/limits.
    pub resources: ResourcesConfig,
}

impl ComponentSection {
    /// Controller-manager image with the default applied.
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| default_image(Component::ControllerManager))
    }
}

/// The `cluster.scheduler` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerSection {
    /// Disable the component entirely.
    pub disabled: bool,

    /// Image override.
    pub image: Option<String>,

    /// Extra command line arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host-path volumes.
    pub extra_volumes: Vec<ExtraVolumeConfig>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Resource requests/limits.
    pub resources: ResourcesConfig,

    /// Scheduler configuration document.
    pub config: serde_yaml::Value,
}

impl SchedulerSection {
    /// Scheduler image with the default applied.
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| default_image(Component::Scheduler))
    }
}

/// The `cluster.proxy` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxySection {
    /// Whether kube-proxy is deployed.
    pub disabled: bool,

    /// Image override.
    pub image: Option<String>,

    /// Proxy mode override.
    pub mode: Option<String>,

    /// Extra command line arguments.
    pub extra_args: BTreeMap<String, String>,
}

impl ProxySection {
    /// Whether kube-proxy is deployed.
    pub fn enabled(&self) -> bool {
        !self.disabled
    }

    /// Image with the default applied.
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| default_image(Component::Proxy))
    }
}

/// The `cluster.coreDNS` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreDnsSection {
    /// Whether CoreDNS is deployed.
    pub disabled: bool,

    /// Image override.
    pub image: Option<String>,
}

impl CoreDnsSection {
    /// Whether CoreDNS is deployed.
    pub fn enabled(&self) -> bool {
        !self.disabled
    }

    /// Image with the default applied.
    pub fn image(&self) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| default_image(Component::CoreDns))
    }
}

/// The `cluster.externalCloudProvider` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExternalCloudProviderSection {
    /// Whether an external cloud provider is in use.
    pub enabled: bool,

    /// Manifests deployed for the provider.
    pub manifests: Vec<String>,
}

/// A manifest declared inline in the configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InlineManifest {
    /// Manifest name.
    pub name: String,

    /// Manifest YAML contents.
    pub contents: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
machine:
  type: controlplane
  network:
    hostname: cp-1
cluster:
  controlPlane:
    endpoint: https://foo:6443
"#;

    #[test]
    fn test_parse_minimal() {
        let config = MachineConfig::from_yaml(MINIMAL).unwrap();

        assert!(config.is_control_plane());
        assert_eq!(
            config.machine.network.hostname.as_deref(),
            Some("cp-1")
        );
        assert_eq!(
            config.cluster.network.service_cidrs(),
            vec!["10.96.0.0/12".to_string()]
        );
        assert!(config.machine.features.kube_prism.enabled);
        assert_eq!(config.machine.features.kube_prism.port, 7445);
    }

    #[test]
    fn test_endpoint_host_port_default_scheme_port() {
        let mut config = MachineConfig::from_yaml(MINIMAL).unwrap();

        let (host, port) = config.endpoint_host_port().unwrap();
        assert_eq!(host, "foo");
        assert_eq!(port, 6443);

        config.cluster.control_plane.endpoint = "https://example.com".into();
        let (host, port) = config.endpoint_host_port().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_configured_vips_cover_vlans() {
        let doc = r#"
machine:
  type: controlplane
  network:
    interfaces:
      - interface: eth0
        vip:
          ip: 172.20.0.10
        vlans:
          - vlanId: 100
            vip:
              ip: 172.21.0.10
cluster:
  controlPlane:
    endpoint: https://foo:6443
"#;

        let config = MachineConfig::from_yaml(doc).unwrap();
        assert_eq!(config.configured_vips(), vec!["172.20.0.10", "172.21.0.10"]);
    }
}
