//! Resource catalog of the Kubernetes lifecycle subsystem.
//!
//! Spec types for every resource flowing through the store, grouped by
//! namespace. Inputs (`config`, `secrets`, `cluster`, `network`,
//! `runtime` namespaces) are produced outside this service; everything in
//! the `k8s` namespace is derived by the controllers in this crate.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::Pod;
use keel_machine_config::MachineConfig;
use keel_resource::ResourceSpec;
use serde::{Deserialize, Serialize};

/// Namespace of externally-fed machine configuration resources.
pub const NS_CONFIG: &str = "config";

/// Namespace of PKI input resources.
pub const NS_SECRETS: &str = "secrets";

/// Namespace of cluster membership resources.
pub const NS_CLUSTER: &str = "cluster";

/// Namespace of host network status resources.
pub const NS_NETWORK: &str = "network";

/// Namespace of node service status resources.
pub const NS_RUNTIME: &str = "runtime";

/// Namespace of derived Kubernetes resources.
pub const NS_K8S: &str = "k8s";

macro_rules! resource_spec {
    ($spec:ty, $type_name:literal, $namespace:expr) => {
        impl ResourceSpec for $spec {
            const TYPE: &'static str = $type_name;
            const NAMESPACE: &'static str = $namespace;
        }
    };
}

// ---------------------------------------------------------------------------
// config namespace (external inputs)
// ---------------------------------------------------------------------------

/// The machine configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineConfigSpec {
    /// Parsed document.
    pub config: MachineConfig,
}

resource_spec!(MachineConfigSpec, "MachineConfig", NS_CONFIG);

/// Machine lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStage {
    /// Stage not reported yet.
    #[default]
    Unknown,

    /// Machine is booting.
    Booting,

    /// Machine is installing.
    Installing,

    /// Machine is upgrading.
    Upgrading,

    /// Machine is resetting.
    Resetting,

    /// Machine is up.
    Running,

    /// Machine is rebooting.
    Rebooting,

    /// Machine is shutting down.
    ShuttingDown,

    /// Machine is in maintenance mode.
    Maintenance,
}

/// Current machine lifecycle stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineStageSpec {
    /// The stage.
    pub stage: MachineStage,
}

resource_spec!(MachineStageSpec, "MachineStage", NS_CONFIG);

// ---------------------------------------------------------------------------
// secrets namespace (external inputs)
// ---------------------------------------------------------------------------

/// A PEM-encoded certificate/key pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PemPair {
    /// Certificate, PEM.
    pub crt: String,

    /// Private key, PEM. Empty for CA-only distributions.
    pub key: String,
}

/// Root Kubernetes PKI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubernetesRootSecretsSpec {
    /// Issuing CA.
    pub ca: PemPair,

    /// Aggregator (front proxy) CA.
    pub aggregator_ca: PemPair,

    /// Service account signing keypair (public in `crt`, private in `key`).
    pub service_account: PemPair,

    /// Additional accepted CA certificates, PEM.
    pub accepted_cas: Vec<String>,

    /// Secretbox encryption secret for etcd encryption at rest.
    pub aescbc_encryption_secret: String,
}

resource_spec!(KubernetesRootSecretsSpec, "KubernetesRootSecrets", NS_SECRETS);

/// Dynamic per-component Kubernetes certificates and kubeconfigs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubernetesCertsSpec {
    /// kube-apiserver serving certificate.
    pub api_server: PemPair,

    /// kube-apiserver client certificate for kubelet connections.
    pub api_server_kubelet_client: PemPair,

    /// Front proxy client certificate.
    pub front_proxy_client: PemPair,

    /// Admin kubeconfig pointing at the cluster endpoint.
    pub admin_kubeconfig: String,

    /// Admin kubeconfig pointing at the local API server.
    pub localhost_admin_kubeconfig: String,

    /// kube-controller-manager kubeconfig.
    pub controller_manager_kubeconfig: String,

    /// kube-scheduler kubeconfig.
    pub scheduler_kubeconfig: String,
}

resource_spec!(KubernetesCertsSpec, "KubernetesCerts", NS_SECRETS);

/// etcd client certificates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EtcdSecretsSpec {
    /// etcd CA.
    pub ca: PemPair,

    /// etcd client certificate.
    pub client: PemPair,
}

resource_spec!(EtcdSecretsSpec, "EtcdSecrets", NS_SECRETS);

// ---------------------------------------------------------------------------
// cluster namespace (external inputs)
// ---------------------------------------------------------------------------

/// Control plane detail of a cluster member.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemberControlPlane {
    /// Port the member's API server listens on.
    pub api_server_port: u16,
}

/// A discovered cluster member.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Member hostname.
    pub hostname: String,

    /// Routable addresses of the member.
    pub addresses: Vec<IpAddr>,

    /// Present when the member advertises a control plane.
    pub control_plane: Option<MemberControlPlane>,
}

resource_spec!(MemberSpec, "Member", NS_CLUSTER);

// ---------------------------------------------------------------------------
// network namespace (external inputs)
// ---------------------------------------------------------------------------

/// Routed addresses of this host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeAddressSpec {
    /// Addresses in route preference order.
    pub addresses: Vec<IpAddr>,
}

resource_spec!(NodeAddressSpec, "NodeAddress", NS_NETWORK);

/// Host network readiness.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkStatusSpec {
    /// An address is assigned.
    pub address_ready: bool,

    /// External connectivity works.
    pub connectivity_ready: bool,
}

resource_spec!(NetworkStatusSpec, "NetworkStatus", NS_NETWORK);

// ---------------------------------------------------------------------------
// runtime namespace (external inputs)
// ---------------------------------------------------------------------------

/// Health of a node-local system service (e.g. etcd).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceHealthSpec {
    /// Service is running.
    pub running: bool,

    /// Service reports healthy.
    pub healthy: bool,
}

resource_spec!(ServiceHealthSpec, "ServiceHealth", NS_RUNTIME);

// ---------------------------------------------------------------------------
// k8s namespace (derived)
// ---------------------------------------------------------------------------

/// A host-path volume carried into a rendered static pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtraVolume {
    /// Volume name.
    pub name: String,

    /// Host path.
    pub host_path: String,

    /// Mount path.
    pub mount_path: String,

    /// Read-only mount.
    pub read_only: bool,
}

/// Resource requests/limits carried into a rendered static pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Requests by resource name.
    pub requests: BTreeMap<String, String>,

    /// Limits by resource name.
    pub limits: BTreeMap<String, String>,
}

/// Desired kube-apiserver configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct APIServerConfigSpec {
    /// Image reference.
    pub image: String,

    /// Cloud provider flag: empty or `external`.
    pub cloud_provider: String,

    /// Control plane endpoint URL.
    pub control_plane_endpoint: String,

    /// etcd client endpoints.
    pub etcd_servers: Vec<String>,

    /// Local secure port.
    pub local_port: u16,

    /// Service CIDRs.
    pub service_cidrs: Vec<String>,

    /// Extra arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host-path volumes.
    pub extra_volumes: Vec<ExtraVolume>,

    /// Extra environment variables.
    pub environment_variables: BTreeMap<String, String>,

    /// Advertised address: `$(POD_IP)` or empty when node registration is
    /// skipped.
    pub advertised_address: String,

    /// Resource requests/limits.
    pub resources: Resources,
}

resource_spec!(APIServerConfigSpec, "APIServerConfig", NS_K8S);

/// Desired kube-controller-manager configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ControllerManagerConfigSpec {
    /// Component deployed at all.
    pub enabled: bool,

    /// Image reference.
    pub image: String,

    /// Cloud provider flag: empty or `external`.
    pub cloud_provider: String,

    /// Pod CIDRs.
    pub pod_cidrs: Vec<String>,

    /// Service CIDRs.
    pub service_cidrs: Vec<String>,

    /// Extra arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host-path volumes.
    pub extra_volumes: Vec<ExtraVolume>,

    /// Extra environment variables.
    pub environment_variables: BTreeMap<String, String>,

    /// Resource requests/limits.
    pub resources: Resources,
}

resource_spec!(ControllerManagerConfigSpec, "ControllerManagerConfig", NS_K8S);

/// Desired kube-scheduler configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerConfigSpec {
    /// Component deployed at all.
    pub enabled: bool,

    /// Image reference.
    pub image: String,

    /// Extra arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host-path volumes.
    pub extra_volumes: Vec<ExtraVolume>,

    /// Extra environment variables.
    pub environment_variables: BTreeMap<String, String>,

    /// Resource requests/limits.
    pub resources: Resources,

    /// Scheduler configuration document.
    pub config: serde_yaml::Value,
}

resource_spec!(SchedulerConfigSpec, "SchedulerConfig", NS_K8S);

/// Desired bootstrap manifest parameters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BootstrapManifestsConfigSpec {
    /// API server URL baked into bootstrap kubeconfigs.
    pub server: String,

    /// Cluster DNS domain.
    pub cluster_domain: String,

    /// Pod CIDRs.
    pub pod_cidrs: Vec<String>,

    /// kube-proxy deployed.
    pub proxy_enabled: bool,

    /// kube-proxy image.
    pub proxy_image: String,

    /// kube-proxy arguments.
    pub proxy_args: Vec<String>,

    /// CoreDNS deployed.
    pub core_dns_enabled: bool,

    /// CoreDNS image.
    pub core_dns_image: String,

    /// IPv4 DNS service address.
    pub dns_service_ip: String,

    /// IPv6 DNS service address.
    pub dns_service_ipv6: String,

    /// Flannel deployed.
    pub flannel_enabled: bool,

    /// Flannel image.
    pub flannel_image: String,

    /// Extra arguments for the flannel daemonset.
    pub flannel_extra_args: Vec<String>,

    /// Flannel kube service host; set only when KubePrism is enabled.
    pub flannel_kube_service_host: String,

    /// Flannel kube service port; set only when KubePrism is enabled.
    pub flannel_kube_service_port: String,
}

resource_spec!(BootstrapManifestsConfigSpec, "BootstrapManifestsConfig", NS_K8S);

/// A single extra manifest source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtraManifest {
    /// Manifest name.
    pub name: String,

    /// Download URL; empty for inline manifests.
    pub url: String,

    /// Apply priority prefix; lower sorts (and applies) first.
    pub priority: String,

    /// Extra request headers for the download.
    pub extra_headers: BTreeMap<String, String>,

    /// Inline manifest contents; empty for URL manifests.
    pub inline_manifest: String,
}

/// Desired extra manifest set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtraManifestsConfigSpec {
    /// Manifests in declaration order.
    pub extra_manifests: Vec<ExtraManifest>,
}

resource_spec!(ExtraManifestsConfigSpec, "ExtraManifestsConfig", NS_K8S);

/// One admission plugin with its configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdmissionPluginSpec {
    /// Plugin name.
    pub name: String,

    /// Plugin configuration.
    pub configuration: serde_yaml::Value,
}

/// Desired admission control configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AdmissionControlConfigSpec {
    /// Configured plugins.
    pub config: Vec<AdmissionPluginSpec>,
}

resource_spec!(AdmissionControlConfigSpec, "AdmissionControlConfig", NS_K8S);

/// Desired audit policy configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AuditPolicyConfigSpec {
    /// Audit policy document.
    pub config: serde_yaml::Value,
}

resource_spec!(AuditPolicyConfigSpec, "AuditPolicyConfig", NS_K8S);

/// Desired kubelet configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubeletConfigSpec {
    /// Kubelet image.
    pub image: String,

    /// Cluster DNS servers.
    pub cluster_dns: Vec<String>,

    /// Cluster DNS domain.
    pub cluster_domain: String,

    /// Extra kubelet arguments.
    pub extra_args: BTreeMap<String, String>,

    /// Extra host mounts.
    pub extra_mounts: Vec<ExtraVolume>,

    /// Skip registering with the API server.
    pub skip_node_registration: bool,

    /// URL the kubelet pulls its static pod list from.
    pub static_pod_list_url: String,
}

resource_spec!(KubeletConfigSpec, "KubeletConfig", NS_K8S);

/// The name this machine registers under.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodenameSpec {
    /// Node name.
    pub nodename: String,

    /// Node registration is skipped entirely.
    pub skip_node_registration: bool,
}

resource_spec!(NodenameSpec, "Nodename", NS_K8S);

/// Subnet constraints for node IP selection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeIPConfigSpec {
    /// Subnets a node IP must fall in; `!`-prefixed entries exclude.
    pub valid_subnets: Vec<String>,

    /// Subnets a node IP must not fall in.
    pub exclude_subnets: Vec<String>,
}

resource_spec!(NodeIPConfigSpec, "NodeIPConfig", NS_K8S);

/// Selected node addresses.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeIPSpec {
    /// At most one IPv4 and one IPv6 address.
    pub addresses: Vec<IpAddr>,
}

resource_spec!(NodeIPSpec, "NodeIP", NS_K8S);

/// A label declared for this machine's Node object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeLabelSpecSpec {
    /// Label key.
    pub key: String,

    /// Label value.
    pub value: String,
}

resource_spec!(NodeLabelSpecSpec, "NodeLabelSpec", NS_K8S);

/// An annotation declared for this machine's Node object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeAnnotationSpecSpec {
    /// Annotation key.
    pub key: String,

    /// Annotation value.
    pub value: String,
}

resource_spec!(NodeAnnotationSpecSpec, "NodeAnnotationSpec", NS_K8S);

/// A taint declared for this machine's Node object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeTaintSpecSpec {
    /// Taint key.
    pub key: String,

    /// Taint value.
    pub value: String,

    /// Taint effect.
    pub effect: String,
}

resource_spec!(NodeTaintSpecSpec, "NodeTaintSpec", NS_K8S);

/// Presence of any instance cordons this machine's Node object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeCordonedSpec {}

resource_spec!(NodeCordonedSpec, "NodeCordonedSpec", NS_K8S);

/// Observed state of this machine's Node object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeStatusSpec {
    /// Node name.
    pub nodename: String,

    /// Node condition Ready.
    pub node_ready: bool,

    /// Node is unschedulable.
    pub unschedulable: bool,

    /// Current labels.
    pub labels: BTreeMap<String, String>,

    /// Current annotations.
    pub annotations: BTreeMap<String, String>,
}

resource_spec!(NodeStatusSpec, "NodeStatus", NS_K8S);

/// A rendered static pod.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaticPodSpec {
    /// The pod document.
    pub pod: Pod,
}

resource_spec!(StaticPodSpec, "StaticPod", NS_K8S);

/// Published static pod list server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StaticPodServerStatusSpec {
    /// URL serving the pod list.
    pub url: String,
}

resource_spec!(StaticPodServerStatusSpec, "StaticPodServerStatus", NS_K8S);

/// Control plane secrets materialization status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecretsStatusSpec {
    /// All files of the current iteration are on disk.
    pub ready: bool,

    /// Version token of the materialized secrets.
    pub version: String,
}

resource_spec!(SecretsStatusSpec, "SecretsStatus", NS_K8S);

/// Control plane config file materialization status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigStatusSpec {
    /// All files of the current iteration are on disk.
    pub ready: bool,

    /// Version token of the materialized configs.
    pub version: String,
}

resource_spec!(ConfigStatusSpec, "ConfigStatus", NS_K8S);

/// A bootstrap manifest: a list of Kubernetes objects to apply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestSpec {
    /// Decoded objects in document order.
    pub objects: Vec<serde_json::Value>,
}

resource_spec!(ManifestSpec, "Manifest", NS_K8S);

/// Manifest application status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ManifestStatusSpec {
    /// Ids of the manifests applied in the last iteration.
    pub manifests_applied: Vec<String>,
}

resource_spec!(ManifestStatusSpec, "ManifestStatus", NS_K8S);

/// One API server endpoint candidate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubePrismEndpoint {
    /// Host name or address.
    pub host: String,

    /// Port.
    pub port: u16,
}

/// All known API server endpoints.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubePrismEndpointsSpec {
    /// Endpoints in preference order.
    pub endpoints: Vec<KubePrismEndpoint>,
}

resource_spec!(KubePrismEndpointsSpec, "KubePrismEndpoints", NS_K8S);

/// Desired KubePrism load balancer configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubePrismConfigSpec {
    /// Bind host (loopback).
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Upstream endpoints.
    pub endpoints: Vec<KubePrismEndpoint>,
}

resource_spec!(KubePrismConfigSpec, "KubePrismConfig", NS_K8S);

/// Live KubePrism load balancer status.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct KubePrismStatusesSpec {
    /// Bind host:port.
    pub host: String,

    /// Any upstream is healthy.
    pub healthy: bool,
}

resource_spec!(KubePrismStatusesSpec, "KubePrismStatuses", NS_K8S);

/// Control plane API server addresses visible in the cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// Deduplicated, sorted addresses.
    pub addresses: Vec<IpAddr>,
}

resource_spec!(EndpointSpec, "Endpoint", NS_K8S);
