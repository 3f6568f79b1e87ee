//! Controller catalog.

mod control_plane;
mod endpoint;
mod extra_manifests;
mod kubelet;
mod kubeprism;
mod manifest_apply;
mod manifests;
mod node_apply;
mod node_specs;
mod nodeip;
mod render_configs;
mod render_secrets;
mod static_pod;
mod static_pod_server;
mod transform;

pub use control_plane::{
    admission_control_controller, api_server_config_controller, audit_policy_controller,
    bootstrap_manifests_controller, controller_manager_config_controller,
    extra_manifests_config_controller, proxy_args, scheduler_config_controller,
};
pub use endpoint::{EndpointController, CONTROL_PLANE_ENDPOINTS_ID};
pub use extra_manifests::{manifest_id, ExtraManifestController, NETWORK_STATUS_ID};
pub use kubelet::{kubelet_config_controller, nodename_controller, KubeletConfigController};
pub use kubeprism::{KubePrismConfigController, KubePrismController, KubePrismEndpointsController};
pub use manifest_apply::{sort_objects, ManifestApplyController};
pub use manifests::{parse_manifest_documents, ManifestController};
pub use node_apply::{
    apply_cordoned, apply_node_kv, apply_specs, apply_taints, DefaultNodeClientProvider,
    NodeApplyController, NodeClientProvider,
};
pub use node_specs::{
    should_cordon, NodeAnnotationSpecController, NodeCordonedSpecController,
    NodeLabelSpecController, NodeTaintSpecController,
};
pub use nodeip::{node_ip_config_controller, select_node_ips, NodeIpController, ROUTED_ADDRESSES_ID};
pub use render_configs::RenderConfigsController;
pub use render_secrets::RenderSecretsController;
pub use static_pod::{
    render_api_server, render_controller_manager, render_scheduler, StaticPodController,
};
pub use static_pod_server::StaticPodServerController;
