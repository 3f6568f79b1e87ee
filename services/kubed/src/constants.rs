//! Well-known paths, ports, annotation keys and identities.

use std::time::Duration;

/// Singleton id used by machine-scoped resources.
pub const SINGLETON_ID: &str = "machine";

/// Static pod id of the kube-apiserver.
pub const APISERVER_ID: &str = "kube-apiserver";

/// Static pod id of the kube-controller-manager.
pub const CONTROLLER_MANAGER_ID: &str = "kube-controller-manager";

/// Static pod id of the kube-scheduler.
pub const SCHEDULER_ID: &str = "kube-scheduler";

/// Id of the secrets/config status resources consumed by the renderer.
pub const STATIC_POD_STATUS_ID: &str = "static-pods";

/// Root of the per-component control plane secrets directories.
pub const KUBERNETES_SECRETS_DIR: &str = "/system/secrets/kubernetes";

/// Root of the per-component control plane config directories.
pub const KUBERNETES_CONFIG_DIR: &str = "/system/config/kubernetes";

/// In-pod mount path of the kube-apiserver secrets.
pub const APISERVER_SECRETS_MOUNT: &str = "/system/secrets/kubernetes/kube-apiserver";

/// In-pod mount path of the kube-apiserver config files.
pub const APISERVER_CONFIG_MOUNT: &str = "/system/config/kubernetes/kube-apiserver";

/// In-pod mount path of the controller-manager secrets.
pub const CONTROLLER_MANAGER_SECRETS_MOUNT: &str =
    "/system/secrets/kubernetes/kube-controller-manager";

/// In-pod mount path of the scheduler secrets.
pub const SCHEDULER_SECRETS_MOUNT: &str = "/system/secrets/kubernetes/kube-scheduler";

/// In-pod mount path of the scheduler config files.
pub const SCHEDULER_CONFIG_MOUNT: &str = "/system/config/kubernetes/kube-scheduler";

/// kube-apiserver audit log directory.
pub const AUDIT_LOG_DIR: &str = "/var/log/audit/kube";

/// Kubeconfig written by the kubelet after bootstrap.
pub const KUBELET_KUBECONFIG: &str = "/etc/kubernetes/kubelet.kubeconfig";

/// UID/GID the kube-apiserver runs as.
pub const APISERVER_RUN_USER: u32 = 65534;

/// UID/GID the kube-controller-manager runs as.
pub const CONTROLLER_MANAGER_RUN_USER: u32 = 65535;

/// UID/GID the kube-scheduler runs as.
pub const SCHEDULER_RUN_USER: u32 = 65536;

/// Port etcd listens on for client traffic.
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// Annotation stamping the secrets version onto rendered static pods.
pub const ANNOTATION_SECRETS_VERSION: &str = "keel.dev/secrets-version";

/// Annotation stamping the config file version onto rendered static pods.
pub const ANNOTATION_CONFIG_FILE_VERSION: &str = "keel.dev/config-file-version";

/// Annotation stamping the component config version onto rendered static pods.
pub const ANNOTATION_CONFIG_VERSION: &str = "keel.dev/config-version";

/// Node annotation listing labels owned by the node applier.
pub const ANNOTATION_OWNED_LABELS: &str = "keel.dev/owned-labels";

/// Node annotation listing annotations owned by the node applier.
pub const ANNOTATION_OWNED_ANNOTATIONS: &str = "keel.dev/owned-annotations";

/// Node annotation listing taints owned by the node applier.
pub const ANNOTATION_OWNED_TAINTS: &str = "keel.dev/owned-taints";

/// Node annotation marking nodes cordoned by the node applier.
pub const ANNOTATION_CORDONED_KEY: &str = "keel.dev/cordoned";

/// Value of the cordoned annotation.
pub const ANNOTATION_CORDONED_VALUE: &str = "true";

/// Field manager used for created Kubernetes objects.
pub const FIELD_MANAGER: &str = "keel";

/// etcd key of the cluster-wide manifest apply mutex.
pub const MANIFEST_APPLY_MUTEX_KEY: &str = "keel:manifest-apply-lock";

/// Timeout for a node update retry loop.
pub const NODE_UPDATE_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Step between node update retries.
pub const NODE_UPDATE_RETRY_STEP: Duration = Duration::from_millis(100);

/// KubePrism upstream dial timeout.
pub const KUBEPRISM_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// KubePrism TCP keep-alive period.
pub const KUBEPRISM_KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// KubePrism TCP user timeout.
pub const KUBEPRISM_TCP_USER_TIMEOUT: Duration = Duration::from_secs(30);

/// KubePrism upstream health check interval.
pub const KUBEPRISM_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(20);

/// KubePrism upstream health check timeout.
pub const KUBEPRISM_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Interval of the KubePrism status poll.
pub const KUBEPRISM_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
