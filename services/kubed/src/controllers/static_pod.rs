//! Renders the control plane static pods from the desired-state configs.
//!
//! The rendered pods carry the secrets/config version annotations so the
//! kubelet restarts them whenever the materialized files rotate.

use std::collections::BTreeMap;

use anyhow::Context as _;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, Pod,
    PodSecurityContext, PodSpec, Probe, SeccompProfile, SecurityContext, Volume, VolumeMount,
    HostPathVolumeSource,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_machine_config::{version_from_image_ref, ArgsBuilder, MergePolicy};
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};

use crate::constants::{
    ANNOTATION_CONFIG_FILE_VERSION, ANNOTATION_CONFIG_VERSION, ANNOTATION_SECRETS_VERSION,
    APISERVER_CONFIG_MOUNT, APISERVER_ID, APISERVER_RUN_USER, APISERVER_SECRETS_MOUNT,
    AUDIT_LOG_DIR, CONTROLLER_MANAGER_ID, CONTROLLER_MANAGER_RUN_USER,
    CONTROLLER_MANAGER_SECRETS_MOUNT, SCHEDULER_CONFIG_MOUNT, SCHEDULER_ID, SCHEDULER_RUN_USER,
    SCHEDULER_SECRETS_MOUNT, SINGLETON_ID, STATIC_POD_STATUS_ID,
};
use crate::resources::{
    APIServerConfigSpec, ConfigStatusSpec, ControllerManagerConfigSpec, ExtraVolume, Resources,
    SchedulerConfigSpec, SecretsStatusSpec, ServiceHealthSpec, StaticPodSpec,
};

/// Pod priority of the control plane, mirroring Kubernetes'
/// `SystemCriticalPriority`.
const SYSTEM_CRITICAL_PRIORITY: i32 = 2_000_000_000;

/// Percentage of the memory limit handed to the Go GC as GOMEMLIMIT.
const GO_GC_MEM_LIMIT_PERCENTAGE: i64 = 95;

/// Renders one `StaticPod` per enabled control plane component.
pub struct StaticPodController;

#[async_trait]
impl Controller for StaticPodController {
    fn name(&self) -> &'static str {
        "k8s.StaticPodController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<APIServerConfigSpec>(SINGLETON_ID),
            Input::weak_id::<ControllerManagerConfigSpec>(SINGLETON_ID),
            Input::weak_id::<SchedulerConfigSpec>(SINGLETON_ID),
            Input::weak_id::<SecretsStatusSpec>(STATIC_POD_STATUS_ID),
            Input::weak_id::<ConfigStatusSpec>(STATIC_POD_STATUS_ID),
            Input::weak_id::<ServiceHealthSpec>("etcd"),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::shared::<StaticPodSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            // kube-apiserver talks to the local etcd; wait for it
            let Some(etcd) = ctx.get_by_id::<ServiceHealthSpec>("etcd")? else {
                self.teardown_all(ctx)?;
                continue;
            };

            if !etcd.spec.healthy {
                continue;
            }

            let Some(secrets_status) = ctx.get_by_id::<SecretsStatusSpec>(STATIC_POD_STATUS_ID)?
            else {
                self.teardown_all(ctx)?;
                continue;
            };

            let Some(config_status) = ctx.get_by_id::<ConfigStatusSpec>(STATIC_POD_STATUS_ID)?
            else {
                self.teardown_all(ctx)?;
                continue;
            };

            let secrets_version = secrets_status.spec.version.clone();
            let config_file_version = config_status.spec.version.clone();

            ctx.start_tracking_outputs();

            if let Some(config) = ctx.get_by_id::<APIServerConfigSpec>(SINGLETON_ID)? {
                let pod = render_api_server(
                    &config.spec,
                    &secrets_version,
                    &config_file_version,
                    &config.version.as_string(),
                )
                .context("error rendering kube-apiserver")
                .map_err(ControllerError::Internal)?;

                ctx.modify::<StaticPodSpec>(APISERVER_ID, |spec| spec.pod = pod)?;
            }

            if let Some(config) = ctx.get_by_id::<ControllerManagerConfigSpec>(SINGLETON_ID)? {
                if config.spec.enabled {
                    let pod = render_controller_manager(
                        &config.spec,
                        &secrets_version,
                        &config.version.as_string(),
                    )
                    .context("error rendering kube-controller-manager")
                    .map_err(ControllerError::Internal)?;

                    ctx.modify::<StaticPodSpec>(CONTROLLER_MANAGER_ID, |spec| spec.pod = pod)?;
                }
            }

            if let Some(config) = ctx.get_by_id::<SchedulerConfigSpec>(SINGLETON_ID)? {
                if config.spec.enabled {
                    let pod = render_scheduler(
                        &config.spec,
                        &secrets_version,
                        &config.version.as_string(),
                    )
                    .context("error rendering kube-scheduler")
                    .map_err(ControllerError::Internal)?;

                    ctx.modify::<StaticPodSpec>(SCHEDULER_ID, |spec| spec.pod = pod)?;
                }
            }

            ctx.cleanup_outputs::<StaticPodSpec>()?;
            ctx.reset_restart_backoff();
        }
    }
}

impl StaticPodController {
    fn teardown_all(&self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        for pod in ctx.list_all::<StaticPodSpec>()? {
            if pod.owner.as_deref() == Some(self.name()) {
                ctx.destroy_md(&pod.metadata)?;
            }
        }

        Ok(())
    }
}

fn pod_metadata(
    id: &str,
    image: &str,
    annotations: BTreeMap<String, String>,
) -> ObjectMeta {
    let version = version_from_image_ref(image)
        .map(|(major, minor, patch)| format!("{major}.{minor}.{patch}"))
        .unwrap_or_else(|| "unknown".to_string());

    ObjectMeta {
        name: Some(id.to_string()),
        namespace: Some("kube-system".to_string()),
        annotations: Some(annotations),
        labels: Some(BTreeMap::from([
            ("tier".to_string(), "control-plane".to_string()),
            ("k8s-app".to_string(), id.to_string()),
            ("component".to_string(), id.to_string()),
            ("app.kubernetes.io/name".to_string(), id.to_string()),
            ("app.kubernetes.io/version".to_string(), version),
            (
                "app.kubernetes.io/component".to_string(),
                "control-plane".to_string(),
            ),
            (
                "app.kubernetes.io/managed-by".to_string(),
                "keel".to_string(),
            ),
        ])),
        ..Default::default()
    }
}

fn volume_mounts(extra: &[ExtraVolume]) -> Vec<VolumeMount> {
    extra
        .iter()
        .map(|vol| VolumeMount {
            name: vol.name.clone(),
            mount_path: vol.mount_path.clone(),
            read_only: Some(vol.read_only),
            ..Default::default()
        })
        .collect()
}

fn volumes(extra: &[ExtraVolume]) -> Vec<Volume> {
    extra
        .iter()
        .map(|vol| Volume {
            name: vol.name.clone(),
            host_path: Some(HostPathVolumeSource {
                path: vol.host_path.clone(),
                type_: None,
            }),
            ..Default::default()
        })
        .collect()
}

fn host_path_mount(name: &str, path: &str, read_only: bool) -> (VolumeMount, Volume) {
    (
        VolumeMount {
            name: name.to_string(),
            mount_path: path.to_string(),
            read_only: Some(read_only),
            ..Default::default()
        },
        Volume {
            name: name.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                type_: None,
            }),
            ..Default::default()
        },
    )
}

/// Environment variables sorted by name, `$` escaped so Kubernetes doesn't
/// expand variable references in user values.
fn env_vars(environment: &BTreeMap<String, String>) -> Vec<EnvVar> {
    environment
        .iter()
        .map(|(key, value)| EnvVar {
            name: key.clone(),
            value: Some(value.replace('$', "$$")),
            ..Default::default()
        })
        .collect()
}

fn pod_ip_env() -> EnvVar {
    EnvVar {
        name: "POD_IP".to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: "status.podIP".to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Bytes of a Kubernetes resource quantity; binary and decimal suffixes.
fn quantity_bytes(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();

    let (number, multiplier): (&str, i64) = if let Some(n) = quantity.strip_suffix("Ki") {
        (n, 1 << 10)
    } else if let Some(n) = quantity.strip_suffix("Mi") {
        (n, 1 << 20)
    } else if let Some(n) = quantity.strip_suffix("Gi") {
        (n, 1 << 30)
    } else if let Some(n) = quantity.strip_suffix("Ti") {
        (n, 1 << 40)
    } else if let Some(n) = quantity.strip_suffix('k') {
        (n, 1_000)
    } else if let Some(n) = quantity.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = quantity.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = quantity.strip_suffix('T') {
        (n, 1_000_000_000_000)
    } else {
        (quantity, 1)
    };

    let number: i64 = number.parse().ok()?;

    Some(number * multiplier)
}

struct PodResources {
    requests: BTreeMap<String, Quantity>,
    limits: BTreeMap<String, Quantity>,
}

/// Resource requirements with component defaults; user values validated
/// enough to fail the iteration instead of producing a broken pod.
fn pod_resources(
    config: &Resources,
    default_cpu: &str,
    default_memory: &str,
) -> anyhow::Result<PodResources> {
    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(default_cpu.to_string())),
        ("memory".to_string(), Quantity(default_memory.to_string())),
    ]);

    for (name, value) in &config.requests {
        if name == "memory" && quantity_bytes(value).is_none() {
            anyhow::bail!("error parsing memory request {value:?}");
        }

        requests.insert(name.clone(), Quantity(value.clone()));
    }

    let mut limits = BTreeMap::new();

    for (name, value) in &config.limits {
        if name == "memory" && quantity_bytes(value).is_none() {
            anyhow::bail!("error parsing memory limit {value:?}");
        }

        limits.insert(name.clone(), Quantity(value.clone()));
    }

    Ok(PodResources { requests, limits })
}

/// GOMEMLIMIT pinned below the container memory limit keeps the Go GC from
/// OOM-killing the component.
fn go_gc_env(resources: &PodResources) -> Option<EnvVar> {
    let limit = resources.limits.get("memory")?;
    let bytes = quantity_bytes(&limit.0)?;

    Some(EnvVar {
        name: "GOMEMLIMIT".to_string(),
        value: Some((bytes * GO_GC_MEM_LIMIT_PERCENTAGE / 100).to_string()),
        ..Default::default()
    })
}

fn container_security_context(add_net_bind: bool) -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            // kube-apiserver carries cap_net_bind_service=+ep; the setcap
            // flag makes this a hard dependency regardless of port
            add: add_net_bind.then(|| vec!["NET_BIND_SERVICE".to_string()]),
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

fn pod_security_context(run_user: u32) -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(run_user as i64),
        run_as_group: Some(run_user as i64),
        ..Default::default()
    }
}

fn https_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            host: Some("localhost".to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_pod(
    id: &str,
    image: &str,
    annotations: BTreeMap<String, String>,
    command: Vec<String>,
    env: Vec<EnvVar>,
    mounts: Vec<VolumeMount>,
    vols: Vec<Volume>,
    resources: PodResources,
    run_user: u32,
    add_net_bind: bool,
    probes: ContainerProbes,
) -> Pod {
    Pod {
        metadata: pod_metadata(id, image, annotations),
        spec: Some(PodSpec {
            priority: Some(SYSTEM_CRITICAL_PRIORITY),
            priority_class_name: Some("system-cluster-critical".to_string()),
            host_network: Some(true),
            security_context: Some(pod_security_context(run_user)),
            containers: vec![Container {
                name: id.to_string(),
                image: Some(image.to_string()),
                command: Some(command),
                env: Some(env),
                volume_mounts: Some(mounts),
                resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                    requests: Some(resources.requests),
                    limits: if resources.limits.is_empty() {
                        None
                    } else {
                        Some(resources.limits)
                    },
                    ..Default::default()
                }),
                security_context: Some(container_security_context(add_net_bind)),
                startup_probe: probes.startup,
                liveness_probe: probes.liveness,
                readiness_probe: probes.readiness,
                ..Default::default()
            }],
            volumes: Some(vols),
            ..Default::default()
        }),
        status: None,
    }
}

#[derive(Default)]
struct ContainerProbes {
    startup: Option<Probe>,
    liveness: Option<Probe>,
    readiness: Option<Probe>,
}

/// Render the kube-apiserver static pod.
pub fn render_api_server(
    cfg: &APIServerConfigSpec,
    secrets_version: &str,
    config_file_version: &str,
    config_version: &str,
) -> anyhow::Result<Pod> {
    let mut builder = ArgsBuilder::new::<&str, String>([
        (
            "admission-control-config-file",
            format!("{APISERVER_CONFIG_MOUNT}/admission-control-config.yaml"),
        ),
        ("allow-privileged", "true".to_string()),
        // anonymous requests would land in system:unauthenticated
        ("anonymous-auth", "false".to_string()),
        ("api-audiences", cfg.control_plane_endpoint.clone()),
        ("authorization-mode", "Node,RBAC".to_string()),
        ("bind-address", "0.0.0.0".to_string()),
        (
            "client-ca-file",
            format!("{APISERVER_SECRETS_MOUNT}/ca.crt"),
        ),
        (
            "enable-admission-plugins",
            "NodeRestriction".to_string(),
        ),
        (
            "requestheader-client-ca-file",
            format!("{APISERVER_SECRETS_MOUNT}/aggregator-ca.crt"),
        ),
        (
            "requestheader-allowed-names",
            "front-proxy-client".to_string(),
        ),
        (
            "requestheader-extra-headers-prefix",
            "X-Remote-Extra-".to_string(),
        ),
        ("requestheader-group-headers", "X-Remote-Group".to_string()),
        (
            "requestheader-username-headers",
            "X-Remote-User".to_string(),
        ),
        (
            "proxy-client-cert-file",
            format!("{APISERVER_SECRETS_MOUNT}/front-proxy-client.crt"),
        ),
        (
            "proxy-client-key-file",
            format!("{APISERVER_SECRETS_MOUNT}/front-proxy-client.key"),
        ),
        ("enable-bootstrap-token-auth", "true".to_string()),
        // TLS 1.2 for interoperability: this is the externally-facing port
        ("tls-min-version", "VersionTLS12".to_string()),
        (
            "encryption-provider-config",
            format!("{APISERVER_SECRETS_MOUNT}/encryptionconfig.yaml"),
        ),
        (
            "audit-policy-file",
            format!("{APISERVER_CONFIG_MOUNT}/auditpolicy.yaml"),
        ),
        (
            "audit-log-path",
            format!("{AUDIT_LOG_DIR}/kube-apiserver.log"),
        ),
        ("audit-log-maxage", "30".to_string()),
        ("audit-log-maxbackup", "10".to_string()),
        ("audit-log-maxsize", "100".to_string()),
        ("profiling", "false".to_string()),
        (
            "etcd-cafile",
            format!("{APISERVER_SECRETS_MOUNT}/etcd-client-ca.crt"),
        ),
        (
            "etcd-certfile",
            format!("{APISERVER_SECRETS_MOUNT}/etcd-client.crt"),
        ),
        (
            "etcd-keyfile",
            format!("{APISERVER_SECRETS_MOUNT}/etcd-client.key"),
        ),
        ("etcd-servers", cfg.etcd_servers.join(",")),
        (
            "kubelet-client-certificate",
            format!("{APISERVER_SECRETS_MOUNT}/apiserver-kubelet-client.crt"),
        ),
        (
            "kubelet-client-key",
            format!("{APISERVER_SECRETS_MOUNT}/apiserver-kubelet-client.key"),
        ),
        ("secure-port", cfg.local_port.to_string()),
        ("service-account-issuer", cfg.control_plane_endpoint.clone()),
        (
            "service-account-key-file",
            format!("{APISERVER_SECRETS_MOUNT}/service-account.pub"),
        ),
        (
            "service-account-signing-key-file",
            format!("{APISERVER_SECRETS_MOUNT}/service-account.key"),
        ),
        ("service-cluster-ip-range", cfg.service_cidrs.join(",")),
        (
            "tls-cert-file",
            format!("{APISERVER_SECRETS_MOUNT}/apiserver.crt"),
        ),
        (
            "tls-private-key-file",
            format!("{APISERVER_SECRETS_MOUNT}/apiserver.key"),
        ),
        (
            "kubelet-preferred-address-types",
            "InternalIP,ExternalIP,Hostname".to_string(),
        ),
    ]);

    if !cfg.advertised_address.is_empty() {
        builder.set("advertise-address", cfg.advertised_address.clone());
    }

    if !cfg.cloud_provider.is_empty() {
        builder.set("cloud-provider", cfg.cloud_provider.clone());
    }

    for key in ["enable-admission-plugins", "feature-gates", "authorization-mode", "tls-cipher-suites"] {
        builder.policy(key, MergePolicy::Additive);
    }

    for key in [
        "etcd-servers",
        "client-ca-file",
        "requestheader-client-ca-file",
        "proxy-client-cert-file",
        "proxy-client-key-file",
        "encryption-provider-config",
        "etcd-cafile",
        "etcd-certfile",
        "etcd-keyfile",
        "kubelet-client-certificate",
        "kubelet-client-key",
        "service-account-key-file",
        "service-account-signing-key-file",
        "tls-cert-file",
        "tls-private-key-file",
    ] {
        builder.policy(key, MergePolicy::Denied);
    }

    builder.merge(cfg.extra_args.clone())?;

    let mut command = vec!["/usr/local/bin/kube-apiserver".to_string()];
    command.extend(builder.build());

    let resources = pod_resources(&cfg.resources, "200m", "512Mi")?;

    let mut env = vec![pod_ip_env()];
    env.extend(env_vars(&cfg.environment_variables));
    if let Some(go_gc) = go_gc_env(&resources) {
        env.push(go_gc);
    }

    let (secrets_mount, secrets_vol) = host_path_mount("secrets", APISERVER_SECRETS_MOUNT, true);
    let (config_mount, config_vol) = host_path_mount("config", APISERVER_CONFIG_MOUNT, true);
    let (audit_mount, audit_vol) = host_path_mount("audit", AUDIT_LOG_DIR, false);

    let mut mounts = vec![secrets_mount, config_mount, audit_mount];
    mounts.extend(volume_mounts(&cfg.extra_volumes));

    let mut vols = vec![secrets_vol, config_vol, audit_vol];
    vols.extend(volumes(&cfg.extra_volumes));

    Ok(build_pod(
        APISERVER_ID,
        &cfg.image,
        BTreeMap::from([
            (
                ANNOTATION_SECRETS_VERSION.to_string(),
                secrets_version.to_string(),
            ),
            (
                ANNOTATION_CONFIG_FILE_VERSION.to_string(),
                config_file_version.to_string(),
            ),
            (
                ANNOTATION_CONFIG_VERSION.to_string(),
                config_version.to_string(),
            ),
        ]),
        command,
        env,
        mounts,
        vols,
        resources,
        APISERVER_RUN_USER,
        true,
        ContainerProbes::default(),
    ))
}

/// Render the kube-controller-manager static pod.
pub fn render_controller_manager(
    cfg: &ControllerManagerConfigSpec,
    secrets_version: &str,
    config_version: &str,
) -> anyhow::Result<Pod> {
    let mut builder = ArgsBuilder::new::<&str, String>([
        ("allocate-node-cidrs", "true".to_string()),
        ("bind-address", "127.0.0.1".to_string()),
        ("cluster-cidr", cfg.pod_cidrs.join(",")),
        ("service-cluster-ip-range", cfg.service_cidrs.join(",")),
        (
            "cluster-signing-cert-file",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/ca.crt"),
        ),
        (
            "cluster-signing-key-file",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/ca.key"),
        ),
        ("controllers", "*,tokencleaner".to_string()),
        ("configure-cloud-routes", "false".to_string()),
        (
            "kubeconfig",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/kubeconfig"),
        ),
        (
            "authentication-kubeconfig",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/kubeconfig"),
        ),
        (
            "authorization-kubeconfig",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/kubeconfig"),
        ),
        ("leader-elect", "true".to_string()),
        (
            "root-ca-file",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/ca.crt"),
        ),
        (
            "service-account-private-key-file",
            format!("{CONTROLLER_MANAGER_SECRETS_MOUNT}/service-account.key"),
        ),
        ("profiling", "false".to_string()),
        ("tls-min-version", "VersionTLS13".to_string()),
    ]);

    if !cfg.cloud_provider.is_empty() {
        builder.set("cloud-provider", cfg.cloud_provider.clone());
    }

    for key in ["service-cluster-ip-range", "controllers"] {
        builder.policy(key, MergePolicy::Additive);
    }

    for key in [
        "cluster-signing-cert-file",
        "cluster-signing-key-file",
        "authentication-kubeconfig",
        "authorization-kubeconfig",
        "root-ca-file",
        "service-account-private-key-file",
    ] {
        builder.policy(key, MergePolicy::Denied);
    }

    builder.merge(cfg.extra_args.clone())?;

    let mut command = vec![
        "/usr/local/bin/kube-controller-manager".to_string(),
        "--use-service-account-credentials".to_string(),
    ];
    command.extend(builder.build());

    let resources = pod_resources(&cfg.resources, "50m", "256Mi")?;

    let mut env = vec![pod_ip_env()];
    env.extend(env_vars(&cfg.environment_variables));
    if let Some(go_gc) = go_gc_env(&resources) {
        env.push(go_gc);
    }

    let (secrets_mount, secrets_vol) =
        host_path_mount("secrets", CONTROLLER_MANAGER_SECRETS_MOUNT, true);

    let mut mounts = vec![secrets_mount];
    mounts.extend(volume_mounts(&cfg.extra_volumes));

    let mut vols = vec![secrets_vol];
    vols.extend(volumes(&cfg.extra_volumes));

    let mut startup = https_probe("/healthz", 10257);
    // allow a slow first election: 12 x 5s
    startup.period_seconds = Some(5);
    startup.failure_threshold = Some(12);

    let mut liveness = https_probe("/healthz", 10257);
    liveness.timeout_seconds = Some(15);

    Ok(build_pod(
        CONTROLLER_MANAGER_ID,
        &cfg.image,
        BTreeMap::from([
            (
                ANNOTATION_SECRETS_VERSION.to_string(),
                secrets_version.to_string(),
            ),
            (
                ANNOTATION_CONFIG_VERSION.to_string(),
                config_version.to_string(),
            ),
        ]),
        command,
        env,
        mounts,
        vols,
        resources,
        CONTROLLER_MANAGER_RUN_USER,
        false,
        ContainerProbes {
            startup: Some(startup),
            liveness: Some(liveness),
            readiness: None,
        },
    ))
}

/// Render the kube-scheduler static pod.
pub fn render_scheduler(
    cfg: &SchedulerConfigSpec,
    secrets_version: &str,
    config_version: &str,
) -> anyhow::Result<Pod> {
    let mut builder = ArgsBuilder::new::<&str, String>([
        (
            "config",
            format!("{SCHEDULER_CONFIG_MOUNT}/scheduler-config.yaml"),
        ),
        (
            "authentication-tolerate-lookup-failure",
            "false".to_string(),
        ),
        (
            "authentication-kubeconfig",
            format!("{SCHEDULER_SECRETS_MOUNT}/kubeconfig"),
        ),
        (
            "authorization-kubeconfig",
            format!("{SCHEDULER_SECRETS_MOUNT}/kubeconfig"),
        ),
        ("bind-address", "127.0.0.1".to_string()),
        ("leader-elect", "true".to_string()),
        ("profiling", "false".to_string()),
        ("tls-min-version", "VersionTLS13".to_string()),
    ]);

    for key in [
        "kubeconfig",
        "authentication-kubeconfig",
        "authorization-kubeconfig",
        "config",
    ] {
        builder.policy(key, MergePolicy::Denied);
    }

    builder.merge(cfg.extra_args.clone())?;

    let mut command = vec!["/usr/local/bin/kube-scheduler".to_string()];
    command.extend(builder.build());

    let resources = pod_resources(&cfg.resources, "10m", "64Mi")?;

    let mut env = vec![pod_ip_env()];
    env.extend(env_vars(&cfg.environment_variables));
    if let Some(go_gc) = go_gc_env(&resources) {
        env.push(go_gc);
    }

    let (secrets_mount, secrets_vol) = host_path_mount("secrets", SCHEDULER_SECRETS_MOUNT, true);
    let (config_mount, config_vol) = host_path_mount("config", SCHEDULER_CONFIG_MOUNT, true);

    let mut mounts = vec![secrets_mount, config_mount];
    mounts.extend(volume_mounts(&cfg.extra_volumes));

    let mut vols = vec![secrets_vol, config_vol];
    vols.extend(volumes(&cfg.extra_volumes));

    Ok(build_pod(
        SCHEDULER_ID,
        &cfg.image,
        BTreeMap::from([
            (
                ANNOTATION_SECRETS_VERSION.to_string(),
                secrets_version.to_string(),
            ),
            (
                ANNOTATION_CONFIG_VERSION.to_string(),
                config_version.to_string(),
            ),
        ]),
        command,
        env,
        mounts,
        vols,
        resources,
        SCHEDULER_RUN_USER,
        false,
        ContainerProbes {
            startup: Some(https_probe("/livez", 10259)),
            liveness: Some(https_probe("/livez", 10259)),
            readiness: Some(https_probe("/readyz", 10259)),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_server_config() -> APIServerConfigSpec {
        APIServerConfigSpec {
            image: "registry.k8s.io/kube-apiserver:v1.31.1".into(),
            control_plane_endpoint: "https://foo:6443".into(),
            etcd_servers: vec!["https://localhost:2379".into()],
            local_port: 6443,
            service_cidrs: vec!["10.96.0.0/12".into()],
            advertised_address: "$(POD_IP)".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_secrets_version_annotation_tracks_input() {
        let cfg = api_server_config();

        let pod_v1 = render_api_server(&cfg, "3", "1", "1").unwrap();
        let pod_v2 = render_api_server(&cfg, "4", "1", "1").unwrap();
        let pod_v1_again = render_api_server(&cfg, "3", "1", "1").unwrap();

        let annotation = |pod: &Pod| {
            pod.metadata.annotations.as_ref().unwrap()[ANNOTATION_SECRETS_VERSION].clone()
        };

        assert_eq!(annotation(&pod_v1), "3");
        assert_eq!(annotation(&pod_v2), "4");

        // unchanged inputs render a byte-equal pod
        assert_eq!(pod_v1, pod_v1_again);
        assert_ne!(pod_v1, pod_v2);
    }

    #[test]
    fn test_denied_extra_arg_fails_render() {
        let mut cfg = api_server_config();
        cfg.extra_args
            .insert("etcd-servers".into(), "https://evil:2379".into());

        assert!(render_api_server(&cfg, "1", "1", "1").is_err());
    }

    #[test]
    fn test_env_dollar_escaped() {
        let env = env_vars(&BTreeMap::from([(
            "GOTRACEBACK".to_string(),
            "$(crash)".to_string(),
        )]));

        assert_eq!(env[0].value.as_deref(), Some("$$(crash)"));
    }

    #[test]
    fn test_gomemlimit_from_memory_limit() {
        let resources = pod_resources(
            &Resources {
                requests: BTreeMap::new(),
                limits: BTreeMap::from([("memory".to_string(), "1Gi".to_string())]),
            },
            "200m",
            "512Mi",
        )
        .unwrap();

        let env = go_gc_env(&resources).unwrap();
        assert_eq!(env.name, "GOMEMLIMIT");
        assert_eq!(
            env.value.as_deref(),
            Some((1073741824i64 * 95 / 100).to_string().as_str())
        );
    }

    #[test]
    fn test_no_memory_limit_no_gomemlimit() {
        let resources = pod_resources(&Resources::default(), "10m", "64Mi").unwrap();

        assert!(go_gc_env(&resources).is_none());
    }

    #[test]
    fn test_scheduler_disabled_not_rendered_by_controller() {
        // renderers themselves don't check `enabled`; the controller does.
        // still: a rendered scheduler pod carries both version annotations
        let pod = render_scheduler(&SchedulerConfigSpec::default(), "7", "9").unwrap();
        let annotations = pod.metadata.annotations.as_ref().unwrap();

        assert_eq!(annotations[ANNOTATION_SECRETS_VERSION], "7");
        assert_eq!(annotations[ANNOTATION_CONFIG_VERSION], "9");
    }
}
