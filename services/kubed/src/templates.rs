//! Bootstrap manifest templates.
//!
//! Rendered once per config change by the manifest controller and applied
//! through the manifest applier. Only the fields the subsystem owns are
//! templated; everything else is fixed.

use crate::resources::BootstrapManifestsConfigSpec;

/// RBAC allowing kubelets to bootstrap and renew their certificates.
pub fn csr_bootstrap_rbac() -> String {
    r#"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: system-bootstrap-approve-node-client-csr
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:certificates.k8s.io:certificatesigningrequests:nodeclient
subjects:
  - apiGroup: rbac.authorization.k8s.io
    kind: Group
    name: system:bootstrappers
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: system-bootstrap-node-renewal
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:certificates.k8s.io:certificatesigningrequests:selfnodeclient
subjects:
  - apiGroup: rbac.authorization.k8s.io
    kind: Group
    name: system:nodes
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: system-bootstrap-node-bootstrapper
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:node-bootstrapper
subjects:
  - apiGroup: rbac.authorization.k8s.io
    kind: Group
    name: system:bootstrappers
"#
    .to_string()
}

/// kube-proxy daemonset.
pub fn kube_proxy(config: &BootstrapManifestsConfigSpec) -> String {
    let args = config
        .proxy_args
        .iter()
        .map(|arg| format!("            - {arg}\n"))
        .collect::<String>();

    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: kube-proxy
  namespace: kube-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: kube-proxy
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:node-proxier
subjects:
  - kind: ServiceAccount
    name: kube-proxy
    namespace: kube-system
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: kube-proxy
  namespace: kube-system
  labels:
    tier: node
    k8s-app: kube-proxy
spec:
  selector:
    matchLabels:
      tier: node
      k8s-app: kube-proxy
  template:
    metadata:
      labels:
        tier: node
        k8s-app: kube-proxy
    spec:
      priorityClassName: system-cluster-critical
      serviceAccountName: kube-proxy
      hostNetwork: true
      tolerations:
        - operator: Exists
      containers:
        - name: kube-proxy
          image: {image}
          command:
            - /usr/local/bin/kube-proxy
{args}          env:
            - name: NODE_NAME
              valueFrom:
                fieldRef:
                  fieldPath: spec.nodeName
          securityContext:
            privileged: true
          volumeMounts:
            - name: kubeconfig
              mountPath: /etc/kubernetes/kubeconfig
              readOnly: true
      volumes:
        - name: kubeconfig
          hostPath:
            path: /etc/kubernetes/kubeconfig
"#,
        image = config.proxy_image,
    )
}

/// CoreDNS deployment with its service account and Corefile.
pub fn coredns(config: &BootstrapManifestsConfigSpec) -> String {
    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: coredns
  namespace: kube-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: system:coredns
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: system:coredns
subjects:
  - kind: ServiceAccount
    name: coredns
    namespace: kube-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: system:coredns
rules:
  - apiGroups: [""]
    resources: ["endpoints", "services", "pods", "namespaces"]
    verbs: ["list", "watch"]
  - apiGroups: ["discovery.k8s.io"]
    resources: ["endpointslices"]
    verbs: ["list", "watch"]
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: coredns
  namespace: kube-system
data:
  Corefile: |
    .:53 {{
        errors
        health
        ready
        kubernetes {cluster_domain} in-addr.arpa ip6.arpa {{
            pods insecure
            fallthrough in-addr.arpa ip6.arpa
        }}
        prometheus :9153
        forward . /etc/resolv.conf
        cache 30
        loop
        reload
        loadbalance
    }}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: coredns
  namespace: kube-system
  labels:
    k8s-app: kube-dns
spec:
  replicas: 2
  selector:
    matchLabels:
      k8s-app: kube-dns
  template:
    metadata:
      labels:
        k8s-app: kube-dns
    spec:
      priorityClassName: system-cluster-critical
      serviceAccountName: coredns
      containers:
        - name: coredns
          image: {image}
          args:
            - -conf
            - /etc/coredns/Corefile
          volumeMounts:
            - name: config
              mountPath: /etc/coredns
              readOnly: true
      volumes:
        - name: config
          configMap:
            name: coredns
            items:
              - key: Corefile
                path: Corefile
"#,
        cluster_domain = config.cluster_domain,
        image = config.core_dns_image,
    )
}

/// The kube-dns service pinned to the cluster DNS service addresses.
pub fn kube_dns_service(config: &BootstrapManifestsConfigSpec) -> String {
    let dual_stack = !config.dns_service_ip.is_empty() && !config.dns_service_ipv6.is_empty();

    let families = if dual_stack {
        "  ipFamilyPolicy: RequireDualStack\n"
    } else {
        ""
    };

    let cluster_ip = if config.dns_service_ip.is_empty() {
        &config.dns_service_ipv6
    } else {
        &config.dns_service_ip
    };

    format!(
        r#"apiVersion: v1
kind: Service
metadata:
  name: kube-dns
  namespace: kube-system
  labels:
    k8s-app: kube-dns
    kubernetes.io/name: CoreDNS
spec:
  selector:
    k8s-app: kube-dns
  clusterIP: {cluster_ip}
{families}  ports:
    - name: dns
      port: 53
      protocol: UDP
    - name: dns-tcp
      port: 53
      protocol: TCP
"#
    )
}

/// Flannel CNI daemonset.
pub fn flannel(config: &BootstrapManifestsConfigSpec) -> String {
    let networks = config
        .pod_cidrs
        .iter()
        .map(|cidr| format!("          \"{cidr}\""))
        .collect::<Vec<_>>()
        .join(",\n")
        + "\n";

    let extra_args = config
        .flannel_extra_args
        .iter()
        .map(|arg| format!("            - {arg}\n"))
        .collect::<String>();

    // with KubePrism enabled flannel dials the local balancer instead of
    // the in-cluster service
    let kube_service_env = if config.flannel_kube_service_host.is_empty() {
        String::new()
    } else {
        format!(
            "            - name: KUBERNETES_SERVICE_HOST\n              value: \"{}\"\n            - name: KUBERNETES_SERVICE_PORT\n              value: \"{}\"\n",
            config.flannel_kube_service_host, config.flannel_kube_service_port,
        )
    };

    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: flannel
  namespace: kube-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: flannel
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: flannel
subjects:
  - kind: ServiceAccount
    name: flannel
    namespace: kube-system
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: flannel
rules:
  - apiGroups: [""]
    resources: ["pods", "nodes"]
    verbs: ["get", "list", "watch"]
  - apiGroups: [""]
    resources: ["nodes/status"]
    verbs: ["patch"]
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: kube-flannel-cfg
  namespace: kube-system
  labels:
    tier: node
    k8s-app: flannel
data:
  net-conf.json: |
    {{
      "Networks": [
{networks}      ],
      "Backend": {{
        "Type": "vxlan"
      }}
    }}
---
apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: kube-flannel
  namespace: kube-system
  labels:
    tier: node
    k8s-app: flannel
spec:
  selector:
    matchLabels:
      tier: node
      k8s-app: flannel
  template:
    metadata:
      labels:
        tier: node
        k8s-app: flannel
    spec:
      priorityClassName: system-node-critical
      serviceAccountName: flannel
      hostNetwork: true
      tolerations:
        - operator: Exists
      containers:
        - name: kube-flannel
          image: {image}
          command:
            - /opt/bin/flanneld
          args:
            - --ip-masq
            - --kube-subnet-mgr
{extra_args}          env:
            - name: POD_NAME
              valueFrom:
                fieldRef:
                  fieldPath: metadata.name
            - name: POD_NAMESPACE
              valueFrom:
                fieldRef:
                  fieldPath: metadata.namespace
{kube_service_env}          securityContext:
            privileged: true
          volumeMounts:
            - name: run
              mountPath: /run/flannel
            - name: flannel-cfg
              mountPath: /etc/kube-flannel/
      volumes:
        - name: run
          hostPath:
            path: /run/flannel
        - name: flannel-cfg
          configMap:
            name: kube-flannel-cfg
"#,
        image = config.flannel_image,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BootstrapManifestsConfigSpec {
        BootstrapManifestsConfigSpec {
            server: "https://127.0.0.1:7445".into(),
            cluster_domain: "cluster.local".into(),
            pod_cidrs: vec!["10.244.0.0/16".into()],
            proxy_enabled: true,
            proxy_image: "registry.k8s.io/kube-proxy:v1.31.1".into(),
            proxy_args: vec!["--proxy-mode=nftables".into()],
            core_dns_enabled: true,
            core_dns_image: "registry.k8s.io/coredns/coredns:v1.11.3".into(),
            dns_service_ip: "10.96.0.10".into(),
            dns_service_ipv6: String::new(),
            flannel_enabled: true,
            flannel_image: "ghcr.io/flannel-io/flannel:v0.25.6".into(),
            flannel_extra_args: vec![],
            flannel_kube_service_host: "127.0.0.1".into(),
            flannel_kube_service_port: "7445".into(),
        }
    }

    fn parse_all(yaml: &str) -> Vec<serde_yaml::Value> {
        yaml.split("\n---\n")
            .map(|doc| serde_yaml::from_str(doc).unwrap())
            .collect()
    }

    #[test]
    fn test_kube_proxy_carries_args() {
        let docs = parse_all(&kube_proxy(&config()));
        let daemonset = docs.iter().find(|d| d["kind"] == "DaemonSet").unwrap();

        let args = &daemonset["spec"]["template"]["spec"]["containers"][0]["command"];
        let rendered: Vec<&str> = args
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();

        assert!(rendered.contains(&"--proxy-mode=nftables"));
    }

    #[test]
    fn test_kube_dns_service_cluster_ip() {
        let docs = parse_all(&kube_dns_service(&config()));

        assert_eq!(docs[0]["spec"]["clusterIP"], "10.96.0.10");
    }

    #[test]
    fn test_flannel_kube_service_env_present_only_with_kubeprism() {
        let with = flannel(&config());
        assert!(with.contains("KUBERNETES_SERVICE_HOST"));

        let mut no_prism = config();
        no_prism.flannel_kube_service_host = String::new();
        no_prism.flannel_kube_service_port = String::new();

        let without = flannel(&no_prism);
        assert!(!without.contains("KUBERNETES_SERVICE_HOST"));
    }

    #[test]
    fn test_all_templates_parse() {
        let cfg = config();

        for yaml in [
            csr_bootstrap_rbac(),
            kube_proxy(&cfg),
            coredns(&cfg),
            kube_dns_service(&cfg),
            flannel(&cfg),
        ] {
            parse_all(&yaml);
        }
    }
}
