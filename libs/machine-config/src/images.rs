//! Default component images and image reference helpers.

/// Kubernetes version the defaults track.
pub const DEFAULT_KUBERNETES_VERSION: &str = "1.31.1";

/// CoreDNS version shipped by default.
pub const DEFAULT_COREDNS_VERSION: &str = "1.11.3";

/// Flannel version shipped by default.
pub const DEFAULT_FLANNEL_VERSION: &str = "0.25.6";

/// Control plane components with default images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// kube-apiserver.
    ApiServer,

    /// kube-controller-manager.
    ControllerManager,

    /// kube-scheduler.
    Scheduler,

    /// kube-proxy.
    Proxy,

    /// kubelet.
    Kubelet,

    /// CoreDNS.
    CoreDns,

    /// Flannel.
    Flannel,
}

/// Default image reference for a component.
pub fn default_image(component: Component) -> String {
    match component {
        Component::ApiServer => {
            format!("registry.k8s.io/kube-apiserver:v{DEFAULT_KUBERNETES_VERSION}")
        }
        Component::ControllerManager => {
            format!("registry.k8s.io/kube-controller-manager:v{DEFAULT_KUBERNETES_VERSION}")
        }
        Component::Scheduler => {
            format!("registry.k8s.io/kube-scheduler:v{DEFAULT_KUBERNETES_VERSION}")
        }
        Component::Proxy => {
            format!("registry.k8s.io/kube-proxy:v{DEFAULT_KUBERNETES_VERSION}")
        }
        Component::Kubelet => {
            format!("ghcr.io/keel-os/kubelet:v{DEFAULT_KUBERNETES_VERSION}")
        }
        Component::CoreDns => {
            format!("registry.k8s.io/coredns/coredns:v{DEFAULT_COREDNS_VERSION}")
        }
        Component::Flannel => {
            format!("ghcr.io/flannel-io/flannel:v{DEFAULT_FLANNEL_VERSION}")
        }
    }
}

/// Parse the semantic version out of an image reference tag.
///
/// `registry.k8s.io/kube-proxy:v1.31.0` yields `(1, 31, 0)`. Pre-release
/// and build suffixes are ignored. Returns `None` for untagged or
/// unparseable references.
pub fn version_from_image_ref(image: &str) -> Option<(u64, u64, u64)> {
    let tag = image.rsplit(':').next()?;
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let tag = tag
        .split_once(['-', '+'])
        .map_or(tag, |(version, _)| version);

    let mut parts = tag.splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;

    Some((major, minor, patch))
}

/// True when the image tag is at or above the given version.
pub fn image_version_gte(image: &str, minimum: (u64, u64, u64)) -> bool {
    version_from_image_ref(image).is_some_and(|version| version >= minimum)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("registry.k8s.io/kube-proxy:v1.31.0", Some((1, 31, 0)))]
    #[case("registry.k8s.io/kube-proxy:v1.30.2-rc.1", Some((1, 30, 2)))]
    #[case("registry.k8s.io/kube-proxy:1.29.7+build.4", Some((1, 29, 7)))]
    #[case("registry.k8s.io/kube-proxy:v1.31", Some((1, 31, 0)))]
    #[case("registry.k8s.io/kube-proxy", None)]
    #[case("registry.k8s.io/kube-proxy:latest", None)]
    fn test_version_from_image_ref(
        #[case] image: &str,
        #[case] expected: Option<(u64, u64, u64)>,
    ) {
        assert_eq!(version_from_image_ref(image), expected);
    }

    #[test]
    fn test_image_version_gte() {
        assert!(image_version_gte(
            "registry.k8s.io/kube-proxy:v1.31.0",
            (1, 31, 0)
        ));
        assert!(!image_version_gte(
            "registry.k8s.io/kube-proxy:v1.30.0",
            (1, 31, 0)
        ));
    }
}
