//! Node IP constraints and selection.

use std::net::IpAddr;

use async_trait::async_trait;
use keel_machine_config::Cidr;
use keel_resource::{
    Controller, ControllerContext, ControllerError, Event, Input, Output,
};
use tracing::warn;

use crate::constants::SINGLETON_ID;
use crate::resources::{MachineConfigSpec, NodeAddressSpec, NodeIPConfigSpec, NodeIPSpec};

use super::transform::{any_machine, MachineConfigTransform};

/// Id of the routed host address inventory.
pub const ROUTED_ADDRESSES_ID: &str = "routed";

/// Derives the node IP selection constraints.
pub type NodeIpConfigController = MachineConfigTransform<NodeIPConfigSpec>;

/// Build the node IP config controller.
pub fn node_ip_config_controller() -> NodeIpConfigController {
    MachineConfigTransform::new("k8s.NodeIpConfigController", any_machine, |config, spec| {
        let user_subnets = &config.machine.kubelet.node_ip.valid_subnets;

        let valid_subnets = if user_subnets.is_empty() {
            // derive the address family filter from the service CIDRs
            let mut subnets = Vec::new();

            for cidr in config.cluster.network.service_cidrs() {
                let parsed: Cidr = cidr
                    .parse()
                    .map_err(anyhow::Error::from)?;

                let family_any = if parsed.is_ipv4() { "0.0.0.0/0" } else { "::/0" };

                if !subnets.iter().any(|s| s == family_any) {
                    subnets.push(family_any.to_string());
                }
            }

            subnets
        } else {
            user_subnets.clone()
        };

        *spec = NodeIPConfigSpec {
            valid_subnets,
            exclude_subnets: config.configured_vips(),
        };

        Ok(())
    })
}

/// Selects the addresses identifying this node in the cluster.
pub struct NodeIpController;

#[async_trait]
impl Controller for NodeIpController {
    fn name(&self) -> &'static str {
        "k8s.NodeIpController"
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::weak_id::<NodeIPConfigSpec>(SINGLETON_ID),
            Input::weak_id::<NodeAddressSpec>(ROUTED_ADDRESSES_ID),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::exclusive::<NodeIPSpec>()]
    }

    async fn run(&mut self, ctx: &mut ControllerContext) -> Result<(), ControllerError> {
        loop {
            if ctx.next_event().await == Event::Shutdown {
                return Ok(());
            }

            let Some(config) = ctx.get_by_id::<NodeIPConfigSpec>(SINGLETON_ID)? else {
                continue;
            };

            let Some(addresses) = ctx.get_by_id::<NodeAddressSpec>(ROUTED_ADDRESSES_ID)? else {
                continue;
            };

            let selected = select_node_ips(&addresses.spec.addresses, &config.spec)
                .map_err(ControllerError::Internal)?;

            // a transient empty inventory must not destabilize consumers
            if !selected.is_empty() {
                ctx.modify::<NodeIPSpec>(SINGLETON_ID, |spec| {
                    spec.addresses = selected;
                })?;
            }

            ctx.reset_restart_backoff();
        }
    }
}

/// A subnet match list entry: a prefix or a bare address.
enum SubnetMatch {
    Prefix(Cidr),
    Address(IpAddr),
}

impl SubnetMatch {
    fn parse(entry: &str) -> anyhow::Result<Self> {
        if entry.contains('/') {
            Ok(Self::Prefix(entry.parse().map_err(anyhow::Error::from)?))
        } else {
            Ok(Self::Address(entry.parse()?))
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Prefix(cidr) => cidr.contains(ip),
            Self::Address(addr) => *addr == ip,
        }
    }
}

/// Apply the subnet constraints and pick at most one address per family.
pub fn select_node_ips(
    addresses: &[IpAddr],
    config: &NodeIPConfigSpec,
) -> anyhow::Result<Vec<IpAddr>> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();

    for entry in &config.valid_subnets {
        match entry.strip_prefix('!') {
            Some(negated) => exclude.push(SubnetMatch::parse(negated)?),
            None => include.push(SubnetMatch::parse(entry)?),
        }
    }

    for entry in &config.exclude_subnets {
        exclude.push(SubnetMatch::parse(entry)?);
    }

    let mut picked = Vec::new();
    let mut have_v4 = false;
    let mut have_v6 = false;

    for &ip in addresses {
        if !include.iter().any(|s| s.matches(ip)) {
            continue;
        }

        if exclude.iter().any(|s| s.matches(ip)) {
            continue;
        }

        let slot = if ip.is_ipv4() { &mut have_v4 } else { &mut have_v6 };

        if *slot {
            warn!(
                address = %ip,
                "skipping node IP, family already picked; constrain .machine.kubelet.nodeIP to make the choice explicit"
            );

            continue;
        }

        *slot = true;
        picked.push(ip);
    }

    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|a| a.parse().unwrap()).collect()
    }

    #[test]
    fn test_one_address_per_family() {
        let config = NodeIPConfigSpec {
            valid_subnets: vec!["0.0.0.0/0".into(), "::/0".into()],
            exclude_subnets: vec![],
        };

        let picked = select_node_ips(
            &addrs(&["10.0.0.5", "10.0.0.6", "2001:db8::1", "2001:db8::2"]),
            &config,
        )
        .unwrap();

        assert_eq!(picked, addrs(&["10.0.0.5", "2001:db8::1"]));
    }

    #[test]
    fn test_negated_subnet_excludes() {
        let config = NodeIPConfigSpec {
            valid_subnets: vec!["10.0.0.0/8".into(), "!10.0.5.0/24".into()],
            exclude_subnets: vec![],
        };

        let picked = select_node_ips(&addrs(&["10.0.5.3", "10.0.6.3"]), &config).unwrap();
        assert_eq!(picked, addrs(&["10.0.6.3"]));
    }

    #[test]
    fn test_vip_excluded() {
        let config = NodeIPConfigSpec {
            valid_subnets: vec!["0.0.0.0/0".into()],
            exclude_subnets: vec!["172.20.0.10".into()],
        };

        let picked = select_node_ips(&addrs(&["172.20.0.10", "172.20.0.2"]), &config).unwrap();
        assert_eq!(picked, addrs(&["172.20.0.2"]));
    }

    #[test]
    fn test_no_match_yields_empty() {
        let config = NodeIPConfigSpec {
            valid_subnets: vec!["192.168.0.0/16".into()],
            exclude_subnets: vec![],
        };

        let picked = select_node_ips(&addrs(&["10.0.0.1"]), &config).unwrap();
        assert!(picked.is_empty());
    }
}
