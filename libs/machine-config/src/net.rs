//! CIDR math for cluster network derivation.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::ConfigError;

/// Offset of the cluster DNS service address inside each service subnet.
const DNS_SERVICE_IP_OFFSET: u128 = 10;

/// A parsed network prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix_len: u8,
}

impl Cidr {
    /// Network base address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// True for an IPv4 prefix.
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// True when the address falls inside this prefix.
    ///
    /// Addresses of the other family never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask(self.prefix_len, 32);
                (u32::from(net) as u128) & mask == (u32::from(ip) as u128) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask(self.prefix_len, 128);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix_len) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidSubnet(s.to_string()))?;

        let addr: IpAddr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidSubnet(s.to_string()))?;

        let prefix_len: u8 = prefix_len
            .parse()
            .map_err(|_| ConfigError::InvalidSubnet(s.to_string()))?;

        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(ConfigError::InvalidSubnet(s.to_string()));
        }

        Ok(Self { addr, prefix_len })
    }
}

fn prefix_mask(prefix_len: u8, bits: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        (!0u128 >> (128 - bits as u32)) << (bits - prefix_len) as u32
    }
}

/// The `n`-th address inside a subnet.
pub fn nth_ip_in_cidr(cidr: &str, n: u128) -> Result<IpAddr, ConfigError> {
    let cidr: Cidr = cidr.parse()?;

    Ok(match cidr.addr {
        IpAddr::V4(base) => {
            let addr = (u32::from(base) as u128 + n) as u32;
            IpAddr::V4(Ipv4Addr::from(addr))
        }
        IpAddr::V6(base) => {
            let addr = u128::from(base).wrapping_add(n);
            IpAddr::V6(Ipv6Addr::from(addr))
        }
    })
}

/// Cluster DNS service addresses: the tenth address of every service subnet.
pub fn dns_service_ips(service_cidrs: &[String]) -> Result<Vec<IpAddr>, ConfigError> {
    service_cidrs
        .iter()
        .map(|cidr| nth_ip_in_cidr(cidr, DNS_SERVICE_IP_OFFSET))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_service_ips() {
        let ips = dns_service_ips(&[
            "10.96.0.0/12".to_string(),
            "fc00:db8:20::/112".to_string(),
        ])
        .unwrap();

        assert_eq!(
            ips,
            vec![
                "10.96.0.10".parse::<IpAddr>().unwrap(),
                "fc00:db8:20::a".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_cidr_contains() {
        let cidr: Cidr = "10.96.0.0/12".parse().unwrap();

        assert!(cidr.contains("10.100.3.4".parse().unwrap()));
        assert!(!cidr.contains("10.128.0.1".parse().unwrap()));
        assert!(!cidr.contains("fc00::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_contains_zero_prefix() {
        let any: Cidr = "0.0.0.0/0".parse().unwrap();

        assert!(any.contains("192.168.1.1".parse().unwrap()));
        assert!(!any.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_subnet() {
        assert!("10.96.0.0".parse::<Cidr>().is_err());
        assert!("10.96.0.0/33".parse::<Cidr>().is_err());
        assert!("bogus/8".parse::<Cidr>().is_err());
    }
}
