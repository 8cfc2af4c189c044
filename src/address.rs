use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::ScanError;

/// A parsed scan target: a CIDR block, or a bare address treated as a
/// single-host block (/32 or /128).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpec {
    net: IpNet,
}

impl AddressSpec {
    /// Parse `192.168.1.0/24`, `2001:db8::/120`, `10.0.0.7` or `::1`.
    ///
    /// Host bits of a CIDR are masked off, so `192.168.1.7/30` covers
    /// `192.168.1.4` through `192.168.1.7`.
    pub fn parse(s: &str) -> Result<Self, ScanError> {
        let s = s.trim();
        let invalid = |reason: String| ScanError::InvalidAddressSpec {
            spec: s.to_string(),
            reason,
        };

        if s.contains('/') {
            let net = s.parse::<IpNet>().map_err(|e| invalid(e.to_string()))?;
            return Ok(Self { net: net.trunc() });
        }

        let ip = s.parse::<IpAddr>().map_err(|e| invalid(e.to_string()))?;
        let prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let net = IpNet::new(ip, prefix).map_err(|e| invalid(e.to_string()))?;
        Ok(Self { net })
    }

    /// Number of addresses in the block, saturating at `u128::MAX`.
    pub fn len(&self) -> u128 {
        let host_bits = u32::from(self.net.max_prefix_len() - self.net.prefix_len());
        1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Every address in the block in ascending order, network and broadcast
    /// addresses included.
    pub fn addresses(&self) -> Addresses {
        Addresses {
            net: self.net,
            next: Some(self.net.network()),
        }
    }
}

impl FromStr for AddressSpec {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.net.fmt(f)
    }
}

/// Lazy iterator returned by [`AddressSpec::addresses`].
#[derive(Debug, Clone)]
pub struct Addresses {
    net: IpNet,
    next: Option<IpAddr>,
}

impl Iterator for Addresses {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let current = self.next?;
        self.next = next_addr(current).filter(|ip| self.net.contains(ip));
        Some(current)
    }
}

/// Add one to a big-endian byte string in place, carrying across bytes.
///
/// Returns `false` when the value wrapped around to all zeros.
pub fn increment(bytes: &mut [u8]) -> bool {
    for b in bytes.iter_mut().rev() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return true;
        }
    }
    false
}

/// The address immediately after `ip`, or `None` past the last address of
/// its family.
pub fn next_addr(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            increment(&mut octets).then(|| IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            increment(&mut octets).then(|| IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn increment_carries_across_bytes() {
        let cases = [
            ("127.0.0.1", "127.0.0.2"),
            ("127.0.0.255", "127.0.1.0"),
            ("127.0.255.255", "127.1.0.0"),
            ("127.255.255.255", "128.0.0.0"),
        ];
        for (ip, expected) in cases {
            assert_eq!(next_addr(v4(ip)), Some(v4(expected)), "incrementing {ip}");
        }
    }

    #[test]
    fn increment_wraps_at_top() {
        let mut bytes = [0xff, 0xff];
        assert!(!increment(&mut bytes));
        assert_eq!(bytes, [0, 0]);
        assert_eq!(next_addr(v4("255.255.255.255")), None);
    }

    #[test]
    fn increment_ipv6_carries_into_high_bytes() {
        let ip: IpAddr = "2001:db8::ffff:ffff".parse().unwrap();
        let expected: IpAddr = "2001:db8::1:0:0".parse().unwrap();
        assert_eq!(next_addr(ip), Some(expected));
    }

    #[test]
    fn bare_address_is_single_host() {
        let spec = AddressSpec::parse(" 10.1.2.3 ").unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec.addresses().collect::<Vec<_>>(), vec![v4("10.1.2.3")]);
    }

    #[test]
    fn cidr_host_bits_are_masked() {
        let spec = AddressSpec::parse("192.168.1.7/30").unwrap();
        assert_eq!(spec.to_string(), "192.168.1.4/30");
        let first = spec.addresses().next();
        assert_eq!(first, Some(v4("192.168.1.4")));
    }

    #[test]
    fn last_block_of_address_space_terminates() {
        let spec = AddressSpec::parse("255.255.255.254/31").unwrap();
        let ips: Vec<_> = spec.addresses().collect();
        assert_eq!(ips, vec![v4("255.255.255.254"), v4("255.255.255.255")]);
    }

    #[test]
    fn garbage_is_rejected() {
        for bad in ["", "not-an-ip", "10.0.0.0/33", "300.1.1.1", "::1/129"] {
            assert!(
                matches!(
                    AddressSpec::parse(bad),
                    Err(ScanError::InvalidAddressSpec { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }
}
