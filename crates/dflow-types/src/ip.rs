//! IP address and prefix types with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of an [`IpAddress`] or [`IpPrefix`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Number of bits in an address of this family.
    pub const fn bits(&self) -> u8 {
        match self {
            IpFamily::Ipv4 => 32,
            IpFamily::Ipv6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::Ipv4 => write!(f, "IPv4"),
            IpFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// An IP address that can be either IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddress {
    pub const fn v4(a: u8, b: u8, c: u8, d: u8) -> Self {
        IpAddress::V4(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn family(&self) -> IpFamily {
        match self {
            IpAddress::V4(_) => IpFamily::Ipv4,
            IpAddress::V6(_) => IpFamily::Ipv6,
        }
    }

    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    /// Returns the address as an unsigned integer, right-aligned.
    pub fn to_bits(&self) -> u128 {
        match self {
            IpAddress::V4(addr) => u128::from(u32::from(*addr)),
            IpAddress::V6(addr) => u128::from(*addr),
        }
    }

    /// Builds an address of the given family from right-aligned bits.
    /// Bits above the family width are discarded.
    pub fn from_bits(family: IpFamily, bits: u128) -> Self {
        match family {
            IpFamily::Ipv4 => IpAddress::V4(Ipv4Addr::from(bits as u32)),
            IpFamily::Ipv6 => IpAddress::V6(Ipv6Addr::from(bits)),
        }
    }

    /// Returns the single-address prefix (/32 or /128) covering this address.
    pub fn host_prefix(&self) -> IpPrefix {
        IpPrefix {
            address: *self,
            prefix_len: self.family().bits(),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Addr>().map(IpAddress::V6)
        } else {
            s.parse::<Ipv4Addr>().map(IpAddress::V4)
        }
        .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl TryFrom<String> for IpAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpAddress> for String {
    fn from(addr: IpAddress) -> String {
        addr.to_string()
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr)
    }
}

/// An IP prefix in CIDR notation (e.g., 10.0.0.0/24 or 2001:db8::/32).
///
/// The stored address keeps whatever host bits it was built with;
/// [`IpPrefix::network`] gives the masked form used in flow matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = address.family().bits();
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len,
                max_len,
                address.family()
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn family(&self) -> IpFamily {
        self.address.family()
    }

    /// Returns true if this is a host route (/32 for IPv4, /128 for IPv6).
    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == self.address.family().bits()
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Right-aligned netmask bits for this prefix length.
    fn mask_bits(&self) -> u128 {
        let width = u32::from(self.family().bits());
        let len = u32::from(self.prefix_len);
        if len == 0 {
            return 0;
        }
        let all = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        let host = if len == width { 0 } else { (1u128 << (width - len)) - 1 };
        all & !host
    }

    /// Returns the netmask as an address (e.g. 255.255.255.0 for a /24).
    pub fn mask(&self) -> IpAddress {
        IpAddress::from_bits(self.family(), self.mask_bits())
    }

    /// Returns the network address with host bits cleared.
    pub fn network(&self) -> IpAddress {
        IpAddress::from_bits(self.family(), self.address.to_bits() & self.mask_bits())
    }

    /// Returns the same prefix with host bits cleared (10.1.2.3/24 -> 10.1.2.0/24).
    pub fn normalized(&self) -> IpPrefix {
        IpPrefix {
            address: self.network(),
            prefix_len: self.prefix_len,
        }
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: &IpAddress) -> bool {
        addr.family() == self.family()
            && (addr.to_bits() & self.mask_bits()) == (self.address.to_bits() & self.mask_bits())
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    /// Parses CIDR notation. A bare address is taken as a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr_str, len_str)) = s.rsplit_once('/') else {
            let address: IpAddress = s
                .parse()
                .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;
            return Ok(address.host_prefix());
        };

        let address: IpAddress = addr_str.parse()?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> String {
        prefix.to_string()
    }
}

impl From<IpAddress> for IpPrefix {
    fn from(addr: IpAddress) -> Self {
        addr.host_prefix()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_address_family() {
        let v4: IpAddress = "10.0.0.1".parse().unwrap();
        assert_eq!(v4.family(), IpFamily::Ipv4);
        assert!(v4.is_ipv4());

        let v6: IpAddress = "2001:db8::1".parse().unwrap();
        assert_eq!(v6.family(), IpFamily::Ipv6);
        assert!(v6.is_ipv6());
    }

    #[test]
    fn test_bits_roundtrip_keeps_family() {
        let v4 = IpAddress::v4(192, 168, 1, 7);
        assert_eq!(v4.to_bits(), 0xc0a8_0107);
        assert_eq!(IpAddress::from_bits(IpFamily::Ipv4, v4.to_bits()), v4);
    }

    #[test]
    fn test_host_prefix() {
        let v4 = IpAddress::v4(10, 0, 0, 5);
        assert_eq!(v4.host_prefix().to_string(), "10.0.0.5/32");
        assert!(v4.host_prefix().is_host_route());

        let v6: IpAddress = "fd00::5".parse().unwrap();
        assert_eq!(v6.host_prefix().prefix_len(), 128);
    }

    #[test]
    fn test_prefix_network_and_mask() {
        let prefix: IpPrefix = "10.1.2.3/24".parse().unwrap();
        assert_eq!(prefix.network().to_string(), "10.1.2.0");
        assert_eq!(prefix.mask().to_string(), "255.255.255.0");

        let default: IpPrefix = "0.0.0.0/0".parse().unwrap();
        assert!(default.is_default());
        assert_eq!(default.mask().to_string(), "0.0.0.0");

        let v6: IpPrefix = "2001:db8::1/32".parse().unwrap();
        assert_eq!(v6.network().to_string(), "2001:db8::");
        assert_eq!(v6.normalized().to_string(), "2001:db8::/32");
    }

    #[test]
    fn test_prefix_contains() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        assert!(prefix.contains(&IpAddress::v4(192, 168, 44, 1)));
        assert!(!prefix.contains(&IpAddress::v4(192, 169, 0, 1)));
        assert!(!prefix.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_parses_as_host_prefix() {
        let prefix: IpPrefix = "10.0.0.9".parse().unwrap();
        assert!(prefix.is_host_route());
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0/x".parse::<IpPrefix>().is_err());
    }
}
