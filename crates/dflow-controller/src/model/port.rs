use super::{LSwitchId, PortId, SecGroupId};
use dflow_types::{IpAddress, IpPrefix, MacAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a port is bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PortBinding {
    /// Bound to a hypervisor chassis by name
    Chassis { chassis: String },
    /// Bound behind a hardware VTEP
    Vtep { ip: IpAddress },
}

impl PortBinding {
    pub fn chassis(name: impl Into<String>) -> Self {
        PortBinding::Chassis {
            chassis: name.into(),
        }
    }

    pub fn is_on_chassis(&self, name: &str) -> bool {
        matches!(self, PortBinding::Chassis { chassis } if chassis == name)
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortBinding::Chassis { chassis } => write!(f, "chassis:{}", chassis),
            PortBinding::Vtep { ip } => write!(f, "vtep:{}", ip),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressPair {
    pub mac: MacAddress,
    pub ip: IpAddress,
}

/// Extra (prefix, mac) a port may source traffic from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedAddressPair {
    pub ip: IpPrefix,
    pub mac: MacAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPort {
    pub id: PortId,
    pub lswitch: LSwitchId,
    pub unique_key: u32,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub addresses: Vec<AddressPair>,
    #[serde(default)]
    pub allowed_address_pairs: Vec<AllowedAddressPair>,
    #[serde(default)]
    pub security_groups: Vec<SecGroupId>,
    #[serde(default = "default_port_security")]
    pub port_security_enabled: bool,
    #[serde(default)]
    pub binding: Option<PortBinding>,
}

fn default_port_security() -> bool {
    true
}

impl LogicalPort {
    pub fn new(id: impl Into<PortId>, lswitch: impl Into<LSwitchId>, unique_key: u32) -> Self {
        Self {
            id: id.into(),
            lswitch: lswitch.into(),
            unique_key,
            version: 0,
            addresses: Vec::new(),
            allowed_address_pairs: Vec::new(),
            security_groups: Vec::new(),
            port_security_enabled: true,
            binding: None,
        }
    }

    pub fn with_address(mut self, mac: MacAddress, ip: IpAddress) -> Self {
        self.addresses.push(AddressPair { mac, ip });
        self
    }

    pub fn with_allowed_pair(mut self, ip: IpPrefix, mac: MacAddress) -> Self {
        self.allowed_address_pairs.push(AllowedAddressPair { ip, mac });
        self
    }

    pub fn with_security_group(mut self, group: impl Into<SecGroupId>) -> Self {
        self.security_groups.push(group.into());
        self
    }

    pub fn with_binding(mut self, binding: PortBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Addresses this port is known by as a group member: a host prefix per
    /// fixed IP plus every allowed-address-pair prefix. Sorted, no duplicates.
    pub fn member_addresses(&self) -> Vec<IpPrefix> {
        let mut prefixes: Vec<IpPrefix> = self
            .addresses
            .iter()
            .map(|pair| pair.ip.host_prefix())
            .chain(self.allowed_address_pairs.iter().map(|pair| pair.ip.normalized()))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        prefixes
    }

    /// Fixed IPs, used for conntrack flushes.
    pub fn fixed_ips(&self) -> Vec<IpAddress> {
        let mut ips: Vec<IpAddress> = self.addresses.iter().map(|pair| pair.ip).collect();
        ips.sort();
        ips.dedup();
        ips
    }
}
