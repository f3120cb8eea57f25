use super::{RuleId, SecGroupId};
use dflow_types::{IpFamily, IpPrefix};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Egress, Direction::Ingress];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EtherType {
    IPv4,
    IPv6,
}

impl EtherType {
    pub const ALL: [EtherType; 2] = [EtherType::IPv4, EtherType::IPv6];

    pub const fn value(&self) -> u16 {
        match self {
            EtherType::IPv4 => 0x0800,
            EtherType::IPv6 => 0x86dd,
        }
    }

    pub const fn family(&self) -> IpFamily {
        match self {
            EtherType::IPv4 => IpFamily::Ipv4,
            EtherType::IPv6 => IpFamily::Ipv6,
        }
    }

    pub const fn is_icmp(&self, protocol: u8) -> bool {
        match self {
            EtherType::IPv4 => protocol == 1,
            EtherType::IPv6 => protocol == 58,
        }
    }
}

/// The far side of a rule: a fixed prefix or the members of another group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteSelector {
    Cidr(IpPrefix),
    Group(SecGroupId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: RuleId,
    pub direction: Direction,
    pub ethertype: EtherType,
    #[serde(default)]
    pub protocol: Option<u8>,
    /// Lowest destination port, or the ICMP type
    #[serde(default)]
    pub port_range_min: Option<u16>,
    /// Highest destination port, or the ICMP code
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default)]
    pub remote: Option<RemoteSelector>,
}

impl SecurityGroupRule {
    pub fn new(id: impl Into<RuleId>, direction: Direction, ethertype: EtherType) -> Self {
        Self {
            id: id.into(),
            direction,
            ethertype,
            protocol: None,
            port_range_min: None,
            port_range_max: None,
            remote: None,
        }
    }

    pub fn with_protocol(mut self, protocol: u8) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_ports(mut self, min: u16, max: u16) -> Self {
        self.port_range_min = Some(min);
        self.port_range_max = Some(max);
        self
    }

    pub fn with_remote_cidr(mut self, prefix: IpPrefix) -> Self {
        self.remote = Some(RemoteSelector::Cidr(prefix));
        self
    }

    pub fn with_remote_group(mut self, group: impl Into<SecGroupId>) -> Self {
        self.remote = Some(RemoteSelector::Group(group.into()));
        self
    }

    pub fn remote_group(&self) -> Option<&SecGroupId> {
        match &self.remote {
            Some(RemoteSelector::Group(group)) => Some(group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: SecGroupId,
    pub unique_key: u32,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

impl SecurityGroup {
    pub fn new(id: impl Into<SecGroupId>, unique_key: u32) -> Self {
        Self {
            id: id.into(),
            unique_key,
            version: 0,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: SecurityGroupRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn rule(&self, id: &RuleId) -> Option<&SecurityGroupRule> {
        self.rules.iter().find(|rule| &rule.id == id)
    }
}
