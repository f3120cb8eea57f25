//! Security group rule compilation into flow matches.
//!
//! A rule compiles to a list of matches (its "clause 1" predicates). The
//! protocol part is fixed per rule; a remote group multiplies it by the
//! group's member prefixes.

use super::port_range::port_range_masks;
use crate::model::{Direction, RemoteSelector, SecurityGroupRule};
use dflow_ofproto::Match;
use dflow_types::IpPrefix;
use itertools::Itertools;
use thiserror::Error;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_SCTP: u8 = 132;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("port range {min}-{max} is inverted")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("ICMP {field} {value} out of range")]
    IcmpOutOfRange { field: &'static str, value: u16 },

    #[error("remote prefix {prefix} does not match the rule's ethertype")]
    FamilyMismatch { prefix: IpPrefix },
}

fn has_ports(protocol: u8) -> bool {
    matches!(protocol, PROTO_TCP | PROTO_UDP | PROTO_SCTP)
}

fn icmp_value(field: &'static str, value: u16) -> Result<u8, CompileError> {
    u8::try_from(value).map_err(|_| CompileError::IcmpOutOfRange { field, value })
}

/// The far-end address is the source of ingress traffic and the
/// destination of egress traffic.
fn with_remote(flow_match: Match, direction: Direction, prefix: IpPrefix) -> Match {
    if prefix.is_default() {
        return flow_match;
    }
    let prefix = prefix.normalized();
    match direction {
        Direction::Ingress => flow_match.ip_src(prefix),
        Direction::Egress => flow_match.ip_dst(prefix),
    }
}

/// Matches for the rule's protocol, ports and CIDR remote. A group remote is
/// left out; see [`compile_rule`].
pub fn rule_templates(rule: &SecurityGroupRule) -> Result<Vec<Match>, CompileError> {
    let mut base = Match::new().eth_type(rule.ethertype.value());

    if let Some(RemoteSelector::Cidr(prefix)) = &rule.remote {
        if prefix.family() != rule.ethertype.family() {
            return Err(CompileError::FamilyMismatch { prefix: *prefix });
        }
        base = with_remote(base, rule.direction, *prefix);
    }

    let Some(protocol) = rule.protocol else {
        return Ok(vec![base]);
    };
    base = base.ip_proto(protocol);

    if rule.ethertype.is_icmp(protocol) {
        if let Some(icmp_type) = rule.port_range_min {
            base = base.icmp_type(icmp_value("type", icmp_type)?);
            if let Some(code) = rule.port_range_max {
                base = base.icmp_code(icmp_value("code", code)?);
            }
        }
        return Ok(vec![base]);
    }

    if !has_ports(protocol) {
        return Ok(vec![base]);
    }
    let (min, max) = match (rule.port_range_min, rule.port_range_max) {
        (None, _) => return Ok(vec![base]),
        (Some(min), None) => (min, min),
        (Some(min), Some(max)) if min > max => return Err(CompileError::InvalidPortRange { min, max }),
        (Some(min), Some(max)) => (min, max),
    };

    let blocks = port_range_masks(min, max);
    if blocks.is_empty() {
        return Ok(vec![base]);
    }
    Ok(blocks
        .into_iter()
        .map(|(value, mask)| base.clone().tp_dst(value, mask))
        .collect())
}

/// Full compilation. For a group remote every template is combined with
/// every member prefix of the rule's family; no members means no matches.
pub fn compile_rule(rule: &SecurityGroupRule, members: &[IpPrefix]) -> Result<Vec<Match>, CompileError> {
    let templates = rule_templates(rule)?;
    if rule.remote_group().is_none() {
        return Ok(templates);
    }

    let family = rule.ethertype.family();
    Ok(templates
        .iter()
        .cartesian_product(members.iter().filter(|prefix| prefix.family() == family))
        .map(|(template, prefix)| with_remote(template.clone(), rule.direction, *prefix))
        .collect())
}
