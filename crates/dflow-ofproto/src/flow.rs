//! Flow entries: match fields, actions, instructions and flow mods.
//!
//! A flow is identified on the switch by its [`FlowKey`]
//! (table, priority, match). Adding a flow with an existing key replaces
//! it, which is what makes blind replay safe.

use crate::channel::TableSelector;
use crate::types::{Cookie, Priority, TableId};
use dflow_types::{IpFamily, IpPrefix};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Connection-tracking state match (`ct_state=+trk+est-inv`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CtState {
    flags: u32,
    mask: u32,
}

impl CtState {
    pub const NEW: u32 = 0x01;
    pub const EST: u32 = 0x02;
    pub const REL: u32 = 0x04;
    pub const RPL: u32 = 0x08;
    pub const INV: u32 = 0x10;
    pub const TRK: u32 = 0x20;

    const NAMES: [(u32, &'static str); 6] = [
        (Self::TRK, "trk"),
        (Self::NEW, "new"),
        (Self::EST, "est"),
        (Self::REL, "rel"),
        (Self::RPL, "rpl"),
        (Self::INV, "inv"),
    ];

    pub const fn new() -> Self {
        CtState { flags: 0, mask: 0 }
    }

    /// Requires `flag` to be set.
    pub const fn with(self, flag: u32) -> Self {
        CtState {
            flags: self.flags | flag,
            mask: self.mask | flag,
        }
    }

    /// Requires `flag` to be clear.
    pub const fn without(self, flag: u32) -> Self {
        CtState {
            flags: self.flags & !flag,
            mask: self.mask | flag,
        }
    }
}

impl fmt::Display for CtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, name) in Self::NAMES {
            if self.mask & flag != 0 {
                let sign = if self.flags & flag != 0 { '+' } else { '-' };
                write!(f, "{}{}", sign, name)?;
            }
        }
        Ok(())
    }
}

/// Discriminant of a [`MatchField`]; a match holds at most one field per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldKind {
    Reg(u8),
    EthType,
    IpProto,
    IpSrc,
    IpDst,
    TpDst,
    IcmpType,
    IcmpCode,
    CtState,
    ConjId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchField {
    Reg { index: u8, value: u32 },
    EthType(u16),
    IpProto(u8),
    IpSrc(IpPrefix),
    IpDst(IpPrefix),
    /// L4 destination port under a bitmask; the protocol comes from `IpProto`.
    TpDst { value: u16, mask: u16 },
    IcmpType(u8),
    IcmpCode(u8),
    CtState(CtState),
    ConjId(u32),
}

impl MatchField {
    pub const fn kind(&self) -> FieldKind {
        match self {
            MatchField::Reg { index, .. } => FieldKind::Reg(*index),
            MatchField::EthType(_) => FieldKind::EthType,
            MatchField::IpProto(_) => FieldKind::IpProto,
            MatchField::IpSrc(_) => FieldKind::IpSrc,
            MatchField::IpDst(_) => FieldKind::IpDst,
            MatchField::TpDst { .. } => FieldKind::TpDst,
            MatchField::IcmpType(_) => FieldKind::IcmpType,
            MatchField::IcmpCode(_) => FieldKind::IcmpCode,
            MatchField::CtState(_) => FieldKind::CtState,
            MatchField::ConjId(_) => FieldKind::ConjId,
        }
    }
}

fn ip_field_name(prefix: &IpPrefix, v4: &'static str, v6: &'static str) -> &'static str {
    match prefix.family() {
        IpFamily::Ipv4 => v4,
        IpFamily::Ipv6 => v6,
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchField::Reg { index, value } => write!(f, "reg{}=0x{:x}", index, value),
            MatchField::EthType(ty) => write!(f, "dl_type=0x{:04x}", ty),
            MatchField::IpProto(proto) => write!(f, "nw_proto={}", proto),
            MatchField::IpSrc(p) => write!(f, "{}={}", ip_field_name(p, "nw_src", "ipv6_src"), p),
            MatchField::IpDst(p) => write!(f, "{}={}", ip_field_name(p, "nw_dst", "ipv6_dst"), p),
            MatchField::TpDst { value, mask } if *mask == u16::MAX => write!(f, "tp_dst={}", value),
            MatchField::TpDst { value, mask } => write!(f, "tp_dst=0x{:x}/0x{:x}", value, mask),
            MatchField::IcmpType(ty) => write!(f, "icmp_type={}", ty),
            MatchField::IcmpCode(code) => write!(f, "icmp_code={}", code),
            MatchField::CtState(state) => write!(f, "ct_state={}", state),
            MatchField::ConjId(id) => write!(f, "conj_id={}", id),
        }
    }
}

/// A set of match fields, at most one per [`FieldKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Match(BTreeMap<FieldKind, MatchField>);

impl Match {
    pub fn new() -> Self {
        Match(BTreeMap::new())
    }

    /// Adds `field`, replacing any field of the same kind.
    pub fn with(mut self, field: MatchField) -> Self {
        self.insert(field);
        self
    }

    pub fn insert(&mut self, field: MatchField) {
        self.0.insert(field.kind(), field);
    }

    pub fn get(&self, kind: FieldKind) -> Option<&MatchField> {
        self.0.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &MatchField> {
        self.0.values()
    }

    /// Returns true if every field of `self` is present, with the same
    /// value, in `other`. The empty match is a subset of everything.
    pub fn is_subset_of(&self, other: &Match) -> bool {
        self.0
            .iter()
            .all(|(kind, field)| other.0.get(kind) == Some(field))
    }

    pub fn reg(self, index: u8, value: u32) -> Self {
        self.with(MatchField::Reg { index, value })
    }

    pub fn eth_type(self, ty: u16) -> Self {
        self.with(MatchField::EthType(ty))
    }

    pub fn ip_proto(self, proto: u8) -> Self {
        self.with(MatchField::IpProto(proto))
    }

    pub fn ip_src(self, prefix: IpPrefix) -> Self {
        self.with(MatchField::IpSrc(prefix))
    }

    pub fn ip_dst(self, prefix: IpPrefix) -> Self {
        self.with(MatchField::IpDst(prefix))
    }

    pub fn tp_dst(self, value: u16, mask: u16) -> Self {
        self.with(MatchField::TpDst { value, mask })
    }

    pub fn icmp_type(self, ty: u8) -> Self {
        self.with(MatchField::IcmpType(ty))
    }

    pub fn icmp_code(self, code: u8) -> Self {
        self.with(MatchField::IcmpCode(code))
    }

    pub fn ct_state(self, state: CtState) -> Self {
        self.with(MatchField::CtState(state))
    }

    pub fn conj_id(self, id: u32) -> Self {
        self.with(MatchField::ConjId(id))
    }
}

impl fmt::Display for Match {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "any");
        }
        for (i, field) in self.0.values().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", field)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Output(u32),
    /// `conjunction(id, clause+1/n_clauses)`; `clause` is zero-based here.
    Conjunction { id: u32, clause: u8, n_clauses: u8 },
    /// Send through connection tracking, optionally committing and
    /// recirculating into `table`. A `zone` of `None` reuses the zone the
    /// packet was last tracked in.
    Ct {
        commit: bool,
        zone: Option<u16>,
        table: Option<TableId>,
    },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Output(port) => write!(f, "output:{}", port),
            Action::Conjunction {
                id,
                clause,
                n_clauses,
            } => write!(f, "conjunction({},{}/{})", id, u16::from(*clause) + 1, n_clauses),
            Action::Ct {
                commit,
                zone,
                table,
            } => {
                write!(f, "ct(")?;
                if *commit {
                    write!(f, "commit,")?;
                }
                match zone {
                    Some(zone) => write!(f, "zone={}", zone)?,
                    None => write!(f, "zone=NXM_NX_CT_ZONE[]")?,
                }
                if let Some(table) = table {
                    write!(f, ",table={}", table.0)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instruction {
    ApplyActions(Vec<Action>),
    GotoTable(TableId),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::ApplyActions(actions) => {
                for (i, action) in actions.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", action)?;
                }
                Ok(())
            }
            Instruction::GotoTable(table) => write!(f, "goto_table:{}", table.0),
        }
    }
}

/// Identity of a flow on the switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub table: TableId,
    pub priority: Priority,
    pub flow_match: Match,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.table, self.priority, self.flow_match)
    }
}

/// An installed flow as reported by a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub table: TableId,
    pub priority: Priority,
    pub flow_match: Match,
    pub cookie: Cookie,
    pub instructions: Vec<Instruction>,
}

impl FlowEntry {
    pub fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            flow_match: self.flow_match.clone(),
        }
    }

    /// All apply-actions of this flow, in order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.instructions.iter().flat_map(|inst| match inst {
            Instruction::ApplyActions(actions) => actions.as_slice(),
            Instruction::GotoTable(_) => &[][..],
        })
    }

    /// Conjunction ids this flow contributes a clause to.
    pub fn conjunction_ids(&self) -> Vec<u32> {
        self.actions()
            .filter_map(|action| match action {
                Action::Conjunction { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// True when the flow has no actions and no goto, i.e. drops.
    pub fn is_drop(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl fmt::Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {}, {} actions=",
            self.cookie, self.table, self.priority, self.flow_match
        )?;
        if self.instructions.is_empty() {
            return write!(f, "drop");
        }
        for (i, inst) in self.instructions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", inst)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowModCommand {
    /// Add or replace the flow at the exact key.
    Add,
    /// Delete every flow in the selected tables whose match contains the
    /// given match and whose cookie agrees under `cookie_mask`.
    Delete,
    /// Delete the flow at the exact key.
    DeleteStrict,
}

/// A flow-table edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub table: TableSelector,
    pub priority: Priority,
    pub flow_match: Match,
    pub cookie: Cookie,
    pub cookie_mask: u64,
    pub instructions: Vec<Instruction>,
}

impl FlowMod {
    pub fn add(
        table: TableId,
        priority: Priority,
        flow_match: Match,
        cookie: Cookie,
        instructions: Vec<Instruction>,
    ) -> Self {
        FlowMod {
            command: FlowModCommand::Add,
            table: TableSelector::Table(table),
            priority,
            flow_match,
            cookie,
            cookie_mask: 0,
            instructions,
        }
    }

    pub fn delete_strict(table: TableId, priority: Priority, flow_match: Match) -> Self {
        FlowMod {
            command: FlowModCommand::DeleteStrict,
            table: TableSelector::Table(table),
            priority,
            flow_match,
            cookie: Cookie::ZERO,
            cookie_mask: 0,
            instructions: Vec::new(),
        }
    }

    pub fn delete(table: TableSelector, flow_match: Match, cookie: Cookie, cookie_mask: u64) -> Self {
        FlowMod {
            command: FlowModCommand::Delete,
            table,
            priority: Priority(0),
            flow_match,
            cookie,
            cookie_mask,
            instructions: Vec::new(),
        }
    }
}

impl fmt::Display for FlowMod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            FlowModCommand::Add => write!(
                f,
                "add {} {} {} {}",
                self.table, self.priority, self.flow_match, self.cookie
            ),
            FlowModCommand::DeleteStrict => write!(
                f,
                "del-strict {} {} {}",
                self.table, self.priority, self.flow_match
            ),
            FlowModCommand::Delete => write!(
                f,
                "del {} {} {}/0x{:x}",
                self.table, self.flow_match, self.cookie, self.cookie_mask
            ),
        }
    }
}
