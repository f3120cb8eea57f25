//! Security group enforcement over connection tracking.
//!
//! Per direction, IP traffic of a local port that has groups is sent
//! through conntrack into the direction's security group table. There,
//! established and related traffic passes, invalid traffic drops, and new
//! connections must satisfy a two-clause conjunction per group:
//!
//! - clause 0: the port register carries a port of the group
//! - clause 1: the packet matches one of the group's compiled rules
//!
//! The conjunction's permit flow commits the connection and continues.
//! A group's conjunction id is its unique key. Its flows exist only while at
//! least one local port is associated with it.

use super::compile::{compile_rule, CompileError};
use super::conjunction::{conjunction_actions, ClauseIndex, ClauseUpdate};
use super::conntrack::ConntrackHelper;
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::dispatch::{App, AppContext, EventKind, Handler, HandlerEntry};
use crate::model::{
    Direction, EtherType, LSwitchId, LogicalPort, LogicalSwitch, ObjectStore, PortId, RuleId,
    SecGroupId, SecurityGroup, SecurityGroupRule,
};
use crate::pipeline::{CookieRegistry, CookieSlot, PipelineError, PriorityBand, Table};
use dflow_app_common::{Acquired, HandlerError, HandlerResult, RefCountMap, Released};
use dflow_ofproto::{Action, Cookie, CtState, Instruction, Match};
use dflow_types::{IpAddress, IpPrefix};
use itertools::Itertools;
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashMap};

pub const SG_RULE_COOKIE: &str = "security_group_rule";
pub const SG_RULE_COOKIE_WIDTH: u8 = 32;

/// Tables and port register used by one direction.
#[derive(Debug, Clone, Copy)]
pub struct DirectionTables {
    pub conntrack: Table,
    pub security_group: Table,
    pub next: Table,
    /// Register holding the port key: source port on egress, destination
    /// port on ingress
    pub port_reg: u8,
}

pub const fn direction_tables(direction: Direction) -> DirectionTables {
    match direction {
        Direction::Egress => DirectionTables {
            conntrack: Table::EgressConntrack,
            security_group: Table::EgressSecurityGroup,
            next: Table::ServicesClassification,
            port_reg: 6,
        },
        Direction::Ingress => DirectionTables {
            conntrack: Table::IngressConntrack,
            security_group: Table::IngressSecurityGroup,
            next: Table::IngressDispatch,
            port_reg: 7,
        },
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecGroupStats {
    pub activations: u64,
    pub deactivations: u64,
    pub rules_installed: u64,
    pub rules_removed: u64,
    pub compile_errors: u64,
    pub missing_dependencies: u64,
    pub conntrack_flushes: u64,
    pub conntrack_failures: u64,
}

type RuleKey = (SecGroupId, RuleId);

/// Enforcement state of a local port with at least one group.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalPort {
    key: u32,
    lswitch: LSwitchId,
    /// None until the port's logical switch is known
    zone: Option<u16>,
    groups: BTreeSet<SecGroupId>,
    addresses: BTreeSet<IpAddress>,
}

/// What a bound port contributes to remote-group member sets.
#[derive(Debug, Clone, Default)]
struct Membership {
    groups: BTreeSet<SecGroupId>,
    prefixes: BTreeSet<IpPrefix>,
}

impl Membership {
    fn pairs(&self) -> BTreeSet<(SecGroupId, IpPrefix)> {
        self.groups
            .iter()
            .cartesian_product(self.prefixes.iter())
            .map(|(group, prefix)| (group.clone(), *prefix))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct InstalledRule {
    rule: SecurityGroupRule,
    local_id: u32,
    conj: u32,
    matches: BTreeSet<Match>,
}

pub struct SecGroupApp {
    slot: Option<CookieSlot>,
    conntrack: Box<dyn ConntrackHelper>,
    local_ports: HashMap<PortId, LocalPort>,
    /// Local ports per group
    associations: RefCountMap<SecGroupId>,
    /// Active groups and their conjunction id
    active: HashMap<SecGroupId, u32>,
    memberships: HashMap<PortId, Membership>,
    members: HashMap<SecGroupId, RefCountMap<IpPrefix>>,
    /// Remote group -> rules naming it
    remote_refs: HashMap<SecGroupId, BTreeSet<RuleKey>>,
    rule_ids: HashMap<RuleKey, u32>,
    free_rule_ids: Vec<u32>,
    next_rule_id: u32,
    installed: HashMap<RuleKey, InstalledRule>,
    clauses: ClauseIndex,
    stats: SecGroupStats,
}

fn ct_state_flows() -> [(Match, bool); 3] {
    let trk = CtState::new().with(CtState::TRK);
    [
        (
            Match::new().ct_state(trk.with(CtState::EST).without(CtState::REL).without(CtState::INV)),
            true,
        ),
        (
            Match::new().ct_state(trk.with(CtState::REL).without(CtState::INV)),
            true,
        ),
        (Match::new().ct_state(trk.with(CtState::INV)), false),
    ]
}

fn port_conntrack_match(tables: &DirectionTables, key: u32, ethertype: EtherType) -> Match {
    Match::new().reg(tables.port_reg, key).eth_type(ethertype.value())
}

impl SecGroupApp {
    pub fn new(conntrack: Box<dyn ConntrackHelper>) -> Self {
        Self {
            slot: None,
            conntrack,
            local_ports: HashMap::new(),
            associations: RefCountMap::new(),
            active: HashMap::new(),
            memberships: HashMap::new(),
            members: HashMap::new(),
            remote_refs: HashMap::new(),
            rule_ids: HashMap::new(),
            free_rule_ids: Vec::new(),
            next_rule_id: 1,
            installed: HashMap::new(),
            clauses: ClauseIndex::new(),
            stats: SecGroupStats::default(),
        }
    }

    pub fn stats(&self) -> &SecGroupStats {
        &self.stats
    }

    pub fn is_active(&self, group: &SecGroupId) -> bool {
        self.active.contains_key(group)
    }

    pub fn conjunction_id(&self, group: &SecGroupId) -> Option<u32> {
        self.active.get(group).copied()
    }

    pub fn association_count(&self, group: &SecGroupId) -> u32 {
        self.associations.count(group)
    }

    pub fn member_count(&self, group: &SecGroupId) -> usize {
        self.members.get(group).map_or(0, RefCountMap::len)
    }

    pub fn rule_local_id(&self, group: &SecGroupId, rule: &RuleId) -> Option<u32> {
        self.rule_ids.get(&(group.clone(), rule.clone())).copied()
    }

    pub fn rule_cookie(&self, group: &SecGroupId, rule: &RuleId) -> Option<Cookie> {
        let local_id = self.rule_local_id(group, rule)?;
        self.slot?.encode(u64::from(local_id)).ok()
    }

    pub fn cookie_slot(&self) -> Option<CookieSlot> {
        self.slot
    }

    fn require_slot(&self) -> HandlerResult<CookieSlot> {
        self.slot
            .ok_or_else(|| HandlerError::internal("security group cookie slot not reserved"))
    }

    // Rule ids

    fn allocate_rule_id(&mut self, key: &RuleKey) -> u32 {
        if let Some(id) = self.rule_ids.get(key) {
            return *id;
        }
        let id = match self.free_rule_ids.pop() {
            Some(id) => id,
            None => {
                let id = self.next_rule_id;
                self.next_rule_id += 1;
                id
            }
        };
        self.rule_ids.insert(key.clone(), id);
        id
    }

    fn release_rule_id(&mut self, key: &RuleKey) {
        if let Some(id) = self.rule_ids.remove(key) {
            self.free_rule_ids.push(id);
        }
    }

    // Static and per-port conntrack flows

    fn install_static_flows(&self, ctx: &mut AppContext<'_>) {
        for direction in Direction::ALL {
            let tables = direction_tables(direction);
            ctx.pipeline
                .install_goto_flow(tables.conntrack, PriorityBand::Default, tables.next, Match::new());
            for (flow_match, pass) in ct_state_flows() {
                if pass {
                    ctx.pipeline
                        .install_goto_flow(tables.security_group, PriorityBand::CtState, tables.next, flow_match);
                } else {
                    ctx.pipeline
                        .install_drop_flow(tables.security_group, PriorityBand::CtState, flow_match);
                }
            }
            ctx.pipeline
                .install_drop_flow(tables.security_group, PriorityBand::Default, Match::new());
        }
    }

    fn install_port_conntrack(ctx: &mut AppContext<'_>, key: u32, zone: u16) {
        for direction in Direction::ALL {
            let tables = direction_tables(direction);
            for ethertype in EtherType::ALL {
                let action = Action::Ct {
                    commit: false,
                    zone: Some(zone),
                    table: Some(tables.security_group.id()),
                };
                ctx.pipeline.install_flow(
                    tables.conntrack,
                    PriorityBand::Medium,
                    port_conntrack_match(&tables, key, ethertype),
                    vec![Instruction::ApplyActions(vec![action])],
                    Cookie::ZERO,
                );
            }
        }
    }

    fn remove_port_conntrack(ctx: &mut AppContext<'_>, key: u32) {
        for direction in Direction::ALL {
            let tables = direction_tables(direction);
            for ethertype in EtherType::ALL {
                ctx.pipeline.remove_flow(
                    tables.conntrack,
                    PriorityBand::Medium,
                    port_conntrack_match(&tables, key, ethertype),
                );
            }
        }
    }

    fn permit_flow(ctx: &mut AppContext<'_>, direction: Direction, conj: u32) {
        let tables = direction_tables(direction);
        ctx.pipeline.install_flow(
            tables.security_group,
            PriorityBand::Medium,
            Match::new().conj_id(conj),
            vec![
                Instruction::ApplyActions(vec![Action::Ct {
                    commit: true,
                    zone: None,
                    table: None,
                }]),
                Instruction::GotoTable(tables.next.id()),
            ],
            Cookie::ZERO,
        );
    }

    // Clause flows

    fn write_port_clause(&mut self, ctx: &mut AppContext<'_>, key: u32, direction: Direction, conjs: BTreeSet<u32>) {
        let tables = direction_tables(direction);
        let flow_match = Match::new().reg(tables.port_reg, key);
        match self.clauses.set_port_conjunctions(key, direction, conjs.clone()) {
            ClauseUpdate::Install | ClauseUpdate::Reinstall => ctx.pipeline.install_flow(
                tables.security_group,
                PriorityBand::Medium,
                flow_match,
                vec![Instruction::ApplyActions(conjunction_actions(&conjs, 0))],
                Cookie::ZERO,
            ),
            ClauseUpdate::Remove => {
                ctx.pipeline
                    .remove_flow(tables.security_group, PriorityBand::Medium, flow_match)
            }
            ClauseUpdate::Unchanged => {}
        }
    }

    /// Rewrites a local port's clause-0 flows from its active groups.
    fn refresh_port_clauses(&mut self, ctx: &mut AppContext<'_>, port: &PortId) {
        let Some(state) = self.local_ports.get(port) else {
            return;
        };
        let key = state.key;
        let conjs: BTreeSet<u32> = state
            .groups
            .iter()
            .filter_map(|group| self.active.get(group).copied())
            .collect();
        for direction in Direction::ALL {
            self.write_port_clause(ctx, key, direction, conjs.clone());
        }
    }

    fn clear_port_clauses(&mut self, ctx: &mut AppContext<'_>, key: u32) {
        for direction in Direction::ALL {
            self.write_port_clause(ctx, key, direction, BTreeSet::new());
        }
    }

    fn refresh_group_ports(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId) {
        let ports: Vec<PortId> = self
            .local_ports
            .iter()
            .filter(|(_, state)| state.groups.contains(group))
            .map(|(id, _)| id.clone())
            .collect();
        for port in ports {
            self.refresh_port_clauses(ctx, &port);
        }
    }

    fn write_rule_clause(&self, ctx: &mut AppContext<'_>, direction: Direction, flow_match: &Match) {
        let (Some(slot), Some(clause)) = (self.slot, self.clauses.rule_clause(direction, flow_match)) else {
            return;
        };
        let cookie = match slot.encode(u64::from(clause.cookie_rule)) {
            Ok(cookie) => cookie,
            Err(e) => {
                warn!("SecGroupApp: rule id {} has no cookie: {}", clause.cookie_rule, e);
                return;
            }
        };
        ctx.pipeline.install_flow(
            direction_tables(direction).security_group,
            PriorityBand::Medium,
            flow_match.clone(),
            vec![Instruction::ApplyActions(clause.actions)],
            cookie,
        );
    }

    fn hold_match(&mut self, ctx: &mut AppContext<'_>, direction: Direction, flow_match: &Match, local_id: u32, conj: u32) {
        match self.clauses.hold(direction, flow_match, local_id, conj) {
            ClauseUpdate::Install | ClauseUpdate::Reinstall => {
                self.write_rule_clause(ctx, direction, flow_match)
            }
            ClauseUpdate::Remove | ClauseUpdate::Unchanged => {}
        }
    }

    /// Drops one holder of a clause-1 match. With `bulk_deleted`, flows
    /// carrying this rule's cookie are already gone from the switch.
    fn release_match(
        &mut self,
        ctx: &mut AppContext<'_>,
        direction: Direction,
        flow_match: &Match,
        local_id: u32,
        bulk_deleted: bool,
    ) {
        match self.clauses.release(direction, flow_match, local_id) {
            ClauseUpdate::Remove if !bulk_deleted => ctx.pipeline.remove_flow(
                direction_tables(direction).security_group,
                PriorityBand::Medium,
                flow_match.clone(),
            ),
            ClauseUpdate::Install | ClauseUpdate::Reinstall => {
                self.write_rule_clause(ctx, direction, flow_match)
            }
            ClauseUpdate::Remove | ClauseUpdate::Unchanged => {}
        }
    }

    // Rules

    /// Member prefixes a rule fans out over. None for rules without a group
    /// remote; empty when the remote group is not known.
    fn remote_members(&self, store: &ObjectStore, rule: &SecurityGroupRule) -> Option<Vec<IpPrefix>> {
        let group = rule.remote_group()?;
        if store.security_group(group).is_none() {
            return Some(Vec::new());
        }
        let mut members: Vec<IpPrefix> = self
            .members
            .get(group)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default();
        members.sort();
        Some(members)
    }

    fn install_rule(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId, conj: u32, rule: &SecurityGroupRule) {
        let key = (group.clone(), rule.id.clone());
        let local_id = self.allocate_rule_id(&key);

        if let Some(remote) = rule.remote_group() {
            if ctx.store.security_group(remote).is_none() {
                self.stats.missing_dependencies += 1;
                warn!(
                    "SecGroupApp: rule {}/{} names unknown remote group {}",
                    group, rule.id, remote
                );
            }
        }
        let members = self.remote_members(ctx.store, rule).unwrap_or_default();
        let matches = match compile_rule(rule, &members) {
            Ok(matches) => matches,
            Err(e) => {
                self.compile_failed(group, rule, &e);
                Vec::new()
            }
        };

        let mut installed = InstalledRule {
            rule: rule.clone(),
            local_id,
            conj,
            matches: BTreeSet::new(),
        };
        for flow_match in matches {
            self.hold_match(ctx, rule.direction, &flow_match, local_id, conj);
            installed.matches.insert(flow_match);
        }
        debug!(
            "SecGroupApp: rule {}/{} installed as {} with {} matches",
            group,
            rule.id,
            local_id,
            installed.matches.len()
        );
        self.installed.insert(key, installed);
        self.stats.rules_installed += 1;
    }

    fn uninstall_rule(&mut self, ctx: &mut AppContext<'_>, key: &RuleKey) -> Option<SecurityGroupRule> {
        let installed = self.installed.remove(key)?;
        let direction = installed.rule.direction;

        let mut bulk_deleted = false;
        if !installed.matches.is_empty() {
            if let Some(slot) = self.slot {
                if let Ok(cookie) = slot.encode(u64::from(installed.local_id)) {
                    ctx.pipeline.remove_flows_by_cookie(
                        Some(direction_tables(direction).security_group),
                        cookie,
                        slot.mask(),
                    );
                    bulk_deleted = true;
                }
            }
        }
        for flow_match in &installed.matches {
            self.release_match(ctx, direction, flow_match, installed.local_id, bulk_deleted);
        }
        self.stats.rules_removed += 1;
        Some(installed.rule)
    }

    /// Recompiles installed rules that name `remote`, after that group
    /// appeared or went away.
    fn refresh_remote_rules(&mut self, ctx: &mut AppContext<'_>, remote: &SecGroupId) {
        let keys: Vec<RuleKey> = self
            .remote_refs
            .get(remote)
            .map(|keys| keys.iter().filter(|key| self.installed.contains_key(*key)).cloned().collect())
            .unwrap_or_default();
        for key in keys {
            let Some(installed) = self.installed.get(&key) else {
                continue;
            };
            let conj = installed.conj;
            if let Some(rule) = self.uninstall_rule(ctx, &key) {
                self.install_rule(ctx, &key.0, conj, &rule);
            }
        }
    }

    fn compile_failed(&mut self, group: &SecGroupId, rule: &SecurityGroupRule, e: &CompileError) {
        self.stats.compile_errors += 1;
        warn!("SecGroupApp: rule {}/{} compiles to nothing: {}", group, rule.id, e);
    }

    // Group activation

    fn activate(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId) {
        if self.active.contains_key(group) {
            return;
        }
        let Some(sg) = ctx.store.security_group(group).cloned() else {
            self.stats.missing_dependencies += 1;
            warn!("SecGroupApp: group {} is associated but unknown, waiting for it", group);
            return;
        };

        let conj = sg.unique_key;
        self.active.insert(group.clone(), conj);
        for direction in Direction::ALL {
            Self::permit_flow(ctx, direction, conj);
        }
        for rule in &sg.rules {
            self.install_rule(ctx, group, conj, rule);
        }
        self.refresh_group_ports(ctx, group);

        self.stats.activations += 1;
        info!("SecGroupApp: activated {} as conjunction {}", group, conj);
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "SecGroupApp", "activate_group")
            .with_object_id(group.to_string())
            .with_object_type("security_group")
            .with_details(serde_json::json!({
                "conjunction_id": conj,
                "rules": sg.rules.len(),
                "associations": self.associations.count(group),
            }))
            .with_outcome(AuditOutcome::Success));
    }

    fn deactivate(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId) {
        let Some(conj) = self.active.remove(group) else {
            return;
        };

        let rules: Vec<RuleKey> = self
            .installed
            .keys()
            .filter(|(owner, _)| owner == group)
            .cloned()
            .collect();
        for key in &rules {
            self.uninstall_rule(ctx, key);
        }
        for direction in Direction::ALL {
            ctx.pipeline.remove_flow(
                direction_tables(direction).security_group,
                PriorityBand::Medium,
                Match::new().conj_id(conj),
            );
        }
        self.refresh_group_ports(ctx, group);

        self.stats.deactivations += 1;
        info!("SecGroupApp: deactivated {} (conjunction {})", group, conj);
        audit_log!(AuditRecord::new(AuditCategory::SecurityPolicy, "SecGroupApp", "deactivate_group")
            .with_object_id(group.to_string())
            .with_object_type("security_group")
            .with_details(serde_json::json!({ "conjunction_id": conj, "rules": rules.len() }))
            .with_outcome(AuditOutcome::Success));
    }

    fn associate(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId) {
        if self.associations.acquire(group.clone()) == Acquired::First {
            self.activate(ctx, group);
        }
    }

    fn dissociate(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId) {
        match self.associations.release(group) {
            Ok(Released::Last) => self.deactivate(ctx, group),
            Ok(Released::Remaining(_)) => {}
            Err(e) => warn!("SecGroupApp: dissociating {}: {}", group, e),
        }
    }

    // Member sets

    fn member_added(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId, prefix: IpPrefix) {
        if ctx.store.security_group(group).is_none() {
            return;
        }
        for key in self.referencing_rules(group) {
            let Some(installed) = self.installed.get(&key) else {
                continue;
            };
            let (rule, local_id, conj) = (installed.rule.clone(), installed.local_id, installed.conj);
            let matches = match compile_rule(&rule, &[prefix]) {
                Ok(matches) => matches,
                Err(e) => {
                    self.compile_failed(&key.0, &rule, &e);
                    continue;
                }
            };
            for flow_match in matches {
                let fresh = self
                    .installed
                    .get_mut(&key)
                    .is_some_and(|installed| installed.matches.insert(flow_match.clone()));
                if fresh {
                    self.hold_match(ctx, rule.direction, &flow_match, local_id, conj);
                }
            }
        }
    }

    fn member_removed(&mut self, ctx: &mut AppContext<'_>, group: &SecGroupId, prefix: IpPrefix) {
        for key in self.referencing_rules(group) {
            let Some(installed) = self.installed.get(&key) else {
                continue;
            };
            let (rule, local_id) = (installed.rule.clone(), installed.local_id);
            let Ok(matches) = compile_rule(&rule, &[prefix]) else {
                continue;
            };
            for flow_match in matches {
                let held = self
                    .installed
                    .get_mut(&key)
                    .is_some_and(|installed| installed.matches.remove(&flow_match));
                if held {
                    self.release_match(ctx, rule.direction, &flow_match, local_id, false);
                }
            }
        }
    }

    fn referencing_rules(&self, group: &SecGroupId) -> Vec<RuleKey> {
        self.remote_refs
            .get(group)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn index_remote_refs(&mut self, old: Option<&SecurityGroup>, new: Option<&SecurityGroup>) {
        if let Some(sg) = old {
            for rule in &sg.rules {
                if let Some(remote) = rule.remote_group() {
                    if let Some(keys) = self.remote_refs.get_mut(remote) {
                        keys.remove(&(sg.id.clone(), rule.id.clone()));
                        if keys.is_empty() {
                            self.remote_refs.remove(remote);
                        }
                    }
                }
            }
        }
        if let Some(sg) = new {
            for rule in &sg.rules {
                if let Some(remote) = rule.remote_group() {
                    self.remote_refs
                        .entry(remote.clone())
                        .or_default()
                        .insert((sg.id.clone(), rule.id.clone()));
                }
            }
        }
    }

    /// Brings a port's contribution to member sets in line with `port`
    /// (None once it is no longer bound anywhere).
    fn sync_membership(&mut self, ctx: &mut AppContext<'_>, id: &PortId, port: Option<&LogicalPort>) {
        let new = port
            .filter(|port| port.port_security_enabled)
            .map(|port| Membership {
                groups: port.security_groups.iter().cloned().collect(),
                prefixes: port.member_addresses().into_iter().collect(),
            })
            .unwrap_or_default();
        let old = self.memberships.remove(id).unwrap_or_default();

        let old_pairs = old.pairs();
        let new_pairs = new.pairs();
        if !new_pairs.is_empty() {
            self.memberships.insert(id.clone(), new);
        }

        for (group, prefix) in old_pairs.difference(&new_pairs) {
            let last = match self.members.get_mut(group).map(|members| members.release(prefix)) {
                Some(Ok(Released::Last)) => true,
                Some(Ok(Released::Remaining(_))) => false,
                Some(Err(e)) => {
                    warn!("SecGroupApp: member {} of {}: {}", prefix, group, e);
                    false
                }
                None => false,
            };
            if self.members.get(group).is_some_and(RefCountMap::is_empty) {
                self.members.remove(group);
            }
            if last {
                self.member_removed(ctx, group, *prefix);
            }
        }
        for (group, prefix) in new_pairs.difference(&old_pairs) {
            let first = self.members.entry(group.clone()).or_default().acquire(*prefix) == Acquired::First;
            if first {
                self.member_added(ctx, group, *prefix);
            }
        }
    }

    // Local ports

    fn zone_for(&mut self, store: &ObjectStore, port: &LogicalPort) -> Option<u16> {
        let Some(lswitch) = store.lswitch(&port.lswitch) else {
            self.stats.missing_dependencies += 1;
            warn!(
                "SecGroupApp: port {} is on unknown logical switch {}, conntrack deferred",
                port.id, port.lswitch
            );
            return None;
        };
        match u16::try_from(lswitch.unique_key) {
            Ok(zone) => Some(zone),
            Err(_) => {
                warn!(
                    "SecGroupApp: logical switch {} key {} does not fit a conntrack zone",
                    lswitch.id, lswitch.unique_key
                );
                None
            }
        }
    }

    fn flush_addresses(&mut self, addresses: impl IntoIterator<Item = IpAddress>, zone: Option<u16>) {
        let Some(zone) = zone else {
            return;
        };
        for address in addresses {
            match self.conntrack.flush(address, zone) {
                Ok(()) => self.stats.conntrack_flushes += 1,
                Err(e) => {
                    self.stats.conntrack_failures += 1;
                    warn!("SecGroupApp: conntrack flush of {} in zone {} failed: {}", address, zone, e);
                }
            }
        }
    }

    /// Brings a local port's enforcement in line with `port` (None once it
    /// is no longer bound here).
    fn sync_local_port(&mut self, ctx: &mut AppContext<'_>, id: &PortId, port: Option<&LogicalPort>) {
        let new = match port.filter(|port| port.port_security_enabled && !port.security_groups.is_empty()) {
            Some(port) => Some(LocalPort {
                key: port.unique_key,
                lswitch: port.lswitch.clone(),
                zone: self.zone_for(ctx.store, port),
                groups: port.security_groups.iter().cloned().collect(),
                addresses: port.fixed_ips().into_iter().collect(),
            }),
            None => None,
        };
        let old = self.local_ports.remove(id);
        if old == new {
            if let Some(state) = old {
                self.local_ports.insert(id.clone(), state);
            }
            return;
        }

        if let Some(old) = &old {
            let same_datapath = new
                .as_ref()
                .is_some_and(|new| new.key == old.key && new.zone == old.zone);
            if !same_datapath {
                Self::remove_port_conntrack(ctx, old.key);
            }
            if new.as_ref().map(|new| new.key) != Some(old.key) {
                self.clear_port_clauses(ctx, old.key);
            }
        }

        let old_groups = old.as_ref().map(|state| state.groups.clone()).unwrap_or_default();
        let new_groups = new.as_ref().map(|state| state.groups.clone()).unwrap_or_default();
        let datapath = new.as_ref().map(|state| (state.key, state.zone));
        if let Some(state) = new.clone() {
            self.local_ports.insert(id.clone(), state);
        }

        for group in old_groups.difference(&new_groups) {
            self.dissociate(ctx, group);
        }
        for group in new_groups.difference(&old_groups) {
            self.associate(ctx, group);
        }

        if let Some((key, zone)) = datapath {
            if let Some(zone) = zone {
                Self::install_port_conntrack(ctx, key, zone);
            }
            self.refresh_port_clauses(ctx, id);
        }

        if let Some(old) = old {
            let flushed: Vec<IpAddress> = match &new {
                Some(new) if new.zone == old.zone => old.addresses.difference(&new.addresses).copied().collect(),
                _ => old.addresses.iter().copied().collect(),
            };
            self.flush_addresses(flushed, old.zone);
        }
    }

    // Handlers

    fn on_local_port(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
        self.require_slot()?;
        self.sync_membership(ctx, &port.id, Some(port));
        self.sync_local_port(ctx, &port.id, Some(port));
        Ok(())
    }

    fn on_local_port_gone(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
        self.require_slot()?;
        self.sync_local_port(ctx, &port.id, None);
        self.sync_membership(ctx, &port.id, None);
        Ok(())
    }

    fn on_remote_port(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
        self.require_slot()?;
        self.sync_membership(ctx, &port.id, Some(port));
        Ok(())
    }

    fn on_remote_port_gone(&mut self, ctx: &mut AppContext<'_>, port: &LogicalPort, _old: Option<&LogicalPort>) -> HandlerResult<()> {
        self.require_slot()?;
        self.sync_membership(ctx, &port.id, None);
        Ok(())
    }

    fn on_group_created(&mut self, ctx: &mut AppContext<'_>, sg: &SecurityGroup, _old: Option<&SecurityGroup>) -> HandlerResult<()> {
        self.require_slot()?;
        self.index_remote_refs(None, Some(sg));
        if self.associations.contains(&sg.id) {
            self.activate(ctx, &sg.id);
        }
        self.refresh_remote_rules(ctx, &sg.id);
        Ok(())
    }

    fn on_group_updated(&mut self, ctx: &mut AppContext<'_>, sg: &SecurityGroup, old: Option<&SecurityGroup>) -> HandlerResult<()> {
        self.require_slot()?;
        let old = old.ok_or_else(|| HandlerError::internal("group update without previous snapshot"))?;
        self.index_remote_refs(Some(old), Some(sg));

        for rule in &old.rules {
            if sg.rule(&rule.id).is_none() {
                let key = (sg.id.clone(), rule.id.clone());
                self.uninstall_rule(ctx, &key);
                self.release_rule_id(&key);
            }
        }

        match self.active.get(&sg.id).copied() {
            Some(conj) if conj != sg.unique_key => {
                self.deactivate(ctx, &sg.id);
                self.activate(ctx, &sg.id);
            }
            Some(conj) => {
                for rule in &sg.rules {
                    let key = (sg.id.clone(), rule.id.clone());
                    let unchanged = self
                        .installed
                        .get(&key)
                        .is_some_and(|installed| installed.rule == *rule);
                    if !unchanged {
                        self.uninstall_rule(ctx, &key);
                        self.install_rule(ctx, &sg.id, conj, rule);
                    }
                }
            }
            None if self.associations.contains(&sg.id) => self.activate(ctx, &sg.id),
            None => {}
        }
        Ok(())
    }

    fn on_group_deleted(&mut self, ctx: &mut AppContext<'_>, sg: &SecurityGroup, _old: Option<&SecurityGroup>) -> HandlerResult<()> {
        self.require_slot()?;
        self.deactivate(ctx, &sg.id);
        self.index_remote_refs(Some(sg), None);

        let keys: Vec<RuleKey> = self
            .rule_ids
            .keys()
            .filter(|(owner, _)| *owner == sg.id)
            .cloned()
            .collect();
        for key in &keys {
            self.release_rule_id(key);
        }
        self.refresh_remote_rules(ctx, &sg.id);
        Ok(())
    }

    fn on_lswitch_changed(&mut self, ctx: &mut AppContext<'_>, lswitch: &LogicalSwitch, _old: Option<&LogicalSwitch>) -> HandlerResult<()> {
        let ports: Vec<PortId> = self
            .local_ports
            .iter()
            .filter(|(_, state)| state.lswitch == lswitch.id)
            .map(|(id, _)| id.clone())
            .collect();
        let waiting: Vec<PortId> = ctx
            .store
            .ports()
            .filter(|port| port.lswitch == lswitch.id && !self.local_ports.contains_key(&port.id))
            .filter(|port| {
                port.binding
                    .as_ref()
                    .is_some_and(|binding| binding.is_on_chassis(ctx.local_chassis))
            })
            .map(|port| port.id.clone())
            .collect();

        for id in ports.into_iter().chain(waiting) {
            let port = ctx.store.port(&id).cloned();
            self.sync_local_port(ctx, &id, port.as_ref());
        }
        Ok(())
    }
}

const HANDLERS: &[HandlerEntry<SecGroupApp>] = &[
    HandlerEntry::new(EventKind::BindLocal, Handler::Port(SecGroupApp::on_local_port)),
    HandlerEntry::new(EventKind::LocalUpdated, Handler::Port(SecGroupApp::on_local_port)),
    HandlerEntry::new(EventKind::UnbindLocal, Handler::Port(SecGroupApp::on_local_port_gone)),
    HandlerEntry::new(EventKind::BindRemote, Handler::Port(SecGroupApp::on_remote_port)),
    HandlerEntry::new(EventKind::RemoteUpdated, Handler::Port(SecGroupApp::on_remote_port)),
    HandlerEntry::new(EventKind::UnbindRemote, Handler::Port(SecGroupApp::on_remote_port_gone)),
    HandlerEntry::new(EventKind::Created, Handler::SecurityGroup(SecGroupApp::on_group_created)),
    HandlerEntry::new(EventKind::Updated, Handler::SecurityGroup(SecGroupApp::on_group_updated)),
    HandlerEntry::new(EventKind::Deleted, Handler::SecurityGroup(SecGroupApp::on_group_deleted)),
    HandlerEntry::new(EventKind::Created, Handler::LogicalSwitch(SecGroupApp::on_lswitch_changed)),
    HandlerEntry::new(EventKind::Updated, Handler::LogicalSwitch(SecGroupApp::on_lswitch_changed)),
    HandlerEntry::new(EventKind::Deleted, Handler::LogicalSwitch(SecGroupApp::on_lswitch_changed)),
];

impl App for SecGroupApp {
    fn name(&self) -> &'static str {
        "security_group"
    }

    fn handlers() -> &'static [HandlerEntry<Self>] {
        HANDLERS
    }

    fn reserve_cookies(&mut self, registry: &mut CookieRegistry) -> Result<(), PipelineError> {
        self.slot = Some(registry.reserve(SG_RULE_COOKIE, SG_RULE_COOKIE_WIDTH)?);
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut AppContext<'_>) {
        self.install_static_flows(ctx);
    }

    /// Replays every flow the current state implies.
    fn on_session_established(&mut self, ctx: &mut AppContext<'_>) {
        self.install_static_flows(ctx);

        for state in self.local_ports.values() {
            if let Some(zone) = state.zone {
                Self::install_port_conntrack(ctx, state.key, zone);
            }
        }
        for conj in self.active.values() {
            for direction in Direction::ALL {
                Self::permit_flow(ctx, direction, *conj);
            }
        }
        for (key, direction, conjs) in self.clauses.port_clauses() {
            let tables = direction_tables(direction);
            ctx.pipeline.install_flow(
                tables.security_group,
                PriorityBand::Medium,
                Match::new().reg(tables.port_reg, key),
                vec![Instruction::ApplyActions(conjunction_actions(conjs, 0))],
                Cookie::ZERO,
            );
        }
        let clauses: Vec<(Direction, Match)> = self
            .clauses
            .rule_clauses()
            .map(|(direction, flow_match, _)| (direction, flow_match.clone()))
            .collect();
        for (direction, flow_match) in &clauses {
            self.write_rule_clause(ctx, *direction, flow_match);
        }

        info!(
            "SecGroupApp: replayed {} local ports, {} active groups, {} rule clauses",
            self.local_ports.len(),
            self.active.len(),
            clauses.len()
        );
    }
}
