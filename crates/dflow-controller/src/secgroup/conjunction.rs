//! Bookkeeping for conjunctive clause flows shared between groups and rules.
//!
//! Two rules (of one group or of different groups) can compile to the same
//! match, and a port can be in several active groups. The switch holds one
//! flow per key, so the index keeps the union of every holder's
//! `conjunction(..)` action per key and tells the caller when the flow has
//! to be written or removed.

use crate::model::Direction;
use dflow_ofproto::{Action, Match};
use std::collections::{BTreeMap, BTreeSet};

/// What the caller must do to the switch after an index update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseUpdate {
    Install,
    /// Content (actions or cookie) changed; rewrite in place
    Reinstall,
    Remove,
    Unchanged,
}

/// A clause-1 flow as the index wants it on the switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleClause {
    pub actions: Vec<Action>,
    /// Local id of the lowest holder; its cookie goes on the flow
    pub cookie_rule: u32,
}

#[derive(Debug, Default)]
struct Holders {
    /// rule local id -> conjunction id
    rules: BTreeMap<u32, u32>,
}

impl Holders {
    fn conjunctions(&self) -> BTreeSet<u32> {
        self.rules.values().copied().collect()
    }

    fn clause(&self) -> Option<RuleClause> {
        let cookie_rule = *self.rules.keys().next()?;
        Some(RuleClause {
            actions: conjunction_actions(&self.conjunctions(), 1),
            cookie_rule,
        })
    }
}

pub fn conjunction_actions(ids: &BTreeSet<u32>, clause: u8) -> Vec<Action> {
    ids.iter()
        .map(|id| Action::Conjunction {
            id: *id,
            clause,
            n_clauses: 2,
        })
        .collect()
}

#[derive(Debug, Default)]
pub struct ClauseIndex {
    rules: BTreeMap<(Direction, Match), Holders>,
    ports: BTreeMap<(u32, Direction), BTreeSet<u32>>,
}

impl ClauseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `rule` (feeding conjunction `conj`) as a holder of the match.
    pub fn hold(&mut self, direction: Direction, flow_match: &Match, rule: u32, conj: u32) -> ClauseUpdate {
        let holders = self.rules.entry((direction, flow_match.clone())).or_default();
        let before = holders.clause();
        holders.rules.insert(rule, conj);
        let after = holders.clause();
        match before {
            None => ClauseUpdate::Install,
            Some(_) if before == after => ClauseUpdate::Unchanged,
            Some(_) => ClauseUpdate::Reinstall,
        }
    }

    pub fn release(&mut self, direction: Direction, flow_match: &Match, rule: u32) -> ClauseUpdate {
        let key = (direction, flow_match.clone());
        let Some(holders) = self.rules.get_mut(&key) else {
            return ClauseUpdate::Unchanged;
        };
        let before = holders.clause();
        if holders.rules.remove(&rule).is_none() {
            return ClauseUpdate::Unchanged;
        }
        match holders.clause() {
            None => {
                self.rules.remove(&key);
                ClauseUpdate::Remove
            }
            after if after == before => ClauseUpdate::Unchanged,
            Some(_) => ClauseUpdate::Reinstall,
        }
    }

    pub fn rule_clause(&self, direction: Direction, flow_match: &Match) -> Option<RuleClause> {
        self.rules
            .get(&(direction, flow_match.clone()))
            .and_then(Holders::clause)
    }

    pub fn rule_clauses(&self) -> impl Iterator<Item = (Direction, &Match, RuleClause)> + '_ {
        self.rules
            .iter()
            .filter_map(|((direction, flow_match), holders)| {
                holders.clause().map(|clause| (*direction, flow_match, clause))
            })
    }

    pub fn rule_clause_count(&self) -> usize {
        self.rules.len()
    }

    /// Replaces the set of conjunctions a port's clause-0 flow feeds.
    pub fn set_port_conjunctions(&mut self, port_key: u32, direction: Direction, conjs: BTreeSet<u32>) -> ClauseUpdate {
        let key = (port_key, direction);
        let before = self.ports.remove(&key).unwrap_or_default();
        let update = match (before.is_empty(), conjs.is_empty()) {
            (true, true) => ClauseUpdate::Unchanged,
            (true, false) => ClauseUpdate::Install,
            (false, true) => ClauseUpdate::Remove,
            (false, false) if before == conjs => ClauseUpdate::Unchanged,
            (false, false) => ClauseUpdate::Reinstall,
        };
        if !conjs.is_empty() {
            self.ports.insert(key, conjs);
        }
        update
    }

    pub fn port_conjunctions(&self, port_key: u32, direction: Direction) -> Option<&BTreeSet<u32>> {
        self.ports.get(&(port_key, direction))
    }

    pub fn port_clauses(&self) -> impl Iterator<Item = (u32, Direction, &BTreeSet<u32>)> + '_ {
        self.ports
            .iter()
            .map(|((port_key, direction), conjs)| (*port_key, *direction, conjs))
    }
}
