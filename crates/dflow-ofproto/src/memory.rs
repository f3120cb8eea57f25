//! In-memory switch flow table.
//!
//! [`MemorySwitch`] applies flow mods with the switch's keying rules and is
//! cheap to clone; clones share one table, so a test can hand one clone to
//! the controller and inspect the other.

use crate::channel::{SwitchChannel, TableSelector};
use crate::error::{OfError, OfResult, OfStatus};
use crate::flow::{FlowEntry, FlowKey, FlowMod, FlowModCommand};
use crate::types::TableId;
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
struct SwitchState {
    flows: BTreeMap<FlowKey, FlowEntry>,
    connected: bool,
    failing_mods: usize,
    failing_dumps: bool,
    mod_log: Vec<FlowMod>,
}

#[derive(Debug, Clone)]
pub struct MemorySwitch {
    state: Arc<Mutex<SwitchState>>,
}

impl Default for MemorySwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySwitch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SwitchState {
                flows: BTreeMap::new(),
                connected: true,
                failing_mods: 0,
                failing_dumps: false,
                mod_log: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SwitchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All installed flows ordered by key.
    pub fn flows(&self) -> Vec<FlowEntry> {
        self.lock().flows.values().cloned().collect()
    }

    pub fn flows_in(&self, table: TableId) -> Vec<FlowEntry> {
        self.lock()
            .flows
            .values()
            .filter(|entry| entry.table == table)
            .cloned()
            .collect()
    }

    pub fn flow_count(&self) -> usize {
        self.lock().flows.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<FlowEntry> {
        self.lock().flows.get(key).cloned()
    }

    /// Every flow mod accepted since creation or the last [`Self::clear_log`].
    pub fn flow_mods(&self) -> Vec<FlowMod> {
        self.lock().mod_log.clone()
    }

    pub fn clear_log(&self) {
        self.lock().mod_log.clear();
    }

    pub fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    /// Rejects the next `count` flow mods with `OFPET_FLOW_MOD_FAILED`.
    pub fn fail_next_flow_mods(&self, count: usize) {
        self.lock().failing_mods = count;
    }

    pub fn fail_dumps(&self, failing: bool) {
        self.lock().failing_dumps = failing;
    }
}

impl SwitchChannel for MemorySwitch {
    fn send_flow_mod(&mut self, flow_mod: &FlowMod) -> OfResult<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(OfError::Disconnected);
        }
        if state.failing_mods > 0 {
            state.failing_mods -= 1;
            return Err(OfError::from_status(OfStatus::FlowModFailed));
        }

        match flow_mod.command {
            FlowModCommand::Add => {
                let TableSelector::Table(table) = flow_mod.table else {
                    return Err(OfError::invalid_parameter("add requires a single table"));
                };
                let entry = FlowEntry {
                    table,
                    priority: flow_mod.priority,
                    flow_match: flow_mod.flow_match.clone(),
                    cookie: flow_mod.cookie,
                    instructions: flow_mod.instructions.clone(),
                };
                state.flows.insert(entry.key(), entry);
            }
            FlowModCommand::DeleteStrict => {
                let TableSelector::Table(table) = flow_mod.table else {
                    return Err(OfError::invalid_parameter("strict delete requires a single table"));
                };
                let key = FlowKey {
                    table,
                    priority: flow_mod.priority,
                    flow_match: flow_mod.flow_match.clone(),
                };
                let cookie_agrees = state
                    .flows
                    .get(&key)
                    .is_some_and(|e| e.cookie.matches(flow_mod.cookie, flow_mod.cookie_mask));
                if cookie_agrees {
                    state.flows.remove(&key);
                }
            }
            FlowModCommand::Delete => {
                let before = state.flows.len();
                state.flows.retain(|_, entry| {
                    !(flow_mod.table.includes(entry.table)
                        && flow_mod.flow_match.is_subset_of(&entry.flow_match)
                        && entry.cookie.matches(flow_mod.cookie, flow_mod.cookie_mask))
                });
                debug!(
                    "MemorySwitch: {} removed {} flows",
                    flow_mod,
                    before - state.flows.len()
                );
            }
        }

        state.mod_log.push(flow_mod.clone());
        Ok(())
    }

    fn dump_flows(&mut self, table: TableSelector) -> OfResult<Vec<FlowEntry>> {
        let state = self.lock();
        if !state.connected {
            return Err(OfError::Disconnected);
        }
        if state.failing_dumps {
            return Err(OfError::timeout("flow stats reply"));
        }
        Ok(state
            .flows
            .values()
            .filter(|entry| table.includes(entry.table))
            .cloned()
            .collect())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
