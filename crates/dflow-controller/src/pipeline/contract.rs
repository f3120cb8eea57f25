//! The flow pipeline contract every module installs flows through.
//!
//! Edits are keyed by (table, priority, match): installing an existing key
//! replaces it and removing a missing key is a no-op, so a module can replay
//! its whole state after a reconnect without reading the switch first.
//! Every installed flow carries the current aging generation in its cookie.
//!
//! The infallible methods log and count southbound errors and carry on;
//! the `try_` variants return them for callers that need to react.

use super::session::SwitchSession;
use super::tables::{PriorityBand, Table};
use crate::aging::GenerationHandle;
use dflow_ofproto::{
    Cookie, FlowEntry, FlowMod, Instruction, Match, OfError, OfResult, TableSelector,
};
use log::{debug, error, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub flows_installed: u64,
    pub flows_removed: u64,
    pub bulk_deletes: u64,
    /// Edits skipped while no session was up
    pub deferred: u64,
    pub southbound_errors: u64,
    pub backward_gotos: u64,
}

pub struct FlowPipeline {
    session: SwitchSession,
    generation: GenerationHandle,
    stats: PipelineStats,
}

impl FlowPipeline {
    pub fn new(session: SwitchSession, generation: GenerationHandle) -> Self {
        Self {
            session,
            generation,
            stats: PipelineStats::default(),
        }
    }

    pub fn session(&self) -> &SwitchSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SwitchSession {
        &mut self.session
    }

    pub fn is_established(&self) -> bool {
        self.session.is_established()
    }

    pub fn generation(&self) -> &GenerationHandle {
        &self.generation
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn install_flow(
        &mut self,
        table: Table,
        band: PriorityBand,
        flow_match: Match,
        instructions: Vec<Instruction>,
        cookie: Cookie,
    ) {
        if let Err(e) = self.try_install_flow(table, band, flow_match, instructions, cookie) {
            self.log_failure("install", table, &e);
        }
    }

    pub fn install_goto_flow(&mut self, table: Table, band: PriorityBand, goto: Table, flow_match: Match) {
        self.install_flow(
            table,
            band,
            flow_match,
            vec![Instruction::GotoTable(goto.id())],
            Cookie::ZERO,
        );
    }

    /// A flow with no instructions drops.
    pub fn install_drop_flow(&mut self, table: Table, band: PriorityBand, flow_match: Match) {
        self.install_flow(table, band, flow_match, Vec::new(), Cookie::ZERO);
    }

    pub fn try_install_flow(
        &mut self,
        table: Table,
        band: PriorityBand,
        flow_match: Match,
        instructions: Vec<Instruction>,
        cookie: Cookie,
    ) -> OfResult<()> {
        self.check_gotos(table, &instructions);
        let cookie = self.generation.apply(cookie);
        let flow_mod = FlowMod::add(table.id(), band.priority(), flow_match, cookie, instructions);
        self.send(&flow_mod)?;
        self.stats.flows_installed += 1;
        Ok(())
    }

    /// Strict removal of one flow key.
    pub fn remove_flow(&mut self, table: Table, band: PriorityBand, flow_match: Match) {
        let flow_mod = FlowMod::delete_strict(table.id(), band.priority(), flow_match);
        match self.send(&flow_mod) {
            Ok(()) => self.stats.flows_removed += 1,
            Err(e) => self.log_failure("remove", table, &e),
        }
    }

    /// Non-strict removal of every flow whose cookie agrees with `cookie`
    /// under `mask`, in one table or (with `None`) in all of them.
    pub fn remove_flows_by_cookie(&mut self, table: Option<Table>, cookie: Cookie, mask: u64) {
        if let Err(e) = self.try_remove_flows_by_cookie(table, cookie, mask) {
            warn!(
                "FlowPipeline: bulk delete {}/0x{:x} failed: {}",
                cookie, mask, e
            );
        }
    }

    pub fn try_remove_flows_by_cookie(&mut self, table: Option<Table>, cookie: Cookie, mask: u64) -> OfResult<()> {
        let selector = match table {
            Some(table) => TableSelector::Table(table.id()),
            None => TableSelector::All,
        };
        let flow_mod = FlowMod::delete(selector, Match::new(), cookie, mask);
        self.send(&flow_mod)?;
        self.stats.bulk_deletes += 1;
        Ok(())
    }

    pub fn dump_table(&mut self, table: Table) -> OfResult<Vec<FlowEntry>> {
        self.session.dump(TableSelector::Table(table.id()))
    }

    fn send(&mut self, flow_mod: &FlowMod) -> OfResult<()> {
        if !self.session.is_established() {
            self.stats.deferred += 1;
            debug!("FlowPipeline: session down, skipping {}", flow_mod);
            return Err(OfError::Disconnected);
        }
        self.session.send(flow_mod).map_err(|e| {
            self.stats.southbound_errors += 1;
            e
        })
    }

    fn check_gotos(&mut self, table: Table, instructions: &[Instruction]) {
        for inst in instructions {
            if let Instruction::GotoTable(target) = inst {
                let forward = match Table::from_id(*target) {
                    Some(target) => table.check_goto(target),
                    None => table.id() < *target,
                };
                if !forward {
                    self.stats.backward_gotos += 1;
                }
            }
        }
    }

    fn log_failure(&self, what: &str, table: Table, e: &OfError) {
        match e {
            // Replayed on the next establish.
            OfError::Disconnected => {}
            e if e.is_transient() => warn!("FlowPipeline: {} in {} skipped: {}", what, table, e),
            e => error!("FlowPipeline: {} in {} failed: {}", what, table, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aging::{Generation, GenerationOwner};
    use crate::pipeline::CookieRegistry;
    use dflow_ofproto::{FlowKey, MemorySwitch};
    use pretty_assertions::assert_eq;

    fn pipeline() -> (FlowPipeline, MemorySwitch, GenerationOwner) {
        let switch = MemorySwitch::new();
        let owner = GenerationOwner::new();
        let mut registry = CookieRegistry::new();
        owner.bind(registry.reserve("aging", 1).unwrap());
        let mut session = SwitchSession::new(Box::new(switch.clone()));
        session.establish();
        (FlowPipeline::new(session, owner.handle()), switch, owner)
    }

    fn key(table: Table, band: PriorityBand, flow_match: Match) -> FlowKey {
        FlowKey {
            table: table.id(),
            priority: band.priority(),
            flow_match,
        }
    }

    #[test]
    fn test_install_is_idempotent() {
        let (mut pipeline, switch, _owner) = pipeline();
        let m = Match::new().reg(6, 5);

        for _ in 0..3 {
            pipeline.install_goto_flow(Table::EgressConntrack, PriorityBand::Medium, Table::EgressSecurityGroup, m.clone());
        }
        assert_eq!(switch.flow_count(), 1);

        pipeline.remove_flow(Table::EgressConntrack, PriorityBand::Medium, m.clone());
        pipeline.remove_flow(Table::EgressConntrack, PriorityBand::Medium, m);
        assert_eq!(switch.flow_count(), 0);
    }

    #[test]
    fn test_cookie_tagged_with_generation() {
        let (mut pipeline, switch, owner) = pipeline();
        let m = Match::new().eth_type(0x0800);

        pipeline.install_flow(Table::L2Lookup, PriorityBand::Low, m.clone(), Vec::new(), Cookie(0x7));
        let entry = switch.get(&key(Table::L2Lookup, PriorityBand::Low, m.clone())).unwrap();
        assert_eq!(entry.cookie, Cookie(0x6));

        owner.set(Generation::ONE);
        pipeline.install_flow(Table::L2Lookup, PriorityBand::Low, m.clone(), Vec::new(), Cookie(0x6));
        let entry = switch.get(&key(Table::L2Lookup, PriorityBand::Low, m)).unwrap();
        assert_eq!(entry.cookie, Cookie(0x7));
    }

    #[test]
    fn test_errors_are_counted_and_skipped() {
        let (mut pipeline, switch, _owner) = pipeline();
        switch.fail_next_flow_mods(1);

        pipeline.install_drop_flow(Table::EgressSecurityGroup, PriorityBand::Default, Match::new());
        pipeline.install_drop_flow(Table::IngressSecurityGroup, PriorityBand::Default, Match::new());

        assert_eq!(pipeline.stats().southbound_errors, 1);
        assert_eq!(pipeline.stats().flows_installed, 1);
        assert_eq!(switch.flow_count(), 1);
    }

    #[test]
    fn test_edits_deferred_while_down() {
        let (mut pipeline, switch, _owner) = pipeline();
        pipeline.session_mut().lose();

        pipeline.install_drop_flow(Table::Egress, PriorityBand::Default, Match::new());
        assert_eq!(pipeline.stats().deferred, 1);
        assert_eq!(switch.flow_count(), 0);
        assert!(matches!(pipeline.dump_table(Table::Egress), Err(OfError::Disconnected)));
    }

    #[test]
    fn test_backward_goto_logged_not_enforced() {
        let (mut pipeline, switch, _owner) = pipeline();
        pipeline.install_goto_flow(Table::Egress, PriorityBand::Low, Table::Classification, Match::new());
        assert_eq!(pipeline.stats().backward_gotos, 1);
        assert_eq!(switch.flow_count(), 1);
    }

    #[test]
    fn test_remove_by_cookie_scoped_to_table() {
        let (mut pipeline, switch, _owner) = pipeline();
        let m = Match::new().ip_proto(6);
        pipeline.install_flow(Table::EgressSecurityGroup, PriorityBand::Medium, m.clone(), Vec::new(), Cookie(0x4));
        pipeline.install_flow(Table::IngressSecurityGroup, PriorityBand::Medium, m, Vec::new(), Cookie(0x4));

        pipeline.remove_flows_by_cookie(Some(Table::EgressSecurityGroup), Cookie(0x4), 0x6);
        assert_eq!(switch.flows_in(Table::EgressSecurityGroup.id()).len(), 0);
        assert_eq!(switch.flows_in(Table::IngressSecurityGroup.id()).len(), 1);

        pipeline.remove_flows_by_cookie(None, Cookie(0x4), 0x6);
        assert_eq!(switch.flow_count(), 0);
    }
}
