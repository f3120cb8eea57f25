//! Pipeline table layout and priority bands.
//!
//! Packets enter at [`Table::Classification`] and only ever move to a higher
//! table id. Every module that installs a goto is expected to respect that
//! order; [`Table::may_goto`] encodes it.

use dflow_ofproto::{Priority, TableId};
use log::error;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Classification,
    EgressConntrack,
    EgressSecurityGroup,
    ServicesClassification,
    L2Lookup,
    L3Lookup,
    Egress,
    IngressConntrack,
    IngressSecurityGroup,
    IngressDispatch,
    /// Holds the aging canary only
    Canary,
}

impl Table {
    pub const ALL: [Table; 11] = [
        Table::Classification,
        Table::EgressConntrack,
        Table::EgressSecurityGroup,
        Table::ServicesClassification,
        Table::L2Lookup,
        Table::L3Lookup,
        Table::Egress,
        Table::IngressConntrack,
        Table::IngressSecurityGroup,
        Table::IngressDispatch,
        Table::Canary,
    ];

    pub const fn id(&self) -> TableId {
        TableId(match self {
            Table::Classification => 0,
            Table::EgressConntrack => 3,
            Table::EgressSecurityGroup => 4,
            Table::ServicesClassification => 9,
            Table::L2Lookup => 17,
            Table::L3Lookup => 20,
            Table::Egress => 64,
            Table::IngressConntrack => 72,
            Table::IngressSecurityGroup => 77,
            Table::IngressDispatch => 78,
            Table::Canary => 200,
        })
    }

    pub fn from_id(id: TableId) -> Option<Table> {
        Table::ALL.into_iter().find(|table| table.id() == id)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Table::Classification => "classification",
            Table::EgressConntrack => "egress_conntrack",
            Table::EgressSecurityGroup => "egress_security_group",
            Table::ServicesClassification => "services_classification",
            Table::L2Lookup => "l2_lookup",
            Table::L3Lookup => "l3_lookup",
            Table::Egress => "egress",
            Table::IngressConntrack => "ingress_conntrack",
            Table::IngressSecurityGroup => "ingress_security_group",
            Table::IngressDispatch => "ingress_dispatch",
            Table::Canary => "canary",
        }
    }

    /// Forward-only: a table may only jump to a strictly later one.
    pub const fn may_goto(&self, target: Table) -> bool {
        self.id().0 < target.id().0
    }

    /// Logs a goto that breaks the forward-only order. Not enforced.
    pub(crate) fn check_goto(&self, target: Table) -> bool {
        let ok = self.may_goto(target);
        if !ok {
            error!("Pipeline: backward goto from {} to {}", self, target);
        }
        ok
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.id().0)
    }
}

/// Flow priority bands shared by all modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PriorityBand {
    Default,
    Low,
    Medium,
    High,
    VeryHigh,
    CtState,
}

impl PriorityBand {
    pub const fn priority(&self) -> Priority {
        Priority(match self {
            PriorityBand::Default => 1,
            PriorityBand::Low => 100,
            PriorityBand::Medium => 1000,
            PriorityBand::High => 10000,
            PriorityBand::VeryHigh => 20000,
            PriorityBand::CtState => 65534,
        })
    }
}

impl From<PriorityBand> for Priority {
    fn from(band: PriorityBand) -> Self {
        band.priority()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_ids_are_ordered() {
        let ids: Vec<u8> = Table::ALL.iter().map(|t| t.id().0).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(Table::from_id(TableId(77)), Some(Table::IngressSecurityGroup));
        assert_eq!(Table::from_id(TableId(5)), None);
    }

    #[test]
    fn test_may_goto_is_forward_only() {
        assert!(Table::EgressConntrack.may_goto(Table::EgressSecurityGroup));
        assert!(Table::EgressSecurityGroup.may_goto(Table::ServicesClassification));
        assert!(!Table::IngressDispatch.may_goto(Table::Classification));
        assert!(!Table::Egress.may_goto(Table::Egress));
    }

    #[test]
    fn test_bands_are_increasing() {
        assert!(PriorityBand::Default.priority() < PriorityBand::Low.priority());
        assert!(PriorityBand::VeryHigh.priority() < PriorityBand::CtState.priority());
        assert_eq!(Priority::from(PriorityBand::Medium), Priority(1000));
    }
}
