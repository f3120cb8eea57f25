//! The southbound channel abstraction.

use crate::error::OfResult;
use crate::flow::{FlowEntry, FlowMod};
use crate::types::TableId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which tables a dump or non-strict delete applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableSelector {
    Table(TableId),
    All,
}

impl TableSelector {
    pub fn includes(&self, table: TableId) -> bool {
        match self {
            TableSelector::Table(t) => *t == table,
            TableSelector::All => true,
        }
    }
}

impl fmt::Display for TableSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSelector::Table(table) => table.fmt(f),
            TableSelector::All => write!(f, "table=all"),
        }
    }
}

/// Point-to-point control session to one switch.
///
/// Implementations encode requests for a concrete protocol version. Calls
/// are issued from the controller's single worker, one at a time, and are
/// applied by the switch in the order sent.
pub trait SwitchChannel: Send {
    /// Sends one flow-table edit.
    fn send_flow_mod(&mut self, flow_mod: &FlowMod) -> OfResult<()>;

    /// Returns the flows installed in the selected tables.
    fn dump_flows(&mut self, table: TableSelector) -> OfResult<Vec<FlowEntry>>;

    fn is_connected(&self) -> bool {
        true
    }
}

impl<T: SwitchChannel + ?Sized> SwitchChannel for Box<T> {
    fn send_flow_mod(&mut self, flow_mod: &FlowMod) -> OfResult<()> {
        (**self).send_flow_mod(flow_mod)
    }

    fn dump_flows(&mut self, table: TableSelector) -> OfResult<Vec<FlowEntry>> {
        (**self).dump_flows(table)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
