//! Southbound flow-table vocabulary for the dflow local controller.
//!
//! This crate models the subset of the switch-control protocol the
//! controller core needs: multi-table flow entries keyed by
//! (table, priority, match), opaque 64-bit cookies, conjunctive matches and
//! connection-tracking actions. The wire encoding is out of scope; a real
//! deployment plugs its codec in behind [`SwitchChannel`].
//!
//! - [`types`]: table ids, priorities, cookies
//! - [`flow`]: match fields, actions, instructions, flow mods and entries
//! - [`channel`]: the [`SwitchChannel`] trait
//! - [`memory`]: [`MemorySwitch`], an in-memory flow table
//! - [`error`]: error and status types

pub mod channel;
pub mod error;
pub mod flow;
pub mod memory;
pub mod types;

pub use channel::{SwitchChannel, TableSelector};
pub use error::{OfError, OfResult, OfStatus};
pub use flow::{
    Action, CtState, FieldKind, FlowEntry, FlowKey, FlowMod, FlowModCommand, Instruction, Match,
    MatchField,
};
pub use memory::MemorySwitch;
pub use types::{Cookie, Priority, TableId};
