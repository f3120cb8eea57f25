//! Stateful security groups.
//!
//! Rules compile to conjunctive clause flows in the per-direction security
//! group tables; connection tracking lets replies and related traffic back
//! in without a rule of their own.

mod app;
mod compile;
mod conjunction;
mod conntrack;
mod port_range;

pub use app::{direction_tables, DirectionTables, SecGroupApp, SecGroupStats, SG_RULE_COOKIE, SG_RULE_COOKIE_WIDTH};
pub use compile::{compile_rule, rule_templates, CompileError};
pub use conjunction::{conjunction_actions, ClauseIndex, ClauseUpdate, RuleClause};
pub use conntrack::{shellquote, ConntrackError, ConntrackHelper, NullConntrack, RecordingConntrack, ShellConntrack, CONNTRACK_CMD};
pub use port_range::port_range_masks;
