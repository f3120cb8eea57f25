//! Shared infrastructure for dflow policy apps.
//!
//! - [`IntentConsumer`]: per-entity queue of northbound intent changes with
//!   per-key coalescing
//! - [`RefCountMap`]: explicit reference counting that never creates entries
//!   on release
//! - [`HandlerError`]/[`HandlerStatus`]: outcome of a single event handler
//!
//! # Processing model
//!
//! 1. The intent store client pushes create/update/delete snapshots
//! 2. The controller queues them per entity kind in an [`IntentConsumer`]
//! 3. The worker drains consumers in priority order and feeds the binding
//!    dispatcher
//! 4. Apps translate events into flow edits

mod consumer;
mod handler;
mod refcount;

pub use consumer::{ConsumerConfig, IntentConsumer, IntentEntry, Operation, Versioned};
pub use handler::{HandlerError, HandlerResult, HandlerResultExt, HandlerStatus};
pub use refcount::{Acquired, RefCountError, RefCountMap, Released};
