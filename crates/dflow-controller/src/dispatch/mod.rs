//! Binding event dispatcher.
//!
//! Turns store changes into per-port binding events (local, remote,
//! unbound) and delivers them, together with plain create/update/delete
//! events for the other entities, to every registered [`App`] in
//! registration order.

mod binding;
mod dispatcher;
mod event;
mod registry;

pub use binding::{derive_events, BindingState, BindingTracker};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use event::{BindingEvent, EventKind};
pub use registry::{
    App, AppContext, Delivery, Handler, HandlerEntry, LogicalSwitchHandler, Payload, PortHandler,
    SecurityGroupHandler,
};

use crate::model::EntityKind;
use crate::pipeline::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("app {0} registered twice")]
    DuplicateApp(&'static str),

    #[error("app {app} declares a {event} handler for {entity}")]
    InvalidHandler {
        app: &'static str,
        entity: EntityKind,
        event: EventKind,
    },

    #[error("app {app} could not reserve cookies: {source}")]
    Cookie {
        app: &'static str,
        #[source]
        source: PipelineError,
    },
}
