//! Port locality tracking and binding event derivation.

use super::event::{BindingEvent, EventKind};
use crate::model::{LogicalPort, PortId, StoreChange};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BindingState {
    #[default]
    Unbound,
    BoundLocal,
    BoundRemote,
}

impl BindingState {
    /// Local iff bound to a chassis named `local_chassis`; any other
    /// binding is remote.
    pub fn of(port: &LogicalPort, local_chassis: &str) -> Self {
        match &port.binding {
            None => BindingState::Unbound,
            Some(binding) if binding.is_on_chassis(local_chassis) => BindingState::BoundLocal,
            Some(_) => BindingState::BoundRemote,
        }
    }

    fn bind_event(&self) -> Option<EventKind> {
        match self {
            BindingState::Unbound => None,
            BindingState::BoundLocal => Some(EventKind::BindLocal),
            BindingState::BoundRemote => Some(EventKind::BindRemote),
        }
    }

    fn unbind_event(&self) -> Option<EventKind> {
        match self {
            BindingState::Unbound => None,
            BindingState::BoundLocal => Some(EventKind::UnbindLocal),
            BindingState::BoundRemote => Some(EventKind::UnbindRemote),
        }
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingState::Unbound => write!(f, "unbound"),
            BindingState::BoundLocal => write!(f, "local"),
            BindingState::BoundRemote => write!(f, "remote"),
        }
    }
}

/// Events for one store change, in delivery order. An unbind always
/// precedes the bind it is paired with.
pub fn derive_events(change: &StoreChange<LogicalPort>, local_chassis: &str) -> Vec<BindingEvent> {
    let mut events = Vec::new();
    match change {
        StoreChange::Created(port) => {
            if let Some(kind) = BindingState::of(port, local_chassis).bind_event() {
                events.push(BindingEvent::new(kind, port.clone(), None));
            }
        }
        StoreChange::Deleted(port) => {
            if let Some(kind) = BindingState::of(port, local_chassis).unbind_event() {
                events.push(BindingEvent::new(kind, port.clone(), None));
            }
        }
        StoreChange::Updated { old, new } => {
            let before = BindingState::of(old, local_chassis);
            let after = BindingState::of(new, local_chassis);
            match (before, after) {
                (BindingState::BoundLocal, BindingState::BoundLocal) => {
                    events.push(BindingEvent::new(EventKind::LocalUpdated, new.clone(), Some(old.clone())));
                }
                (BindingState::BoundRemote, BindingState::BoundRemote) => {
                    events.push(BindingEvent::new(EventKind::RemoteUpdated, new.clone(), Some(old.clone())));
                }
                (BindingState::Unbound, BindingState::Unbound) => {}
                (before, after) => {
                    if let Some(kind) = before.unbind_event() {
                        events.push(BindingEvent::new(kind, old.clone(), None));
                    }
                    if let Some(kind) = after.bind_event() {
                        events.push(BindingEvent::new(kind, new.clone(), Some(old.clone())));
                    }
                }
            }
        }
        StoreChange::Stale | StoreChange::Unchanged | StoreChange::Unknown => {}
    }
    events
}

/// Last known locality of every port that is currently bound.
#[derive(Debug, Default)]
pub struct BindingTracker {
    states: HashMap<PortId, BindingState>,
}

impl BindingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, port: &PortId) -> BindingState {
        self.states.get(port).copied().unwrap_or_default()
    }

    pub fn local_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| **state == BindingState::BoundLocal)
            .count()
    }

    pub fn remote_count(&self) -> usize {
        self.states
            .values()
            .filter(|state| **state == BindingState::BoundRemote)
            .count()
    }

    pub fn record(&mut self, change: &StoreChange<LogicalPort>, local_chassis: &str) {
        match change {
            StoreChange::Created(port) | StoreChange::Updated { new: port, .. } => {
                match BindingState::of(port, local_chassis) {
                    BindingState::Unbound => {
                        self.states.remove(&port.id);
                    }
                    state => {
                        self.states.insert(port.id.clone(), state);
                    }
                }
            }
            StoreChange::Deleted(port) => {
                self.states.remove(&port.id);
            }
            StoreChange::Stale | StoreChange::Unchanged | StoreChange::Unknown => {}
        }
    }
}
