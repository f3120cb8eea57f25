use crate::model::{EntityKind, LogicalPort};
use std::fmt;

/// What an app is told about an object.
///
/// Ports produce the binding events; security groups and logical switches
/// produce `Created`, `Updated` and `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    BindLocal,
    BindRemote,
    LocalUpdated,
    RemoteUpdated,
    UnbindLocal,
    UnbindRemote,
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub const fn is_binding(&self) -> bool {
        !matches!(self, EventKind::Created | EventKind::Updated | EventKind::Deleted)
    }

    /// The entity kinds this event can be raised for.
    pub fn applies_to(&self, entity: EntityKind) -> bool {
        match entity {
            EntityKind::Port => self.is_binding(),
            EntityKind::SecurityGroup | EntityKind::LogicalSwitch => !self.is_binding(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::BindLocal => "bind_local",
            EventKind::BindRemote => "bind_remote",
            EventKind::LocalUpdated => "local_updated",
            EventKind::RemoteUpdated => "remote_updated",
            EventKind::UnbindLocal => "unbind_local",
            EventKind::UnbindRemote => "unbind_remote",
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A derived port event.
///
/// `port` is the snapshot the handler acts on: the new one for binds and
/// updates, the one that was bound for unbinds. `old` is set for updates
/// and for binds that come out of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingEvent {
    pub kind: EventKind,
    pub port: LogicalPort,
    pub old: Option<LogicalPort>,
}

impl BindingEvent {
    pub fn new(kind: EventKind, port: LogicalPort, old: Option<LogicalPort>) -> Self {
        Self { kind, port, old }
    }
}
