//! Flat, id-keyed cache of the intent objects this host has seen.

use super::{LSwitchId, LogicalPort, LogicalSwitch, PortBinding, PortId, SecGroupId, SecurityGroup};
use dflow_app_common::{Operation, Versioned};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    LogicalSwitch,
    SecurityGroup,
    Port,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::LogicalSwitch => write!(f, "lswitch"),
            EntityKind::SecurityGroup => write!(f, "secgroup"),
            EntityKind::Port => write!(f, "port"),
        }
    }
}

/// Any intent object, as delivered by the intent store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    LogicalSwitch(LogicalSwitch),
    SecurityGroup(SecurityGroup),
    Port(LogicalPort),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::LogicalSwitch(_) => EntityKind::LogicalSwitch,
            Entity::SecurityGroup(_) => EntityKind::SecurityGroup,
            Entity::Port(_) => EntityKind::Port,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Entity::LogicalSwitch(ls) => ls.id.as_str(),
            Entity::SecurityGroup(sg) => sg.id.as_str(),
            Entity::Port(port) => port.id.as_str(),
        }
    }
}

/// What applying a snapshot did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange<T> {
    Created(T),
    Updated { old: T, new: T },
    Deleted(T),
    /// The snapshot is older than the cached one
    Stale,
    /// Same version, same content
    Unchanged,
    /// Delete of an object that was never seen
    Unknown,
}

impl<T> StoreChange<T> {
    /// True when handlers have something to react to.
    pub fn is_effective(&self) -> bool {
        matches!(
            self,
            StoreChange::Created(_) | StoreChange::Updated { .. } | StoreChange::Deleted(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("port {port} reuses unique key {key} held by {holder}")]
    DuplicateUniqueKey { port: PortId, key: u32, holder: PortId },
}

trait StoredObject: Versioned + Clone + PartialEq {
    type Id: Clone + Eq + Hash;

    fn object_id(&self) -> &Self::Id;
}

impl Versioned for LogicalPort {
    fn version(&self) -> u64 {
        self.version
    }
}

impl StoredObject for LogicalPort {
    type Id = PortId;

    fn object_id(&self) -> &PortId {
        &self.id
    }
}

impl Versioned for SecurityGroup {
    fn version(&self) -> u64 {
        self.version
    }
}

impl StoredObject for SecurityGroup {
    type Id = SecGroupId;

    fn object_id(&self) -> &SecGroupId {
        &self.id
    }
}

impl Versioned for LogicalSwitch {
    fn version(&self) -> u64 {
        self.version
    }
}

impl StoredObject for LogicalSwitch {
    type Id = LSwitchId;

    fn object_id(&self) -> &LSwitchId {
        &self.id
    }
}

/// Create and update are both upserts: a create for a known object is an
/// update, an update for an unknown object is a create.
fn upsert<T: StoredObject>(map: &mut HashMap<T::Id, T>, object: T) -> StoreChange<T> {
    match map.get(object.object_id()) {
        None => {
            map.insert(object.object_id().clone(), object.clone());
            StoreChange::Created(object)
        }
        Some(cached) if object.version() < cached.version() => StoreChange::Stale,
        Some(cached) if *cached == object => StoreChange::Unchanged,
        Some(_) => {
            let old = map.insert(object.object_id().clone(), object.clone());
            match old {
                Some(old) => StoreChange::Updated { old, new: object },
                None => StoreChange::Created(object),
            }
        }
    }
}

fn remove<T: StoredObject>(map: &mut HashMap<T::Id, T>, id: &T::Id) -> StoreChange<T> {
    match map.remove(id) {
        Some(old) => StoreChange::Deleted(old),
        None => StoreChange::Unknown,
    }
}

#[derive(Debug, Default)]
pub struct ObjectStore {
    ports: HashMap<PortId, LogicalPort>,
    security_groups: HashMap<SecGroupId, SecurityGroup>,
    lswitches: HashMap<LSwitchId, LogicalSwitch>,
    port_keys: HashMap<u32, PortId>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(&self, id: &PortId) -> Option<&LogicalPort> {
        self.ports.get(id)
    }

    pub fn port_by_key(&self, unique_key: u32) -> Option<&LogicalPort> {
        self.port_keys.get(&unique_key).and_then(|id| self.ports.get(id))
    }

    pub fn ports(&self) -> impl Iterator<Item = &LogicalPort> {
        self.ports.values()
    }

    pub fn security_group(&self, id: &SecGroupId) -> Option<&SecurityGroup> {
        self.security_groups.get(id)
    }

    pub fn security_groups(&self) -> impl Iterator<Item = &SecurityGroup> {
        self.security_groups.values()
    }

    pub fn lswitch(&self, id: &LSwitchId) -> Option<&LogicalSwitch> {
        self.lswitches.get(id)
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn apply_port(&mut self, op: Operation, port: LogicalPort) -> Result<StoreChange<LogicalPort>, StoreError> {
        if op.is_delete() {
            let change = remove(&mut self.ports, &port.id);
            if let StoreChange::Deleted(old) = &change {
                self.port_keys.remove(&old.unique_key);
            }
            return Ok(change);
        }

        if let Some(holder) = self.port_keys.get(&port.unique_key) {
            if *holder != port.id {
                return Err(StoreError::DuplicateUniqueKey {
                    port: port.id.clone(),
                    key: port.unique_key,
                    holder: holder.clone(),
                });
            }
        }

        let change = upsert(&mut self.ports, port);
        match &change {
            StoreChange::Created(new) => {
                self.port_keys.insert(new.unique_key, new.id.clone());
            }
            StoreChange::Updated { old, new } if old.unique_key != new.unique_key => {
                self.port_keys.remove(&old.unique_key);
                self.port_keys.insert(new.unique_key, new.id.clone());
            }
            _ => {}
        }
        Ok(change)
    }

    pub fn apply_security_group(&mut self, op: Operation, group: SecurityGroup) -> StoreChange<SecurityGroup> {
        if op.is_delete() {
            remove(&mut self.security_groups, &group.id)
        } else {
            upsert(&mut self.security_groups, group)
        }
    }

    pub fn apply_lswitch(&mut self, op: Operation, lswitch: LogicalSwitch) -> StoreChange<LogicalSwitch> {
        if op.is_delete() {
            remove(&mut self.lswitches, &lswitch.id)
        } else {
            upsert(&mut self.lswitches, lswitch)
        }
    }

    /// Local rebind of a cached port. The version is left alone so the next
    /// snapshot from the intent store still wins.
    pub fn set_port_binding(&mut self, id: &PortId, binding: Option<PortBinding>) -> StoreChange<LogicalPort> {
        let Some(cached) = self.ports.get_mut(id) else {
            return StoreChange::Unknown;
        };
        if cached.binding == binding {
            return StoreChange::Unchanged;
        }
        let old = cached.clone();
        cached.binding = binding;
        StoreChange::Updated {
            old,
            new: cached.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn port(id: &str, key: u32, version: u64) -> LogicalPort {
        LogicalPort::new(id, "net1", key).with_version(version)
    }

    #[test]
    fn test_create_update_delete() {
        let mut store = ObjectStore::new();

        let change = store.apply_port(Operation::Created, port("p1", 1, 1)).unwrap();
        assert_eq!(change, StoreChange::Created(port("p1", 1, 1)));
        assert_eq!(store.port_by_key(1).map(|p| p.id.as_str()), Some("p1"));

        let updated = port("p1", 1, 2).with_binding(PortBinding::chassis("host-a"));
        let change = store.apply_port(Operation::Updated, updated.clone()).unwrap();
        assert_eq!(
            change,
            StoreChange::Updated {
                old: port("p1", 1, 1),
                new: updated.clone()
            }
        );

        let change = store.apply_port(Operation::Deleted, port("p1", 1, 0)).unwrap();
        assert_eq!(change, StoreChange::Deleted(updated));
        assert!(store.port_by_key(1).is_none());
    }

    #[test]
    fn test_stale_and_unchanged_snapshots() {
        let mut store = ObjectStore::new();
        store.apply_port(Operation::Created, port("p1", 1, 5)).unwrap();

        assert_eq!(store.apply_port(Operation::Updated, port("p1", 1, 4)).unwrap(), StoreChange::Stale);
        assert_eq!(store.apply_port(Operation::Created, port("p1", 1, 5)).unwrap(), StoreChange::Unchanged);
    }

    #[test]
    fn test_update_unknown_is_create_and_delete_unknown_ignored() {
        let mut store = ObjectStore::new();
        let sg = SecurityGroup::new("sg1", 10);
        assert_eq!(
            store.apply_security_group(Operation::Updated, sg.clone()),
            StoreChange::Created(sg.clone())
        );
        assert_eq!(
            store.apply_lswitch(Operation::Deleted, LogicalSwitch::new("net9", 9)),
            StoreChange::Unknown
        );
    }

    #[test]
    fn test_duplicate_unique_key_rejected() {
        let mut store = ObjectStore::new();
        store.apply_port(Operation::Created, port("p1", 1, 1)).unwrap();
        let err = store.apply_port(Operation::Created, port("p2", 1, 1)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUniqueKey { key: 1, .. }));
        assert!(store.port(&PortId::new("p2")).is_none());
    }

    #[test]
    fn test_unique_key_reindexed_on_update() {
        let mut store = ObjectStore::new();
        store.apply_port(Operation::Created, port("p1", 1, 1)).unwrap();
        store.apply_port(Operation::Updated, port("p1", 2, 2)).unwrap();
        assert!(store.port_by_key(1).is_none());
        assert_eq!(store.port_by_key(2).map(|p| p.version), Some(2));
    }

    #[test]
    fn test_set_port_binding() {
        let mut store = ObjectStore::new();
        store.apply_port(Operation::Created, port("p1", 1, 1)).unwrap();
        let id = PortId::new("p1");

        let change = store.set_port_binding(&id, Some(PortBinding::chassis("host-a")));
        assert!(change.is_effective());
        assert_eq!(
            store.set_port_binding(&id, Some(PortBinding::chassis("host-a"))),
            StoreChange::Unchanged
        );
        assert_eq!(store.set_port_binding(&PortId::new("nope"), None), StoreChange::Unknown);
    }
}
