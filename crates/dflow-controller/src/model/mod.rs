//! Intent object model.
//!
//! Objects are stored flat in an [`ObjectStore`] keyed by id; relationships
//! (port -> logical switch, port -> security groups, rule -> remote group)
//! are ids resolved through the store, never embedded objects. An update
//! therefore carries two plain snapshots that can be diffed directly.

mod lswitch;
mod port;
mod secgroup;
mod store;

pub use lswitch::LogicalSwitch;
pub use port::{AddressPair, AllowedAddressPair, LogicalPort, PortBinding};
pub use secgroup::{Direction, EtherType, RemoteSelector, SecurityGroup, SecurityGroupRule};
pub use store::{Entity, EntityKind, ObjectStore, StoreChange, StoreError};

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                $name(id.to_string())
            }
        }
    };
}

object_id!(
    /// Logical port id as assigned by the intent store.
    PortId
);
object_id!(
    /// Security group id.
    SecGroupId
);
object_id!(
    /// Rule id, unique within its security group.
    RuleId
);
object_id!(
    /// Logical switch (network) id.
    LSwitchId
);
