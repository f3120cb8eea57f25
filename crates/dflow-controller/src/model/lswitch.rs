use super::LSwitchId;
use serde::{Deserialize, Serialize};

/// A logical switch. Its unique key doubles as the network's conntrack zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalSwitch {
    pub id: LSwitchId,
    pub unique_key: u32,
    #[serde(default)]
    pub version: u64,
}

impl LogicalSwitch {
    pub fn new(id: impl Into<LSwitchId>, unique_key: u32) -> Self {
        Self {
            id: id.into(),
            unique_key,
            version: 0,
        }
    }
}
