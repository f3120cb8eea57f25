//! Coalescing queue for northbound intent changes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Change kind reported by the intent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
}

impl Operation {
    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Deleted)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Created => write!(f, "created"),
            Operation::Updated => write!(f, "updated"),
            Operation::Deleted => write!(f, "deleted"),
        }
    }
}

/// Objects that carry the intent store's revision number.
pub trait Versioned {
    fn version(&self) -> u64;
}

/// One intent change: the object id, what happened, and the snapshot the
/// store delivered with it (the last known one for deletes).
#[derive(Debug, Clone, PartialEq)]
pub struct IntentEntry<T> {
    pub key: String,
    pub op: Operation,
    pub object: T,
}

impl<T> IntentEntry<T> {
    pub fn new(key: impl Into<String>, op: Operation, object: T) -> Self {
        Self {
            key: key.into(),
            op,
            object,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Entity table name (e.g. "lport", "secgroup")
    pub table_name: String,
    /// Drain order across consumers (lower = earlier)
    pub priority: i32,
    /// Maximum entries returned by one [`IntentConsumer::pop_batch`]
    pub batch_size: usize,
}

impl ConsumerConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            priority: 0,
            batch_size: 128,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Pending intent changes for one entity kind.
///
/// Changes are queued per key so that only the latest snapshot of an object
/// is processed:
/// - create/update after a pending create/update: the snapshot is replaced
///   unless it is older than the pending one; the earlier op is kept
///   (create then update is still a create)
/// - delete: drops everything pending for the key and queues the delete
/// - create after a pending delete: both are kept, in order
///
/// Per-key order is preserved; keys are drained in key order.
pub struct IntentConsumer<T> {
    config: ConsumerConfig,
    to_sync: BTreeMap<String, VecDeque<IntentEntry<T>>>,
    pending_count: usize,
}

impl<T: Versioned> IntentConsumer<T> {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            to_sync: BTreeMap::new(),
            pending_count: 0,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }

    pub fn priority(&self) -> i32 {
        self.config.priority
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub fn push(&mut self, entry: IntentEntry<T>) {
        let queue = self.to_sync.entry(entry.key.clone()).or_default();

        match entry.op {
            Operation::Deleted => {
                self.pending_count -= queue.len();
                queue.clear();
                queue.push_back(entry);
                self.pending_count += 1;
            }
            Operation::Created | Operation::Updated => {
                if let Some(last) = queue.back_mut() {
                    if !last.op.is_delete() {
                        if entry.object.version() >= last.object.version() {
                            last.object = entry.object;
                        }
                        return;
                    }
                }
                queue.push_back(entry);
                self.pending_count += 1;
            }
        }
    }

    /// Removes up to `batch_size` entries, whole keys first.
    pub fn pop_batch(&mut self) -> Vec<IntentEntry<T>> {
        let limit = self.config.batch_size;
        let mut result = Vec::with_capacity(limit.min(self.pending_count));

        while result.len() < limit {
            let Some(mut first) = self.to_sync.first_entry() else {
                break;
            };
            let queue = first.get_mut();
            while result.len() < limit {
                match queue.pop_front() {
                    Some(entry) => result.push(entry),
                    None => break,
                }
            }
            if queue.is_empty() {
                first.remove();
            }
        }

        self.pending_count -= result.len();
        result
    }

    /// Removes every pending entry.
    pub fn drain(&mut self) -> Vec<IntentEntry<T>> {
        let mut result = Vec::with_capacity(self.pending_count);
        for (_key, queue) in std::mem::take(&mut self.to_sync) {
            result.extend(queue);
        }
        self.pending_count = 0;
        result
    }

    pub fn clear(&mut self) {
        self.to_sync.clear();
        self.pending_count = 0;
    }

    /// Dumps pending entries for debugging.
    pub fn dump(&self) -> Vec<String> {
        self.to_sync
            .iter()
            .flat_map(|(key, queue)| queue.iter().map(move |e| format!("{}: {}", key, e.op)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    impl Versioned for u32 {
        fn version(&self) -> u64 {
            u64::from(*self)
        }
    }

    fn consumer() -> IntentConsumer<u32> {
        IntentConsumer::new(ConsumerConfig::new("lport"))
    }

    #[test]
    fn test_update_coalesces_into_create() {
        let mut c = consumer();
        c.push(IntentEntry::new("p1", Operation::Created, 1));
        c.push(IntentEntry::new("p1", Operation::Updated, 2));
        c.push(IntentEntry::new("p1", Operation::Updated, 3));

        assert_eq!(c.pending_count(), 1);
        let entries = c.drain();
        assert_eq!(entries, vec![IntentEntry::new("p1", Operation::Created, 3)]);
    }

    #[test]
    fn test_older_snapshot_does_not_replace_pending() {
        let mut c = consumer();
        c.push(IntentEntry::new("p1", Operation::Updated, 3));
        c.push(IntentEntry::new("p1", Operation::Updated, 2));

        assert_eq!(c.pending_count(), 1);
        assert_eq!(c.drain(), vec![IntentEntry::new("p1", Operation::Updated, 3)]);
    }

    #[test]
    fn test_delete_drops_pending() {
        let mut c = consumer();
        c.push(IntentEntry::new("p1", Operation::Created, 1));
        c.push(IntentEntry::new("p1", Operation::Deleted, 1));

        let entries = c.drain();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].op.is_delete());
    }

    #[test]
    fn test_delete_then_create_keeps_both() {
        let mut c = consumer();
        c.push(IntentEntry::new("p1", Operation::Deleted, 1));
        c.push(IntentEntry::new("p1", Operation::Created, 2));

        assert_eq!(c.pending_count(), 2);
        let ops: Vec<_> = c.drain().into_iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![Operation::Deleted, Operation::Created]);
    }

    #[test]
    fn test_pop_batch_respects_limit_and_key_order() {
        let mut c = IntentConsumer::new(ConsumerConfig::new("lport").with_batch_size(2));
        c.push(IntentEntry::new("b", Operation::Deleted, 0));
        c.push(IntentEntry::new("b", Operation::Created, 1));
        c.push(IntentEntry::new("a", Operation::Created, 2));

        let first: Vec<_> = c.pop_batch().into_iter().map(|e| (e.key, e.op)).collect();
        assert_eq!(
            first,
            vec![
                ("a".to_string(), Operation::Created),
                ("b".to_string(), Operation::Deleted)
            ]
        );
        assert_eq!(c.pending_count(), 1);

        let second = c.pop_batch();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].op, Operation::Created);
        assert!(!c.has_pending());
    }
}
