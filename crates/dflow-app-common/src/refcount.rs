//! Reference counting keyed map.
//!
//! Apps track "how many local ports hold this" for security groups and
//! member addresses. The interesting moments are the first acquire and the
//! last release, so both operations report the transition instead of a raw
//! count.
//!
//! Releasing a key that was never acquired is an error rather than an
//! implicit zero entry; a spurious release would otherwise tear down state
//! another holder still depends on.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefCountError {
    #[error("release of key that holds no references")]
    NotHeld,
}

/// Outcome of [`RefCountMap::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The key went from zero to one reference.
    First,
    /// The key already had references; holds the new count.
    Again(u32),
}

/// Outcome of [`RefCountMap::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// The last reference was dropped and the key removed.
    Last,
    /// References remain; holds the new count.
    Remaining(u32),
}

#[derive(Debug, Clone)]
pub struct RefCountMap<K> {
    inner: HashMap<K, u32>,
}

impl<K> RefCountMap<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn acquire(&mut self, key: K) -> Acquired {
        let count = self.inner.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 {
            Acquired::First
        } else {
            Acquired::Again(*count)
        }
    }

    pub fn release<Q>(&mut self, key: &Q) -> Result<Released, RefCountError>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let count = self.inner.get_mut(key).ok_or(RefCountError::NotHeld)?;
        *count -= 1;
        if *count == 0 {
            self.inner.remove(key);
            Ok(Released::Last)
        } else {
            Ok(Released::Remaining(*count))
        }
    }

    /// Current count; zero for unknown keys. Never creates entries.
    pub fn count<Q>(&self, key: &Q) -> u32
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.get(key).copied().unwrap_or(0)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<K> Default for RefCountMap<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_and_last_transitions() {
        let mut map: RefCountMap<String> = RefCountMap::new();

        assert_eq!(map.acquire("sg1".to_string()), Acquired::First);
        assert_eq!(map.acquire("sg1".to_string()), Acquired::Again(2));
        assert_eq!(map.count("sg1"), 2);

        assert_eq!(map.release("sg1"), Ok(Released::Remaining(1)));
        assert_eq!(map.release("sg1"), Ok(Released::Last));
        assert!(!map.contains("sg1"));
    }

    #[test]
    fn test_release_never_creates() {
        let mut map: RefCountMap<String> = RefCountMap::new();

        assert_eq!(map.release("missing"), Err(RefCountError::NotHeld));
        assert_eq!(map.count("missing"), 0);
        assert!(map.is_empty());
    }
}
