//! Scalar identifiers carried by every flow entry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric flow table identifier (0..=254 usable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u8);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table={}", self.0)
    }
}

/// Flow priority; higher values are matched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u16);

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "priority={}", self.0)
    }
}

/// Opaque 64-bit flow cookie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cookie(pub u64);

impl Cookie {
    pub const ZERO: Cookie = Cookie(0);

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Returns true if the bits selected by `mask` equal those of `other`.
    pub const fn matches(&self, other: Cookie, mask: u64) -> bool {
        (self.0 & mask) == (other.0 & mask)
    }
}

impl std::ops::BitOr for Cookie {
    type Output = Cookie;

    fn bitor(self, rhs: Cookie) -> Cookie {
        Cookie(self.0 | rhs.0)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cookie=0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_mask_match() {
        let flow = Cookie(0x1_0000_0005);
        assert!(flow.matches(Cookie(0x1_0000_0000), 0x1_0000_0000));
        assert!(!flow.matches(Cookie(0), 0x1_0000_0000));
        assert!(flow.matches(Cookie(0xdead), 0));
    }

    #[test]
    fn test_cookie_or() {
        assert_eq!(Cookie(0x4) | Cookie(0x1), Cookie(0x5));
    }
}
