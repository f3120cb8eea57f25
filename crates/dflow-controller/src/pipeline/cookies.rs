//! Bit-range allocation inside the 64-bit flow cookie.

use super::PipelineError;
use dflow_ofproto::Cookie;
use log::info;

/// A module's reserved bit range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CookieSlot {
    offset: u8,
    width: u8,
}

impl CookieSlot {
    pub const fn offset(&self) -> u8 {
        self.offset
    }

    pub const fn width(&self) -> u8 {
        self.width
    }

    /// Mask selecting this slot's bits in place.
    pub const fn mask(&self) -> u64 {
        let low = if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        };
        low << self.offset
    }

    pub fn encode(&self, value: u64) -> Result<Cookie, PipelineError> {
        if value > (self.mask() >> self.offset) {
            return Err(PipelineError::CookieValueOverflow {
                value,
                width: self.width,
            });
        }
        Ok(Cookie(value << self.offset))
    }

    pub const fn decode(&self, cookie: Cookie) -> u64 {
        (cookie.0 & self.mask()) >> self.offset
    }
}

/// Hands out non-overlapping cookie slots, lowest bits first.
#[derive(Debug, Default)]
pub struct CookieRegistry {
    slots: Vec<(String, CookieSlot)>,
    used: u8,
}

impl CookieRegistry {
    pub const COOKIE_BITS: u8 = 64;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, name: &str, width: u8) -> Result<CookieSlot, PipelineError> {
        if width == 0 || width > Self::COOKIE_BITS {
            return Err(PipelineError::InvalidCookieWidth {
                name: name.to_string(),
                width,
            });
        }
        if self.slots.iter().any(|(existing, _)| existing == name) {
            return Err(PipelineError::DuplicateCookie(name.to_string()));
        }
        if u16::from(self.used) + u16::from(width) > u16::from(Self::COOKIE_BITS) {
            return Err(PipelineError::CookieBudgetExceeded {
                name: name.to_string(),
                requested: width,
                available: Self::COOKIE_BITS - self.used,
            });
        }

        let slot = CookieSlot {
            offset: self.used,
            width,
        };
        self.used += width;
        self.slots.push((name.to_string(), slot));
        info!(
            "CookieRegistry: reserved {} bits at offset {} for {}",
            width, slot.offset, name
        );
        Ok(slot)
    }

    pub fn get(&self, name: &str) -> Option<CookieSlot> {
        self.slots
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, slot)| *slot)
    }

    pub fn available(&self) -> u8 {
        Self::COOKIE_BITS - self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_slots_do_not_overlap() {
        let mut registry = CookieRegistry::new();
        let aging = registry.reserve("aging", 1).unwrap();
        let rules = registry.reserve("security_group_rule", 32).unwrap();

        assert_eq!(aging.mask(), 0x1);
        assert_eq!(rules.offset(), 1);
        assert_eq!(rules.mask(), 0x1_ffff_fffe);
        assert_eq!(aging.mask() & rules.mask(), 0);
        assert_eq!(registry.available(), 31);
        assert_eq!(registry.get("aging"), Some(aging));
    }

    #[test]
    fn test_encode_decode() {
        let mut registry = CookieRegistry::new();
        registry.reserve("aging", 1).unwrap();
        let slot = registry.reserve("rules", 4).unwrap();

        let cookie = slot.encode(9).unwrap();
        assert_eq!(cookie, Cookie(9 << 1));
        assert_eq!(slot.decode(cookie | Cookie(1)), 9);
        assert!(matches!(
            slot.encode(16),
            Err(PipelineError::CookieValueOverflow { value: 16, width: 4 })
        ));
    }

    #[test]
    fn test_budget_and_validation() {
        let mut registry = CookieRegistry::new();
        registry.reserve("big", 60).unwrap();

        assert!(matches!(
            registry.reserve("too_big", 5),
            Err(PipelineError::CookieBudgetExceeded { available: 4, .. })
        ));
        assert!(matches!(registry.reserve("big", 1), Err(PipelineError::DuplicateCookie(_))));
        assert!(matches!(
            registry.reserve("empty", 0),
            Err(PipelineError::InvalidCookieWidth { width: 0, .. })
        ));

        let full = registry.reserve("rest", 4).unwrap();
        assert_eq!(full.mask(), 0xf000_0000_0000_0000);
        assert_eq!(registry.available(), 0);
    }

    #[test]
    fn test_full_width_slot() {
        let mut registry = CookieRegistry::new();
        let slot = registry.reserve("all", 64).unwrap();
        assert_eq!(slot.mask(), u64::MAX);
        assert_eq!(slot.encode(u64::MAX).unwrap(), Cookie(u64::MAX));
    }
}
