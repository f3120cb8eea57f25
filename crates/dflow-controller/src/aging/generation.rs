//! The generation bit shared between the aging manager and the pipeline.

use crate::pipeline::CookieSlot;
use dflow_ofproto::Cookie;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Generation = Generation(0);
    pub const ONE: Generation = Generation(1);

    pub const fn complement(&self) -> Generation {
        Generation(self.0 ^ 1)
    }

    pub const fn bit(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

#[derive(Debug, Default)]
struct GenerationCell {
    mask: AtomicU64,
    bit: AtomicU8,
}

/// Read side, held by the pipeline. A handle whose slot was never bound
/// tags nothing.
#[derive(Debug, Clone, Default)]
pub struct GenerationHandle {
    cell: Arc<GenerationCell>,
}

impl GenerationHandle {
    pub fn mask(&self) -> u64 {
        self.cell.mask.load(Ordering::Acquire)
    }

    pub fn current(&self) -> Generation {
        Generation(self.cell.bit.load(Ordering::Acquire))
    }

    /// Cookie bits for `generation` within the aging slot.
    pub fn tag_for(&self, generation: Generation) -> Cookie {
        if generation.bit() == 1 {
            Cookie(self.mask())
        } else {
            Cookie::ZERO
        }
    }

    pub fn tag(&self) -> Cookie {
        self.tag_for(self.current())
    }

    /// Replaces the aging bits of `cookie` with the current tag.
    pub fn apply(&self, cookie: Cookie) -> Cookie {
        Cookie(cookie.0 & !self.mask()) | self.tag()
    }

    pub fn generation_of(&self, cookie: Cookie) -> Generation {
        if self.mask() != 0 && cookie.0 & self.mask() != 0 {
            Generation::ONE
        } else {
            Generation::ZERO
        }
    }
}

/// Write side, owned by the aging manager.
#[derive(Debug, Default)]
pub struct GenerationOwner {
    handle: GenerationHandle,
}

impl GenerationOwner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> GenerationHandle {
        self.handle.clone()
    }

    /// Binds the one-bit aging slot.
    pub fn bind(&self, slot: CookieSlot) {
        self.handle.cell.mask.store(slot.mask(), Ordering::Release);
    }

    pub fn is_bound(&self) -> bool {
        self.handle.mask() != 0
    }

    pub fn current(&self) -> Generation {
        self.handle.current()
    }

    pub fn set(&self, generation: Generation) {
        self.handle.cell.bit.store(generation.bit(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::CookieRegistry;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unbound_handle_tags_nothing() {
        let owner = GenerationOwner::new();
        owner.set(Generation::ONE);
        let handle = owner.handle();
        assert_eq!(handle.apply(Cookie(0x10)), Cookie(0x10));
        assert_eq!(handle.generation_of(Cookie(u64::MAX)), Generation::ZERO);
    }

    #[test]
    fn test_apply_overrides_aging_bits() {
        let mut registry = CookieRegistry::new();
        let owner = GenerationOwner::new();
        owner.bind(registry.reserve("aging", 1).unwrap());
        let handle = owner.handle();

        assert_eq!(handle.apply(Cookie(0x11)), Cookie(0x10));
        owner.set(Generation::ONE);
        assert_eq!(handle.apply(Cookie(0x10)), Cookie(0x11));
        assert_eq!(handle.generation_of(Cookie(0x11)), Generation::ONE);
        assert_eq!(Generation::ONE.complement(), Generation::ZERO);
    }
}
