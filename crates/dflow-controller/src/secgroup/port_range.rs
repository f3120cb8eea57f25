//! Port range to value/mask decomposition.

/// Covers `[min, max]` with the fewest aligned power-of-two blocks, each as
/// a `(value, mask)` pair for a masked L4 port match. The full range needs
/// no match at all and yields an empty list.
pub fn port_range_masks(min: u16, max: u16) -> Vec<(u16, u16)> {
    if min > max || (min == 0 && max == u16::MAX) {
        return Vec::new();
    }

    let max = u32::from(max);
    let mut start = u32::from(min);
    let mut blocks = Vec::new();
    while start <= max {
        // Largest block aligned at `start`, then shrink until it fits.
        let mut size = if start == 0 { 1 << 16 } else { 1u32 << start.trailing_zeros() };
        while start + size - 1 > max {
            size >>= 1;
        }
        let mask = !(size - 1) & 0xffff;
        blocks.push((to_u16(start), to_u16(mask)));
        start += size;
    }
    blocks
}

fn to_u16(value: u32) -> u16 {
    u16::try_from(value & 0xffff).unwrap_or(u16::MAX)
}
