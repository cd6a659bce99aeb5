use crate::Address;

/// Test if `addr` is aligned to a multiple of `align`
pub fn aligned_to(addr: Address, align: usize) -> bool {
    addr % align == 0
}

/// Test if `[addr, addr + size)` lies within `[start, end)`
pub fn within(addr: Address, size: usize, start: Address, end: Address) -> bool {
    addr >= start && addr.checked_add(size).is_some_and(|last| last <= end)
}
