//! Wraparound-safe comparison of 32-bit TCP sequence numbers.

/// Returns `true` if `a` comes strictly before `b` in sequence space.
#[inline]
pub const fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Returns `true` if `a` comes strictly after `b` in sequence space.
#[inline]
pub const fn after(a: u32, b: u32) -> bool {
    before(b, a)
}

/// Shifts a sequence number by a signed offset, wrapping around.
#[inline]
pub const fn offset(seq: u32, by: i32) -> u32 {
    seq.wrapping_add(by as u32)
}
