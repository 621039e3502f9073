//! Hashing and rounding primitives for the file format.

use crate::layout::NUM_BUCKETS;

/// Bucket index for a counter name.
///
/// FNV-1a over the raw bytes, with the high 16 bits folded into the low 16
/// before reducing modulo the bucket count. This hash is part of the file
/// format and cannot change without a format version bump.
pub(crate) fn bucket(name: &[u8]) -> u32 {
    const OFFSET32: u32 = 2166136261;
    const PRIME32: u32 = 16777619;

    let mut h = OFFSET32;
    for &c in name {
        h = (h ^ c as u32).wrapping_mul(PRIME32);
    }
    (h ^ (h >> 16)) % NUM_BUCKETS
}

/// Round `x` up to a multiple of `unit`, which must be a power of two.
pub(crate) fn round_u32(x: u32, unit: u32) -> u32 {
    debug_assert!(unit.is_power_of_two());
    (x + unit - 1) & !(unit - 1)
}

/// `round_u32` for sizes held as `usize`.
pub(crate) fn round_usize(x: usize, unit: usize) -> usize {
    debug_assert!(unit.is_power_of_two());
    (x + unit - 1) & !(unit - 1)
}
