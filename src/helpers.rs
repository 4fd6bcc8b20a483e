//! Pure slot codec and prefix-range helpers.

use crate::constants::{BLOCK_INDEX_MASK, BLOCK_REF_MASK, PREFIX_LEN_SHIFT, VALUE_INDEX_MASK};

#[inline]
pub fn is_empty(slot: u32) -> bool {
    slot == 0
}

#[inline]
pub fn is_block_ref(slot: u32) -> bool {
    slot & BLOCK_REF_MASK == BLOCK_REF_MASK
}

#[inline]
pub fn encode_block_ref(block_idx: u32) -> u32 {
    debug_assert!(block_idx <= BLOCK_INDEX_MASK);
    BLOCK_REF_MASK | block_idx
}

#[inline]
pub fn decode_block_ref(slot: u32) -> u32 {
    slot & BLOCK_INDEX_MASK
}

/// Encodes a (value index, prefix length) terminal. Prefix length is stored
/// biased by one so that a `/0` terminal is still nonzero.
#[inline]
pub fn encode_terminal(value_idx: u32, prefix_len: u8) -> u32 {
    debug_assert!(value_idx <= VALUE_INDEX_MASK);
    ((prefix_len as u32 + 1) << PREFIX_LEN_SHIFT) | value_idx
}

#[inline]
pub fn decode_terminal(slot: u32) -> (u32, u8) {
    (slot & VALUE_INDEX_MASK, ((slot >> PREFIX_LEN_SHIFT) - 1) as u8)
}

/// Slot range `[start, end]` a prefix covers in its terminal block, given the
/// address byte at that depth and the number of spare bits `tail` (0..=8)
/// past the prefix in it. `tail == 8` covers the whole block.
#[inline]
pub fn terminal_range(byte: u8, tail: u32) -> (u8, u8) {
    let mask = (0xFFu32 << tail) as u8;
    let start = byte & mask;
    (start, start | !mask)
}
