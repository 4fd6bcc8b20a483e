//! Slot encoding and storage image constants.

/// Slots per block: one per possible value of an address byte.
pub const BLOCK_SIZE: usize = 256;

/// Raw byte size of one block (256 native-endian u32 slots).
pub const BLOCK_BYTES: usize = BLOCK_SIZE * 4;

// Slot encoding:
// - empty: 0x0000_0000 exactly
// - block reference: top 2 bits set (0xC000_0000 | block index)
// - terminal: prefix length + 1 in the top byte (1..=129), value index below.
//   The top byte of a terminal never reaches 0xC0, so the encodings cannot
//   collide.
pub const BLOCK_REF_MASK: u32 = 0xC000_0000;
pub const BLOCK_INDEX_MASK: u32 = 0x3FFF_FFFF;
pub const PREFIX_LEN_SHIFT: u32 = 24;
pub const VALUE_INDEX_MASK: u32 = 0x00FF_FFFF;

/// Longest value a packed image can carry; slot lengths are a single byte.
pub const MAX_VALUE_LEN: usize = 255;

pub const STORAGE_MAGIC: u32 = 0x4C50_4D00; // "LPM\0"
pub const STORAGE_VERSION: u32 = 1;
