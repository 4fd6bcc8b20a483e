//! Longest-prefix-match trie for fast IP address lookups.
//!
//! Maps IP prefixes (CIDR blocks), IPv4 or IPv6, to short byte-string
//! values. Lookup returns the value bound to the most specific stored
//! prefix containing an address, in at most 4 slot reads for IPv4 and 16
//! for IPv6 (the trie branches 256 ways on each address byte).
//!
//! ```
//! use ipnet::IpNet;
//! use lpmtrie::LpmTrie;
//! use std::net::IpAddr;
//!
//! let mut trie = LpmTrie::new();
//! trie.insert("10.0.0.0/8".parse::<IpNet>().unwrap(), b"broad").unwrap();
//! trie.insert("10.1.0.0/16".parse::<IpNet>().unwrap(), b"specific").unwrap();
//!
//! let addr: IpAddr = "10.1.2.3".parse().unwrap();
//! assert_eq!(trie.lookup(addr), Some(&b"specific"[..]));
//! ```
//!
//! # Shared storage
//!
//! A built trie serializes into a single self-describing buffer with
//! [`LpmTrie::pack`]; [`LpmTrie::load`] reinterprets such a buffer in place
//! without copying blocks or values, which makes the image suitable for
//! memory-mapped, multi-process read-mostly deployments. A loaded trie still
//! accepts inserts: new blocks and values go to an owned dynamic tier, while
//! slots inside the shared region are updated in place.
//!
//! # Thread safety
//!
//! A trie is not safe for concurrent mutation; readers are only safe
//! against other readers. For cross-process sharing, the packed image is
//! the coordination medium: one process builds and writes, others load the
//! buffer into independent handles.

pub mod constants;
pub mod errors;
pub mod helpers;
pub mod types;

pub use errors::{Error, Result};
pub use types::{Family, LpmTrie, Stats, StorageHeader};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::mem;
use std::net::IpAddr;
use std::ptr::{self, NonNull};
use std::slice;

use ipnet::IpNet;
use log::{debug, trace};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;

use constants::*;
use helpers::*;
use types::{LpmBlock, SharedBlocks, SharedValues};

fn zeroed_block() -> Box<LpmBlock> {
    Box::new([0; BLOCK_SIZE])
}

/// A child block inherits the slot it replaces: an evicted terminal is
/// replicated into all 256 slots so its footprint survives the descent.
fn block_with_slot(init_slot: u32) -> Box<LpmBlock> {
    if is_empty(init_slot) {
        zeroed_block()
    } else {
        Box::new([init_slot; BLOCK_SIZE])
    }
}

impl LpmTrie<'static> {
    /// Creates an empty trie: one zeroed root block per family, no shared tier.
    pub fn new() -> Self {
        Self::ensure_logging();
        LpmTrie {
            shared: [SharedBlocks::empty(), SharedBlocks::empty()],
            shared_values: None,
            shared_value_count: 0,
            dynamic: [vec![zeroed_block()], vec![zeroed_block()]],
            values: HashMap::new(),
            rev_values: Vec::new(),
            _storage: PhantomData,
        }
    }
}

impl Default for LpmTrie<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> LpmTrie<'a> {
    // ---- logging bootstrapper -------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// Loads a trie from a packed storage image, reinterpreting the block
    /// and value regions in place. The buffer must outlive the trie; it is
    /// borrowed mutably because inserts may write into shared blocks.
    ///
    /// Only buffer bounds and header identity are validated. A structurally
    /// corrupt image (e.g. a slot referencing a block past the declared
    /// count) is undefined behavior.
    pub fn load(storage: &'a mut [u8]) -> Result<Self> {
        Self::ensure_logging();

        let header_size = mem::size_of::<StorageHeader>();
        let storage_len = storage.len();
        if storage_len < header_size {
            return Err(Error::BufferTooSmall {
                needed: header_size,
                got: storage_len,
            });
        }
        let base = storage.as_mut_ptr();
        if base as usize % mem::align_of::<StorageHeader>() != 0 {
            return Err(Error::MisalignedBuffer);
        }
        // SAFETY: length and alignment checked above; the header is plain u32s.
        let header = unsafe { ptr::read(base as *const StorageHeader) };

        if header.magic != STORAGE_MAGIC {
            return Err(Error::BadMagic {
                expected: STORAGE_MAGIC,
                got: header.magic,
            });
        }
        if header.version != STORAGE_VERSION {
            return Err(Error::UnsupportedVersion {
                expected: STORAGE_VERSION,
                got: header.version,
            });
        }

        let mut trie = LpmTrie {
            shared: [SharedBlocks::empty(), SharedBlocks::empty()],
            shared_values: None,
            shared_value_count: header.value_count as usize,
            dynamic: [Vec::new(), Vec::new()],
            values: HashMap::new(),
            rev_values: Vec::new(),
            _storage: PhantomData,
        };

        let regions = [
            (
                Family::V4,
                header.v4_block_count as usize,
                header.v4_blocks_offset as usize,
            ),
            (
                Family::V6,
                header.v6_block_count as usize,
                header.v6_blocks_offset as usize,
            ),
        ];
        for (family, count, offset) in regions {
            if count == 0 {
                // No shared blocks for this family: seed a dynamic root.
                trie.dynamic[family.index()].push(zeroed_block());
                continue;
            }
            let needed = offset + count * BLOCK_BYTES;
            if storage_len < needed {
                return Err(Error::BufferTooSmall {
                    needed,
                    got: storage_len,
                });
            }
            if offset % mem::align_of::<LpmBlock>() != 0 {
                return Err(Error::MisalignedBuffer);
            }
            // SAFETY: region bounds and alignment validated; blocks are plain
            // u32 arrays viewed where the header says they are.
            let ptr = unsafe { NonNull::new_unchecked(base.add(offset) as *mut LpmBlock) };
            trie.shared[family.index()] = SharedBlocks { ptr, len: count };
        }

        let value_count = header.value_count as usize;
        let slot_size = header.value_slot_size as usize;
        if value_count > 0 && slot_size > 0 {
            let offset = header.values_offset as usize;
            let needed = offset + value_count * slot_size;
            if storage_len < needed {
                return Err(Error::BufferTooSmall {
                    needed,
                    got: storage_len,
                });
            }
            // SAFETY: region bounds validated; the value region is raw bytes.
            let ptr = unsafe { NonNull::new_unchecked(base.add(offset)) };
            trie.shared_values = Some(SharedValues { ptr, slot_size });
        }

        debug!(
            "loaded image: v4_blocks={} v6_blocks={} values={} slot_size={}",
            header.v4_block_count, header.v6_block_count, header.value_count, slot_size
        );
        Ok(trie)
    }

    /// Binds every address in `net` to `value`, except where a strictly more
    /// specific prefix already covers it. Re-inserting the same prefix
    /// overwrites its value. Fails only when an index space overflows
    /// (2^24 values, 2^30 blocks per family).
    pub fn insert(&mut self, net: IpNet, value: &[u8]) -> Result<()> {
        counter!("lpmtrie_inserts_total").increment(1);
        let value_idx = self.intern(value)?;
        let prefix_len = net.prefix_len() as u32;
        match net.network() {
            IpAddr::V4(addr) => self.insert_bytes(Family::V4, &addr.octets(), prefix_len, value_idx),
            IpAddr::V6(addr) => self.insert_bytes(Family::V6, &addr.octets(), prefix_len, value_idx),
        }
    }

    fn insert_bytes(
        &mut self,
        family: Family,
        addr: &[u8],
        prefix_len: u32,
        value_idx: u32,
    ) -> Result<()> {
        debug!("insert: family={family:?} addr={addr:02x?} prefix_len={prefix_len}");
        let mut block_idx = 0u32;
        for (i, &byte) in addr.iter().enumerate() {
            let tail = (i as i32 + 1) * 8 - prefix_len as i32;
            if tail >= 0 {
                // Last byte the prefix touches: claim the covered slot range.
                let (start, end) = terminal_range(byte, tail as u32);
                trace!("insert: terminal at depth {i}, block {block_idx}, slots [{start}, {end}]");
                self.propagate(family, block_idx, value_idx, prefix_len as u8, start, end);
                return Ok(());
            }

            let slot = self.slot(family, block_idx, byte);
            if is_block_ref(slot) {
                block_idx = decode_block_ref(slot);
            } else {
                // Descend through an empty or terminal slot: the new child is
                // seeded with the old slot value so an evicted terminal keeps
                // covering every deeper address.
                let child = self.new_block(family, slot)?;
                self.set_slot(family, block_idx, byte, encode_block_ref(child));
                block_idx = child;
            }
        }
        Ok(())
    }

    /// Writes `(value_idx, prefix_len)` terminals across `[start, end]` of a
    /// block, preserving anything more specific. The same rule applies at
    /// every level: empty slots are claimed, existing terminals survive
    /// unless the new prefix is at least as long, and block references are
    /// descended (over their full slot range) so the new prefix also reaches
    /// slots materialized by finer inserts deeper down. Without the descent,
    /// a coarse prefix inserted after a finer one two or more bytes below it
    /// would leave uncovered holes, and results would depend on insertion
    /// order. Depth is bounded by the address length.
    fn propagate(
        &mut self,
        family: Family,
        block_idx: u32,
        value_idx: u32,
        prefix_len: u8,
        start: u8,
        end: u8,
    ) {
        let new_slot = encode_terminal(value_idx, prefix_len);
        for pos in start..=end {
            let current = self.slot(family, block_idx, pos);
            if is_block_ref(current) {
                let child_idx = decode_block_ref(current);
                self.propagate(family, child_idx, value_idx, prefix_len, 0, u8::MAX);
            } else if is_empty(current) {
                self.set_slot(family, block_idx, pos, new_slot);
            } else {
                let (_, existing_len) = decode_terminal(current);
                if prefix_len >= existing_len {
                    self.set_slot(family, block_idx, pos, new_slot);
                }
            }
        }
    }

    /// Returns the value bound to the longest stored prefix containing
    /// `addr`, or `None` if no prefix matches.
    pub fn lookup(&self, addr: IpAddr) -> Option<&[u8]> {
        match addr {
            IpAddr::V4(a) => self.lookup_bytes(Family::V4, &a.octets()),
            IpAddr::V6(a) => self.lookup_bytes(Family::V6, &a.octets()),
        }
    }

    fn lookup_bytes(&self, family: Family, addr: &[u8]) -> Option<&[u8]> {
        let mut block_idx = 0u32;
        for &byte in addr {
            let slot = self.slot(family, block_idx, byte);
            if is_block_ref(slot) {
                block_idx = decode_block_ref(slot);
            } else if is_empty(slot) {
                return None;
            } else {
                let (value_idx, _) = decode_terminal(slot);
                return self.value_at(value_idx);
            }
        }
        None
    }

    /// Serializes the trie into one contiguous buffer: header, IPv4 blocks,
    /// IPv6 blocks (shared tier first within each family), then values in
    /// fixed-width slots. Fails if any value exceeds 255 bytes.
    pub fn pack(&self) -> Result<Vec<u8>> {
        // The widest value decides the slot width. Over-long values are
        // rejected here, not at insert.
        let mut max_value_len = 0usize;
        if let Some(sv) = &self.shared_values {
            for i in 0..self.shared_value_count {
                // SAFETY: i < shared_value_count, region validated at load.
                let len = unsafe { *sv.ptr.as_ptr().add(i * sv.slot_size) } as usize;
                max_value_len = max_value_len.max(len);
            }
        }
        for (i, value) in self.rev_values.iter().enumerate() {
            if value.len() > MAX_VALUE_LEN {
                return Err(Error::ValueTooLong {
                    index: self.shared_value_count + i,
                    len: value.len(),
                });
            }
            max_value_len = max_value_len.max(value.len());
        }

        let header_size = mem::size_of::<StorageHeader>();
        let v4_blocks = self.block_count(Family::V4);
        let v6_blocks = self.block_count(Family::V6);
        let value_count = self.shared_value_count + self.rev_values.len();
        let value_slot_size = if value_count == 0 { 0 } else { max_value_len + 1 };

        let v4_offset = header_size;
        let v6_offset = v4_offset + v4_blocks * BLOCK_BYTES;
        let values_offset = v6_offset + v6_blocks * BLOCK_BYTES;
        let total = values_offset + value_count * value_slot_size;

        let mut storage = vec![0u8; total];
        let header = StorageHeader {
            magic: STORAGE_MAGIC,
            version: STORAGE_VERSION,
            v4_block_count: v4_blocks as u32,
            v6_block_count: v6_blocks as u32,
            value_count: value_count as u32,
            value_slot_size: value_slot_size as u32,
            v4_blocks_offset: v4_offset as u32,
            v6_blocks_offset: v6_offset as u32,
            values_offset: values_offset as u32,
        };
        // SAFETY: the destination has at least header_size bytes.
        unsafe { ptr::write_unaligned(storage.as_mut_ptr() as *mut StorageHeader, header) };

        let mut offset = v4_offset;
        for family in [Family::V4, Family::V6] {
            let tier = &self.shared[family.index()];
            for i in 0..tier.len {
                // SAFETY: i < tier.len, view established at load.
                let bytes = unsafe {
                    slice::from_raw_parts(tier.ptr.as_ptr().add(i) as *const u8, BLOCK_BYTES)
                };
                storage[offset..offset + BLOCK_BYTES].copy_from_slice(bytes);
                offset += BLOCK_BYTES;
            }
            for block in &self.dynamic[family.index()] {
                // SAFETY: a block is exactly BLOCK_BYTES of plain u32s.
                let bytes =
                    unsafe { slice::from_raw_parts(block.as_ptr() as *const u8, BLOCK_BYTES) };
                storage[offset..offset + BLOCK_BYTES].copy_from_slice(bytes);
                offset += BLOCK_BYTES;
            }
        }

        // Re-slot every value to the new width; trailing padding stays zero.
        let mut offset = values_offset;
        if let Some(sv) = &self.shared_values {
            for i in 0..self.shared_value_count {
                // SAFETY: i < shared_value_count, region validated at load.
                let src = unsafe {
                    slice::from_raw_parts(sv.ptr.as_ptr().add(i * sv.slot_size), sv.slot_size)
                };
                let len = src[0] as usize;
                storage[offset] = src[0];
                storage[offset + 1..offset + 1 + len].copy_from_slice(&src[1..1 + len]);
                offset += value_slot_size;
            }
        }
        for value in &self.rev_values {
            storage[offset] = value.len() as u8;
            storage[offset + 1..offset + 1 + value.len()].copy_from_slice(value);
            offset += value_slot_size;
        }

        debug!(
            "packed image: {total} bytes, v4_blocks={v4_blocks} v6_blocks={v6_blocks} values={value_count}"
        );
        Ok(storage)
    }

    /// Block and byte counts across both tiers. Byte figures include
    /// container bookkeeping for the dynamic tier and are approximate.
    pub fn stats(&self) -> Stats {
        let v4_shared = self.shared[Family::V4.index()].len;
        let v6_shared = self.shared[Family::V6.index()].len;
        let v4_dynamic = self.dynamic[Family::V4.index()].len();
        let v6_dynamic = self.dynamic[Family::V6.index()].len();

        fn family_bytes(shared: usize, dynamic: usize) -> usize {
            let mut bytes = shared * BLOCK_BYTES;
            if dynamic > 0 {
                bytes += dynamic * BLOCK_BYTES;
                bytes += dynamic * mem::size_of::<Box<LpmBlock>>();
                bytes += mem::size_of::<Vec<Box<LpmBlock>>>();
            }
            bytes
        }
        let ipv4_storage_bytes = family_bytes(v4_shared, v4_dynamic);
        let ipv6_storage_bytes = family_bytes(v6_shared, v6_dynamic);

        let mut values_storage_bytes = self
            .shared_values
            .as_ref()
            .map_or(0, |sv| self.shared_value_count * sv.slot_size);
        if !self.rev_values.is_empty() {
            let payload: usize = self.rev_values.iter().map(|v| v.len()).sum();
            // Payload is held twice (value list + dedup map key), plus
            // container bookkeeping per entry.
            values_storage_bytes += 2 * payload;
            values_storage_bytes += self.rev_values.len()
                * (2 * mem::size_of::<Vec<u8>>() + mem::size_of::<u32>());
            values_storage_bytes +=
                mem::size_of::<Vec<Vec<u8>>>() + mem::size_of::<HashMap<Vec<u8>, u32>>();
        }

        Stats {
            ipv4_blocks: v4_shared + v4_dynamic,
            ipv6_blocks: v6_shared + v6_dynamic,
            ipv4_storage_bytes,
            ipv6_storage_bytes,
            values_storage_bytes,
            total_size_bytes: ipv4_storage_bytes + ipv6_storage_bytes + values_storage_bytes,
        }
    }

    /// Emit gauges for the current stats (caller decides cadence).
    pub fn report_stats_metrics(&self) {
        let stats = self.stats();
        gauge!("lpmtrie_ipv4_blocks").set(stats.ipv4_blocks as f64);
        gauge!("lpmtrie_ipv6_blocks").set(stats.ipv6_blocks as f64);
        gauge!("lpmtrie_total_size_bytes").set(stats.total_size_bytes as f64);
    }

    // ---- value table ----------------------------------------------------

    /// Interns a value into the dynamic tier, deduplicating against values
    /// inserted this session. Shared-tier values are not rehashed on load,
    /// so a duplicate across tiers gets a fresh index.
    fn intern(&mut self, value: &[u8]) -> Result<u32> {
        if let Some(&idx) = self.values.get(value) {
            return Ok(idx);
        }
        let idx = self.shared_value_count + self.rev_values.len();
        if idx > VALUE_INDEX_MASK as usize {
            return Err(Error::ValueIndexOverflow);
        }
        self.values.insert(value.to_vec(), idx as u32);
        self.rev_values.push(value.to_vec());
        Ok(idx as u32)
    }

    fn value_at(&self, value_idx: u32) -> Option<&[u8]> {
        let idx = value_idx as usize;
        if idx < self.shared_value_count {
            let sv = self.shared_values.as_ref()?;
            let offset = idx * sv.slot_size;
            // SAFETY: idx < shared_value_count, region validated at load.
            let slot = unsafe { slice::from_raw_parts(sv.ptr.as_ptr().add(offset), sv.slot_size) };
            let len = slot[0] as usize;
            if len + 1 > sv.slot_size {
                return None;
            }
            return Some(&slot[1..1 + len]);
        }
        self.rev_values
            .get(idx - self.shared_value_count)
            .map(|v| v.as_slice())
    }

    // ---- block store ----------------------------------------------------

    fn block_count(&self, family: Family) -> usize {
        self.shared[family.index()].len + self.dynamic[family.index()].len()
    }

    #[inline]
    fn block(&self, family: Family, block_idx: u32) -> &LpmBlock {
        let tier = &self.shared[family.index()];
        let idx = block_idx as usize;
        if idx < tier.len {
            // SAFETY: idx < tier.len, view established at load.
            unsafe { &*tier.ptr.as_ptr().add(idx) }
        } else {
            &self.dynamic[family.index()][idx - tier.len]
        }
    }

    #[inline]
    fn block_mut(&mut self, family: Family, block_idx: u32) -> &mut LpmBlock {
        let tier = &self.shared[family.index()];
        let idx = block_idx as usize;
        if idx < tier.len {
            // SAFETY: idx < tier.len; &mut self holds the storage borrow, so
            // writing into the shared region cannot race.
            unsafe { &mut *tier.ptr.as_ptr().add(idx) }
        } else {
            let shared_len = tier.len;
            &mut self.dynamic[family.index()][idx - shared_len]
        }
    }

    #[inline]
    fn slot(&self, family: Family, block_idx: u32, byte: u8) -> u32 {
        self.block(family, block_idx)[byte as usize]
    }

    #[inline]
    fn set_slot(&mut self, family: Family, block_idx: u32, byte: u8, slot: u32) {
        self.block_mut(family, block_idx)[byte as usize] = slot;
    }

    /// Appends a block to the dynamic tier, every slot set to `init_slot`,
    /// and returns its logical index (shared tier counts first).
    fn new_block(&mut self, family: Family, init_slot: u32) -> Result<u32> {
        let logical = self.block_count(family);
        if logical > BLOCK_INDEX_MASK as usize {
            return Err(Error::BlockIndexOverflow);
        }
        self.dynamic[family.index()].push(block_with_slot(init_slot));
        counter!("lpmtrie_blocks_allocated_total").increment(1);
        Ok(logical as u32)
    }
}
