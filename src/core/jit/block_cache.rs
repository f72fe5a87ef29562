//! Block Cache.
//!
//! Maps guest entry points to translated blocks stored in the code buffer.
//! Lookup goes through a direct-mapped table indexed by the guest PC first
//! and falls back to a hash map keyed by `(address, MSR translation bits)`.
//! A second index from physical pages to blocks lets writes to guest memory
//! find every block built from the written range.
//!
//! Exits with a compile-time target are linked: their link slot names the
//! target block, so the executor can chain into it without a lookup. A
//! reverse index from target address to linking exits allows unlinking a
//! block when it is destroyed.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::{debug, error, trace};

use crate::common::error::JitError;
use crate::core::jit::code_buffer::CodeBuffer;
use crate::core::jit::emitter::{link_slot, ExitInfo, LINK_SLOT_OFFSET, MICRO_OP_SIZE};
use crate::system::devices::address_space::PHYSICAL_MASK;

/// Entries in the direct-mapped lookup table.
pub const FAST_BLOCK_MAP_SIZE: usize = 0x1_0000;
const FAST_BLOCK_MAP_MASK: u32 = FAST_BLOCK_MAP_SIZE as u32 - 1;

/// Granule of the physical invalidation index.
pub const INVALIDATION_PAGE_SHIFT: u32 = 12;

/// Identifies a block until it is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// An exit with a known target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExitSlot {
    /// Byte offset of the exit micro-op in the code buffer.
    pub offset: usize,
    pub target: u32,
    pub linked: Option<BlockId>,
}

#[derive(Clone, Debug)]
pub struct TranslatedBlock {
    pub id: BlockId,
    pub effective_address: u32,
    pub msr_bits: u32,
    /// Physical `(start, length)` ranges the block was translated from.
    pub physical_ranges: Vec<(u32, u32)>,
    pub code_offset: usize,
    pub code_len: usize,
    pub num_instructions: u32,
    pub linkable: bool,
    pub exits: Vec<ExitSlot>,
    /// Position in compile order.
    pub serial: u64,
}

impl TranslatedBlock {
    pub fn op_count(&self) -> usize {
        self.code_len / MICRO_OP_SIZE
    }

    /// True if any source range intersects `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.physical_ranges.iter().any(|&(s, len)| {
            let s = u64::from(s);
            s < end && start < s + u64::from(len)
        })
    }

    fn pages(&self) -> impl Iterator<Item = u32> + '_ {
        self.physical_ranges.iter().flat_map(|&(s, len)| {
            let first = s >> INVALIDATION_PAGE_SHIFT;
            let last = s.wrapping_add(len.max(1) - 1) >> INVALIDATION_PAGE_SHIFT;
            first..=last.max(first)
        })
    }
}

/// Counters kept by the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub blocks_compiled: u64,
    pub dispatch_hits: u64,
    pub fast_map_hits: u64,
    pub dispatch_misses: u64,
    pub blocks_invalidated: u64,
    pub flushes: u64,
    pub links: u64,
    pub unlinks: u64,
}

pub struct BlockCache {
    code: CodeBuffer,
    blocks: Vec<Option<TranslatedBlock>>,
    live: usize,
    start_map: HashMap<(u32, u32), BlockId>,
    fast_map: Vec<Option<BlockId>>,
    page_map: HashMap<u32, BTreeSet<BlockId>>,
    /// Target address to `(source block, exit index)`.
    links_to: HashMap<u32, BTreeSet<(BlockId, usize)>>,
    serial: u64,
    block_linking: bool,
    stats: CacheStats,
}

#[inline(always)]
fn fast_index(addr: u32) -> usize {
    ((addr >> 2) & FAST_BLOCK_MAP_MASK) as usize
}

impl BlockCache {
    pub fn new(code: CodeBuffer) -> Self {
        Self {
            code,
            blocks: Vec::new(),
            live: 0,
            start_map: HashMap::new(),
            fast_map: vec![None; FAST_BLOCK_MAP_SIZE],
            page_map: HashMap::new(),
            links_to: HashMap::new(),
            serial: 0,
            block_linking: true,
            stats: CacheStats::default(),
        }
    }

    pub fn code(&self) -> &CodeBuffer {
        &self.code
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Linking only affects blocks added after the change.
    pub fn set_block_linking(&mut self, enabled: bool) {
        self.block_linking = enabled;
    }

    pub fn block(&self, id: BlockId) -> Option<&TranslatedBlock> {
        self.blocks.get(id.0 as usize)?.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TranslatedBlock> {
        self.blocks.iter().flatten()
    }

    /// Number of exits currently linked to a block.
    pub fn link_count(&self) -> usize {
        self.iter()
            .flat_map(|b| b.exits.iter())
            .filter(|e| e.linked.is_some())
            .count()
    }

    /// Bytes a block of `ops` micro-ops needs.
    pub fn fits(&self, ops: usize) -> bool {
        ops * MICRO_OP_SIZE <= self.code.remaining()
    }

    /// Finds the block for `addr` under the given translation bits.
    pub fn lookup(&mut self, addr: u32, msr_bits: u32) -> Option<BlockId> {
        let slot = fast_index(addr);
        if let Some(id) = self.fast_map[slot] {
            if let Some(b) = self.block(id) {
                if b.effective_address == addr && b.msr_bits == msr_bits {
                    self.stats.dispatch_hits += 1;
                    self.stats.fast_map_hits += 1;
                    return Some(id);
                }
            }
        }
        match self.start_map.get(&(addr, msr_bits)).copied() {
            Some(id) => {
                self.fast_map[slot] = Some(id);
                self.stats.dispatch_hits += 1;
                Some(id)
            }
            None => {
                self.stats.dispatch_misses += 1;
                None
            }
        }
    }

    /// Returns a live block only if it still starts at `addr` under
    /// `msr_bits`. Used to validate a link slot read from code.
    pub fn check_link(&self, id: BlockId, addr: u32, msr_bits: u32) -> bool {
        self.block(id)
            .is_some_and(|b| b.effective_address == addr && b.msr_bits == msr_bits)
    }

    /// Copies a finished block into the code buffer and indexes it.
    pub fn add_block(
        &mut self,
        effective_address: u32,
        msr_bits: u32,
        physical_ranges: Vec<(u32, u32)>,
        num_instructions: u32,
        code: &[u8],
        exits: &[ExitInfo],
    ) -> Result<BlockId, JitError> {
        if let Some(old) = self.start_map.get(&(effective_address, msr_bits)).copied() {
            self.destroy_block(old);
        }
        let code_offset = self.code.emit(code)?;
        let id = BlockId(self.blocks.len() as u32);
        self.serial += 1;

        let block = TranslatedBlock {
            id,
            effective_address,
            msr_bits,
            physical_ranges,
            code_offset,
            code_len: code.len(),
            num_instructions,
            linkable: self.block_linking,
            exits: exits
                .iter()
                .map(|e| ExitSlot {
                    offset: code_offset + e.op_index * MICRO_OP_SIZE,
                    target: e.target,
                    linked: None,
                })
                .collect(),
            serial: self.serial,
        };

        for page in block.pages() {
            self.page_map.entry(page).or_default().insert(id);
        }
        self.start_map.insert((effective_address, msr_bits), id);
        self.fast_map[fast_index(effective_address)] = Some(id);
        self.blocks.push(Some(block));
        self.live += 1;
        self.stats.blocks_compiled += 1;

        if self.block_linking {
            self.link_block(id);
        }
        trace!(
            addr = format_args!("{:#010x}", effective_address),
            id = id.0,
            bytes = code.len(),
            "block added"
        );
        Ok(id)
    }

    fn link_block(&mut self, id: BlockId) {
        let Some(block) = self.block(id) else {
            return;
        };
        let msr_bits = block.msr_bits;
        let start = block.effective_address;
        let targets: Vec<(usize, u32)> = block
            .exits
            .iter()
            .enumerate()
            .map(|(i, e)| (i, e.target))
            .collect();

        // Outgoing exits.
        for (i, target) in targets {
            self.links_to.entry(target).or_default().insert((id, i));
            if let Some(&dest) = self.start_map.get(&(target, msr_bits)) {
                if self.block(dest).is_some_and(|d| d.linkable) {
                    self.set_link(id, i, Some(dest));
                }
            }
        }

        // Incoming exits that were waiting for this address.
        let sources: Vec<(BlockId, usize)> = self
            .links_to
            .get(&start)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for (src, i) in sources {
            let compatible = self
                .block(src)
                .is_some_and(|b| b.linkable && b.msr_bits == msr_bits);
            if compatible {
                self.set_link(src, i, Some(id));
            }
        }
    }

    fn set_link(&mut self, src: BlockId, exit: usize, dest: Option<BlockId>) {
        let Some(Some(block)) = self.blocks.get_mut(src.0 as usize) else {
            return;
        };
        let Some(slot) = block.exits.get_mut(exit) else {
            return;
        };
        if slot.linked == dest {
            return;
        }
        let offset = slot.offset + LINK_SLOT_OFFSET;
        slot.linked = dest;
        if let Err(e) = self.code.patch(offset, &link_slot(dest.map(|d| d.0))) {
            error!(error = %e, "failed to patch link slot");
            return;
        }
        if dest.is_some() {
            self.stats.links += 1;
        } else {
            self.stats.unlinks += 1;
        }
    }

    fn destroy_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        self.live -= 1;
        self.stats.blocks_invalidated += 1;

        for page in block.pages() {
            if let Some(set) = self.page_map.get_mut(&page) {
                set.remove(&id);
                if set.is_empty() {
                    self.page_map.remove(&page);
                }
            }
        }
        let key = (block.effective_address, block.msr_bits);
        if self.start_map.get(&key) == Some(&id) {
            self.start_map.remove(&key);
        }
        let slot = fast_index(block.effective_address);
        if self.fast_map[slot] == Some(id) {
            self.fast_map[slot] = None;
        }
        for (i, exit) in block.exits.iter().enumerate() {
            if let Some(set) = self.links_to.get_mut(&exit.target) {
                set.remove(&(id, i));
                if set.is_empty() {
                    self.links_to.remove(&exit.target);
                }
            }
        }

        // Nothing may chain into the dead block.
        let sources: Vec<(BlockId, usize)> = self
            .links_to
            .get(&block.effective_address)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for (src, i) in sources {
            let linked_here = self
                .block(src)
                .and_then(|b| b.exits.get(i))
                .is_some_and(|e| e.linked == Some(id));
            if linked_here {
                self.set_link(src, i, None);
            }
        }
    }

    /// Drops every block whose guest range intersects `[start, start+length)`.
    ///
    /// A range covering the whole address space flushes the cache. With
    /// `rebuild_dispatcher`, all links and the fast lookup table go too.
    pub fn invalidate_icache(&mut self, start: u32, length: u32, rebuild_dispatcher: bool) {
        if start == 0 && length == u32::MAX {
            self.clear();
            return;
        }
        if length > 0 {
            let start = u64::from(start & PHYSICAL_MASK);
            let end = start + u64::from(length);
            let first = (start >> INVALIDATION_PAGE_SHIFT) as u32;
            let last = ((end - 1) >> INVALIDATION_PAGE_SHIFT) as u32;

            let mut doomed = BTreeSet::new();
            for page in first..=last {
                if let Some(set) = self.page_map.get(&page) {
                    for &id in set {
                        if self.block(id).is_some_and(|b| b.overlaps(start, end)) {
                            doomed.insert(id);
                        }
                    }
                }
            }
            if !doomed.is_empty() {
                debug!(
                    start = format_args!("{:#010x}", start),
                    length,
                    blocks = doomed.len(),
                    "invalidating blocks"
                );
            }
            for id in doomed {
                self.destroy_block(id);
            }
        }
        if rebuild_dispatcher {
            self.unlink_all();
            self.fast_map.fill(None);
        }
    }

    /// True if some block was translated from the physical word at `phys`.
    pub fn covers(&self, phys: u32) -> bool {
        let phys = phys & PHYSICAL_MASK;
        self.page_map
            .get(&(phys >> INVALIDATION_PAGE_SHIFT))
            .is_some_and(|set| {
                set.iter().any(|&id| {
                    self.block(id)
                        .is_some_and(|b| b.overlaps(u64::from(phys), u64::from(phys) + 4))
                })
            })
    }

    fn unlink_all(&mut self) {
        let linked: Vec<(BlockId, usize)> = self
            .iter()
            .flat_map(|b| {
                b.exits
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.linked.is_some())
                    .map(move |(i, _)| (b.id, i))
            })
            .collect();
        for (src, i) in linked {
            self.set_link(src, i, None);
        }
    }

    /// Destroys every block and resets the code buffer.
    pub fn clear(&mut self) {
        debug!(blocks = self.live, "flushing block cache");
        self.stats.blocks_invalidated += self.live as u64;
        self.blocks.clear();
        self.live = 0;
        self.start_map.clear();
        self.fast_map.fill(None);
        self.page_map.clear();
        self.links_to.clear();
        self.code.reset();
        self.stats.flushes += 1;
    }
}
