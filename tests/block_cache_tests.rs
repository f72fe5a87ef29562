//! Integration tests for the block cache: lookup, linking and invalidation.

use proptest::prelude::*;

use ppc_emulator::common::error::JitError;
use ppc_emulator::core::jit::block_cache::{BlockCache, BlockId};
use ppc_emulator::core::jit::code_buffer::{page_size, CodeBuffer};
use ppc_emulator::core::jit::emitter::{BlockEmitter, ExitInfo, MicroOp, OpCode, MICRO_OP_SIZE};

const TRANSLATED: u32 = 0x30;

fn create_cache() -> BlockCache {
    BlockCache::new(CodeBuffer::new(256 * 1024).unwrap())
}

fn jump_block(target: u32) -> (Vec<u8>, Vec<ExitInfo>) {
    let mut e = BlockEmitter::new();
    e.push(MicroOp::new(OpCode::Cycles).imm(1));
    e.exit(OpCode::ExitBranch, target, 0);
    e.finish()
}

fn add(cache: &mut BlockCache, addr: u32, len: u32, target: u32) -> BlockId {
    let (code, exits) = jump_block(target);
    cache
        .add_block(addr, TRANSLATED, vec![(addr & 0x3FFF_FFFF, len)], len / 4, &code, &exits)
        .unwrap()
}

/// Reads the link slot of the block's first exit straight from the code.
fn linked_in_code(cache: &BlockCache, id: BlockId) -> Option<u32> {
    let exit = cache.block(id).unwrap().exits[0];
    let bytes = cache.code().read(exit.offset, MICRO_OP_SIZE).unwrap();
    MicroOp::decode(bytes, exit.offset).unwrap().linked_block()
}

/// Tests that lookups are keyed by address and translation bits.
#[test]
fn test_lookup_by_msr_bits() {
    let mut cache = create_cache();
    let id = add(&mut cache, 0x8000_1000, 8, 0x8000_2000);

    assert_eq!(cache.lookup(0x8000_1000, TRANSLATED), Some(id));
    assert_eq!(cache.lookup(0x8000_1000, 0), None);
    assert_eq!(cache.lookup(0x8000_1004, TRANSLATED), None);

    let stats = cache.stats();
    assert_eq!(stats.dispatch_hits, 1);
    assert_eq!(stats.dispatch_misses, 2);
}

/// Tests that the second lookup is served by the direct-mapped table.
#[test]
fn test_fast_map_hit() {
    let mut cache = create_cache();
    let id = add(&mut cache, 0x8000_1000, 8, 0x8000_2000);
    cache.lookup(0x8000_1000, TRANSLATED);
    cache.lookup(0x8000_1000, TRANSLATED);
    assert_eq!(cache.lookup(0x8000_1000, TRANSLATED), Some(id));
    assert_eq!(cache.stats().fast_map_hits, 3);
}

/// Tests that recompiling an address replaces the previous block.
#[test]
fn test_readd_replaces_block() {
    let mut cache = create_cache();
    let old = add(&mut cache, 0x8000_1000, 8, 0x8000_2000);
    let new = add(&mut cache, 0x8000_1000, 12, 0x8000_3000);

    assert_ne!(old, new);
    assert!(cache.block(old).is_none());
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.lookup(0x8000_1000, TRANSLATED), Some(new));
}

/// Tests that exits are linked in both directions and written into the code.
#[test]
fn test_links_are_patched_into_code() {
    let mut cache = create_cache();
    let a = add(&mut cache, 0x8000_1000, 8, 0x8000_2000);
    assert_eq!(linked_in_code(&cache, a), None);

    let b = add(&mut cache, 0x8000_2000, 8, 0x8000_1000);
    assert_eq!(linked_in_code(&cache, a), Some(b.0));
    assert_eq!(linked_in_code(&cache, b), Some(a.0));
    assert!(cache.check_link(b, 0x8000_2000, TRANSLATED));
    assert!(!cache.check_link(b, 0x8000_2000, 0));
    assert_eq!(cache.stats().links, 2);
}

/// Tests that destroying a block unlinks every exit that chained into it.
#[test]
fn test_invalidate_unlinks_sources() {
    let mut cache = create_cache();
    let a = add(&mut cache, 0x8000_1000, 8, 0x8000_2000);
    let b = add(&mut cache, 0x8000_2000, 8, 0x8000_1000);

    cache.invalidate_icache(0x2004, 4, false);
    assert!(cache.block(b).is_none());
    assert_eq!(linked_in_code(&cache, a), None);
    assert!(!cache.check_link(b, 0x8000_2000, TRANSLATED));

    // A fresh block at the same address is linked again.
    let c = add(&mut cache, 0x8000_2000, 8, 0x8000_4000);
    assert_eq!(linked_in_code(&cache, a), Some(c.0));
}

/// Tests that blocks added with linking off are neither linked nor linked to.
#[test]
fn test_linking_disabled() {
    let mut cache = create_cache();
    cache.set_block_linking(false);
    let a = add(&mut cache, 0x8000_1000, 8, 0x8000_2000);
    add(&mut cache, 0x8000_2000, 8, 0x8000_1000);
    assert_eq!(cache.link_count(), 0);
    assert_eq!(linked_in_code(&cache, a), None);
}

/// Tests that only blocks overlapping the written range are dropped.
#[test]
fn test_invalidate_overlapping_only() {
    let mut cache = create_cache();
    let low = add(&mut cache, 0x8000_1000, 0x20, 0);
    let high = add(&mut cache, 0x8000_1020, 0x20, 0);
    let far = add(&mut cache, 0x8000_9000, 0x20, 0);

    cache.invalidate_icache(0x101C, 8, false);
    assert!(cache.block(low).is_none());
    assert!(cache.block(high).is_none());
    assert!(cache.block(far).is_some());
    assert_eq!(cache.stats().blocks_invalidated, 2);
}

/// Tests that a whole-address-space invalidation flushes everything.
#[test]
fn test_full_flush() {
    let mut cache = create_cache();
    for i in 0..8 {
        add(&mut cache, 0x8000_1000 + i * 0x40, 0x40, 0x8000_1000);
    }
    assert!(cache.code().used() > 0);

    cache.invalidate_icache(0, u32::MAX, false);
    assert!(cache.is_empty());
    assert_eq!(cache.code().used(), 0);
    assert_eq!(cache.stats().flushes, 1);
    assert_eq!(cache.lookup(0x8000_1000, TRANSLATED), None);
}

/// Tests that an exhausted code buffer is reported, not overrun.
#[test]
fn test_code_buffer_full() {
    let mut cache = BlockCache::new(CodeBuffer::new(page_size()).unwrap());
    let (code, exits) = jump_block(0);
    let fit = page_size() / code.len();

    for i in 0..fit as u32 {
        cache
            .add_block(0x8000_0000 + i * 4, TRANSLATED, vec![(i * 4, 4)], 1, &code, &exits)
            .unwrap();
    }
    assert!(!cache.fits(2));
    let err = cache
        .add_block(0x8010_0000, TRANSLATED, vec![(0x10_0000, 4)], 1, &code, &exits)
        .unwrap_err();
    assert!(matches!(err, JitError::CodeBufferFull { .. }));
    assert_eq!(cache.len(), fit);
}

/// Tests that a block built from two ranges is dropped by a write to either.
#[test]
fn test_split_ranges() {
    let mut cache = create_cache();
    let (code, exits) = jump_block(0);
    let id = cache
        .add_block(
            0x8000_1000,
            TRANSLATED,
            vec![(0x1000, 8), (0x5000, 8)],
            4,
            &code,
            &exits,
        )
        .unwrap();
    assert!(cache.covers(0x5004));
    assert!(!cache.covers(0x3000));

    cache.invalidate_icache(0x5000, 4, false);
    assert!(cache.block(id).is_none());
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    /// Tests that after any write no block overlapping it survives, and
    /// every other block does.
    #[test]
    fn test_no_stale_block_survives_write(
        blocks in prop::collection::vec(1u32..=64, 1..24),
        write_start in 0u32..0x2000,
        write_len in 1u32..0x400,
    ) {
        let mut cache = create_cache();
        let mut ids = Vec::new();
        for (i, words) in blocks.iter().enumerate() {
            let addr = 0x8000_0000 + (i as u32) * 0x100;
            ids.push((add(&mut cache, addr, words * 4, addr + 0x100), addr, words * 4));
        }

        cache.invalidate_icache(write_start, write_len, false);

        let (start, end) = (u64::from(write_start), u64::from(write_start) + u64::from(write_len));
        for block in cache.iter() {
            prop_assert!(!block.overlaps(start, end));
        }
        for (id, addr, len) in ids {
            let phys = u64::from(addr & 0x3FFF_FFFF);
            let hit = phys < end && start < phys + u64::from(len);
            prop_assert_eq!(cache.block(id).is_none(), hit);
        }
        for block in cache.iter() {
            for exit in &block.exits {
                if let Some(dest) = exit.linked {
                    prop_assert!(cache.block(dest).is_some());
                }
            }
        }
    }
}
