use talon_cpu_core::cache::{ExitInfo, PatchOutcome, PatchRequest, TranslationCache};
use talon_x86::ir::{IrBlock, Terminator};

/// Placeholder branch word the "emitter" writes at unpatched exits.
const DISPATCH_WORD: u32 = 0xd65f_03c0; // ret
/// Marker the test patcher writes at patched sites.
const PATCHED_WORD: u32 = 0x1400_0000; // b .

fn dummy_ir(start: u32) -> IrBlock {
    IrBlock {
        start,
        insts: Vec::new(),
        term: Terminator::Jmp {
            target: start.wrapping_add(4),
        },
    }
}

fn code_with_exit_site() -> Vec<u8> {
    let mut code = vec![0u8; 16];
    code[8..12].copy_from_slice(&DISPATCH_WORD.to_le_bytes());
    code
}

fn patcher(req: PatchRequest<'_>) -> PatchOutcome {
    req.code[req.site..req.site + 4].copy_from_slice(&PATCHED_WORD.to_le_bytes());
    PatchOutcome::Patched
}

fn store_jmp_block(tc: &TranslationCache, addr: u32, size: u32, target: u32) {
    tc.store(
        addr,
        size,
        dummy_ir(addr),
        &code_with_exit_site(),
        vec![ExitInfo::jmp(target, 8)],
    )
    .unwrap();
}

#[test]
fn lookup_hits_after_store() {
    let tc = TranslationCache::new(1 << 16, 64);
    assert!(tc.lookup(0x1000).is_none());
    store_jmp_block(&tc, 0x1000, 16, 0x2000);
    assert!(tc.lookup(0x1000).is_some());
    assert_eq!(tc.len(), 1);
}

#[test]
fn chain_patches_and_records_incoming_link() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x1000, 16, 0x2000);
    store_jmp_block(&tc, 0x2000, 16, 0x3000);

    tc.chain(0x1000, &mut patcher);

    tc.with_block(0x1000, |b| {
        assert!(b.exits[0].patched);
        assert!(b.linked);
    })
    .unwrap();
    let src_id = tc.lookup(0x1000).unwrap();
    tc.with_block(0x2000, |b| {
        assert!(b.incoming.contains(&src_id));
    })
    .unwrap();
}

#[test]
fn chain_is_idempotent() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x1000, 16, 0x2000);
    store_jmp_block(&tc, 0x2000, 16, 0x3000);

    let mut calls = 0usize;
    let mut counting = |req: PatchRequest<'_>| {
        calls += 1;
        patcher(req)
    };
    tc.chain(0x1000, &mut counting);
    tc.chain(0x1000, &mut counting);
    assert_eq!(calls, 1, "second chain must introduce no new patches");
}

#[test]
fn chain_skips_missing_targets() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x1000, 16, 0x9999);
    tc.chain(0x1000, &mut patcher);
    tc.with_block(0x1000, |b| {
        assert!(!b.exits[0].patched);
        assert!(!b.linked);
    })
    .unwrap();
}

#[test]
fn invalidation_cascades_to_callers() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x1000, 16, 0x2000);
    store_jmp_block(&tc, 0x2000, 16, 0x3000);
    tc.chain(0x1000, &mut patcher);

    // Invalidate the target; the caller's patch must be cleared and its
    // branch site restored to the dispatcher word.
    tc.invalidate(0x2000);
    assert!(!tc.contains(0x2000));
    assert!(tc.contains(0x1000));
    tc.with_block(0x1000, |b| {
        assert!(!b.exits[0].patched);
    })
    .unwrap();

    let id = tc.lookup(0x1000).unwrap();
    let entry = tc.entry_ptr(id).unwrap();
    let restored = unsafe { std::ptr::read_unaligned(entry.add(8).cast::<u32>()) };
    assert_eq!(restored, DISPATCH_WORD, "branch site restored on unchain");
}

#[test]
fn conditional_exits_chain_both_legs() {
    let tc = TranslationCache::new(1 << 16, 64);
    let mut code = vec![0u8; 24];
    code[8..12].copy_from_slice(&DISPATCH_WORD.to_le_bytes());
    code[16..20].copy_from_slice(&DISPATCH_WORD.to_le_bytes());
    tc.store(
        0x1000,
        24,
        dummy_ir(0x1000),
        &code,
        vec![ExitInfo::cond(0x2000, 8, 0x3000, 16)],
    )
    .unwrap();
    store_jmp_block(&tc, 0x2000, 16, 0);
    store_jmp_block(&tc, 0x3000, 16, 0);

    tc.chain(0x1000, &mut patcher);
    tc.with_block(0x1000, |b| {
        assert!(b.exits[0].patched);
        assert!(b.exits[0].patched_false);
    })
    .unwrap();

    // Dropping only the false-leg target clears only that patch.
    tc.invalidate(0x3000);
    tc.with_block(0x1000, |b| {
        assert!(b.exits[0].patched);
        assert!(!b.exits[0].patched_false);
    })
    .unwrap();
}

#[test]
fn store_overwrites_existing_block() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x1000, 16, 0x2000);
    let first = tc.lookup(0x1000).unwrap();
    store_jmp_block(&tc, 0x1000, 32, 0x2000);
    assert_eq!(tc.len(), 1);
    tc.with_block(0x1000, |b| assert_eq!(b.guest_size, 32)).unwrap();
    // The old id slot is recycled or distinct; either way lookup yields the
    // fresh block.
    let second = tc.lookup(0x1000).unwrap();
    assert_eq!(tc.guest_range_of(second), Some((0x1000, 32)));
    let _ = first;
}

#[test]
fn invalidate_range_overlap_semantics() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x1000, 0x10, 0);
    store_jmp_block(&tc, 0x1040, 0x10, 0);
    store_jmp_block(&tc, 0x2000, 0x10, 0);

    // Range covering only the first two.
    tc.invalidate_range(0x1000, 0x1080);
    assert!(!tc.contains(0x1000));
    assert!(!tc.contains(0x1040));
    assert!(tc.contains(0x2000));

    // Second identical invalidation is a no-op.
    tc.invalidate_range(0x1000, 0x1080);
    assert!(tc.contains(0x2000));
    assert_eq!(tc.len(), 1);
}

#[test]
fn block_straddling_range_start_is_invalidated() {
    let tc = TranslationCache::new(1 << 16, 64);
    store_jmp_block(&tc, 0x0ff8, 0x10, 0); // covers 0x0ff8..0x1008
    tc.invalidate_range(0x1000, 0x1100);
    assert!(!tc.contains(0x0ff8));
}

#[test]
fn lru_eviction_runs_full_invalidation() {
    let tc = TranslationCache::new(1 << 16, 2);
    store_jmp_block(&tc, 0x1000, 16, 0x2000);
    store_jmp_block(&tc, 0x2000, 16, 0x1000);
    tc.chain(0x2000, &mut patcher);
    // Touch 0x1000 so 0x2000 is the LRU victim.
    let _ = tc.lookup(0x1000);
    store_jmp_block(&tc, 0x3000, 16, 0);
    assert!(tc.contains(0x1000));
    assert!(!tc.contains(0x2000));
    assert!(tc.contains(0x3000));
}

#[test]
fn flush_drops_everything() {
    let tc = TranslationCache::new(1 << 16, 64);
    for i in 0..8u32 {
        store_jmp_block(&tc, 0x1000 + i * 0x100, 16, 0);
    }
    assert_eq!(tc.len(), 8);
    tc.flush();
    assert!(tc.is_empty());
    assert_eq!(tc.chained_count(), 0);
}

#[test]
fn arena_exhaustion_reports_store_error() {
    let tc = TranslationCache::new(4096, 1024);
    let big = vec![0u8; 3000];
    assert!(tc
        .store(0x1000, 16, dummy_ir(0x1000), &big, vec![])
        .is_ok());
    assert!(tc
        .store(0x2000, 16, dummy_ir(0x2000), &big, vec![])
        .is_err());
}
