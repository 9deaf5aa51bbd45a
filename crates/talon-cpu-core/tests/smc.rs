use talon_cpu_core::cache::{ExitInfo, TranslationCache};
use talon_cpu_core::mem::{FlatTestBus, MemConfig, MemError, MemoryManager, PageProt};
use talon_x86::ir::{IrBlock, Terminator};

fn dummy_ir(start: u32) -> IrBlock {
    IrBlock {
        start,
        insts: Vec::new(),
        term: Terminator::Jmp {
            target: start.wrapping_add(4),
        },
    }
}

fn setup() -> (MemoryManager, TranslationCache) {
    let bus = FlatTestBus::new(0x10000);
    let mem = MemoryManager::new(Box::new(bus), MemConfig::default());
    let tc = TranslationCache::new(1 << 16, 64);
    (mem, tc)
}

fn store_block(tc: &TranslationCache, mem: &MemoryManager, addr: u32, size: u32) {
    tc.store(addr, size, dummy_ir(addr), &[0u8; 8], vec![ExitInfo::unchained(
        talon_cpu_core::cache::ExitKind::Ret,
    )])
    .unwrap();
    mem.register_code_pages(addr, size);
}

#[test]
fn registering_code_strips_write_permission() {
    let (mem, tc) = setup();
    store_block(&tc, &mem, 0x1000, 16);
    assert!(mem.page_contains_code(0x1000));
    assert!(!mem.page_prot(0x1000).contains(PageProt::WRITE));
    // Invariant: every page overlapping a translated block is code + no
    // write.
    assert!(mem.page_contains_code(0x1004));
}

#[test]
fn store_to_code_page_invalidates_translations() {
    let (mem, tc) = setup();
    store_block(&tc, &mem, 0x1000, 16);
    assert!(tc.contains(0x1000));

    mem.write_u8(&tc, 0x1002, 0xcc);
    assert!(!tc.contains(0x1000), "translation must be invalidated");
    assert_eq!(mem.read_u8(0x1002), 0xcc, "the write itself must land");
    assert!(mem.page_dirty(0x1000));
}

#[test]
fn store_to_plain_page_leaves_cache_alone() {
    let (mem, tc) = setup();
    store_block(&tc, &mem, 0x1000, 16);
    mem.write_u32(&tc, 0x5000, 0xdead_beef);
    assert!(tc.contains(0x1000));
    assert_eq!(mem.read_u32(0x5000), 0xdead_beef);
}

#[test]
fn page_straddling_store_invalidates_both_pages() {
    let (mem, tc) = setup();
    // One block on each side of the 0x2000 page boundary.
    store_block(&tc, &mem, 0x1ff0, 0x10);
    store_block(&tc, &mem, 0x2000, 0x10);

    // A 4-byte store straddling 0x1ffe..0x2002.
    mem.write_u32(&tc, 0x1ffe, 0x11223344);
    assert!(!tc.contains(0x1ff0));
    assert!(!tc.contains(0x2000));
    assert_eq!(mem.read_u32(0x1ffe), 0x11223344);
}

#[test]
fn block_write_spanning_code_invalidates() {
    let (mem, tc) = setup();
    store_block(&tc, &mem, 0x3000, 8);
    let data = [0u8; 64];
    mem.write_block(&tc, 0x2fe0, &data);
    assert!(!tc.contains(0x3000));
}

#[test]
fn protection_fault_on_code_page_is_handled_and_rearmed() {
    let (mem, tc) = setup();
    store_block(&tc, &mem, 0x1000, 16);
    assert!(mem.handle_protection_fault(&tc, 0x1008).is_ok());
    assert!(!tc.contains(0x1000));
    // Page is writable again so the embedder can retry the store.
    assert!(mem.page_prot(0x1000).contains(PageProt::WRITE));
    assert!(!mem.page_contains_code(0x1000));
}

#[test]
fn protection_fault_on_plain_page_is_forwarded() {
    let (mem, tc) = setup();
    let err = mem.handle_protection_fault(&tc, 0x7000).unwrap_err();
    assert_eq!(err, MemError::NotCode { addr: 0x7000 });
}

#[test]
fn notify_modified_invalidates_and_is_idempotent() {
    let (mem, tc) = setup();
    store_block(&tc, &mem, 0x1000, 16);
    mem.notify_modified(&tc, 0x1000, 0x20);
    assert!(!tc.contains(0x1000));
    // Second notification over the same range is a no-op.
    mem.notify_modified(&tc, 0x1000, 0x20);
    assert!(tc.is_empty());
}

#[test]
fn smc_disabled_skips_page_tracking() {
    let bus = FlatTestBus::new(0x10000);
    let mem = MemoryManager::new(
        Box::new(bus),
        MemConfig {
            smc_detection: false,
            ..MemConfig::default()
        },
    );
    let tc = TranslationCache::new(1 << 16, 64);
    store_block(&tc, &mem, 0x1000, 16);
    mem.write_u8(&tc, 0x1002, 0xcc);
    // With SMC detection off the embedder is on its own: the translation
    // survives the store.
    assert!(tc.contains(0x1000));
}

#[test]
fn custom_page_size_is_honoured() {
    let bus = FlatTestBus::new(0x10000);
    let mem = MemoryManager::new(
        Box::new(bus),
        MemConfig {
            page_size: 1024,
            ..MemConfig::default()
        },
    );
    let tc = TranslationCache::new(1 << 16, 64);
    store_block(&tc, &mem, 0x1000, 16);
    assert!(mem.page_contains_code(0x13ff));
    assert!(!mem.page_contains_code(0x1400));
}
