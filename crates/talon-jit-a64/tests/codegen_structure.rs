//! Structural checks on emitted blocks: exit-site layout, veneer
//! reservations, and the pipeline wiring against the translation cache.

use talon_cpu_core::cache::{ExitKind, TranslationCache};
use talon_jit_a64::a64::VENEER_WORDS;
use talon_jit_a64::translate::{chain_patcher, translate_block};
use talon_types::{Cond, DataType, FlagSet, Gpr, Width};
use talon_x86::decode::decode_one;
use talon_x86::ir::{AluOp, Inst, IrBlock, IrBuilder, Terminator};

fn word_at(code: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(code[off..off + 4].try_into().unwrap())
}

fn simple_jmp_block() -> IrBlock {
    let mut b = IrBuilder::new();
    let v = b.const_val(5, DataType::I32);
    b.push(Inst::WriteReg {
        reg: Gpr::Eax,
        width: Width::W32,
        high8: false,
        src: v,
    });
    b.finish(0x1000, Terminator::Jmp { target: 0x2000 })
}

#[test]
fn emitted_code_is_word_aligned_and_nonempty() {
    let t = translate_block(&simple_jmp_block()).unwrap();
    assert!(!t.code.is_empty());
    assert_eq!(t.code.len() % 4, 0);
}

#[test]
fn jmp_exit_reserves_patch_site_and_veneer() {
    let t = translate_block(&simple_jmp_block()).unwrap();
    assert_eq!(t.exits.len(), 1);
    let exit = &t.exits[0];
    assert_eq!(exit.kind, ExitKind::Jmp);
    assert_eq!(exit.target, 0x2000);
    assert!(!exit.patched);

    // Unpatched site is `b .+4` over the veneer slot... it is `b .` with
    // zero offset placeholder; the words after it are the reserved NOPs.
    let site = exit.patch_offset;
    assert_eq!(word_at(&t.code, site), 0x1400_0000);
    for k in 1..=VENEER_WORDS {
        assert_eq!(word_at(&t.code, site + 4 * k), 0xD503_201F, "veneer NOP {k}");
    }
}

#[test]
fn conditional_exit_has_two_sites() {
    let mut b = IrBuilder::new();
    let l = b.const_val(1, DataType::I32);
    let r = b.const_val(2, DataType::I32);
    b.push(Inst::CmpFlags { lhs: l, rhs: r });
    let block = b.finish(
        0x1000,
        Terminator::Jcc {
            cond: Cond::Z,
            target: 0x3000,
            fallthrough: 0x1008,
        },
    );
    let t = translate_block(&block).unwrap();
    assert_eq!(t.exits.len(), 1);
    let exit = &t.exits[0];
    assert_eq!(exit.kind, ExitKind::Cond);
    assert_eq!(exit.target, 0x3000);
    assert_eq!(exit.target_false, 0x1008);
    assert_ne!(exit.patch_offset, exit.patch_offset_false);
    assert_eq!(word_at(&t.code, exit.patch_offset), 0x1400_0000);
    assert_eq!(word_at(&t.code, exit.patch_offset_false), 0x1400_0000);
}

#[test]
fn ret_terminator_is_unchainable() {
    // Decoded RET.
    let block = decode_one(&[0xc3], 0x1000).unwrap();
    let t = translate_block(&block).unwrap();
    assert_eq!(t.exits.len(), 1);
    assert_eq!(t.exits[0].kind, ExitKind::Ret);
}

#[test]
fn decoded_scenarios_translate_cleanly() {
    // The end-to-end byte streams from the test plan must all make it
    // through regalloc and emission.
    let cases: &[&[u8]] = &[
        &[0xb8, 0x05, 0x00, 0x00, 0x00, 0xa3, 0x00, 0x01, 0x00, 0x00, 0xc3],
        &[0x31, 0xc0, 0x74, 0x05],
        &[0xb9, 0x05, 0x00, 0x00, 0x00, 0x31, 0xc0, 0x40, 0xe2, 0xfd],
        &[0x0f, 0xfc, 0xc1, 0xc3],
        &[0xd9, 0xeb, 0xd9, 0xf2, 0xc3],
        &[0xf3, 0x0f, 0x58, 0xc1, 0xc3],
        &[0xf7, 0xf1, 0xc3],
    ];
    for code in cases {
        let block = decode_one(code, 0x1000).unwrap();
        let t = translate_block(&block).unwrap();
        assert!(!t.code.is_empty());
    }
}

#[test]
fn chaining_through_cache_patches_emitted_site() {
    let tc = TranslationCache::new(1 << 20, 64);
    let a = translate_block(&simple_jmp_block()).unwrap();
    let block_a = simple_jmp_block();
    tc.store(0x1000, 11, block_a, &a.code, a.exits).unwrap();

    // Target block at 0x2000.
    let mut b = IrBuilder::new();
    let v = b.const_val(1, DataType::I32);
    b.push(Inst::WriteReg {
        reg: Gpr::Ebx,
        width: Width::W32,
        high8: false,
        src: v,
    });
    let block_b = b.finish(0x2000, Terminator::Jmp { target: 0x3000 });
    let t_b = translate_block(&block_b).unwrap();
    tc.store(0x2000, 7, block_b, &t_b.code, t_b.exits).unwrap();

    tc.chain(0x1000, &mut chain_patcher);

    tc.with_block(0x1000, |blk| {
        assert!(blk.exits[0].patched);
        assert!(!blk.exits[0].long_patched, "arena-local patch is short-form");
    })
    .unwrap();

    // Invalidating the target restores the site to the placeholder.
    tc.invalidate(0x2000);
    tc.with_block(0x1000, |blk| assert!(!blk.exits[0].patched)).unwrap();
    let id = tc.lookup(0x1000).unwrap();
    let entry = tc.entry_ptr(id).unwrap();
    let site = tc.with_block(0x1000, |blk| blk.exits[0].patch_offset).unwrap();
    let restored = unsafe { std::ptr::read_unaligned(entry.add(site).cast::<u32>()) };
    assert_eq!(restored, 0x1400_0000);
}

#[test]
fn retranslation_is_deterministic() {
    let code = [0xb8, 0x05, 0x00, 0x00, 0x00, 0xa3, 0x00, 0x01, 0x00, 0x00, 0xc3];
    let block = decode_one(&code, 0x1000).unwrap();
    let first = translate_block(&block).unwrap();
    let second = translate_block(&block).unwrap();
    assert_eq!(first.code, second.code);
    assert_eq!(first.exits.len(), second.exits.len());
}

#[test]
fn spilled_blocks_still_emit() {
    // Enough simultaneously-live values to force spills.
    let mut b = IrBuilder::new();
    let mut vs = Vec::new();
    for i in 0..40 {
        vs.push(b.const_val(i, DataType::I32));
    }
    let mut acc = vs[0];
    for v in &vs[1..] {
        let dst = b.vreg(DataType::I32);
        b.push(Inst::Alu {
            op: AluOp::Add,
            dst,
            lhs: acc,
            rhs: *v,
            flags: FlagSet::empty(),
        });
        acc = dst;
    }
    b.push(Inst::WriteReg {
        reg: Gpr::Eax,
        width: Width::W32,
        high8: false,
        src: acc,
    });
    let block = b.finish(0x1000, Terminator::Jmp { target: 0x2000 });
    let t = translate_block(&block).unwrap();
    assert!(!t.code.is_empty());
}
