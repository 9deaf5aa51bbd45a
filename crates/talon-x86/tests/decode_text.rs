use talon_x86::decode::decode_one;
use talon_x86::ir::{Inst, Terminator};
use talon_x86::{decode_block, BlockLimits, DecodeError};

fn assert_ir(code: &[u8], entry: u32, expected: &str) {
    let block = decode_one(code, entry).unwrap();
    assert!(block.ssa_ok(), "SSA violation:\n{}", block.to_text());
    assert_eq!(block.to_text(), expected);
}

#[test]
fn mov_store_ret() {
    // mov eax, 5
    // mov [0x100], eax
    // ret
    let code = [
        0xb8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0xa3, 0x00, 0x01, 0x00, 0x00, // mov [0x100], eax
        0xc3, // ret
    ];
    let expected = "\
block 0x1000:
  v0 = const.i32 0x5
  write.eax v0
  v1 = read.eax
  store.i32 [0x100], v1
  v2 = read.esp
  v3 = load.i32 [v2]
  v4 = const.i32 0x4
  v5 = add.i32 v2, v4
  write.esp v5
  term ret [v3]
";
    assert_ir(&code, 0x1000, expected);
}

#[test]
fn xor_jcc() {
    // xor eax, eax
    // je +5
    let code = [0x31, 0xc0, 0x74, 0x05];
    let expected = "\
block 0x1200:
  v0 = read.eax
  v1 = read.eax
  v2 = xor.i32 v0, v1 ; flags=CF|PF|AF|ZF|SF|OF
  write.eax v2
  term jcc.e 0x1209, 0x1204
";
    assert_ir(&code, 0x1200, expected);
}

#[test]
fn loop_decrements_ecx_without_flags() {
    // inc eax
    // loop -3
    let code = [0x40, 0xe2, 0xfd];
    let block = decode_one(&code, 0x1500).unwrap();
    // LOOP must not produce a flag-recording subtraction.
    let flagged_subs = block
        .insts
        .iter()
        .filter(|i| matches!(i, Inst::Alu { flags, .. } if !flags.is_empty()))
        .count();
    assert_eq!(flagged_subs, 1, "only INC records flags:\n{}", block.to_text());
    match block.term {
        Terminator::JccVreg {
            target,
            fallthrough,
            ..
        } => {
            assert_eq!(target, 0x1500);
            assert_eq!(fallthrough, 0x1503);
        }
        other => panic!("unexpected terminator {other:?}"),
    }
}

#[test]
fn call_pushes_return_address() {
    // call +0x0b
    let code = [0xe8, 0x0b, 0x00, 0x00, 0x00];
    let expected = "\
block 0x1000:
  v0 = const.i32 0x1005
  v1 = read.esp
  v2 = const.i32 0x4
  v3 = sub.i32 v1, v2
  write.esp v3
  store.i32 [v3], v0
  term jmp 0x1010
";
    assert_ir(&code, 0x1000, expected);
}

#[test]
fn lea_with_sib() {
    // lea eax, [ecx + edx*4 + 0x10]
    // ret
    let code = [0x8d, 0x44, 0x91, 0x10, 0xc3];
    let expected = "\
block 0x4000:
  v0 = read.ecx
  v1 = read.edx
  v2 = lea [v0+v1*4+0x10]
  write.eax v2
  v3 = read.esp
  v4 = load.i32 [v3]
  v5 = const.i32 0x4
  v6 = add.i32 v3, v5
  write.esp v6
  term ret [v4]
";
    assert_ir(&code, 0x4000, expected);
}

#[test]
fn paddb_mmx() {
    // paddb mm0, mm1
    // nop
    let code = [0x0f, 0xfc, 0xc1, 0x90, 0xc3];
    let block = decode_one(&code, 0x2000).unwrap();
    let text = block.to_text();
    assert!(text.contains("v0 = read.mm0"), "{text}");
    assert!(text.contains("v1 = read.mm1"), "{text}");
    assert!(text.contains("v2 = padd.v64.b8 v0, v1"), "{text}");
    assert!(text.contains("write.mm0 v2"), "{text}");
}

#[test]
fn x87_escape_forms() {
    // fld st0 / faddp st1, st0 / fsin / fld dword [eax] / fnstsw ax
    let code = [
        0xd9, 0xc0, // fld st0
        0xde, 0xc1, // faddp st1, st0
        0xd9, 0xfe, // fsin
        0xd9, 0x00, // fld dword [eax]
        0xdf, 0xe0, // fnstsw ax
        0xc3, // ret
    ];
    let block = decode_one(&code, 0x3000).unwrap();
    let text = block.to_text();
    assert!(text.contains("fld st0"), "{text}");
    assert!(text.contains("faddp st1, st0"), "{text}");
    assert!(text.contains("fsin"), "{text}");
    assert!(text.contains("fld.f32 [v0]"), "{text}");
    assert!(text.contains("fnstsw ax"), "{text}");
}

#[test]
fn fptan_and_constants() {
    let code = [
        0xd9, 0xeb, // fldpi
        0xd9, 0xf2, // fptan
        0xd9, 0xe8, // fld1
        0xc3,
    ];
    let block = decode_one(&code, 0x3100).unwrap();
    let text = block.to_text();
    assert!(text.contains("fldpi"), "{text}");
    assert!(text.contains("fptan"), "{text}");
    assert!(text.contains("fld1"), "{text}");
}

#[test]
fn operand_size_prefix_selects_16bit() {
    // mov ax, 1
    let code = [0x66, 0xb8, 0x01, 0x00, 0xc3];
    let block = decode_one(&code, 0x5000).unwrap();
    let text = block.to_text();
    assert!(text.contains("v0 = const.i16 0x1"), "{text}");
    assert!(text.contains("write.ax v0"), "{text}");
}

#[test]
fn high8_registers_decode() {
    // shl ah, 1
    let code = [0xd0, 0xe4, 0xc3];
    let block = decode_one(&code, 0x5100).unwrap();
    let text = block.to_text();
    assert!(text.contains("read.ah"), "{text}");
    assert!(text.contains("write.ah"), "{text}");
}

#[test]
fn byte_counts_are_reported() {
    let code = [0x90, 0x90, 0xeb, 0xfe, 0xff, 0xff];
    let (func, len) = decode_block(&code, 0x100, BlockLimits::default()).unwrap();
    assert_eq!(len, 4); // two NOPs + jmp rel8
    assert_eq!(func.entry, 0x100);
    assert_eq!(func.blocks.len(), 1);
}

#[test]
fn block_without_terminator_is_an_error() {
    let code = [0x90; 16];
    let err = decode_block(&code, 0x100, BlockLimits {
        max_bytes: 16,
        max_insts: 2048,
    })
    .unwrap_err();
    assert!(matches!(err, DecodeError::BlockTooLong { .. }));
}

#[test]
fn sse_scalar_add() {
    // addss xmm0, xmm1
    let code = [0xf3, 0x0f, 0x58, 0xc1, 0xc3];
    let block = decode_one(&code, 0x6000).unwrap();
    let text = block.to_text();
    assert!(text.contains("fadd.f32"), "{text}");
    assert!(text.contains("insertss"), "{text}");
}

#[test]
fn sse_packed_add_and_compare() {
    // addps xmm0, xmm1 ; cmpps xmm0, xmm1, 2
    let code = [0x0f, 0x58, 0xc1, 0x0f, 0xc2, 0xc1, 0x02, 0xc3];
    let block = decode_one(&code, 0x6100).unwrap();
    let text = block.to_text();
    assert!(text.contains("fadd.v128.s4"), "{text}");
    assert!(text.contains("fcmp.v128.s4"), "{text}");
}

#[test]
fn emms_and_movq() {
    // movq mm0, [eax]; emms
    let code = [0x0f, 0x6f, 0x00, 0x0f, 0x77, 0xc3];
    let block = decode_one(&code, 0x6200).unwrap();
    let text = block.to_text();
    assert!(text.contains("load.v64.s2"), "{text}");
    assert!(text.contains("emms"), "{text}");
}

#[test]
fn int3_terminates_block() {
    let code = [0xcc];
    let block = decode_one(&code, 0x7000).unwrap();
    assert_eq!(
        block.term,
        Terminator::Interrupt {
            vector: 3,
            next: 0x7001
        }
    );
}

#[test]
fn indirect_jmp_through_register() {
    // jmp eax
    let code = [0xff, 0xe0];
    let block = decode_one(&code, 0x7100).unwrap();
    assert!(matches!(block.term, Terminator::Indirect { .. }));
}
