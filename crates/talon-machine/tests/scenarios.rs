//! End-to-end scenarios through the embedder façade: literal guest bytes
//! in, architectural state out. Blocks are translated to AArch64 host code
//! and cached on every host; execution runs natively on AArch64 and through
//! the reference interpreter elsewhere.

use talon_machine::{FlatTestBus, JitConfig, Machine};
use talon_types::{EFLAGS_ZF, Gpr};

fn machine_with(code_at: &[(u32, &[u8])]) -> Machine {
    let mut bus = FlatTestBus::new(0x20000);
    for (addr, bytes) in code_at {
        bus.load(*addr, bytes);
    }
    Machine::new(Box::new(bus), JitConfig::default()).unwrap()
}

#[test]
fn scenario_mov_store_ret_with_smc_retranslation() {
    // mov eax, 5 ; mov [0x100], eax ; ret
    let code = [0xb8, 0x05, 0x00, 0x00, 0x00, 0xa3, 0x00, 0x01, 0x00, 0x00, 0xc3];
    let mut m = machine_with(&[(0x1000, &code)]);
    m.set_gpr(Gpr::Esp, 0x8000);
    m.write_u32(0x8000, 0x5000); // return address

    let next = m.execute(0x1000).unwrap();
    assert_eq!(next, 0x5000);
    assert_eq!(m.gpr(Gpr::Eax), 5);
    assert_eq!(m.read_u32(0x100), 5);
    assert_eq!(m.reg(8).unwrap(), 0x5000); // EIP tracked

    // Self-modifying store: rewrite the immediate. The cached translation
    // must be invalidated and the re-translation must observe the new byte.
    assert!(m.lookup(0x1000));
    m.write_u8(0x1001, 0x06);
    assert!(!m.lookup(0x1000), "SMC write must invalidate the block");

    m.set_gpr(Gpr::Esp, 0x8000);
    let next = m.execute(0x1000).unwrap();
    assert_eq!(next, 0x5000);
    assert_eq!(m.gpr(Gpr::Eax), 6);
}

#[test]
fn scenario_conditional_taken() {
    // xor eax, eax ; je +5 ; mov ebx, 1 ; nop
    let code = [0x31, 0xc0, 0x74, 0x05, 0xbb, 0x01, 0x00, 0x00, 0x00, 0x90, 0xf4];
    let mut m = machine_with(&[(0x1200, &code)]);
    m.set_gpr(Gpr::Ebx, 0);

    let next = m.execute(0x1200).unwrap();
    assert_eq!(next, 0x1209);
    assert_eq!(m.gpr(Gpr::Ebx), 0);
    assert_ne!(m.eflags() & EFLAGS_ZF, 0);
    assert_eq!(m.reg(8).unwrap(), 0x1209);
}

#[test]
fn scenario_counted_loop() {
    // mov ecx, 5 ; xor eax, eax ; inc eax ; loop -3
    let code = [0xb9, 0x05, 0x00, 0x00, 0x00, 0x31, 0xc0, 0x40, 0xe2, 0xfd];
    let mut m = machine_with(&[(0x1500, &code)]);

    let stop = m.run_until(0x1500, 0x150a, 32).unwrap();
    assert_eq!(stop, 0x150a);
    assert_eq!(m.gpr(Gpr::Ecx), 0);
    assert_eq!(m.gpr(Gpr::Eax), 5);
}

#[test]
fn scenario_mmx_paddb() {
    // paddb mm0, mm1 ; hlt
    let code = [0x0f, 0xfc, 0xc1, 0xf4];
    let mut m = machine_with(&[(0x2000, &code)]);
    m.set_mmx(0, 0x0102_0304_0506_0708).unwrap();
    m.set_mmx(1, 0x1020_3040_5060_7080).unwrap();

    m.execute(0x2000).unwrap();
    assert_eq!(m.mmx(0).unwrap(), 0x1122_3344_5566_7788);
    assert_eq!(m.fpu().ftw, 0x0000, "MMX entry rewrites the tag word");
    assert_eq!(m.fpu().top(), 0);
}

#[test]
fn scenario_fptan_quarter_pi() {
    // fld qword [0x900] ; fptan ; hlt
    let code = [0xdd, 0x05, 0x00, 0x09, 0x00, 0x00, 0xd9, 0xf2, 0xf4];
    let mut m = machine_with(&[(0x2100, &code)]);
    m.write_u32(0x900, std::f64::consts::FRAC_PI_4.to_bits() as u32);
    m.write_u32(0x904, (std::f64::consts::FRAC_PI_4.to_bits() >> 32) as u32);

    let top_before = m.fpu().top();
    m.execute(0x2100).unwrap();
    // Operand replaced by tan, then 1.0 pushed: top down two mod 8.
    assert_eq!(m.fpu().top(), top_before.wrapping_sub(2) & 7);
    let st0 = talon_fpu::F80::from_bytes(m.fpu_st(0).unwrap()).to_f64();
    let st1 = talon_fpu::F80::from_bytes(m.fpu_st(1).unwrap()).to_f64();
    assert_eq!(st0, 1.0);
    assert!((st1 - 1.0).abs() < 1e-12, "tan(pi/4) = {st1}");
    assert_eq!(m.fpu().fsw & talon_fpu::state::FSW_C2, 0);
}

#[test]
fn scenario_fyl2x() {
    // fyl2x ; hlt, with ST(1) = 3.0 and ST(0) = 2.0 seeded via the façade.
    let code = [0xd9, 0xf1, 0xf4];
    let mut m = machine_with(&[(0x2200, &code)]);
    m.fpu().push(talon_fpu::F80::from_f64(3.0));
    m.fpu().push(talon_fpu::F80::from_f64(2.0));
    let top_before = m.fpu().top();

    m.execute(0x2200).unwrap();
    assert_eq!(m.fpu().top(), top_before.wrapping_add(1) & 7);
    let st0 = talon_fpu::F80::from_bytes(m.fpu_st(0).unwrap()).to_f64();
    assert_eq!(st0, 3.0); // 3 * log2(2)
}

#[test]
fn translation_is_deterministic_after_invalidate() {
    let code = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
    let mut m = machine_with(&[(0x3000, &code)]);
    m.translate(0x3000).unwrap();
    let stats = m.cache_stats();
    assert_eq!(stats.blocks, 1);

    m.invalidate_range(0x3000, 0x10);
    assert!(!m.lookup(0x3000));
    m.translate(0x3000).unwrap();
    assert!(m.lookup(0x3000));

    // Idempotent range invalidation.
    m.invalidate_range(0x3000, 0x10);
    m.invalidate_range(0x3000, 0x10);
    assert_eq!(m.cache_stats().blocks, 0);
}

#[test]
fn blocks_chain_and_unchain_through_the_facade() {
    // Block A: jmp 0x4100 ; Block B at 0x4100: hlt.
    let mut m = machine_with(&[(0x4000, &[0xe9, 0xfb, 0x00, 0x00, 0x00]), (0x4100, &[0xf4])]);
    m.translate(0x4100).unwrap();
    m.translate(0x4000).unwrap();
    assert!(m.cache_stats().chained_blocks >= 1, "A chains to B");

    m.invalidate_range(0x4100, 1);
    assert!(m.lookup(0x4000));
    assert!(!m.lookup(0x4100));

    // A's exit was unchained; executing A re-translates B on demand.
    let next = m.execute(0x4000).unwrap();
    assert_eq!(next, 0x4100);
}

#[test]
fn notify_modified_forces_retranslation() {
    let code = [0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3];
    let mut m = machine_with(&[(0x5000, &code)]);
    m.translate(0x5000).unwrap();
    m.notify_modified(0x5000, 0x10);
    assert!(!m.lookup(0x5000));
}

#[test]
fn protection_fault_routing() {
    let code = [0x90, 0xc3];
    let mut m = machine_with(&[(0x6000, &code)]);
    m.translate(0x6000).unwrap();
    assert_eq!(m.handle_protection_fault(0x6001).unwrap(), true);
    assert!(!m.lookup(0x6000));
    // Non-code page: not ours.
    assert_eq!(m.handle_protection_fault(0x9000).unwrap(), false);
}

#[test]
fn unimplemented_opcode_reports_translation_failed() {
    // CPUID is outside the supported profile.
    let mut m = machine_with(&[(0x7000, &[0x0f, 0xa2])]);
    let err = m.execute(0x7000).unwrap_err();
    assert_eq!(err.code(), 3);
    assert_eq!(talon_machine::last_error(), 3);
    assert_eq!(talon_machine::error_string(3), "translation failed");
}

#[test]
fn divide_error_is_delivered_to_the_bus() {
    // xor edx, edx ; mov ecx, 0 ; mov eax, 7 ; div ecx ; hlt
    let code = [
        0x31, 0xd2, 0xb9, 0x00, 0x00, 0x00, 0x00, 0xb8, 0x07, 0x00, 0x00, 0x00, 0xf7, 0xf1, 0xf4,
    ];
    let mut m = machine_with(&[(0x7100, &code)]);
    // The fault is delivered through the guest-exception callback, not as a
    // façade error.
    let next = m.execute(0x7100).unwrap();
    assert_eq!(next, 0x7100, "execution stops at the faulting block");
}

#[test]
fn sse_scalar_add_through_facade() {
    // addss xmm0, xmm1 ; hlt
    let code = [0xf3, 0x0f, 0x58, 0xc1, 0xf4];
    let mut m = machine_with(&[(0x7200, &code)]);
    let mut x0 = [0u8; 16];
    x0[0..4].copy_from_slice(&2.5f32.to_bits().to_le_bytes());
    x0[12..16].copy_from_slice(&9u32.to_le_bytes());
    m.set_xmm(0, x0).unwrap();
    let mut x1 = [0u8; 16];
    x1[0..4].copy_from_slice(&1.25f32.to_bits().to_le_bytes());
    m.set_xmm(1, x1).unwrap();

    m.execute(0x7200).unwrap();
    let out = m.xmm(0).unwrap();
    let lane0 = f32::from_bits(u32::from_le_bytes(out[0..4].try_into().unwrap()));
    assert_eq!(lane0, 3.75);
    assert_eq!(u32::from_le_bytes(out[12..16].try_into().unwrap()), 9);
}

#[test]
fn snapshot_round_trips_state() {
    let mut m = machine_with(&[]);
    m.set_gpr(Gpr::Eax, 0x1234);
    m.set_eflags(0x246);
    m.fpu().push(talon_fpu::F80::PI);
    let snap = m.snapshot();

    m.set_gpr(Gpr::Eax, 0);
    m.fpu().init();
    m.restore(&snap);
    assert_eq!(m.gpr(Gpr::Eax), 0x1234);
    assert_eq!(m.eflags() & 0xff, 0x246 & 0xff);
    let st0 = talon_fpu::F80::from_bytes(m.fpu_st(0).unwrap());
    assert_eq!(st0, talon_fpu::F80::PI);
}
