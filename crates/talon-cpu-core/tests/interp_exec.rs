//! End-to-end semantics through decode + the reference interpreter: guest
//! byte streams in, architectural state out.

use talon_cpu_core::cache::TranslationCache;
use talon_cpu_core::interp::{execute_block, BlockExit};
use talon_cpu_core::mem::{FlatTestBus, MemConfig, MemoryManager};
use talon_cpu_core::state::CpuState;
use talon_types::{EFLAGS_ZF, Exception, Gpr, Width};
use talon_x86::{decode_block, BlockLimits};

struct Harness {
    mem: MemoryManager,
    tc: TranslationCache,
    state: CpuState,
}

impl Harness {
    fn new() -> Harness {
        let bus = FlatTestBus::new(0x20000);
        Harness {
            mem: MemoryManager::new(Box::new(bus), MemConfig::default()),
            tc: TranslationCache::new(1 << 16, 256),
            state: CpuState::new(),
        }
    }

    fn load(&mut self, addr: u32, code: &[u8]) {
        self.mem.with_bus(|bus| {
            for (i, b) in code.iter().enumerate() {
                bus.write_u8(addr + i as u32, *b);
            }
        });
    }

    /// Decode-and-interpret dispatcher loop; stops at `stop_eip` or on a
    /// non-jump exit.
    fn run(&mut self, entry: u32, stop_eip: u32, max_blocks: usize) -> BlockExit {
        let mut eip = entry;
        for _ in 0..max_blocks {
            let mut bytes = vec![0u8; 64];
            self.mem.read_block(eip, &mut bytes);
            let (func, _) = decode_block(&bytes, eip, BlockLimits::default()).unwrap();
            let exit = execute_block(
                func.entry_block(),
                &mut self.state,
                &self.mem,
                &self.tc,
            )
            .unwrap();
            match exit {
                BlockExit::Jump(next) => {
                    self.state.eip = next;
                    if next == stop_eip {
                        return exit;
                    }
                    eip = next;
                }
                other => return other,
            }
        }
        panic!("dispatcher did not reach {stop_eip:#x}");
    }

    fn gpr(&self, reg: Gpr) -> u32 {
        self.state.read_gpr(reg, Width::W32, false)
    }
}

#[test]
fn mov_store_ret_scenario() {
    let mut h = Harness::new();
    // mov eax, 5 ; mov [0x100], eax ; ret
    h.load(
        0x1000,
        &[0xb8, 0x05, 0x00, 0x00, 0x00, 0xa3, 0x00, 0x01, 0x00, 0x00, 0xc3],
    );
    // Return address on the stack.
    h.state.write_gpr(Gpr::Esp, Width::W32, false, 0x8000);
    h.mem.write_u32(&h.tc, 0x8000, 0x5000);

    let exit = h.run(0x1000, 0x5000, 4);
    assert_eq!(exit, BlockExit::Jump(0x5000));
    assert_eq!(h.gpr(Gpr::Eax), 5);
    assert_eq!(h.mem.read_u32(0x100), 5);
    assert_eq!(h.gpr(Gpr::Esp), 0x8004);
}

#[test]
fn conditional_taken_scenario() {
    let mut h = Harness::new();
    // xor eax, eax ; je +5 ; mov ebx, 1 ; nop
    h.load(
        0x1200,
        &[0x31, 0xc0, 0x74, 0x05, 0xbb, 0x01, 0x00, 0x00, 0x00, 0x90, 0xf4],
    );
    let exit = h.run(0x1200, 0x1209, 4);
    assert_eq!(exit, BlockExit::Jump(0x1209));
    assert_eq!(h.gpr(Gpr::Ebx), 0, "branch must skip the mov");
    assert_ne!(h.state.eflags.value() & EFLAGS_ZF, 0);
    assert_eq!(h.state.eip, 0x1209);
}

#[test]
fn counted_loop_scenario() {
    let mut h = Harness::new();
    // mov ecx, 5 ; xor eax, eax ; inc eax ; loop -3
    h.load(
        0x1500,
        &[0xb9, 0x05, 0x00, 0x00, 0x00, 0x31, 0xc0, 0x40, 0xe2, 0xfd, 0xf4],
    );
    let exit = h.run(0x1500, 0x150a, 16);
    assert_eq!(exit, BlockExit::Jump(0x150a));
    assert_eq!(h.gpr(Gpr::Ecx), 0);
    assert_eq!(h.gpr(Gpr::Eax), 5);
}

#[test]
fn mmx_paddb_scenario() {
    let mut h = Harness::new();
    // paddb mm0, mm1 ; hlt
    h.load(0x2000, &[0x0f, 0xfc, 0xc1, 0xf4]);
    h.state.fpu.mmx_write(0, 0x0102_0304_0506_0708);
    h.state.fpu.mmx_write(1, 0x1020_3040_5060_7080);

    let exit = h.run(0x2000, 0xffff_ffff, 1);
    assert_eq!(exit, BlockExit::Halt { next: 0x2004 });
    assert_eq!(h.state.fpu.mmx_read(0), 0x1122_3344_5566_7788);
    assert_eq!(h.state.fpu.ftw, 0x0000);
    assert_eq!(h.state.fpu.top(), 0);
}

#[test]
fn fptan_scenario() {
    let mut h = Harness::new();
    // fld qword [0x900] ; fptan ; hlt
    h.load(0x2100, &[0xdd, 0x05, 0x00, 0x09, 0x00, 0x00, 0xd9, 0xf2, 0xf4]);
    h.mem
        .write_u64(&h.tc, 0x900, std::f64::consts::FRAC_PI_4.to_bits());

    let top_before = h.state.fpu.top();
    let exit = h.run(0x2100, 0xffff_ffff, 1);
    assert_eq!(exit, BlockExit::Halt { next: 0x2109 });
    // FLD pushed one, FPTAN replaced it and pushed 1.0: top moved down two.
    assert_eq!(h.state.fpu.top(), top_before.wrapping_sub(2) & 7);
    assert_eq!(h.state.fpu.st(0).to_f64(), 1.0);
    assert!((h.state.fpu.st(1).to_f64() - 1.0).abs() < 1e-12);
    assert_eq!(h.state.fpu.fsw & talon_fpu::state::FSW_C2, 0);
}

#[test]
fn fyl2x_scenario() {
    let mut h = Harness::new();
    // ST(1) = 3.0, ST(0) = 2.0 seeded directly; fyl2x ; hlt
    h.load(0x2200, &[0xd9, 0xf1, 0xf4]);
    h.state.fpu.push(talon_fpu::F80::from_f64(3.0));
    h.state.fpu.push(talon_fpu::F80::from_f64(2.0));
    let top_before = h.state.fpu.top();

    let exit = h.run(0x2200, 0xffff_ffff, 1);
    assert_eq!(exit, BlockExit::Halt { next: 0x2202 });
    assert_eq!(h.state.fpu.top(), top_before.wrapping_add(1) & 7);
    assert_eq!(h.state.fpu.st(0).to_f64(), 3.0);
}

#[test]
fn division_by_zero_raises_guest_fault() {
    let mut h = Harness::new();
    // xor edx, edx ; mov ecx, 0 ; mov eax, 7 ; div ecx
    h.load(
        0x2300,
        &[0x31, 0xd2, 0xb9, 0x00, 0x00, 0x00, 0x00, 0xb8, 0x07, 0x00, 0x00, 0x00, 0xf7, 0xf1, 0xf4],
    );
    let mut bytes = vec![0u8; 64];
    h.mem.read_block(0x2300, &mut bytes);
    let (func, _) = decode_block(&bytes, 0x2300, BlockLimits::default()).unwrap();
    let fault = execute_block(func.entry_block(), &mut h.state, &h.mem, &h.tc).unwrap_err();
    assert_eq!(fault.exception, Exception::DivideError);
}

#[test]
fn push_pop_round_trip() {
    let mut h = Harness::new();
    // push 0x1234 ; pop eax ; hlt
    h.load(0x2400, &[0x68, 0x34, 0x12, 0x00, 0x00, 0x58, 0xf4]);
    h.state.write_gpr(Gpr::Esp, Width::W32, false, 0x9000);
    h.run(0x2400, 0xffff_ffff, 1);
    assert_eq!(h.gpr(Gpr::Eax), 0x1234);
    assert_eq!(h.gpr(Gpr::Esp), 0x9000);
}

#[test]
fn interrupt_terminator_surfaces_vector() {
    let mut h = Harness::new();
    h.load(0x2500, &[0xcd, 0x21]);
    let exit = h.run(0x2500, 0xffff_ffff, 1);
    assert_eq!(
        exit,
        BlockExit::Interrupt {
            vector: 0x21,
            next: 0x2502
        }
    );
}

#[test]
fn sse_scalar_add_through_interp() {
    let mut h = Harness::new();
    // addss xmm0, xmm1 ; hlt
    h.load(0x2600, &[0xf3, 0x0f, 0x58, 0xc1, 0xf4]);
    h.state.fpu.xmm[0] = u128::from(2.5f32.to_bits()) | (u128::from(9u32) << 96);
    h.state.fpu.xmm[1] = u128::from(1.25f32.to_bits());
    h.run(0x2600, 0xffff_ffff, 1);
    let lane0 = f32::from_bits(h.state.fpu.xmm[0] as u32);
    assert_eq!(lane0, 3.75);
    // Upper lanes untouched by the scalar form.
    assert_eq!((h.state.fpu.xmm[0] >> 96) as u32, 9);
}

#[test]
fn smc_invalidation_changes_behaviour() {
    let mut h = Harness::new();
    // mov eax, 5 ; ret at 0x3000.
    h.load(0x3000, &[0xb8, 0x05, 0x00, 0x00, 0x00, 0xc3]);
    h.state.write_gpr(Gpr::Esp, Width::W32, false, 0x8000);
    h.mem.write_u32(&h.tc, 0x8000, 0x6000);

    // Translate (store a block so the page is registered) then run.
    let mut bytes = vec![0u8; 64];
    h.mem.read_block(0x3000, &mut bytes);
    let (func, len) = decode_block(&bytes, 0x3000, BlockLimits::default()).unwrap();
    h.tc.store(0x3000, len as u32, func.entry_block().clone(), &[0u8; 4], vec![])
        .unwrap();
    h.mem.register_code_pages(0x3000, len as u32);
    h.run(0x3000, 0x6000, 1);
    assert_eq!(h.gpr(Gpr::Eax), 5);

    // Guest store rewrites the immediate; the cached block must go away.
    h.mem.write_u8(&h.tc, 0x3001, 0x06);
    assert!(!h.tc.contains(0x3000));

    // Re-run from the modified bytes.
    h.state.write_gpr(Gpr::Esp, Width::W32, false, 0x8000);
    h.run(0x3000, 0x6000, 1);
    assert_eq!(h.gpr(Gpr::Eax), 6);
}
