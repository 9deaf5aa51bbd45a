//! Reference IR interpreter.
//!
//! Executes one translated block's IR against the guest state block and the
//! memory manager. This is the semantic reference the JIT backend is tested
//! against, and the execution backend on hosts that cannot run the emitted
//! AArch64 code.

use talon_fpu::arith::{self, DyadicOp};
use talon_fpu::state::{MXCSR_IE, MXCSR_ZE};
use talon_fpu::{F80, FpuBank, transcendental as trans};
use talon_types::{
    DataType, EFLAGS_AF, EFLAGS_CF, EFLAGS_OF, EFLAGS_PF, EFLAGS_SF, EFLAGS_ZF, Exception, Width,
};
use talon_x86::ir::{
    AluOp, FpuArithOp, FpuConst, FpuTransOp, Inst, IrBlock, MemRef, PackedOp, ShiftOp, Terminator,
    VFloatOp, Vreg,
};

use crate::cache::TranslationCache;
use crate::eflags::FlagOp;
use crate::mem::{self, MemoryManager};
use crate::state::CpuState;

/// How a block handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Continue at this guest address.
    Jump(u32),
    /// Software interrupt; resume at `next` once delivered.
    Interrupt { vector: u8, next: u32 },
    /// HLT-class stop.
    Halt { next: u32 },
}

/// A guest fault raised mid-block, with the faulting block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestFault {
    pub exception: Exception,
    pub addr: u32,
}

struct Vals {
    v: Vec<u128>,
}

impl Vals {
    fn for_block(block: &IrBlock) -> Vals {
        let mut max = 0u32;
        for inst in &block.insts {
            inst.visit_vregs(|v, _| max = max.max(v.id + 1));
        }
        block.term.visit_vregs(|v, _| max = max.max(v.id + 1));
        Vals {
            v: vec![0; max as usize],
        }
    }

    fn get(&self, r: Vreg) -> u128 {
        self.v[r.id as usize]
    }

    fn geti(&self, r: Vreg) -> u64 {
        self.v[r.id as usize] as u64
    }

    fn get32(&self, r: Vreg) -> u32 {
        self.v[r.id as usize] as u32
    }

    fn set(&mut self, r: Vreg, value: u128) {
        self.v[r.id as usize] = value;
    }

    fn seti(&mut self, r: Vreg, value: u64) {
        self.v[r.id as usize] = u128::from(value);
    }
}

fn width_of(ty: DataType) -> Width {
    ty.integer_width().unwrap_or(Width::W32)
}

fn mem_addr(vals: &Vals, m: &MemRef) -> u32 {
    let mut addr = m.disp as u32;
    if let Some(b) = m.base {
        addr = addr.wrapping_add(vals.get32(b));
    }
    if let Some(i) = m.index {
        addr = addr.wrapping_add(vals.get32(i).wrapping_mul(u32::from(m.scale)));
    }
    addr
}

/// Executes one block. Returns the exit or a guest fault.
pub fn execute_block(
    block: &IrBlock,
    state: &mut CpuState,
    mem: &MemoryManager,
    tc: &TranslationCache,
) -> Result<BlockExit, GuestFault> {
    let mut vals = Vals::for_block(block);
    for inst in &block.insts {
        step(inst, block.start, state, mem, tc, &mut vals)?;
    }
    Ok(match block.term {
        Terminator::Jmp { target } => BlockExit::Jump(target),
        Terminator::Jcc {
            cond,
            target,
            fallthrough,
        } => {
            if state.eflags.evaluate_condition(cond) {
                BlockExit::Jump(target)
            } else {
                BlockExit::Jump(fallthrough)
            }
        }
        Terminator::JccVreg {
            cond,
            target,
            fallthrough,
        } => {
            if vals.geti(cond) != 0 {
                BlockExit::Jump(target)
            } else {
                BlockExit::Jump(fallthrough)
            }
        }
        Terminator::Indirect { addr } | Terminator::Ret { addr } => {
            BlockExit::Jump(vals.get32(addr))
        }
        Terminator::Interrupt { vector, next } => BlockExit::Interrupt { vector, next },
        Terminator::Halt { next } => BlockExit::Halt { next },
    })
}

/// Executes a single instruction that references no vregs (x87 and other
/// helper-dispatched forms); used by the JIT's helper layer.
pub fn exec_single(
    inst: &Inst,
    start: u32,
    state: &mut CpuState,
    mem: &MemoryManager,
    tc: &TranslationCache,
) -> Result<(), GuestFault> {
    let mut vals = Vals { v: Vec::new() };
    step(inst, start, state, mem, tc, &mut vals)
}

#[allow(clippy::too_many_lines)]
fn step(
    inst: &Inst,
    start: u32,
    state: &mut CpuState,
    mem: &MemoryManager,
    tc: &TranslationCache,
    vals: &mut Vals,
) -> Result<(), GuestFault> {
    match inst {
        Inst::Const { dst, value } => {
            vals.set(*dst, *value as u64 as u128);
        }
        Inst::ReadReg {
            dst,
            reg,
            width,
            high8,
        } => {
            let v = state.read_gpr(*reg, *width, *high8);
            vals.seti(*dst, u64::from(v));
        }
        Inst::WriteReg {
            reg,
            width,
            high8,
            src,
        } => {
            state.write_gpr(*reg, *width, *high8, vals.get32(*src));
        }
        Inst::Load { dst, mem: m } => {
            let addr = mem_addr(vals, m);
            let v: u128 = match m.ty.size_bytes() {
                1 => u128::from(mem.read_u8(addr)),
                2 => u128::from(mem.read_u16(addr)),
                4 => u128::from(mem.read_u32(addr)),
                8 => u128::from(mem.read_u64(addr)),
                _ => mem.read_u128(addr),
            };
            vals.set(*dst, v);
        }
        Inst::Store { mem: m, src } => {
            let addr = mem_addr(vals, m);
            let v = vals.get(*src);
            match m.ty.size_bytes() {
                1 => mem.write_u8(tc, addr, v as u32),
                2 => mem.write_u16(tc, addr, v as u32),
                4 => mem.write_u32(tc, addr, v as u32),
                8 => mem.write_u64(tc, addr, v as u64),
                _ => mem.write_u128(tc, addr, v),
            }
        }
        Inst::Lea { dst, mem: m } => {
            vals.seti(*dst, u64::from(mem_addr(vals, m)));
        }
        Inst::Alu {
            op,
            dst,
            lhs,
            rhs,
            flags,
        } => {
            let w = width_of(dst.ty);
            let mask = w.mask();
            let a = vals.geti(*lhs) & mask;
            let b = vals.geti(*rhs) & mask;
            let (r, flag_op, carry_in) = match op {
                AluOp::Add => (a.wrapping_add(b), FlagOp::Add, false),
                AluOp::Adc => {
                    let c = state.eflags.get_flag(EFLAGS_CF);
                    (a.wrapping_add(b).wrapping_add(u64::from(c)), FlagOp::Adc, c)
                }
                AluOp::Sub => (a.wrapping_sub(b), FlagOp::Sub, false),
                AluOp::Sbb => {
                    let c = state.eflags.get_flag(EFLAGS_CF);
                    (a.wrapping_sub(b).wrapping_sub(u64::from(c)), FlagOp::Sbb, c)
                }
                AluOp::And => (a & b, FlagOp::Logic, false),
                AluOp::Or => (a | b, FlagOp::Logic, false),
                AluOp::Xor => (a ^ b, FlagOp::Logic, false),
            };
            let r = r & mask;
            if !flags.is_empty() {
                // A mask that excludes CF marks the INC/DEC forms.
                let flag_op = match flag_op {
                    FlagOp::Add if !flags.contains(talon_types::FlagSet::CF) => FlagOp::Inc,
                    FlagOp::Sub if !flags.contains(talon_types::FlagSet::CF) => FlagOp::Dec,
                    other => other,
                };
                state
                    .eflags
                    .store_op_state_carry(flag_op, w, r as u32, a as u32, b as u32, carry_in);
            }
            vals.seti(*dst, r);
        }
        Inst::Shift {
            op,
            dst,
            src,
            count,
            flags,
        } => {
            let w = width_of(dst.ty);
            let mask = w.mask();
            let a = vals.geti(*src) & mask;
            let cnt = (vals.geti(*count) as u32) & 0x1f;
            if cnt == 0 {
                vals.seti(*dst, a);
                return Ok(());
            }
            let r = match op {
                ShiftOp::Shl => (a << cnt) & mask,
                ShiftOp::Shr => (a >> cnt) & mask,
                ShiftOp::Sar => {
                    // Counts past the width keep filling with the sign bit.
                    let signed = w.sign_extend(a);
                    ((signed >> cnt) as u64) & mask
                }
                ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => {
                    let code = match op {
                        ShiftOp::Rol => 0,
                        ShiftOp::Ror => 1,
                        ShiftOp::Rcl => 2,
                        _ => 3,
                    };
                    // Rotates update CF/OF inside the shared primitive.
                    let r = rotate_op(&mut state.eflags, code, w, a, cnt);
                    vals.seti(*dst, r);
                    return Ok(());
                }
            } & mask;
            if !flags.is_empty() {
                match op {
                    ShiftOp::Shl => state.eflags.store_op_state(
                        FlagOp::Shl,
                        w,
                        r as u32,
                        a as u32,
                        cnt,
                    ),
                    ShiftOp::Shr => state.eflags.store_op_state(
                        FlagOp::Shr,
                        w,
                        r as u32,
                        a as u32,
                        cnt,
                    ),
                    ShiftOp::Sar => state.eflags.store_op_state(
                        FlagOp::Sar,
                        w,
                        r as u32,
                        a as u32,
                        cnt,
                    ),
                    _ => unreachable!("rotates handled above"),
                }
            }
            vals.seti(*dst, r);
        }
        Inst::Not { dst, src } => {
            let w = width_of(dst.ty);
            vals.seti(*dst, !vals.geti(*src) & w.mask());
        }
        Inst::Neg { dst, src, flags } => {
            let w = width_of(dst.ty);
            let a = vals.geti(*src) & w.mask();
            let r = 0u64.wrapping_sub(a) & w.mask();
            if !flags.is_empty() {
                state
                    .eflags
                    .store_op_state(FlagOp::Sub, w, r as u32, 0, a as u32);
            }
            vals.seti(*dst, r);
        }
        Inst::MulWide {
            signed,
            dst_hi,
            dst_lo,
            lhs,
            rhs,
        } => {
            let w = width_of(dst_lo.ty);
            let bits = w.bits();
            let mask = w.mask();
            let a = vals.geti(*lhs) & mask;
            let b = vals.geti(*rhs) & mask;
            let full = if *signed {
                (w.sign_extend(a) as i128 * w.sign_extend(b) as i128) as u128
            } else {
                u128::from(a) * u128::from(b)
            };
            let lo = (full as u64) & mask;
            let hi = ((full >> bits) as u64) & mask;
            vals.seti(*dst_lo, lo);
            vals.seti(*dst_hi, hi);
            // CF/OF: set when the upper half carries significance.
            let significant = if *signed {
                let sext = w.sign_extend(lo) as i128;
                sext != full as i128
            } else {
                hi != 0
            };
            state.eflags.set_flag(EFLAGS_CF, significant);
            state.eflags.set_flag(EFLAGS_OF, significant);
        }
        Inst::Imul { dst, lhs, rhs } => {
            let w = width_of(dst.ty);
            let mask = w.mask();
            let a = w.sign_extend(vals.geti(*lhs) & mask);
            let b = w.sign_extend(vals.geti(*rhs) & mask);
            let full = a as i128 * b as i128;
            let r = (full as u64) & mask;
            let overflow = w.sign_extend(r) as i128 != full;
            state.eflags.set_flag(EFLAGS_CF, overflow);
            state.eflags.set_flag(EFLAGS_OF, overflow);
            vals.seti(*dst, r);
        }
        Inst::DivRem {
            signed,
            dst_quot,
            dst_rem,
            hi,
            lo,
            divisor,
        } => {
            let w = width_of(dst_quot.ty);
            match divrem(
                w,
                *signed,
                vals.get32(*hi),
                vals.get32(*lo),
                vals.get32(*divisor),
            ) {
                Some((q, r)) => {
                    vals.seti(*dst_quot, u64::from(q));
                    vals.seti(*dst_rem, u64::from(r));
                }
                None => {
                    return Err(GuestFault {
                        exception: Exception::DivideError,
                        addr: start,
                    });
                }
            }
        }
        Inst::Ext { dst, src, sign } => {
            let from = width_of(src.ty);
            let to = width_of(dst.ty);
            let v = vals.geti(*src) & from.mask();
            let r = if *sign {
                (from.sign_extend(v) as u64) & to.mask()
            } else {
                v & to.mask()
            };
            vals.seti(*dst, r);
        }
        Inst::CmpFlags { lhs, rhs } => {
            let w = width_of(lhs.ty);
            let mask = w.mask();
            let a = vals.geti(*lhs) & mask;
            let b = vals.geti(*rhs) & mask;
            let r = a.wrapping_sub(b) & mask;
            state
                .eflags
                .store_op_state(FlagOp::Sub, w, r as u32, a as u32, b as u32);
        }
        Inst::TestFlags { lhs, rhs } => {
            let w = width_of(lhs.ty);
            let mask = w.mask();
            let a = vals.geti(*lhs) & mask;
            let b = vals.geti(*rhs) & mask;
            let r = a & b;
            state
                .eflags
                .store_op_state(FlagOp::Logic, w, r as u32, a as u32, b as u32);
        }
        Inst::EvalCond { dst, cond } => {
            vals.seti(*dst, u64::from(state.eflags.evaluate_condition(*cond)));
        }
        Inst::SetNz { dst, src } => {
            vals.seti(*dst, u64::from(vals.geti(*src) != 0));
        }
        Inst::Select {
            dst,
            cond,
            if_true,
            if_false,
        } => {
            let v = if vals.geti(*cond) != 0 {
                vals.get(*if_true)
            } else {
                vals.get(*if_false)
            };
            vals.set(*dst, v);
        }
        Inst::ReadFlags { dst } => {
            vals.seti(*dst, u64::from(state.eflags.value()));
        }
        Inst::WriteFlags { src } => {
            state.eflags.set_value(vals.get32(*src));
        }

        // x87.
        Inst::FpuLoadMem { mem: m } => {
            let bank = &mut state.fpu;
            bank.x87_enter();
            let addr = mem_addr(vals, m);
            let v = match m.ty {
                DataType::F32 => F80::from_f64(f64::from(f32::from_bits(mem.read_u32(addr)))),
                DataType::F64 => F80::from_f64(f64::from_bits(mem.read_u64(addr))),
                _ => {
                    let mut buf = [0u8; 10];
                    mem.read_block(addr, &mut buf);
                    F80::from_bytes(buf)
                }
            };
            state.fpu.push(v);
        }
        Inst::FpuLoadSt { i } => {
            state.fpu.x87_enter();
            let v = state.fpu.st(*i);
            state.fpu.push(v);
        }
        Inst::FpuStoreMem { mem: m, pop } => {
            state.fpu.x87_enter();
            let v = state.fpu.st(0);
            let addr = mem_addr(vals, m);
            match m.ty {
                DataType::F32 => mem.write_u32(tc, addr, (v.to_f64() as f32).to_bits()),
                DataType::F64 => mem.write_u64(tc, addr, v.to_f64().to_bits()),
                _ => mem.write_block(tc, addr, &v.bytes()),
            }
            if *pop {
                state.fpu.pop();
            }
        }
        Inst::FpuStoreSt { i, pop } => {
            state.fpu.x87_enter();
            let v = state.fpu.st(0);
            state.fpu.st_write(*i, v);
            if *pop {
                state.fpu.pop();
            }
        }
        Inst::FpuExchange { i } => {
            state.fpu.x87_enter();
            let a = state.fpu.st(0);
            let b = state.fpu.st(*i);
            state.fpu.st_write(0, b);
            state.fpu.st_write(*i, a);
        }
        Inst::FpuArith {
            op,
            st,
            st0_dst,
            pop,
            mem: m,
        } => {
            state.fpu.x87_enter();
            let bank = &mut state.fpu;
            let (dst_idx, a, b) = match m {
                Some(m) => {
                    let addr = mem_addr(vals, m);
                    let b = match m.ty {
                        DataType::F32 => {
                            F80::from_f64(f64::from(f32::from_bits(mem.read_u32(addr))))
                        }
                        DataType::F64 => F80::from_f64(f64::from_bits(mem.read_u64(addr))),
                        DataType::I16 => arith::from_i64(i64::from(mem.read_u16(addr) as i16)),
                        _ => arith::from_i64(i64::from(mem.read_u32(addr) as i32)),
                    };
                    (0u8, bank.st(0), b)
                }
                None => {
                    if *st0_dst {
                        (0, bank.st(0), bank.st(*st))
                    } else {
                        (*st, bank.st(*st), bank.st(0))
                    }
                }
            };
            let r = match op {
                FpuArithOp::Add => arith::dyadic(bank, DyadicOp::Add, a, b),
                FpuArithOp::Sub => arith::dyadic(bank, DyadicOp::Sub, a, b),
                FpuArithOp::Subr => arith::dyadic(bank, DyadicOp::Sub, b, a),
                FpuArithOp::Mul => arith::dyadic(bank, DyadicOp::Mul, a, b),
                FpuArithOp::Div => arith::dyadic(bank, DyadicOp::Div, a, b),
                FpuArithOp::Divr => arith::dyadic(bank, DyadicOp::Div, b, a),
            };
            bank.st_write(dst_idx, r);
            if *pop {
                bank.pop();
            }
        }
        Inst::FpuCom { mem: m, st, pops } => {
            state.fpu.x87_enter();
            let bank = &mut state.fpu;
            let a = bank.st(0);
            let b = match m {
                Some(m) => {
                    let addr = mem_addr(vals, m);
                    match m.ty {
                        DataType::F32 => {
                            F80::from_f64(f64::from(f32::from_bits(mem.read_u32(addr))))
                        }
                        DataType::F64 => F80::from_f64(f64::from_bits(mem.read_u64(addr))),
                        DataType::I16 => arith::from_i64(i64::from(mem.read_u16(addr) as i16)),
                        _ => arith::from_i64(i64::from(mem.read_u32(addr) as i32)),
                    }
                }
                None => bank.st(*st),
            };
            let r = arith::compare(bank, a, b);
            arith::set_compare_cc(bank, r);
            for _ in 0..*pops {
                bank.pop();
            }
        }
        Inst::FpuTst => {
            state.fpu.x87_enter();
            let bank = &mut state.fpu;
            let a = bank.st(0);
            let r = arith::compare(bank, a, F80::ZERO);
            arith::set_compare_cc(bank, r);
        }
        Inst::FpuXam => {
            state.fpu.x87_enter();
            state.fpu.examine();
        }
        Inst::FpuChs => {
            state.fpu.x87_enter();
            let v = state.fpu.st(0);
            state.fpu.st_write(0, v.neg());
        }
        Inst::FpuAbs => {
            state.fpu.x87_enter();
            let v = state.fpu.st(0);
            state.fpu.st_write(0, v.abs());
        }
        Inst::FpuTrans { op } => {
            state.fpu.x87_enter();
            let bank = &mut state.fpu;
            let _ = match op {
                FpuTransOp::F2xm1 => trans::f2xm1(bank),
                FpuTransOp::Yl2x => trans::fyl2x(bank),
                FpuTransOp::Ptan => trans::fptan(bank),
                FpuTransOp::Patan => trans::fpatan(bank),
                FpuTransOp::Xtract => trans::fxtract(bank),
                FpuTransOp::Prem1 => trans::fprem(bank, true),
                FpuTransOp::Prem => trans::fprem(bank, false),
                FpuTransOp::Yl2xp1 => trans::fyl2xp1(bank),
                FpuTransOp::Sqrt => trans::fsqrt(bank),
                FpuTransOp::Sincos => trans::fsincos(bank),
                FpuTransOp::Rndint => trans::frndint(bank),
                FpuTransOp::Scale => trans::fscale(bank),
                FpuTransOp::Sin => trans::fsin(bank),
                FpuTransOp::Cos => trans::fcos(bank),
            };
        }
        Inst::FpuConstLoad { k } => {
            state.fpu.x87_enter();
            let v = match k {
                FpuConst::One => F80::ONE,
                FpuConst::L2t => F80::L2T,
                FpuConst::L2e => F80::L2E,
                FpuConst::Pi => F80::PI,
                FpuConst::Lg2 => F80::LG2,
                FpuConst::Ln2 => F80::LN2,
                FpuConst::Zero => F80::ZERO,
            };
            state.fpu.push(v);
        }
        Inst::FpuIntLoad { mem: m } => {
            state.fpu.x87_enter();
            let addr = mem_addr(vals, m);
            let v = match m.ty {
                DataType::I16 => i64::from(mem.read_u16(addr) as i16),
                DataType::I64 => mem.read_u64(addr) as i64,
                _ => i64::from(mem.read_u32(addr) as i32),
            };
            state.fpu.push(arith::from_i64(v));
        }
        Inst::FpuIntStore { mem: m, pop } => {
            state.fpu.x87_enter();
            let bank = &mut state.fpu;
            let v = bank.st(0);
            let bits = m.ty.size_bytes() * 8;
            let int = arith::to_int(bank, v, bits);
            let addr = mem_addr(vals, m);
            match m.ty {
                DataType::I16 => mem.write_u16(tc, addr, int as u32),
                DataType::I64 => mem.write_u64(tc, addr, int as u64),
                _ => mem.write_u32(tc, addr, int as u32),
            }
            if *pop {
                bank.pop();
            }
        }
        Inst::FpuSetCw { mem: m } => {
            state.fpu.x87_enter();
            let addr = mem_addr(vals, m);
            state.fpu.fcw = mem.read_u16(addr);
        }
        Inst::FpuGetCw { mem: m } => {
            state.fpu.x87_enter();
            let addr = mem_addr(vals, m);
            mem.write_u16(tc, addr, u32::from(state.fpu.fcw));
        }
        Inst::FpuGetSw { mem: m } => {
            state.fpu.x87_enter();
            let sw = state.fpu.fsw;
            match m {
                Some(m) => {
                    let addr = mem_addr(vals, m);
                    mem.write_u16(tc, addr, u32::from(sw));
                }
                None => state.write_gpr(talon_types::Gpr::Eax, Width::W16, false, u32::from(sw)),
            }
        }
        Inst::FpuClearEx => {
            state.fpu.x87_enter();
            state.fpu.clear_exceptions();
        }
        Inst::FpuInit => {
            state.fpu.init();
        }
        Inst::FpuFree { i } => {
            state.fpu.x87_enter();
            state.fpu.free(*i);
        }
        Inst::FpuIncStp => {
            state.fpu.x87_enter();
            state.fpu.inc_top();
        }
        Inst::FpuDecStp => {
            state.fpu.x87_enter();
            state.fpu.dec_top();
        }
        Inst::Emms => {
            state.fpu.emms();
        }

        // MMX / XMM register traffic.
        Inst::MmxRead { dst, mm } => {
            let v = state.fpu.mmx_read(*mm);
            let v = if dst.ty == DataType::I32 {
                u64::from(v as u32)
            } else {
                v
            };
            vals.seti(*dst, v);
        }
        Inst::MmxWrite { mm, src } => {
            state.fpu.mmx_write(*mm, vals.geti(*src));
        }
        Inst::XmmRead { dst, xmm } => {
            let full = state.fpu.xmm[(*xmm & 7) as usize];
            let v = match dst.ty {
                DataType::F32 | DataType::I32 => u128::from(full as u32),
                _ => full,
            };
            vals.set(*dst, v);
        }
        Inst::XmmWrite { xmm, src } => {
            let v = match src.ty {
                // MOVSS/MOVD forms zero-extend into the full register.
                DataType::F32 | DataType::I32 => u128::from(vals.get32(*src)),
                _ => vals.get(*src),
            };
            state.fpu.xmm[(*xmm & 7) as usize] = v;
        }

        Inst::Packed { op, dst, lhs, rhs } => {
            let a = vals.get(*lhs);
            let b = vals.get(*rhs);
            let r = packed_op(*op, dst.ty, lhs.ty, a, b);
            vals.set(*dst, r);
        }

        Inst::VFloat { op, dst, lhs, rhs } => {
            let r = if dst.ty == DataType::F32 {
                let a = f32::from_bits(vals.get32(*lhs));
                let b = f32::from_bits(vals.get32(*rhs));
                u128::from(vfloat_scalar(&mut state.fpu, *op, a, b).to_bits())
            } else {
                let mut out = 0u128;
                for lane in 0..4 {
                    let a = f32::from_bits((vals.get(*lhs) >> (lane * 32)) as u32);
                    let b = f32::from_bits((vals.get(*rhs) >> (lane * 32)) as u32);
                    let r = vfloat_scalar(&mut state.fpu, *op, a, b);
                    out |= u128::from(r.to_bits()) << (lane * 32);
                }
                out
            };
            vals.set(*dst, r);
        }
        Inst::VFloatSqrt { dst, src } => {
            let one = |bank: &mut FpuBank, v: f32| -> f32 {
                if v < 0.0 {
                    bank.mxcsr |= MXCSR_IE;
                    f32::NAN
                } else {
                    v.sqrt()
                }
            };
            let r = if dst.ty == DataType::F32 {
                u128::from(one(&mut state.fpu, f32::from_bits(vals.get32(*src))).to_bits())
            } else {
                let mut out = 0u128;
                for lane in 0..4 {
                    let v = f32::from_bits((vals.get(*src) >> (lane * 32)) as u32);
                    out |= u128::from(one(&mut state.fpu, v).to_bits()) << (lane * 32);
                }
                out
            };
            vals.set(*dst, r);
        }
        Inst::VFloatCmp {
            dst,
            lhs,
            rhs,
            pred,
        } => {
            let r = if dst.ty == DataType::F32 {
                u128::from(fcmp_pred(
                    f32::from_bits(vals.get32(*lhs)),
                    f32::from_bits(vals.get32(*rhs)),
                    *pred,
                ))
            } else {
                let mut out = 0u128;
                for lane in 0..4 {
                    let a = f32::from_bits((vals.get(*lhs) >> (lane * 32)) as u32);
                    let b = f32::from_bits((vals.get(*rhs) >> (lane * 32)) as u32);
                    out |= u128::from(fcmp_pred(a, b, *pred)) << (lane * 32);
                }
                out
            };
            vals.set(*dst, r);
        }
        Inst::SseComi { lhs, rhs, quiet } => {
            let a = f32::from_bits(vals.get32(*lhs));
            let b = f32::from_bits(vals.get32(*rhs));
            comi(state, a, b, *quiet);
        }
        Inst::InsertF32 { dst, base, src } => {
            let merged =
                (vals.get(*base) & !0xffff_ffffu128) | u128::from(vals.get32(*src));
            vals.set(*dst, merged);
        }
        Inst::Shuffle { dst, lhs, rhs, imm } => {
            let r = shuffle_ps(vals.get(*lhs), vals.get(*rhs), *imm);
            vals.set(*dst, r);
        }
        Inst::CvtIntToF32 { dst, src } => {
            let v = vals.get32(*src) as i32;
            vals.seti(*dst, u64::from((v as f32).to_bits()));
        }
        Inst::CvtF32ToInt { dst, src, trunc } => {
            let r = cvt_f32_to_i32(&mut state.fpu, vals.get32(*src), *trunc);
            vals.seti(*dst, u64::from(r as u32));
        }
        Inst::SetMxcsr { src } => {
            state.fpu.mxcsr = vals.get32(*src);
        }
        Inst::GetMxcsr { dst } => {
            vals.seti(*dst, u64::from(state.fpu.mxcsr));
        }
        Inst::Barrier { kind } => {
            mem::barrier(*kind);
        }
    }
    Ok(())
}

fn vfloat_scalar(bank: &mut FpuBank, op: VFloatOp, a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        bank.mxcsr |= MXCSR_IE;
    }
    match op {
        VFloatOp::Add => a + b,
        VFloatOp::Sub => a - b,
        VFloatOp::Mul => a * b,
        VFloatOp::Div => {
            if b == 0.0 && a.is_finite() && a != 0.0 {
                bank.mxcsr |= MXCSR_ZE;
            }
            a / b
        }
        VFloatOp::Min => {
            // SSE MIN/MAX return the second operand on NaN or equality.
            if a < b { a } else { b }
        }
        VFloatOp::Max => {
            if a > b { a } else { b }
        }
    }
}

fn sign_extend_128(v: u128, bits: u32) -> i128 {
    let shift = 128 - bits;
    ((v << shift) as i128) >> shift
}

fn lane_shape(ty: DataType) -> (u32, u32) {
    let lanes = ty.lanes();
    let bits = (ty.size_bytes() * 8) / lanes;
    (lanes, bits)
}

fn map_lanes2(ty: DataType, a: u128, b: u128, f: impl Fn(u64, u64, u32) -> u64) -> u128 {
    let (lanes, bits) = lane_shape(ty);
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let mut out = 0u128;
    for i in 0..lanes {
        let sh = i * bits;
        let la = ((a >> sh) as u64) & mask;
        let lb = ((b >> sh) as u64) & mask;
        out |= u128::from(f(la, lb, bits) & mask) << sh;
    }
    out
}

fn sx(v: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((v << shift) as i64) >> shift
}

fn sat_signed(v: i64, bits: u32) -> u64 {
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    (v.clamp(min, max) as u64) & if bits == 64 { u64::MAX } else { (1 << bits) - 1 }
}

fn sat_unsigned(v: i64, bits: u32) -> u64 {
    let max = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    if v < 0 {
        0
    } else if v as u64 > max {
        max
    } else {
        v as u64
    }
}

/// Lane-wise packed-integer evaluation; shared with the JIT helper layer.
pub fn packed_op(op: PackedOp, dst_ty: DataType, src_ty: DataType, a: u128, b: u128) -> u128 {
    match op {
        PackedOp::Add => map_lanes2(dst_ty, a, b, |x, y, _| x.wrapping_add(y)),
        PackedOp::Sub => map_lanes2(dst_ty, a, b, |x, y, _| x.wrapping_sub(y)),
        PackedOp::AddSat => {
            map_lanes2(dst_ty, a, b, |x, y, bits| sat_signed(sx(x, bits) + sx(y, bits), bits))
        }
        PackedOp::SubSat => {
            map_lanes2(dst_ty, a, b, |x, y, bits| sat_signed(sx(x, bits) - sx(y, bits), bits))
        }
        PackedOp::AddSatU => map_lanes2(dst_ty, a, b, |x, y, bits| {
            sat_unsigned((x + y) as i64, bits)
        }),
        PackedOp::SubSatU => map_lanes2(dst_ty, a, b, |x, y, _| x.saturating_sub(y)),
        PackedOp::MulLo => map_lanes2(dst_ty, a, b, |x, y, _| x.wrapping_mul(y)),
        PackedOp::MulHi => map_lanes2(dst_ty, a, b, |x, y, bits| {
            ((sx(x, bits) * sx(y, bits)) >> bits) as u64
        }),
        PackedOp::And => a & b,
        PackedOp::AndNot => !a & b,
        PackedOp::Or => a | b,
        PackedOp::Xor => a ^ b,
        PackedOp::CmpEq => map_lanes2(dst_ty, a, b, |x, y, _| if x == y { u64::MAX } else { 0 }),
        PackedOp::CmpGt => map_lanes2(dst_ty, a, b, |x, y, bits| {
            if sx(x, bits) > sx(y, bits) { u64::MAX } else { 0 }
        }),
        PackedOp::Sll => {
            let count = b as u64;
            map_lanes2(dst_ty, a, 0, |x, _, bits| {
                if count >= u64::from(bits) { 0 } else { x << count }
            })
        }
        PackedOp::Srl => {
            let count = b as u64;
            map_lanes2(dst_ty, a, 0, |x, _, bits| {
                if count >= u64::from(bits) { 0 } else { x >> count }
            })
        }
        PackedOp::Sra => {
            let count = b as u64;
            map_lanes2(dst_ty, a, 0, |x, _, bits| {
                let c = count.min(u64::from(bits - 1)) as u32;
                (sx(x, bits) >> c) as u64
            })
        }
        PackedOp::PackSs | PackedOp::PackUs => {
            let (src_lanes, src_bits) = lane_shape(src_ty);
            let dst_bits = src_bits / 2;
            let mask = (1u64 << dst_bits) - 1;
            let mut out = 0u128;
            for i in 0..src_lanes * 2 {
                let lane = if i < src_lanes {
                    ((a >> (i * src_bits)) as u64) & ((1u64 << src_bits) - 1)
                } else {
                    ((b >> ((i - src_lanes) * src_bits)) as u64) & ((1u64 << src_bits) - 1)
                };
                let v = sx(lane, src_bits);
                let packed = if op == PackedOp::PackSs {
                    sat_signed(v, dst_bits)
                } else {
                    sat_unsigned(v, dst_bits)
                };
                out |= u128::from(packed & mask) << (i * dst_bits);
            }
            out
        }
        PackedOp::UnpackLo | PackedOp::UnpackHi => {
            let (lanes, bits) = lane_shape(dst_ty);
            let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
            let half = lanes / 2;
            let base = if op == PackedOp::UnpackHi { half } else { 0 };
            let mut out = 0u128;
            for i in 0..half {
                let la = ((a >> ((base + i) * bits)) as u64) & mask;
                let lb = ((b >> ((base + i) * bits)) as u64) & mask;
                out |= u128::from(la) << (2 * i * bits);
                out |= u128::from(lb) << ((2 * i + 1) * bits);
            }
            out
        }
    }
}


/// Rotate primitive shared by the interpreter and the JIT helper:
/// `code` 0 = ROL, 1 = ROR, 2 = RCL, 3 = RCR. Updates CF, and OF for a
/// count of one, the way the hardware does.
pub fn rotate_op(eflags: &mut crate::eflags::Eflags, code: u32, w: Width, a: u64, cnt: u32) -> u64 {
    let bits = w.bits();
    let mask = w.mask();
    let a = a & mask;
    let cnt = cnt & 0x1f;
    if cnt == 0 {
        return a;
    }
    match code {
        0 => {
            let c = cnt % bits;
            let r = if c == 0 {
                a
            } else {
                ((a << c) | (a >> (bits - c))) & mask
            };
            let cf = r & 1 != 0;
            eflags.set_flag(EFLAGS_CF, cf);
            if cnt == 1 {
                eflags.set_flag(EFLAGS_OF, w.sign_bit(r) ^ cf);
            }
            r
        }
        1 => {
            let c = cnt % bits;
            let r = if c == 0 {
                a
            } else {
                ((a >> c) | (a << (bits - c))) & mask
            };
            let cf = w.sign_bit(r);
            eflags.set_flag(EFLAGS_CF, cf);
            if cnt == 1 {
                let next = (r >> (bits - 2)) & 1 != 0;
                eflags.set_flag(EFLAGS_OF, cf ^ next);
            }
            r
        }
        2 => {
            let c = cnt % (bits + 1);
            let cf_in = u64::from(eflags.get_flag(EFLAGS_CF));
            let wide = (a << 1) | cf_in;
            let rot = if c == 0 {
                wide
            } else {
                ((wide << c) | (wide >> (bits + 1 - c))) & ((mask << 1) | 1)
            };
            let r = (rot >> 1) & mask;
            let cf_out = if c == 0 {
                cf_in != 0
            } else {
                (a >> (bits - c)) & 1 != 0
            };
            eflags.set_flag(EFLAGS_CF, cf_out);
            if cnt == 1 {
                eflags.set_flag(EFLAGS_OF, w.sign_bit(r) ^ cf_out);
            }
            r
        }
        _ => {
            let c = cnt % (bits + 1);
            let cf_in = u64::from(eflags.get_flag(EFLAGS_CF));
            let wide = (a << 1) | cf_in;
            let rot = if c == 0 {
                wide
            } else {
                ((wide >> c) | (wide << (bits + 1 - c))) & ((mask << 1) | 1)
            };
            let r = (rot >> 1) & mask;
            let cf_out = if c == 0 {
                cf_in != 0
            } else {
                (a >> (c - 1)) & 1 != 0
            };
            eflags.set_flag(EFLAGS_CF, cf_out);
            if cnt == 1 {
                let top = w.sign_bit(r);
                let next = (r >> (bits - 2)) & 1 != 0;
                eflags.set_flag(EFLAGS_OF, top ^ next);
            }
            r
        }
    }
}

/// COMISS/UCOMISS flag materialization.
pub fn comi(state: &mut CpuState, a: f32, b: f32, quiet: bool) {
    let (zf, pf, cf) = if a.is_nan() || b.is_nan() {
        if !quiet {
            state.fpu.mxcsr |= MXCSR_IE;
        }
        (true, true, true)
    } else if a > b {
        (false, false, false)
    } else if a < b {
        (false, false, true)
    } else {
        (true, false, false)
    };
    state.eflags.set_flag(EFLAGS_ZF, zf);
    state.eflags.set_flag(EFLAGS_PF, pf);
    state.eflags.set_flag(EFLAGS_CF, cf);
    state.eflags.set_flag(EFLAGS_OF, false);
    state.eflags.set_flag(EFLAGS_AF, false);
    state.eflags.set_flag(EFLAGS_SF, false);
}

/// CMPPS/CMPSS predicate evaluation (0..7) to an all-ones/zero lane mask.
#[must_use]
pub fn fcmp_pred(a: f32, b: f32, pred: u8) -> u32 {
    let t = match pred {
        0 => a == b,
        1 => a < b,
        2 => a <= b,
        3 => a.is_nan() || b.is_nan(),
        4 => a != b || a.is_nan() || b.is_nan(),
        5 => !(a < b),
        6 => !(a <= b),
        _ => !a.is_nan() && !b.is_nan(),
    };
    if t { u32::MAX } else { 0 }
}

/// SHUFPS lane selection.
#[must_use]
pub fn shuffle_ps(a: u128, b: u128, imm: u8) -> u128 {
    let sel = |v: u128, idx: u32| -> u128 { (v >> (idx * 32)) & 0xffff_ffff };
    let imm = u32::from(imm);
    sel(a, imm & 3)
        | (sel(a, (imm >> 2) & 3) << 32)
        | (sel(b, (imm >> 4) & 3) << 64)
        | (sel(b, (imm >> 6) & 3) << 96)
}

/// CVT(T)SS2SI with the x86 integer-indefinite sentinel.
pub fn cvt_f32_to_i32(fpu: &mut FpuBank, bits: u32, trunc: bool) -> i32 {
    let v = f32::from_bits(bits);
    if v.is_nan() || v >= 2_147_483_648.0 || v < -2_147_483_648.0 {
        fpu.mxcsr |= MXCSR_IE;
        i32::MIN
    } else if trunc {
        v.trunc() as i32
    } else {
        v.round_ties_even() as i32
    }
}

/// Checked widening division; `None` is a #DE (zero divisor or quotient
/// overflow). Shared with the JIT's division helper.
#[must_use]
pub fn divrem(w: Width, signed: bool, hi: u32, lo: u32, divisor: u32) -> Option<(u32, u32)> {
    let bits = w.bits();
    let mask = w.mask();
    let d = u64::from(divisor) & mask;
    if d == 0 {
        return None;
    }
    let dividend = (u128::from(u64::from(hi) & mask) << bits) | u128::from(u64::from(lo) & mask);
    if signed {
        let dividend = sign_extend_128(dividend, bits * 2);
        let d = w.sign_extend(d) as i128;
        let q = dividend.wrapping_div(d);
        let r = dividend.wrapping_rem(d);
        let (min, max) = match w {
            Width::W8 => (i64::from(i8::MIN), i64::from(i8::MAX)),
            Width::W16 => (i64::from(i16::MIN), i64::from(i16::MAX)),
            _ => (i64::from(i32::MIN), i64::from(i32::MAX)),
        };
        if q < i128::from(min) || q > i128::from(max) {
            return None;
        }
        Some(((q as u64 & mask) as u32, (r as u64 & mask) as u32))
    } else {
        let q = dividend / u128::from(d);
        let r = dividend % u128::from(d);
        if q > u128::from(mask) {
            return None;
        }
        Some((q as u32, r as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talon_types::DataType;

    #[test]
    fn packed_add_bytes() {
        let a = 0x0102_0304_0506_0708u128;
        let b = 0x1020_3040_5060_7080u128;
        let r = packed_op(PackedOp::Add, DataType::V64B8, DataType::V64B8, a, b);
        assert_eq!(r, 0x1122_3344_5566_7788);
    }

    #[test]
    fn packed_saturating_unsigned_add() {
        let a = 0x00ff_00f0u128;
        let b = 0x0001_0020u128;
        let r = packed_op(PackedOp::AddSatU, DataType::V64B8, DataType::V64B8, a, b);
        assert_eq!(r & 0xffff_ffff, 0x00ff_00ff);
    }

    #[test]
    fn packed_compare_produces_masks() {
        let a = 0x0005_0001u128;
        let b = 0x0005_0002u128;
        let r = packed_op(PackedOp::CmpEq, DataType::V64H4, DataType::V64H4, a, b);
        assert_eq!(r & 0xffff_ffff, 0xffff_0000);
    }

    #[test]
    fn pack_signed_saturates() {
        // Four 16-bit lanes 0x0100, -1, 0x7f, 0x80 → packed to bytes
        // 0x7f, 0xff, 0x7f, 0x7f (saturated).
        let a = 0x0080_007f_ffff_0100u128;
        let r = packed_op(PackedOp::PackSs, DataType::V64B8, DataType::V64H4, a, 0);
        assert_eq!(r as u32 & 0xff, 0x7f); // 0x0100 saturates to 0x7f
        assert_eq!((r >> 8) as u32 & 0xff, 0xff); // -1 stays -1
        assert_eq!((r >> 16) as u32 & 0xff, 0x7f);
        assert_eq!((r >> 24) as u32 & 0xff, 0x7f); // 0x80 positive → 0x7f
    }

    #[test]
    fn unpack_interleaves_low_lanes() {
        let a = 0x0807_0605_0403_0201u128;
        let b = 0x1817_1615_1413_1211u128;
        let r = packed_op(PackedOp::UnpackLo, DataType::V64B8, DataType::V64B8, a, b);
        assert_eq!(r as u64, 0x1404_1303_1202_1101);
    }

    #[test]
    fn shifts_clear_beyond_width() {
        let a = 0x8000_0001_8000_0001u128;
        let cnt = 40u128;
        let r = packed_op(PackedOp::Sll, DataType::V64S2, DataType::V64S2, a, cnt);
        assert_eq!(r as u64, 0);
    }
}
