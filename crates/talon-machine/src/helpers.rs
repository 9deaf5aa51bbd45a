//! Implementations of the emitted-code helper table.
//!
//! Each entry is an `extern "C"` function taking the [`JitCtx`] pointer; the
//! runtime pointer inside it carries the memory manager and translation
//! cache. Semantics are shared with the reference interpreter: the x87
//! helper rebuilds the (vreg-free) IR instruction and runs it through
//! `interp::exec_single`, and the scalar primitives call the same functions
//! the interpreter uses.

use talon_cpu_core::cache::TranslationCache;
use talon_cpu_core::eflags::FlagOp;
use talon_cpu_core::interp::{self, packed_op};
use talon_cpu_core::mem::MemoryManager;
use talon_cpu_core::state::CpuState;
use talon_jit_a64::abi::{self, fpu_kind, helper, packed_fallback_op, JitCtx};
use talon_types::{Cond, Width};
use talon_x86::ir::{Inst, MemRef};

/// What `JitCtx::runtime` points at.
pub(crate) struct Runtime {
    pub mem: *const MemoryManager,
    pub tc: *const TranslationCache,
}

struct Refs<'a> {
    state: &'a mut CpuState,
    mem: &'a MemoryManager,
    tc: &'a TranslationCache,
    ctx: &'a mut JitCtx,
}

unsafe fn refs<'a>(ctx: *mut JitCtx) -> Refs<'a> {
    let ctx = &mut *ctx;
    let rt = &*ctx.runtime.cast::<Runtime>();
    Refs {
        state: &mut *ctx.state,
        mem: &*rt.mem,
        tc: &*rt.tc,
        ctx,
    }
}

fn width_from_bits(bits: u32) -> Width {
    match bits {
        8 => Width::W8,
        16 => Width::W16,
        _ => Width::W32,
    }
}

unsafe extern "C" fn h_read_u8(ctx: *mut JitCtx, addr: u32) -> u32 {
    let r = refs(ctx);
    u32::from(r.mem.read_u8(addr))
}
unsafe extern "C" fn h_read_u16(ctx: *mut JitCtx, addr: u32) -> u32 {
    let r = refs(ctx);
    u32::from(r.mem.read_u16(addr))
}
unsafe extern "C" fn h_read_u32(ctx: *mut JitCtx, addr: u32) -> u32 {
    let r = refs(ctx);
    r.mem.read_u32(addr)
}
unsafe extern "C" fn h_read_u64(ctx: *mut JitCtx, addr: u32) -> u64 {
    let r = refs(ctx);
    r.mem.read_u64(addr)
}
unsafe extern "C" fn h_read_u128(ctx: *mut JitCtx, addr: u32) {
    let r = refs(ctx);
    let v = r.mem.read_u128(addr);
    r.ctx.scratch16[..16].copy_from_slice(&v.to_le_bytes());
}
unsafe extern "C" fn h_write_u8(ctx: *mut JitCtx, addr: u32, value: u32) {
    let r = refs(ctx);
    r.mem.write_u8(r.tc, addr, value);
}
unsafe extern "C" fn h_write_u16(ctx: *mut JitCtx, addr: u32, value: u32) {
    let r = refs(ctx);
    r.mem.write_u16(r.tc, addr, value);
}
unsafe extern "C" fn h_write_u32(ctx: *mut JitCtx, addr: u32, value: u32) {
    let r = refs(ctx);
    r.mem.write_u32(r.tc, addr, value);
}
unsafe extern "C" fn h_write_u64(ctx: *mut JitCtx, addr: u32, value: u64) {
    let r = refs(ctx);
    r.mem.write_u64(r.tc, addr, value);
}
unsafe extern "C" fn h_write_u128(ctx: *mut JitCtx, addr: u32) {
    let r = refs(ctx);
    let v = u128::from_le_bytes(r.ctx.scratch16[..16].try_into().unwrap());
    r.mem.write_u128(r.tc, addr, v);
}

unsafe extern "C" fn h_flags_store(
    ctx: *mut JitCtx,
    meta: u32,
    result: u32,
    src1: u32,
    src2: u32,
    carry_in: u32,
) {
    let r = refs(ctx);
    let op = FlagOp::from_u32(meta & 0xff).unwrap_or(FlagOp::Logic);
    let width = width_from_bits((meta >> 8) & 0xff);
    r.state
        .eflags
        .store_op_state_carry(op, width, result, src1, src2, carry_in != 0);
}
unsafe extern "C" fn h_flags_get(ctx: *mut JitCtx) -> u32 {
    let r = refs(ctx);
    r.state.eflags.value()
}
unsafe extern "C" fn h_flags_set(ctx: *mut JitCtx, value: u32) {
    let r = refs(ctx);
    r.state.eflags.set_value(value);
}
unsafe extern "C" fn h_eval_cond(ctx: *mut JitCtx, cc: u32) -> u32 {
    let r = refs(ctx);
    let cond = Cond::from_encoding((cc & 0xf) as u8).unwrap();
    u32::from(r.state.eflags.evaluate_condition(cond))
}
unsafe extern "C" fn h_flags_set_bits(ctx: *mut JitCtx, mask: u32, values: u32) {
    let r = refs(ctx);
    let cur = r.state.eflags.value();
    r.state.eflags.set_value((cur & !mask) | (values & mask));
}

unsafe extern "C" fn h_divrem(ctx: *mut JitCtx, meta: u32, hi: u32, lo: u32, divisor: u32) -> u64 {
    let r = refs(ctx);
    let width = width_from_bits(meta & 0xff);
    let signed = (meta >> 8) & 1 != 0;
    match interp::divrem(width, signed, hi, lo, divisor) {
        Some((quot, rem)) => u64::from(quot) | (u64::from(rem) << 32),
        None => {
            r.ctx.pending_exception = u32::from(talon_types::Exception::DivideError.vector()) + 1;
            r.ctx.pending_addr = r.state.eip;
            0
        }
    }
}

unsafe extern "C" fn h_fpu_exec(ctx: *mut JitCtx, meta: u32, addr: u32) {
    let r = refs(ctx);
    let kind = meta & 0xff;
    let a = (meta >> 8) & 0xff;
    let b = (meta >> 16) & 0xff;
    let ty = abi::mem_ty_from(meta >> 24);
    let mem_ref = MemRef::absolute(addr as i32, ty);
    let inst = match kind {
        fpu_kind::LOAD_MEM => Inst::FpuLoadMem { mem: mem_ref },
        fpu_kind::LOAD_ST => Inst::FpuLoadSt { i: a as u8 },
        fpu_kind::STORE_MEM => Inst::FpuStoreMem {
            mem: mem_ref,
            pop: b & 1 != 0,
        },
        fpu_kind::STORE_ST => Inst::FpuStoreSt {
            i: a as u8,
            pop: b & 1 != 0,
        },
        fpu_kind::EXCHANGE => Inst::FpuExchange { i: a as u8 },
        fpu_kind::ARITH => Inst::FpuArith {
            op: abi::fpu_arith_from(a),
            st: (b & 0xf) as u8,
            st0_dst: b & 0x10 != 0,
            pop: b & 0x20 != 0,
            mem: (b & 0x40 != 0).then_some(mem_ref),
        },
        fpu_kind::COM => Inst::FpuCom {
            mem: (b & 0x10 != 0).then_some(mem_ref),
            st: a as u8,
            pops: (b & 0xf) as u8,
        },
        fpu_kind::TST => Inst::FpuTst,
        fpu_kind::XAM => Inst::FpuXam,
        fpu_kind::CHS => Inst::FpuChs,
        fpu_kind::ABS => Inst::FpuAbs,
        fpu_kind::TRANS => Inst::FpuTrans {
            op: abi::trans_from(a),
        },
        fpu_kind::CONST_LOAD => Inst::FpuConstLoad {
            k: abi::const_from(a),
        },
        fpu_kind::INT_LOAD => Inst::FpuIntLoad { mem: mem_ref },
        fpu_kind::INT_STORE => Inst::FpuIntStore {
            mem: mem_ref,
            pop: b & 1 != 0,
        },
        fpu_kind::SET_CW => Inst::FpuSetCw { mem: mem_ref },
        fpu_kind::GET_CW => Inst::FpuGetCw { mem: mem_ref },
        fpu_kind::GET_SW => Inst::FpuGetSw {
            mem: (b & 1 == 0).then_some(mem_ref),
        },
        fpu_kind::CLEAR_EX => Inst::FpuClearEx,
        fpu_kind::INIT => Inst::FpuInit,
        fpu_kind::FREE => Inst::FpuFree { i: a as u8 },
        fpu_kind::INC_STP => Inst::FpuIncStp,
        fpu_kind::DEC_STP => Inst::FpuDecStp,
        _ => Inst::Emms,
    };
    let start = r.state.eip;
    if let Err(fault) = interp::exec_single(&inst, start, r.state, r.mem, r.tc) {
        r.ctx.pending_exception = u32::from(fault.exception.vector()) + 1;
        r.ctx.pending_addr = fault.addr;
    }
}

unsafe extern "C" fn h_mmx_read(ctx: *mut JitCtx, n: u32) -> u64 {
    let r = refs(ctx);
    r.state.fpu.mmx_read(n as u8)
}
unsafe extern "C" fn h_mmx_write(ctx: *mut JitCtx, n: u32, value: u64) {
    let r = refs(ctx);
    r.state.fpu.mmx_write(n as u8, value);
}

unsafe extern "C" fn h_interrupt(ctx: *mut JitCtx, vector: u32) {
    let r = refs(ctx);
    let next = r.state.eip;
    r.mem
        .with_bus(|bus| bus.software_interrupt(vector as u8, next));
}

unsafe extern "C" fn h_rotate(ctx: *mut JitCtx, meta: u32, value: u64, count: u64) -> u64 {
    let r = refs(ctx);
    let width = width_from_bits((meta >> 8) & 0xff);
    interp::rotate_op(&mut r.state.eflags, meta & 0xff, width, value, count as u32)
}

unsafe extern "C" fn h_sse_comi(ctx: *mut JitCtx, a_bits: u32, b_bits: u32, quiet: u32) {
    let r = refs(ctx);
    interp::comi(
        r.state,
        f32::from_bits(a_bits),
        f32::from_bits(b_bits),
        quiet != 0,
    );
}

unsafe extern "C" fn h_cvt_f32_to_i32(ctx: *mut JitCtx, bits: u32, trunc: u32) -> i32 {
    let r = refs(ctx);
    interp::cvt_f32_to_i32(&mut r.state.fpu, bits, trunc != 0)
}

unsafe extern "C" fn h_mxcsr(ctx: *mut JitCtx, is_set: u32, value: u32) -> u32 {
    let r = refs(ctx);
    if is_set != 0 {
        r.state.fpu.mxcsr = value;
        value
    } else {
        r.state.fpu.mxcsr
    }
}

unsafe extern "C" fn h_packed_fallback(ctx: *mut JitCtx, op: u32, dst_ty: u32, src_ty: u32) {
    let r = refs(ctx);
    let a = u128::from_le_bytes(r.ctx.scratch16[..16].try_into().unwrap());
    let b = u128::from_le_bytes(r.ctx.scratch16[16..32].try_into().unwrap());
    let dst = abi::vec_ty_from(dst_ty);
    let src = abi::vec_ty_from(src_ty);
    let kind = op & 0xff;
    let result = match kind {
        packed_fallback_op::SHUFFLE => interp::shuffle_ps(a, b, (op >> 8) as u8),
        packed_fallback_op::FCMP => {
            let pred = (op >> 8) as u8;
            if dst == talon_types::DataType::F32 {
                u128::from(interp::fcmp_pred(
                    f32::from_bits(a as u32),
                    f32::from_bits(b as u32),
                    pred,
                ))
            } else {
                let mut out = 0u128;
                for lane in 0..4 {
                    let x = f32::from_bits((a >> (lane * 32)) as u32);
                    let y = f32::from_bits((b >> (lane * 32)) as u32);
                    out |= u128::from(interp::fcmp_pred(x, y, pred)) << (lane * 32);
                }
                out
            }
        }
        _ => packed_op(abi::packed_from(kind), dst, src, a, b),
    };
    r.ctx.scratch16[..16].copy_from_slice(&result.to_le_bytes());
}

/// Builds the helper table the emitted code indexes.
pub(crate) fn build_table() -> [usize; helper::COUNT] {
    let mut t = [0usize; helper::COUNT];
    t[helper::READ_U8] = h_read_u8 as usize;
    t[helper::READ_U16] = h_read_u16 as usize;
    t[helper::READ_U32] = h_read_u32 as usize;
    t[helper::READ_U64] = h_read_u64 as usize;
    t[helper::READ_U128] = h_read_u128 as usize;
    t[helper::WRITE_U8] = h_write_u8 as usize;
    t[helper::WRITE_U16] = h_write_u16 as usize;
    t[helper::WRITE_U32] = h_write_u32 as usize;
    t[helper::WRITE_U64] = h_write_u64 as usize;
    t[helper::WRITE_U128] = h_write_u128 as usize;
    t[helper::FLAGS_STORE] = h_flags_store as usize;
    t[helper::FLAGS_GET] = h_flags_get as usize;
    t[helper::FLAGS_SET] = h_flags_set as usize;
    t[helper::EVAL_COND] = h_eval_cond as usize;
    t[helper::FLAGS_SET_BITS] = h_flags_set_bits as usize;
    t[helper::DIVREM] = h_divrem as usize;
    t[helper::FPU_EXEC] = h_fpu_exec as usize;
    t[helper::MMX_READ] = h_mmx_read as usize;
    t[helper::MMX_WRITE] = h_mmx_write as usize;
    t[helper::INTERRUPT] = h_interrupt as usize;
    t[helper::ROTATE] = h_rotate as usize;
    t[helper::SSE_COMI] = h_sse_comi as usize;
    t[helper::CVT_F32_TO_I32] = h_cvt_f32_to_i32 as usize;
    t[helper::MXCSR] = h_mxcsr as usize;
    t[helper::PACKED_FALLBACK] = h_packed_fallback as usize;
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_empty_slots() {
        let t = build_table();
        assert!(t.iter().all(|&f| f != 0));
    }
}
