//! Emitted-code ABI.
//!
//! A translated block is an `extern "C" fn(*mut JitCtx) -> u32` returning the
//! next guest address. Register conventions inside a block:
//!
//! - `x28` holds the [`JitCtx`] pointer for the whole block.
//! - `x16`/`x17` are emitter scratch (also the veneer register).
//! - `v0..v7` are emitter NEON scratch.
//! - Everything else in the allocator pools carries vreg values.
//!
//! Guest state is reached through `JitCtx::state` with the fixed offsets
//! below; anything richer (flags engine, FPU bank, guest memory) goes
//! through the helper table, whose entries are plain function addresses the
//! emitted code loads and calls with `blr`.

use std::mem::offset_of;

use talon_cpu_core::state::CpuState;

/// Fixed context the emitted code receives in `x0`.
#[repr(C)]
pub struct JitCtx {
    /// Guest state block.
    pub state: *mut CpuState,
    /// Opaque runtime pointer the helper implementations downcast.
    pub runtime: *mut core::ffi::c_void,
    /// Guest exception raised by a helper mid-block (vector + 1, 0 = none).
    pub pending_exception: u32,
    pub pending_addr: u32,
    /// Transfer buffer: 128-bit memory traffic uses the first 16 bytes;
    /// the packed-fallback helper reads both operands from the full 32.
    pub scratch16: [u8; 32],
    /// Helper function addresses, indexed by [`helper`] constants.
    pub helpers: [usize; helper::COUNT],
}

pub const CTX_STATE: u32 = offset_of!(JitCtx, state) as u32;
pub const CTX_RUNTIME: u32 = offset_of!(JitCtx, runtime) as u32;
pub const CTX_PENDING_EXC: u32 = offset_of!(JitCtx, pending_exception) as u32;
pub const CTX_PENDING_ADDR: u32 = offset_of!(JitCtx, pending_addr) as u32;
pub const CTX_SCRATCH16: u32 = offset_of!(JitCtx, scratch16) as u32;
pub const CTX_HELPERS: u32 = offset_of!(JitCtx, helpers) as u32;

/// State-block offsets the emitted code addresses directly.
pub const STATE_GPR: u32 = offset_of!(CpuState, gpr) as u32;
pub const STATE_EIP: u32 = offset_of!(CpuState, eip) as u32;

#[must_use]
pub fn gpr_offset(index: usize) -> u32 {
    STATE_GPR + (index as u32) * 4
}

/// Helper-table slots.
pub mod helper {
    pub const READ_U8: usize = 0;
    pub const READ_U16: usize = 1;
    pub const READ_U32: usize = 2;
    pub const READ_U64: usize = 3;
    /// Fills `JitCtx::scratch16`.
    pub const READ_U128: usize = 4;
    pub const WRITE_U8: usize = 5;
    pub const WRITE_U16: usize = 6;
    pub const WRITE_U32: usize = 7;
    pub const WRITE_U64: usize = 8;
    /// Stores from `JitCtx::scratch16`.
    pub const WRITE_U128: usize = 9;
    /// `(ctx, meta, result, src1, src2, carry_in)`; meta packs the flag-op
    /// kind and width, see [`pack_flags_meta`].
    pub const FLAGS_STORE: usize = 10;
    /// `(ctx) -> u32` materialized EFLAGS.
    pub const FLAGS_GET: usize = 11;
    /// `(ctx, value)` POPF-style write.
    pub const FLAGS_SET: usize = 12;
    /// `(ctx, cc) -> 0/1`.
    pub const EVAL_COND: usize = 13;
    /// `(ctx, mask, values)` direct bit update (MUL CF/OF, COMISS).
    pub const FLAGS_SET_BITS: usize = 14;
    /// `(ctx, meta, hi, lo, divisor) -> rem:quot`; sets pending #DE.
    pub const DIVREM: usize = 15;
    /// `(ctx, meta, addr)`: one x87 instruction, see [`pack_fpu_meta`].
    pub const FPU_EXEC: usize = 16;
    /// `(ctx, n) -> u64`.
    pub const MMX_READ: usize = 17;
    /// `(ctx, n, value)`.
    pub const MMX_WRITE: usize = 18;
    /// `(ctx, vector)`: software-interrupt delivery.
    pub const INTERRUPT: usize = 19;
    /// `(ctx, meta, value, count) -> result` rotate with flag effects.
    pub const ROTATE: usize = 20;
    /// `(ctx, a_bits, b_bits, quiet)` COMISS/UCOMISS.
    pub const SSE_COMI: usize = 21;
    /// `(ctx, bits, trunc) -> i32` CVT(T)SS2SI with the x86 sentinel.
    pub const CVT_F32_TO_I32: usize = 22;
    /// `(ctx, is_set, value) -> u32` LDMXCSR/STMXCSR.
    pub const MXCSR: usize = 23;
    /// `(ctx, op, dst_ty, src_ty)`: packed ops without a direct NEON
    /// lowering (shifts by register, MULHI, pack, shuffle, float compares);
    /// operands and result travel through the scratch buffer.
    pub const PACKED_FALLBACK: usize = 24;
    pub const COUNT: usize = 25;
}

/// Packs (flag-op kind, width bits, carry-in) for `FLAGS_STORE`.
#[must_use]
pub fn pack_flags_meta(op: u32, width_bits: u32, carry_in_bit: u32) -> u32 {
    op | (width_bits << 8) | (carry_in_bit << 16)
}

/// Packs an x87 instruction for `FPU_EXEC`: kind, two small operands and a
/// type code.
#[must_use]
pub fn pack_fpu_meta(kind: u32, a: u32, b: u32, ty: u32) -> u32 {
    kind | (a << 8) | (b << 16) | (ty << 24)
}

/// x87 instruction kinds understood by the `FPU_EXEC` helper.
pub mod fpu_kind {
    pub const LOAD_MEM: u32 = 0;
    pub const LOAD_ST: u32 = 1;
    pub const STORE_MEM: u32 = 2;
    pub const STORE_ST: u32 = 3;
    pub const EXCHANGE: u32 = 4;
    /// a = arith op, b = st | st0_dst<<4 | pop<<5 | has_mem<<6.
    pub const ARITH: u32 = 5;
    /// a = st, b = pops | has_mem<<4.
    pub const COM: u32 = 6;
    pub const TST: u32 = 7;
    pub const XAM: u32 = 8;
    pub const CHS: u32 = 9;
    pub const ABS: u32 = 10;
    /// a = transcendental op index.
    pub const TRANS: u32 = 11;
    /// a = constant index.
    pub const CONST_LOAD: u32 = 12;
    pub const INT_LOAD: u32 = 13;
    /// b = pop.
    pub const INT_STORE: u32 = 14;
    pub const SET_CW: u32 = 15;
    pub const GET_CW: u32 = 16;
    /// b = 1 when the target is AX.
    pub const GET_SW: u32 = 17;
    pub const CLEAR_EX: u32 = 18;
    pub const INIT: u32 = 19;
    pub const FREE: u32 = 20;
    pub const INC_STP: u32 = 21;
    pub const DEC_STP: u32 = 22;
    pub const EMMS: u32 = 23;
}

/// Type codes shared between codegen and the FPU helper.
pub mod ty_code {
    pub const F32: u32 = 0;
    pub const F64: u32 = 1;
    pub const F80: u32 = 2;
    pub const I16: u32 = 3;
    pub const I32: u32 = 4;
    pub const I64: u32 = 5;
}


use talon_types::DataType;
use talon_x86::ir::{FpuArithOp, FpuConst, FpuTransOp, PackedOp, ShiftOp};

/// Opcode space of the packed-fallback helper.
pub mod packed_fallback_op {
    pub const MULHI: u32 = 0;
    pub const SLL: u32 = 1;
    pub const SRL: u32 = 2;
    pub const SRA: u32 = 3;
    pub const PACKSS: u32 = 4;
    pub const PACKUS: u32 = 5;
    pub const SHUFFLE: u32 = 6;
    pub const FCMP: u32 = 7;
}

#[must_use]
pub fn rotate_code(op: ShiftOp) -> u32 {
    match op {
        ShiftOp::Rol => 0,
        ShiftOp::Ror => 1,
        ShiftOp::Rcl => 2,
        _ => 3,
    }
}

#[must_use]
pub fn packed_code(op: PackedOp) -> u32 {
    match op {
        PackedOp::MulHi => packed_fallback_op::MULHI,
        PackedOp::Sll => packed_fallback_op::SLL,
        PackedOp::Srl => packed_fallback_op::SRL,
        PackedOp::Sra => packed_fallback_op::SRA,
        PackedOp::PackSs => packed_fallback_op::PACKSS,
        _ => packed_fallback_op::PACKUS,
    }
}

#[must_use]
pub fn packed_from(code: u32) -> PackedOp {
    match code {
        packed_fallback_op::MULHI => PackedOp::MulHi,
        packed_fallback_op::SLL => PackedOp::Sll,
        packed_fallback_op::SRL => PackedOp::Srl,
        packed_fallback_op::SRA => PackedOp::Sra,
        packed_fallback_op::PACKSS => PackedOp::PackSs,
        _ => PackedOp::PackUs,
    }
}

#[must_use]
pub fn fpu_arith_code(op: FpuArithOp) -> u32 {
    match op {
        FpuArithOp::Add => 0,
        FpuArithOp::Sub => 1,
        FpuArithOp::Subr => 2,
        FpuArithOp::Mul => 3,
        FpuArithOp::Div => 4,
        FpuArithOp::Divr => 5,
    }
}

#[must_use]
pub fn fpu_arith_from(code: u32) -> FpuArithOp {
    match code {
        0 => FpuArithOp::Add,
        1 => FpuArithOp::Sub,
        2 => FpuArithOp::Subr,
        3 => FpuArithOp::Mul,
        4 => FpuArithOp::Div,
        _ => FpuArithOp::Divr,
    }
}

#[must_use]
pub fn trans_code(op: FpuTransOp) -> u32 {
    match op {
        FpuTransOp::F2xm1 => 0,
        FpuTransOp::Yl2x => 1,
        FpuTransOp::Ptan => 2,
        FpuTransOp::Patan => 3,
        FpuTransOp::Xtract => 4,
        FpuTransOp::Prem1 => 5,
        FpuTransOp::Prem => 6,
        FpuTransOp::Yl2xp1 => 7,
        FpuTransOp::Sqrt => 8,
        FpuTransOp::Sincos => 9,
        FpuTransOp::Rndint => 10,
        FpuTransOp::Scale => 11,
        FpuTransOp::Sin => 12,
        FpuTransOp::Cos => 13,
    }
}

#[must_use]
pub fn trans_from(code: u32) -> FpuTransOp {
    match code {
        0 => FpuTransOp::F2xm1,
        1 => FpuTransOp::Yl2x,
        2 => FpuTransOp::Ptan,
        3 => FpuTransOp::Patan,
        4 => FpuTransOp::Xtract,
        5 => FpuTransOp::Prem1,
        6 => FpuTransOp::Prem,
        7 => FpuTransOp::Yl2xp1,
        8 => FpuTransOp::Sqrt,
        9 => FpuTransOp::Sincos,
        10 => FpuTransOp::Rndint,
        11 => FpuTransOp::Scale,
        12 => FpuTransOp::Sin,
        _ => FpuTransOp::Cos,
    }
}

#[must_use]
pub fn const_code(k: FpuConst) -> u32 {
    match k {
        FpuConst::One => 0,
        FpuConst::L2t => 1,
        FpuConst::L2e => 2,
        FpuConst::Pi => 3,
        FpuConst::Lg2 => 4,
        FpuConst::Ln2 => 5,
        FpuConst::Zero => 6,
    }
}

#[must_use]
pub fn const_from(code: u32) -> FpuConst {
    match code {
        0 => FpuConst::One,
        1 => FpuConst::L2t,
        2 => FpuConst::L2e,
        3 => FpuConst::Pi,
        4 => FpuConst::Lg2,
        5 => FpuConst::Ln2,
        _ => FpuConst::Zero,
    }
}

#[must_use]
pub fn mem_ty_code(ty: DataType) -> u32 {
    match ty {
        DataType::F32 => ty_code::F32,
        DataType::F64 => ty_code::F64,
        DataType::F80 => ty_code::F80,
        DataType::I16 => ty_code::I16,
        DataType::I64 => ty_code::I64,
        _ => ty_code::I32,
    }
}

#[must_use]
pub fn mem_ty_from(code: u32) -> DataType {
    match code {
        x if x == ty_code::F32 => DataType::F32,
        x if x == ty_code::F64 => DataType::F64,
        x if x == ty_code::F80 => DataType::F80,
        x if x == ty_code::I16 => DataType::I16,
        x if x == ty_code::I64 => DataType::I64,
        _ => DataType::I32,
    }
}

#[must_use]
pub fn vec_ty_code(ty: DataType) -> u32 {
    match ty {
        DataType::V64B8 => 0,
        DataType::V64H4 => 1,
        DataType::V64S2 => 2,
        DataType::V64D1 => 3,
        DataType::V128B16 => 4,
        DataType::V128H8 => 5,
        DataType::V128S4 => 6,
        DataType::V128D2 => 7,
        DataType::F32 => 8,
        _ => 9,
    }
}

#[must_use]
pub fn vec_ty_from(code: u32) -> DataType {
    match code {
        0 => DataType::V64B8,
        1 => DataType::V64H4,
        2 => DataType::V64S2,
        3 => DataType::V64D1,
        4 => DataType::V128B16,
        5 => DataType::V128H8,
        6 => DataType::V128S4,
        7 => DataType::V128D2,
        8 => DataType::F32,
        _ => DataType::V128D2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctx_layout_is_stable() {
        assert_eq!(CTX_STATE, 0);
        assert_eq!(CTX_RUNTIME, 8);
        assert_eq!(CTX_PENDING_EXC, 16);
        assert_eq!(CTX_PENDING_ADDR, 20);
        assert_eq!(CTX_SCRATCH16, 24);
        assert_eq!(CTX_HELPERS, 56);
    }

    #[test]
    fn state_offsets_match_repr_c() {
        assert_eq!(STATE_GPR, 0);
        assert_eq!(STATE_EIP, 32);
        assert_eq!(gpr_offset(4), 16); // ESP
    }

    #[test]
    fn meta_packing_round_trips() {
        let m = pack_flags_meta(7, 32, 1);
        assert_eq!(m & 0xff, 7);
        assert_eq!((m >> 8) & 0xff, 32);
        assert_eq!((m >> 16) & 1, 1);
    }
}
