//! IR → AArch64 lowering.
//!
//! Integer ALU, register traffic, vector arithmetic and control flow are
//! emitted inline; guest memory, the flags engine, the x87 bank and the few
//! vector shapes NEON has no single instruction for go through the helper
//! table (the emitted code saves live caller-saved registers around each
//! `blr`). Every deterministic exit leg ends in a patchable `B` followed by
//! a reserved veneer slot so the cache's chaining pass can redirect it.

use std::mem::offset_of;

use thiserror::Error;

use talon_cpu_core::cache::{ExitInfo, ExitKind};
use talon_cpu_core::eflags::FlagOp;
use talon_fpu::FpuBank;
use talon_types::{BarrierKind, DataType, FlagSet, Width};
use talon_x86::ir::{
    AluOp, Inst, IrBlock, MemRef, PackedOp, ShiftOp, Terminator, VFloatOp, Vreg,
};

use crate::a64::{Arr, Asm, Cc, VENEER_WORDS};
use crate::abi::{self, fpu_kind, helper};
use crate::regalloc::{Assignment, RegMap};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EmitError {
    #[error("cannot encode IR instruction #{index}")]
    Unencodable { index: usize },
    #[error("block frame too large: {bytes} bytes")]
    FrameTooLarge { bytes: u32 },
}

const SCR0: u8 = 16;
const SCR1: u8 = 17;
const CTX: u8 = 28;
const ZR: u8 = 31;
const VSCR0: u8 = 0;
const VSCR1: u8 = 1;

/// Offset of the XMM file within the state block.
fn xmm_offset(n: u8) -> u32 {
    (offset_of!(talon_cpu_core::state::CpuState, fpu) as u32)
        + (offset_of!(FpuBank, xmm) as u32)
        + u32::from(n & 7) * 16
}

/// Caller-saved GPRs in the allocator pool.
fn caller_saved_gpr(r: u8) -> bool {
    r <= 15 || r == 18
}

struct Frame {
    total: u32,
    /// Spill area at [sp + 0, spill_size).
    /// Argument staging for helper calls.
    stage_off: u32,
    /// Caller-saved GPR save slots.
    cs_gpr_off: u32,
    /// NEON save slots.
    cs_neon_off: u32,
    /// d8..d15 callee-save slots.
    dsave_off: u32,
    /// x19..x28 callee-save slots.
    xsave_off: u32,
    used_cs_gprs: Vec<u8>,
    used_neon: Vec<u8>,
}

impl Frame {
    fn plan(block: &IrBlock, map: &RegMap) -> Frame {
        let mut used_cs_gprs = Vec::new();
        let mut used_neon = Vec::new();
        let mut note = |a: Assignment| match a {
            Assignment::Gpr(r) if caller_saved_gpr(r) && !used_cs_gprs.contains(&r) => {
                used_cs_gprs.push(r);
            }
            Assignment::Neon(v) if !used_neon.contains(&v) => used_neon.push(v),
            _ => {}
        };
        let mut visit = |v: Vreg| {
            if let Some(a) = map.lookup(v.id) {
                note(a);
            }
        };
        for inst in &block.insts {
            inst.visit_vregs(|v, _| visit(v));
        }
        block.term.visit_vregs(|v, _| visit(v));
        used_cs_gprs.sort_unstable();
        used_neon.sort_unstable();

        let stage_off = map.spill_size;
        let cs_gpr_off = stage_off + 48; // up to six staged arguments
        let cs_neon_off = (cs_gpr_off + used_cs_gprs.len() as u32 * 8).next_multiple_of(16);
        let dsave_off = (cs_neon_off + used_neon.len() as u32 * 16).next_multiple_of(16);
        let xsave_off = dsave_off + 64;
        let total = (xsave_off + 80 + 16).next_multiple_of(16);
        Frame {
            total,
            stage_off,
            cs_gpr_off,
            cs_neon_off,
            dsave_off,
            xsave_off,
            used_cs_gprs,
            used_neon,
        }
    }

    fn fp_off(&self) -> i32 {
        (self.total - 16) as i32
    }
}

/// One lowered block: code bytes plus its control-flow exits.
pub struct EmittedBlock {
    pub code: Vec<u8>,
    pub exits: Vec<ExitInfo>,
}

struct Emitter<'a> {
    asm: Asm,
    map: &'a RegMap,
    frame: Frame,
    block: &'a IrBlock,
    exits: Vec<ExitInfo>,
    /// Shared mid-block fault exit (guest exception from a helper).
    fault_sites: Vec<usize>,
}

/// Values a helper call takes, in argument order after the implicit ctx.
enum Arg {
    Imm(u64),
    /// 64-bit read of a vreg (zero-extended for narrower types).
    Reg(Vreg),
    /// Already-materialized scratch register.
    Scratch(u8),
}

pub fn emit_block(block: &IrBlock, map: &RegMap) -> Result<EmittedBlock, EmitError> {
    let frame = Frame::plan(block, map);
    if frame.total >= 4096 {
        return Err(EmitError::FrameTooLarge { bytes: frame.total });
    }
    let mut e = Emitter {
        asm: Asm::new(),
        map,
        frame,
        block,
        exits: Vec::new(),
        fault_sites: Vec::new(),
    };
    e.prologue();
    for (index, inst) in block.insts.iter().enumerate() {
        e.lower(inst)
            .map_err(|()| EmitError::Unencodable { index })?;
    }
    e.terminator();
    e.fault_exit();
    Ok(EmittedBlock {
        code: e.asm.into_bytes(),
        exits: e.exits,
    })
}

impl<'a> Emitter<'a> {
    fn prologue(&mut self) {
        let total = self.frame.total;
        self.asm.sub_imm(true, 31, 31, total);
        let fp = self.frame.fp_off() as u32;
        self.asm.str_x(29, 31, fp);
        self.asm.str_x(30, 31, fp + 8);
        self.asm.add_imm(true, 29, 31, fp);
        let xo = self.frame.xsave_off;
        for (k, r) in (19..=28u8).enumerate() {
            self.asm.str_x(r, 31, xo + k as u32 * 8);
        }
        let dof = self.frame.dsave_off;
        for (k, v) in (8..=15u8).enumerate() {
            self.asm.str_d(v, 31, dof + k as u32 * 8);
        }
        self.asm.mov_reg(true, CTX, 0);
    }

    /// Restores the frame; emitted at the head of every exit leg. Leaves
    /// x0 = ctx for a chained tail call.
    fn teardown(&mut self) {
        self.asm.mov_reg(true, 0, CTX);
        let xo = self.frame.xsave_off;
        for (k, r) in (19..=28u8).enumerate() {
            self.asm.ldr_x(r, 31, xo + k as u32 * 8);
        }
        let dof = self.frame.dsave_off;
        for (k, v) in (8..=15u8).enumerate() {
            self.asm.ldr_d(v, 31, dof + k as u32 * 8);
        }
        let fp = self.frame.fp_off() as u32;
        self.asm.ldr_x(29, 31, fp);
        self.asm.ldr_x(30, 31, fp + 8);
        self.asm.add_imm(true, 31, 31, self.frame.total);
    }

    /// Emits one chainable exit leg returning `guest_target`; records and
    /// returns the patch site offset.
    fn exit_leg(&mut self, guest_target: u32) -> usize {
        self.teardown();
        let site = self.asm.b_placeholder();
        for _ in 0..VENEER_WORDS {
            self.asm.nop();
        }
        self.asm.mov_imm32(0, guest_target);
        self.asm.ret();
        site
    }

    /// Non-chainable exit: next guest address already in `SCR0`.
    fn exit_indirect(&mut self) {
        self.teardown();
        self.asm.mov_reg(false, 0, SCR0);
        self.asm.ret();
    }

    fn terminator(&mut self) {
        match self.block.term {
            Terminator::Jmp { target } => {
                let site = self.exit_leg(target);
                self.exits.push(ExitInfo::jmp(target, site));
            }
            Terminator::Jcc {
                cond,
                target,
                fallthrough,
            } => {
                self.call_helper(
                    helper::EVAL_COND,
                    &[Arg::Imm(u64::from(cond.encoding()))],
                );
                // Result in SCR0.
                let taken = self.asm.cbnz_fwd(false, SCR0);
                let site_false = self.exit_leg(fallthrough);
                self.asm.bind(taken);
                let site_true = self.exit_leg(target);
                self.exits
                    .push(ExitInfo::cond(target, site_true, fallthrough, site_false));
            }
            Terminator::JccVreg {
                cond,
                target,
                fallthrough,
            } => {
                let c = self.gpr_src(cond, SCR0);
                let taken = self.asm.cbnz_fwd(false, c);
                let site_false = self.exit_leg(fallthrough);
                self.asm.bind(taken);
                let site_true = self.exit_leg(target);
                self.exits
                    .push(ExitInfo::cond(target, site_true, fallthrough, site_false));
            }
            Terminator::Indirect { addr } | Terminator::Ret { addr } => {
                let r = self.gpr_src(addr, SCR0);
                if r != SCR0 {
                    self.asm.mov_reg(false, SCR0, r);
                }
                let kind = if matches!(self.block.term, Terminator::Ret { .. }) {
                    ExitKind::Ret
                } else {
                    ExitKind::Indirect
                };
                self.exit_indirect();
                self.exits.push(ExitInfo::unchained(kind));
            }
            Terminator::Interrupt { vector, next } => {
                self.call_helper(helper::INTERRUPT, &[Arg::Imm(u64::from(vector))]);
                self.teardown();
                self.asm.mov_imm32(0, next);
                self.asm.ret();
                self.exits.push(ExitInfo::unchained(ExitKind::Ret));
            }
            Terminator::Halt { next } => {
                self.teardown();
                self.asm.mov_imm32(0, next);
                self.asm.ret();
                self.exits.push(ExitInfo::unchained(ExitKind::Ret));
            }
        }
    }

    /// Shared leg for helper-raised guest faults: return to the dispatcher,
    /// which inspects `JitCtx::pending_exception`.
    fn fault_exit(&mut self) {
        if self.fault_sites.is_empty() {
            return;
        }
        let here = self.asm.offset();
        for site in std::mem::take(&mut self.fault_sites) {
            let rel = here as i64 - site as i64;
            let w = crate::a64::encode_b(rel).expect("fault leg within block");
            self.asm.patch_word(site, w);
        }
        self.teardown();
        self.asm.mov_imm32(0, self.block.start);
        self.asm.ret();
    }

    // ---- vreg access ----

    /// Reads an integer vreg into a register: its assigned GPR, or `scratch`
    /// after a spill reload.
    fn gpr_src(&mut self, v: Vreg, scratch: u8) -> u8 {
        match self.map.get(v) {
            Assignment::Gpr(r) => r,
            Assignment::Spill { offset, .. } => {
                self.asm.ldr_x(scratch, 31, offset);
                scratch
            }
            Assignment::Neon(_) => unreachable!("integer vreg in NEON register"),
        }
    }

    /// Destination register for an integer vreg; spilled defs write through
    /// `scratch` and [`Self::gpr_def_commit`].
    fn gpr_def(&mut self, v: Vreg, scratch: u8) -> u8 {
        match self.map.get(v) {
            Assignment::Gpr(r) => r,
            Assignment::Spill { .. } => scratch,
            Assignment::Neon(_) => unreachable!("integer vreg in NEON register"),
        }
    }

    fn gpr_def_commit(&mut self, v: Vreg, reg: u8) {
        if let Assignment::Spill { offset, .. } = self.map.get(v) {
            self.asm.str_x(reg, 31, offset);
        }
    }

    fn neon_src(&mut self, v: Vreg, scratch: u8) -> u8 {
        match self.map.get(v) {
            Assignment::Neon(r) => r,
            Assignment::Spill { offset, .. } => {
                self.asm.ldr_q(scratch, 31, offset);
                scratch
            }
            Assignment::Gpr(_) => unreachable!("vector vreg in GPR"),
        }
    }

    fn neon_def(&mut self, v: Vreg) -> u8 {
        match self.map.get(v) {
            Assignment::Neon(r) => r,
            Assignment::Spill { .. } => VSCR0,
            Assignment::Gpr(_) => unreachable!("vector vreg in GPR"),
        }
    }

    fn neon_def_commit(&mut self, v: Vreg, reg: u8) {
        if let Assignment::Spill { offset, .. } = self.map.get(v) {
            self.asm.str_q(reg, 31, offset);
        }
    }

    /// Loads the guest-state base pointer into `SCR1`.
    fn state_base(&mut self) {
        self.asm.ldr_x(SCR1, CTX, abi::CTX_STATE);
    }

    /// Computes a guest memory address into `SCR0`.
    fn mem_address(&mut self, m: &MemRef) {
        self.asm.mov_imm32(SCR0, m.disp as u32);
        if let Some(base) = m.base {
            let b = self.gpr_src(base, SCR1);
            self.asm.add_reg(false, SCR0, SCR0, b);
        }
        if let Some(index) = m.index {
            let i = self.gpr_src(index, SCR1);
            let shift = m.scale.trailing_zeros() as u8;
            self.asm.add_reg_lsl(false, SCR0, SCR0, i, shift);
        }
    }

    // ---- helper calls ----

    /// Calls a helper: saves live caller-saved registers, stages arguments,
    /// loads the table entry and branches. The return value (if any) is
    /// left in `SCR0` (x0's value moved there before restores).
    fn call_helper(&mut self, index: usize, args: &[Arg]) {
        let frame = &self.frame;
        let cs_gprs = frame.used_cs_gprs.clone();
        let cs_neon = frame.used_neon.clone();
        let cs_gpr_off = frame.cs_gpr_off;
        let cs_neon_off = frame.cs_neon_off;
        let stage = frame.stage_off;

        for (k, r) in cs_gprs.iter().enumerate() {
            self.asm.str_x(*r, 31, cs_gpr_off + k as u32 * 8);
        }
        for (k, v) in cs_neon.iter().enumerate() {
            self.asm.str_q(*v, 31, cs_neon_off + k as u32 * 16);
        }

        // Stage arguments (sources still intact), then load into x1..
        for (k, arg) in args.iter().enumerate() {
            match arg {
                Arg::Imm(v) => {
                    self.asm.mov_imm64(SCR0, *v);
                    self.asm.str_x(SCR0, 31, stage + k as u32 * 8);
                }
                Arg::Reg(v) => {
                    let r = match self.map.get(*v) {
                        Assignment::Gpr(r) => r,
                        Assignment::Spill { offset, .. } => {
                            self.asm.ldr_x(SCR0, 31, offset);
                            SCR0
                        }
                        Assignment::Neon(n) => {
                            self.asm.fmov_x_d(SCR0, n);
                            SCR0
                        }
                    };
                    self.asm.str_x(r, 31, stage + k as u32 * 8);
                }
                Arg::Scratch(r) => {
                    self.asm.str_x(*r, 31, stage + k as u32 * 8);
                }
            }
        }
        for k in 0..args.len() {
            self.asm.ldr_x(1 + k as u8, 31, stage + k as u32 * 8);
        }
        self.asm.mov_reg(true, 0, CTX);
        self.asm
            .ldr_x(SCR1, CTX, abi::CTX_HELPERS + index as u32 * 8);
        self.asm.blr(SCR1);
        self.asm.mov_reg(true, SCR0, 0);

        for (k, r) in cs_gprs.iter().enumerate() {
            self.asm.ldr_x(*r, 31, cs_gpr_off + k as u32 * 8);
        }
        for (k, v) in cs_neon.iter().enumerate() {
            self.asm.ldr_q(*v, 31, cs_neon_off + k as u32 * 16);
        }
    }

    /// After a faulting helper (DIVREM), branch to the shared fault leg when
    /// a guest exception is pending. The result of the helper is preserved
    /// in SCR0 by using SCR1 for the check.
    fn check_pending_fault(&mut self) {
        self.asm.ldr_w(SCR1, CTX, abi::CTX_PENDING_EXC);
        let skip = self.asm.cbz_fwd(false, SCR1);
        let b_site = self.asm.b_placeholder();
        self.fault_sites.push(b_site);
        self.asm.bind(skip);
    }

    fn flags_meta(op: FlagOp, width: Width) -> u32 {
        abi::pack_flags_meta(op as u32, width.bits(), 0)
    }

    fn width_of(ty: DataType) -> Width {
        ty.integer_width().unwrap_or(Width::W32)
    }

    fn arr_of(ty: DataType) -> Arr {
        match ty {
            DataType::V64B8 => Arr::B8,
            DataType::V64H4 => Arr::H4,
            DataType::V64S2 => Arr::S2,
            DataType::V64D1 => Arr::D1,
            DataType::V128B16 => Arr::B16,
            DataType::V128H8 => Arr::H8,
            DataType::V128S4 => Arr::S4,
            _ => Arr::D2,
        }
    }

    /// Narrows a register view so shifts and sign-dependent ops see the
    /// architectural width.
    fn normalize_width(&mut self, reg: u8, width: Width, signed: bool) {
        match (width, signed) {
            (Width::W8, false) => self.asm.uxtb(reg, reg),
            (Width::W8, true) => self.asm.sxtb(reg, reg),
            (Width::W16, false) => self.asm.uxth(reg, reg),
            (Width::W16, true) => self.asm.sxth(reg, reg),
            _ => {}
        }
    }

    // ---- instruction lowering ----

    #[allow(clippy::too_many_lines)]
    fn lower(&mut self, inst: &Inst) -> Result<(), ()> {
        match inst {
            Inst::Const { dst, value } => {
                if dst.ty.needs_neon() {
                    self.asm.mov_imm64(SCR0, *value as u64);
                    let d = self.neon_def(*dst);
                    self.asm.fmov_d_x(d, SCR0);
                    self.neon_def_commit(*dst, d);
                } else {
                    // Integer vregs are at most 32 bits wide; keep the upper
                    // half of the host register clean.
                    let d = self.gpr_def(*dst, SCR0);
                    self.asm.mov_imm32(d, *value as u32);
                    self.gpr_def_commit(*dst, d);
                }
            }

            Inst::ReadReg {
                dst,
                reg,
                width,
                high8,
            } => {
                self.state_base();
                let off = abi::gpr_offset(reg.index()) + u32::from(*high8);
                let d = self.gpr_def(*dst, SCR0);
                match width {
                    Width::W8 => self.asm.ldrb(d, SCR1, off),
                    Width::W16 => self.asm.ldrh(d, SCR1, off),
                    _ => self.asm.ldr_w(d, SCR1, off),
                }
                self.gpr_def_commit(*dst, d);
            }
            Inst::WriteReg {
                reg,
                width,
                high8,
                src,
            } => {
                let s = self.gpr_src(*src, SCR0);
                self.state_base();
                let off = abi::gpr_offset(reg.index()) + u32::from(*high8);
                match width {
                    Width::W8 => self.asm.strb(s, SCR1, off),
                    Width::W16 => self.asm.strh(s, SCR1, off),
                    _ => self.asm.str_w(s, SCR1, off),
                }
            }

            Inst::Load { dst, mem } => {
                self.mem_address(mem);
                let (idx, is64, is128) = match mem.ty.size_bytes() {
                    1 => (helper::READ_U8, false, false),
                    2 => (helper::READ_U16, false, false),
                    4 => (helper::READ_U32, false, false),
                    8 => (helper::READ_U64, true, false),
                    _ => (helper::READ_U128, false, true),
                };
                self.call_helper(idx, &[Arg::Scratch(SCR0)]);
                if is128 {
                    let d = self.neon_def(*dst);
                    self.asm.ldr_q(d, CTX, abi::CTX_SCRATCH16);
                    self.neon_def_commit(*dst, d);
                } else if dst.ty.needs_neon() {
                    let d = self.neon_def(*dst);
                    if is64 || dst.ty.size_bytes() == 8 {
                        self.asm.fmov_d_x(d, SCR0);
                    } else {
                        self.asm.fmov_s_w(d, SCR0);
                    }
                    self.neon_def_commit(*dst, d);
                } else {
                    let d = self.gpr_def(*dst, SCR0);
                    if d != SCR0 {
                        self.asm.mov_reg(true, d, SCR0);
                    }
                    self.gpr_def_commit(*dst, d);
                }
            }
            Inst::Store { mem, src } => {
                self.mem_address(mem);
                match mem.ty.size_bytes() {
                    16 => {
                        let s = self.neon_src(*src, VSCR0);
                        self.asm.str_q(s, CTX, abi::CTX_SCRATCH16);
                        self.call_helper(helper::WRITE_U128, &[Arg::Scratch(SCR0)]);
                    }
                    8 => {
                        let idx = helper::WRITE_U64;
                        if src.ty.needs_neon() {
                            let s = self.neon_src(*src, VSCR0);
                            self.asm.fmov_x_d(SCR1, s);
                            self.call_helper(idx, &[Arg::Scratch(SCR0), Arg::Scratch(SCR1)]);
                        } else {
                            self.call_helper(idx, &[Arg::Scratch(SCR0), Arg::Reg(*src)]);
                        }
                    }
                    n => {
                        let idx = match n {
                            1 => helper::WRITE_U8,
                            2 => helper::WRITE_U16,
                            _ => helper::WRITE_U32,
                        };
                        if src.ty.needs_neon() {
                            let s = self.neon_src(*src, VSCR0);
                            self.asm.fmov_w_s(SCR1, s);
                            self.call_helper(idx, &[Arg::Scratch(SCR0), Arg::Scratch(SCR1)]);
                        } else {
                            self.call_helper(idx, &[Arg::Scratch(SCR0), Arg::Reg(*src)]);
                        }
                    }
                }
            }
            Inst::Lea { dst, mem } => {
                self.mem_address(mem);
                let d = self.gpr_def(*dst, SCR0);
                if d != SCR0 {
                    self.asm.mov_reg(false, d, SCR0);
                }
                self.gpr_def_commit(*dst, d);
            }

            Inst::Alu {
                op,
                dst,
                lhs,
                rhs,
                flags,
            } => {
                let width = Self::width_of(dst.ty);
                let carry = matches!(op, AluOp::Adc | AluOp::Sbb);
                if carry {
                    // Fetch CF ahead of the arithmetic.
                    self.call_helper(helper::FLAGS_GET, &[]);
                    self.asm.ubfx(SCR0, SCR0, 0, 1);
                    self.asm.str_x(SCR0, 31, self.frame.stage_off + 40);
                }
                let a = self.gpr_src(*lhs, SCR0);
                let b = self.gpr_src(*rhs, SCR1);
                let d = self.gpr_def(*dst, SCR0);
                match op {
                    AluOp::Add => self.asm.add_reg(false, d, a, b),
                    AluOp::Sub => self.asm.sub_reg(false, d, a, b),
                    AluOp::And => self.asm.and_reg(false, d, a, b),
                    AluOp::Or => self.asm.orr_reg(false, d, a, b),
                    AluOp::Xor => self.asm.eor_reg(false, d, a, b),
                    AluOp::Adc => {
                        self.asm.add_reg(false, d, a, b);
                        self.asm.ldr_x(SCR1, 31, self.frame.stage_off + 40);
                        self.asm.add_reg(false, d, d, SCR1);
                    }
                    AluOp::Sbb => {
                        self.asm.sub_reg(false, d, a, b);
                        self.asm.ldr_x(SCR1, 31, self.frame.stage_off + 40);
                        self.asm.sub_reg(false, d, d, SCR1);
                    }
                }
                self.gpr_def_commit(*dst, d);
                if !flags.is_empty() {
                    let flag_op = match op {
                        AluOp::Add if !flags.contains(FlagSet::CF) => FlagOp::Inc,
                        AluOp::Sub if !flags.contains(FlagSet::CF) => FlagOp::Dec,
                        AluOp::Add => FlagOp::Add,
                        AluOp::Adc => FlagOp::Adc,
                        AluOp::Sub => FlagOp::Sub,
                        AluOp::Sbb => FlagOp::Sbb,
                        _ => FlagOp::Logic,
                    };
                    let meta = Self::flags_meta(flag_op, width);
                    if carry {
                        self.asm.ldr_x(SCR1, 31, self.frame.stage_off + 40);
                        self.call_helper(
                            helper::FLAGS_STORE,
                            &[
                                Arg::Imm(u64::from(meta)),
                                Arg::Reg(*dst),
                                Arg::Reg(*lhs),
                                Arg::Reg(*rhs),
                                Arg::Scratch(SCR1),
                            ],
                        );
                    } else {
                        self.call_helper(
                            helper::FLAGS_STORE,
                            &[
                                Arg::Imm(u64::from(meta)),
                                Arg::Reg(*dst),
                                Arg::Reg(*lhs),
                                Arg::Reg(*rhs),
                                Arg::Imm(0),
                            ],
                        );
                    }
                }
            }

            Inst::Shift {
                op,
                dst,
                src,
                count,
                flags,
            } => {
                let width = Self::width_of(dst.ty);
                match op {
                    ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => {
                        let meta = u64::from(abi::rotate_code(*op)) | (u64::from(width.bits()) << 8);
                        self.call_helper(
                            helper::ROTATE,
                            &[Arg::Imm(meta), Arg::Reg(*src), Arg::Reg(*count)],
                        );
                        let d = self.gpr_def(*dst, SCR0);
                        if d != SCR0 {
                            self.asm.mov_reg(true, d, SCR0);
                        }
                        self.gpr_def_commit(*dst, d);
                        let _ = flags;
                    }
                    _ => {
                        let c = self.gpr_src(*count, SCR1);
                        self.asm.ubfx(SCR1, c, 0, 5);
                        let s = self.gpr_src(*src, SCR0);
                        if s != SCR0 {
                            self.asm.mov_reg(false, SCR0, s);
                        }
                        self.normalize_width(SCR0, width, *op == ShiftOp::Sar);
                        let d = self.gpr_def(*dst, SCR0);
                        // Result = src when the masked count is zero; the
                        // flag record is skipped in that case too.
                        self.asm.mov_reg(false, d, SCR0);
                        let skip = self.asm.cbz_fwd(false, SCR1);
                        match op {
                            ShiftOp::Shl => self.asm.lslv(false, d, SCR0, SCR1),
                            ShiftOp::Shr => self.asm.lsrv(false, d, SCR0, SCR1),
                            _ => self.asm.asrv(false, d, SCR0, SCR1),
                        }
                        self.gpr_def_commit(*dst, d);
                        if !flags.is_empty() {
                            let flag_op = match op {
                                ShiftOp::Shl => FlagOp::Shl,
                                ShiftOp::Shr => FlagOp::Shr,
                                _ => FlagOp::Sar,
                            };
                            let meta = Self::flags_meta(flag_op, width);
                            self.call_helper(
                                helper::FLAGS_STORE,
                                &[
                                    Arg::Imm(u64::from(meta)),
                                    Arg::Reg(*dst),
                                    Arg::Reg(*src),
                                    Arg::Scratch(SCR1),
                                    Arg::Imm(0),
                                ],
                            );
                        }
                        self.asm.bind(skip);
                        // Re-commit on the skip path (result = src).
                        self.gpr_def_commit(*dst, d);
                    }
                }
            }

            Inst::Not { dst, src } => {
                let s = self.gpr_src(*src, SCR0);
                let d = self.gpr_def(*dst, SCR0);
                self.asm.orn_reg(false, d, ZR, s);
                self.gpr_def_commit(*dst, d);
            }
            Inst::Neg { dst, src, flags } => {
                let s = self.gpr_src(*src, SCR0);
                let d = self.gpr_def(*dst, SCR1);
                self.asm.sub_reg(false, d, ZR, s);
                self.gpr_def_commit(*dst, d);
                if !flags.is_empty() {
                    let meta = Self::flags_meta(FlagOp::Sub, Self::width_of(dst.ty));
                    self.call_helper(
                        helper::FLAGS_STORE,
                        &[
                            Arg::Imm(u64::from(meta)),
                            Arg::Reg(*dst),
                            Arg::Imm(0),
                            Arg::Reg(*src),
                            Arg::Imm(0),
                        ],
                    );
                }
            }

            Inst::MulWide {
                signed,
                dst_hi,
                dst_lo,
                lhs,
                rhs,
            } => {
                let width = Self::width_of(dst_lo.ty);
                let a = self.gpr_src(*lhs, SCR0);
                if a != SCR0 {
                    self.asm.mov_reg(false, SCR0, a);
                }
                self.normalize_width(SCR0, width, *signed);
                let b = self.gpr_src(*rhs, SCR1);
                if b != SCR1 {
                    self.asm.mov_reg(false, SCR1, b);
                }
                self.normalize_width(SCR1, width, *signed);
                if *signed {
                    self.asm.smull(SCR0, SCR0, SCR1);
                } else {
                    self.asm.umull(SCR0, SCR0, SCR1);
                }
                let lo = self.gpr_def(*dst_lo, SCR1);
                self.asm.mov_reg(false, lo, SCR0);
                self.gpr_def_commit(*dst_lo, lo);
                self.asm.lsr_imm(true, SCR0, SCR0, width.bits() as u8);
                let hi = self.gpr_def(*dst_hi, SCR0);
                if hi != SCR0 {
                    self.asm.mov_reg(false, hi, SCR0);
                }
                self.gpr_def_commit(*dst_hi, hi);
                // CF/OF = upper half significant.
                self.emit_mul_flags(*dst_hi, *dst_lo, width, *signed);
            }
            Inst::Imul { dst, lhs, rhs } => {
                let width = Self::width_of(dst.ty);
                let a = self.gpr_src(*lhs, SCR0);
                if a != SCR0 {
                    self.asm.mov_reg(false, SCR0, a);
                }
                self.normalize_width(SCR0, width, true);
                let b = self.gpr_src(*rhs, SCR1);
                if b != SCR1 {
                    self.asm.mov_reg(false, SCR1, b);
                }
                self.normalize_width(SCR1, width, true);
                self.asm.smull(SCR0, SCR0, SCR1);
                let d = self.gpr_def(*dst, SCR1);
                self.asm.mov_reg(false, d, SCR0);
                self.gpr_def_commit(*dst, d);
                // Overflow when the full product differs from the sign
                // extension of the width-truncated result.
                self.asm.mov_reg(false, SCR1, d);
                self.normalize_width(SCR1, width, true);
                self.asm.sxtw(SCR1, SCR1);
                self.asm.subs_reg(true, SCR1, SCR1, SCR0);
                self.asm.cset(SCR1, Cc::Ne);
                self.emit_cf_of_from_bool(SCR1);
            }
            Inst::DivRem {
                signed,
                dst_quot,
                dst_rem,
                hi,
                lo,
                divisor,
            } => {
                let width = Self::width_of(dst_quot.ty);
                let meta = u64::from(width.bits()) | (u64::from(*signed) << 8);
                self.call_helper(
                    helper::DIVREM,
                    &[
                        Arg::Imm(meta),
                        Arg::Reg(*hi),
                        Arg::Reg(*lo),
                        Arg::Reg(*divisor),
                    ],
                );
                self.check_pending_fault();
                let q = self.gpr_def(*dst_quot, SCR1);
                self.asm.mov_reg(false, q, SCR0);
                self.gpr_def_commit(*dst_quot, q);
                self.asm.lsr_imm(true, SCR0, SCR0, 32);
                let r = self.gpr_def(*dst_rem, SCR0);
                if r != SCR0 {
                    self.asm.mov_reg(false, r, SCR0);
                }
                self.gpr_def_commit(*dst_rem, r);
            }

            Inst::Ext { dst, src, sign } => {
                let from = Self::width_of(src.ty);
                let s = self.gpr_src(*src, SCR0);
                let d = self.gpr_def(*dst, SCR0);
                match (from, sign) {
                    (Width::W8, true) => self.asm.sxtb(d, s),
                    (Width::W8, false) => self.asm.uxtb(d, s),
                    (Width::W16, true) => self.asm.sxth(d, s),
                    (Width::W16, false) => self.asm.uxth(d, s),
                    _ => {
                        if d != s {
                            self.asm.mov_reg(false, d, s);
                        }
                    }
                }
                self.gpr_def_commit(*dst, d);
            }

            Inst::CmpFlags { lhs, rhs } => {
                let width = Self::width_of(lhs.ty);
                let a = self.gpr_src(*lhs, SCR0);
                let b = self.gpr_src(*rhs, SCR1);
                self.asm.sub_reg(false, SCR0, a, b);
                let meta = Self::flags_meta(FlagOp::Sub, width);
                self.call_helper(
                    helper::FLAGS_STORE,
                    &[
                        Arg::Imm(u64::from(meta)),
                        Arg::Scratch(SCR0),
                        Arg::Reg(*lhs),
                        Arg::Reg(*rhs),
                        Arg::Imm(0),
                    ],
                );
            }
            Inst::TestFlags { lhs, rhs } => {
                let width = Self::width_of(lhs.ty);
                let a = self.gpr_src(*lhs, SCR0);
                let b = self.gpr_src(*rhs, SCR1);
                self.asm.and_reg(false, SCR0, a, b);
                let meta = Self::flags_meta(FlagOp::Logic, width);
                self.call_helper(
                    helper::FLAGS_STORE,
                    &[
                        Arg::Imm(u64::from(meta)),
                        Arg::Scratch(SCR0),
                        Arg::Reg(*lhs),
                        Arg::Reg(*rhs),
                        Arg::Imm(0),
                    ],
                );
            }

            Inst::EvalCond { dst, cond } => {
                self.call_helper(
                    helper::EVAL_COND,
                    &[Arg::Imm(u64::from(cond.encoding()))],
                );
                let d = self.gpr_def(*dst, SCR0);
                if d != SCR0 {
                    self.asm.mov_reg(false, d, SCR0);
                }
                self.gpr_def_commit(*dst, d);
            }
            Inst::SetNz { dst, src } => {
                let s = self.gpr_src(*src, SCR0);
                self.asm.cmp_imm(false, s, 0);
                let d = self.gpr_def(*dst, SCR0);
                self.asm.cset(d, Cc::Ne);
                self.gpr_def_commit(*dst, d);
            }
            Inst::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                let c = self.gpr_src(*cond, SCR0);
                self.asm.cmp_imm(false, c, 0);
                let t = self.gpr_src(*if_true, SCR0);
                let f = self.gpr_src(*if_false, SCR1);
                let d = self.gpr_def(*dst, SCR0);
                self.asm.csel(false, d, t, f, Cc::Ne);
                self.gpr_def_commit(*dst, d);
            }

            Inst::ReadFlags { dst } => {
                self.call_helper(helper::FLAGS_GET, &[]);
                let d = self.gpr_def(*dst, SCR0);
                if d != SCR0 {
                    self.asm.mov_reg(false, d, SCR0);
                }
                self.gpr_def_commit(*dst, d);
            }
            Inst::WriteFlags { src } => {
                self.call_helper(helper::FLAGS_SET, &[Arg::Reg(*src)]);
            }

            // x87: one helper call per instruction.
            Inst::FpuLoadMem { mem } => self.fpu_mem(fpu_kind::LOAD_MEM, mem, 0, 0),
            Inst::FpuStoreMem { mem, pop } => {
                self.fpu_mem(fpu_kind::STORE_MEM, mem, 0, u32::from(*pop));
            }
            Inst::FpuIntLoad { mem } => self.fpu_mem(fpu_kind::INT_LOAD, mem, 0, 0),
            Inst::FpuIntStore { mem, pop } => {
                self.fpu_mem(fpu_kind::INT_STORE, mem, 0, u32::from(*pop));
            }
            Inst::FpuSetCw { mem } => self.fpu_mem(fpu_kind::SET_CW, mem, 0, 0),
            Inst::FpuGetCw { mem } => self.fpu_mem(fpu_kind::GET_CW, mem, 0, 0),
            Inst::FpuGetSw { mem } => match mem {
                Some(m) => self.fpu_mem(fpu_kind::GET_SW, m, 0, 0),
                None => self.fpu_plain(fpu_kind::GET_SW, 0, 1),
            },
            Inst::FpuLoadSt { i } => self.fpu_plain(fpu_kind::LOAD_ST, u32::from(*i), 0),
            Inst::FpuStoreSt { i, pop } => {
                self.fpu_plain(fpu_kind::STORE_ST, u32::from(*i), u32::from(*pop));
            }
            Inst::FpuExchange { i } => self.fpu_plain(fpu_kind::EXCHANGE, u32::from(*i), 0),
            Inst::FpuArith {
                op,
                st,
                st0_dst,
                pop,
                mem,
            } => {
                let b = u32::from(*st)
                    | (u32::from(*st0_dst) << 4)
                    | (u32::from(*pop) << 5)
                    | (u32::from(mem.is_some()) << 6);
                let a = abi::fpu_arith_code(*op);
                match mem {
                    Some(m) => self.fpu_mem(fpu_kind::ARITH, m, a, b),
                    None => self.fpu_plain_ab(fpu_kind::ARITH, a, b, 0),
                }
            }
            Inst::FpuCom { mem, st, pops } => {
                let b = u32::from(*pops) | (u32::from(mem.is_some()) << 4);
                match mem {
                    Some(m) => self.fpu_mem(fpu_kind::COM, m, u32::from(*st), b),
                    None => self.fpu_plain_ab(fpu_kind::COM, u32::from(*st), b, 0),
                }
            }
            Inst::FpuTst => self.fpu_plain(fpu_kind::TST, 0, 0),
            Inst::FpuXam => self.fpu_plain(fpu_kind::XAM, 0, 0),
            Inst::FpuChs => self.fpu_plain(fpu_kind::CHS, 0, 0),
            Inst::FpuAbs => self.fpu_plain(fpu_kind::ABS, 0, 0),
            Inst::FpuTrans { op } => self.fpu_plain(fpu_kind::TRANS, abi::trans_code(*op), 0),
            Inst::FpuConstLoad { k } => self.fpu_plain(fpu_kind::CONST_LOAD, abi::const_code(*k), 0),
            Inst::FpuClearEx => self.fpu_plain(fpu_kind::CLEAR_EX, 0, 0),
            Inst::FpuInit => self.fpu_plain(fpu_kind::INIT, 0, 0),
            Inst::FpuFree { i } => self.fpu_plain(fpu_kind::FREE, u32::from(*i), 0),
            Inst::FpuIncStp => self.fpu_plain(fpu_kind::INC_STP, 0, 0),
            Inst::FpuDecStp => self.fpu_plain(fpu_kind::DEC_STP, 0, 0),
            Inst::Emms => self.fpu_plain(fpu_kind::EMMS, 0, 0),

            Inst::MmxRead { dst, mm } => {
                self.call_helper(helper::MMX_READ, &[Arg::Imm(u64::from(*mm))]);
                if dst.ty.needs_neon() {
                    let d = self.neon_def(*dst);
                    self.asm.fmov_d_x(d, SCR0);
                    self.neon_def_commit(*dst, d);
                } else {
                    let d = self.gpr_def(*dst, SCR0);
                    if d != SCR0 {
                        self.asm.mov_reg(false, d, SCR0);
                    }
                    self.gpr_def_commit(*dst, d);
                }
            }
            Inst::MmxWrite { mm, src } => {
                self.call_helper(
                    helper::MMX_WRITE,
                    &[Arg::Imm(u64::from(*mm)), Arg::Reg(*src)],
                );
            }
            Inst::XmmRead { dst, xmm } => {
                self.state_base();
                let off = xmm_offset(*xmm);
                match dst.ty {
                    DataType::F32 => {
                        let d = self.neon_def(*dst);
                        self.asm.ldr_s(d, SCR1, off);
                        self.neon_def_commit(*dst, d);
                    }
                    DataType::I32 => {
                        let d = self.gpr_def(*dst, SCR0);
                        self.asm.ldr_w(d, SCR1, off);
                        self.gpr_def_commit(*dst, d);
                    }
                    _ => {
                        let d = self.neon_def(*dst);
                        self.asm.ldr_q(d, SCR1, off);
                        self.neon_def_commit(*dst, d);
                    }
                }
            }
            Inst::XmmWrite { xmm, src } => {
                self.state_base();
                let off = xmm_offset(*xmm);
                match src.ty {
                    DataType::F32 => {
                        // MOVSS-from-memory semantics: zero the upper lanes.
                        let s = self.neon_src(*src, VSCR0);
                        self.asm.fmov_w_s(SCR0, s);
                        self.asm.str_w(SCR0, SCR1, off);
                        self.asm.str_w(ZR, SCR1, off + 4);
                        self.asm.str_x(ZR, SCR1, off + 8);
                    }
                    DataType::I32 => {
                        let s = self.gpr_src(*src, SCR0);
                        self.asm.str_w(s, SCR1, off);
                        self.asm.str_w(ZR, SCR1, off + 4);
                        self.asm.str_x(ZR, SCR1, off + 8);
                    }
                    _ => {
                        let s = self.neon_src(*src, VSCR0);
                        self.asm.str_q(s, SCR1, off);
                    }
                }
            }

            Inst::Packed { op, dst, lhs, rhs } => {
                let arr = Self::arr_of(dst.ty);
                let q = dst.ty.size_bytes() == 16;
                match op {
                    PackedOp::Add
                    | PackedOp::Sub
                    | PackedOp::AddSat
                    | PackedOp::AddSatU
                    | PackedOp::SubSat
                    | PackedOp::SubSatU
                    | PackedOp::MulLo
                    | PackedOp::CmpEq
                    | PackedOp::CmpGt
                    | PackedOp::UnpackLo
                    | PackedOp::UnpackHi => {
                        let a = self.neon_src(*lhs, VSCR0);
                        let b = self.neon_src(*rhs, VSCR1);
                        let d = self.neon_def(*dst);
                        match op {
                            PackedOp::Add => self.asm.v_add(arr, d, a, b),
                            PackedOp::Sub => self.asm.v_sub(arr, d, a, b),
                            PackedOp::AddSat => self.asm.v_sqadd(arr, d, a, b),
                            PackedOp::AddSatU => self.asm.v_uqadd(arr, d, a, b),
                            PackedOp::SubSat => self.asm.v_sqsub(arr, d, a, b),
                            PackedOp::SubSatU => self.asm.v_uqsub(arr, d, a, b),
                            PackedOp::MulLo => self.asm.v_mul(arr, d, a, b),
                            PackedOp::CmpEq => self.asm.v_cmeq(arr, d, a, b),
                            PackedOp::CmpGt => self.asm.v_cmgt(arr, d, a, b),
                            PackedOp::UnpackLo => self.asm.v_zip1(arr, d, a, b),
                            _ => self.asm.v_zip2(arr, d, a, b),
                        }
                        self.neon_def_commit(*dst, d);
                    }
                    PackedOp::And | PackedOp::AndNot | PackedOp::Or | PackedOp::Xor => {
                        let a = self.neon_src(*lhs, VSCR0);
                        let b = self.neon_src(*rhs, VSCR1);
                        let d = self.neon_def(*dst);
                        match op {
                            PackedOp::And => self.asm.v_and(q, d, a, b),
                            PackedOp::Or => self.asm.v_orr(q, d, a, b),
                            PackedOp::Xor => self.asm.v_eor(q, d, a, b),
                            // PANDN: !lhs & rhs.
                            _ => self.asm.v_bic(q, d, b, a),
                        }
                        self.neon_def_commit(*dst, d);
                    }
                    PackedOp::MulHi
                    | PackedOp::Sll
                    | PackedOp::Srl
                    | PackedOp::Sra
                    | PackedOp::PackSs
                    | PackedOp::PackUs => {
                        self.packed_fallback(abi::packed_code(*op), *dst, *lhs, *rhs);
                    }
                }
            }

            Inst::VFloat { op, dst, lhs, rhs } => {
                let a = self.neon_src(*lhs, VSCR0);
                let b = self.neon_src(*rhs, VSCR1);
                let d = self.neon_def(*dst);
                if dst.ty == DataType::F32 {
                    match op {
                        VFloatOp::Add => self.asm.fadd_s(d, a, b),
                        VFloatOp::Sub => self.asm.fsub_s(d, a, b),
                        VFloatOp::Mul => self.asm.fmul_s(d, a, b),
                        VFloatOp::Div => self.asm.fdiv_s(d, a, b),
                        VFloatOp::Min => self.asm.fmin_s(d, a, b),
                        VFloatOp::Max => self.asm.fmax_s(d, a, b),
                    }
                } else {
                    match op {
                        VFloatOp::Add => self.asm.v_fadd4s(d, a, b),
                        VFloatOp::Sub => self.asm.v_fsub4s(d, a, b),
                        VFloatOp::Mul => self.asm.v_fmul4s(d, a, b),
                        VFloatOp::Div => self.asm.v_fdiv4s(d, a, b),
                        VFloatOp::Min => self.asm.v_fmin4s(d, a, b),
                        VFloatOp::Max => self.asm.v_fmax4s(d, a, b),
                    }
                }
                self.neon_def_commit(*dst, d);
            }
            Inst::VFloatSqrt { dst, src } => {
                let s = self.neon_src(*src, VSCR0);
                let d = self.neon_def(*dst);
                if dst.ty == DataType::F32 {
                    self.asm.fsqrt_s(d, s);
                } else {
                    self.asm.v_fsqrt4s(d, s);
                }
                self.neon_def_commit(*dst, d);
            }
            Inst::VFloatCmp {
                dst,
                lhs,
                rhs,
                pred,
            } => {
                self.packed_fallback(
                    abi::packed_fallback_op::FCMP | (u32::from(*pred) << 8),
                    *dst,
                    *lhs,
                    *rhs,
                );
            }
            Inst::SseComi { lhs, rhs, quiet } => {
                let a = self.neon_src(*lhs, VSCR0);
                self.asm.fmov_w_s(SCR0, a);
                let b = self.neon_src(*rhs, VSCR1);
                self.asm.fmov_w_s(SCR1, b);
                self.call_helper(
                    helper::SSE_COMI,
                    &[
                        Arg::Scratch(SCR0),
                        Arg::Scratch(SCR1),
                        Arg::Imm(u64::from(*quiet)),
                    ],
                );
            }
            Inst::InsertF32 { dst, base, src } => {
                let b = self.neon_src(*base, VSCR0);
                let s = self.neon_src(*src, VSCR1);
                let d = self.neon_def(*dst);
                if d != b {
                    self.asm.v_mov(true, d, b);
                }
                self.asm.ins_s0(d, s);
                self.neon_def_commit(*dst, d);
            }
            Inst::Shuffle { dst, lhs, rhs, imm } => {
                self.packed_fallback(
                    abi::packed_fallback_op::SHUFFLE | (u32::from(*imm) << 8),
                    *dst,
                    *lhs,
                    *rhs,
                );
            }
            Inst::CvtIntToF32 { dst, src } => {
                let s = self.gpr_src(*src, SCR0);
                let d = self.neon_def(*dst);
                self.asm.scvtf_s_w(d, s);
                self.neon_def_commit(*dst, d);
            }
            Inst::CvtF32ToInt { dst, src, trunc } => {
                let s = self.neon_src(*src, VSCR0);
                self.asm.fmov_w_s(SCR0, s);
                self.call_helper(
                    helper::CVT_F32_TO_I32,
                    &[Arg::Scratch(SCR0), Arg::Imm(u64::from(*trunc))],
                );
                let d = self.gpr_def(*dst, SCR0);
                if d != SCR0 {
                    self.asm.mov_reg(false, d, SCR0);
                }
                self.gpr_def_commit(*dst, d);
            }
            Inst::SetMxcsr { src } => {
                self.call_helper(helper::MXCSR, &[Arg::Imm(1), Arg::Reg(*src)]);
            }
            Inst::GetMxcsr { dst } => {
                self.call_helper(helper::MXCSR, &[Arg::Imm(0), Arg::Imm(0)]);
                let d = self.gpr_def(*dst, SCR0);
                if d != SCR0 {
                    self.asm.mov_reg(false, d, SCR0);
                }
                self.gpr_def_commit(*dst, d);
            }

            Inst::Barrier { kind } => match kind {
                BarrierKind::DataMemory => self.asm.dmb_ish(),
                BarrierKind::DataSync => self.asm.dsb_ish(),
                BarrierKind::InstructionSync => self.asm.isb(),
            },
        }
        Ok(())
    }

    fn fpu_mem(&mut self, kind: u32, mem: &MemRef, a: u32, b: u32) {
        self.mem_address(mem);
        let meta = abi::pack_fpu_meta(kind, a, b, abi::mem_ty_code(mem.ty));
        self.call_helper(
            helper::FPU_EXEC,
            &[Arg::Imm(u64::from(meta)), Arg::Scratch(SCR0)],
        );
    }

    fn fpu_plain(&mut self, kind: u32, a: u32, b: u32) {
        self.fpu_plain_ab(kind, a, b, 0);
    }

    fn fpu_plain_ab(&mut self, kind: u32, a: u32, b: u32, ty: u32) {
        let meta = abi::pack_fpu_meta(kind, a, b, ty);
        self.call_helper(
            helper::FPU_EXEC,
            &[Arg::Imm(u64::from(meta)), Arg::Imm(0)],
        );
    }

    /// Packed operation through the scratch buffer: both operands stored,
    /// helper computes, result reloaded.
    fn packed_fallback(&mut self, op: u32, dst: Vreg, lhs: Vreg, rhs: Vreg) {
        let a = self.neon_src(lhs, VSCR0);
        self.asm.str_q(a, CTX, abi::CTX_SCRATCH16);
        let b = self.neon_src(rhs, VSCR1);
        self.asm.str_q(b, CTX, abi::CTX_SCRATCH16 + 16);
        self.call_helper(
            helper::PACKED_FALLBACK,
            &[
                Arg::Imm(u64::from(op)),
                Arg::Imm(u64::from(abi::vec_ty_code(dst.ty))),
                Arg::Imm(u64::from(abi::vec_ty_code(lhs.ty))),
            ],
        );
        let d = self.neon_def(dst);
        if dst.ty == DataType::F32 {
            self.asm.ldr_s(d, CTX, abi::CTX_SCRATCH16);
        } else {
            self.asm.ldr_q(d, CTX, abi::CTX_SCRATCH16);
        }
        self.neon_def_commit(dst, d);
    }

    /// CF/OF from a 0/1 value in `reg`.
    fn emit_cf_of_from_bool(&mut self, reg: u8) {
        let mask = u64::from(talon_types::EFLAGS_CF | talon_types::EFLAGS_OF);
        // values = reg ? mask : 0.
        self.asm.cmp_imm(false, reg, 0);
        self.asm.mov_imm64(SCR1, mask);
        self.asm.csel(true, SCR1, SCR1, ZR, Cc::Ne);
        self.call_helper(
            helper::FLAGS_SET_BITS,
            &[Arg::Imm(mask), Arg::Scratch(SCR1)],
        );
    }

    fn emit_mul_flags(&mut self, dst_hi: Vreg, dst_lo: Vreg, width: Width, signed: bool) {
        let hi = self.gpr_src(dst_hi, SCR0);
        if signed {
            // Significant when hi != sign-fill(lo).
            let lo = self.gpr_src(dst_lo, SCR1);
            if lo != SCR1 {
                self.asm.mov_reg(false, SCR1, lo);
            }
            self.normalize_width(SCR1, width, true);
            self.asm.asr_imm(SCR1, SCR1, (width.bits() - 1) as u8);
            self.asm.subs_reg(false, SCR1, SCR1, hi);
        } else {
            self.asm.cmp_imm(false, hi, 0);
        }
        self.asm.cset(SCR1, Cc::Ne);
        self.emit_cf_of_from_bool(SCR1);
    }
}

