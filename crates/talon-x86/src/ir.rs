//! Translator IR.
//!
//! A block is an ordered list of instructions plus exactly one terminator.
//! Values flow through virtual registers that are defined once and only used
//! by later instructions of the same block (SSA-like within a block);
//! guest-architectural state travels through the state block via explicit
//! `read.*`/`write.*` instructions, never through vregs across blocks.
//!
//! x87 instructions do not produce vregs: the FPU operates on its own
//! rotating register bank and the IR only records which stack operation to
//! perform. MMX/XMM values do flow through (vector-typed) vregs.

use std::collections::HashSet;
use std::fmt::Write as _;

use talon_types::{BarrierKind, Cond, DataType, FlagSet, Gpr, Width};

/// A virtual register: an id unique within its block plus the data type it
/// carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vreg {
    pub id: u32,
    pub ty: DataType,
}

/// A guest memory reference: `base + index*scale + disp`, typed by the
/// access the surrounding instruction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: Option<Vreg>,
    pub index: Option<Vreg>,
    /// 1, 2, 4 or 8.
    pub scale: u8,
    pub disp: i32,
    pub ty: DataType,
}

impl MemRef {
    #[must_use]
    pub fn absolute(disp: i32, ty: DataType) -> Self {
        MemRef {
            base: None,
            index: None,
            scale: 1,
            disp,
            ty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
}

/// x87 dyadic arithmetic. `Subr`/`Divr` are the reversed-operand forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuArithOp {
    Add,
    Sub,
    Subr,
    Mul,
    Div,
    Divr,
}

/// x87 operations implemented by the transcendental helper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuTransOp {
    F2xm1,
    Yl2x,
    Ptan,
    Patan,
    Xtract,
    Prem1,
    Prem,
    Yl2xp1,
    Sqrt,
    Sincos,
    Rndint,
    Scale,
    Sin,
    Cos,
}

/// x87 constant-load instructions (FLD1 .. FLDZ).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuConst {
    One,
    L2t,
    L2e,
    Pi,
    Lg2,
    Ln2,
    Zero,
}

/// Packed-integer operations shared by MMX and the 0x66-prefixed XMM forms.
/// The lane shape comes from the destination vreg's data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedOp {
    Add,
    AddSat,
    AddSatU,
    Sub,
    SubSat,
    SubSatU,
    MulLo,
    MulHi,
    And,
    AndNot,
    Or,
    Xor,
    CmpEq,
    CmpGt,
    Sll,
    Srl,
    Sra,
    PackSs,
    PackUs,
    UnpackLo,
    UnpackHi,
}

/// Packed/scalar SSE float operations. The destination type selects packed
/// (`V128S4`) versus scalar (`F32`) lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VFloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// Immediate producer; the only way a literal enters the value graph.
    Const { dst: Vreg, value: i64 },

    // Guest-architectural register traffic.
    ReadReg {
        dst: Vreg,
        reg: Gpr,
        width: Width,
        high8: bool,
    },
    WriteReg {
        reg: Gpr,
        width: Width,
        high8: bool,
        src: Vreg,
    },

    // Memory.
    Load { dst: Vreg, mem: MemRef },
    Store { mem: MemRef, src: Vreg },
    /// Address computation only; no access.
    Lea { dst: Vreg, mem: MemRef },

    // Integer ALU.
    Alu {
        op: AluOp,
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
        flags: FlagSet,
    },
    Shift {
        op: ShiftOp,
        dst: Vreg,
        src: Vreg,
        count: Vreg,
        flags: FlagSet,
    },
    Not { dst: Vreg, src: Vreg },
    Neg { dst: Vreg, src: Vreg, flags: FlagSet },
    /// Widening multiply: `hi:lo = lhs * rhs`.
    MulWide {
        signed: bool,
        dst_hi: Vreg,
        dst_lo: Vreg,
        lhs: Vreg,
        rhs: Vreg,
    },
    /// Two-operand IMUL (truncating).
    Imul { dst: Vreg, lhs: Vreg, rhs: Vreg },
    /// `quot = hi:lo / divisor`, `rem = hi:lo % divisor`; raises #DE on zero
    /// divisor or quotient overflow.
    DivRem {
        signed: bool,
        dst_quot: Vreg,
        dst_rem: Vreg,
        hi: Vreg,
        lo: Vreg,
        divisor: Vreg,
    },
    /// Width conversion (MOVZX/MOVSX and internal widenings).
    Ext { dst: Vreg, src: Vreg, sign: bool },
    CmpFlags { lhs: Vreg, rhs: Vreg },
    TestFlags { lhs: Vreg, rhs: Vreg },
    /// Materializes a condition to 0/1.
    EvalCond { dst: Vreg, cond: Cond },
    /// CMOVcc: `dst = cond ? if_true : if_false`.
    Select {
        dst: Vreg,
        cond: Vreg,
        if_true: Vreg,
        if_false: Vreg,
    },
    /// `dst = (src != 0) as i8`; used for LOOP/JECXZ conditions.
    SetNz { dst: Vreg, src: Vreg },
    /// PUSHF-side: materializes the lazy record into a value.
    ReadFlags { dst: Vreg },
    /// POPF-side: writes EFLAGS directly and clears any pending record.
    WriteFlags { src: Vreg },

    // x87. Stack effects happen in the FPU bank, not in vregs.
    FpuLoadMem { mem: MemRef },
    FpuLoadSt { i: u8 },
    FpuStoreMem { mem: MemRef, pop: bool },
    FpuStoreSt { i: u8, pop: bool },
    FpuExchange { i: u8 },
    FpuArith {
        op: FpuArithOp,
        /// Register form: the ST index of the non-ST(0) operand.
        st: u8,
        /// Register form: true when ST(0) is the destination.
        st0_dst: bool,
        pop: bool,
        /// Memory form (`st` ignored): F32/F64 operand, or I16/I32 for the
        /// FIADD family.
        mem: Option<MemRef>,
    },
    /// FCOM/FCOMP/FCOMPP/FICOM family; result goes to C0/C2/C3.
    FpuCom {
        mem: Option<MemRef>,
        st: u8,
        pops: u8,
    },
    FpuTst,
    FpuXam,
    FpuChs,
    FpuAbs,
    FpuTrans { op: FpuTransOp },
    FpuConstLoad { k: FpuConst },
    /// FILD.
    FpuIntLoad { mem: MemRef },
    /// FIST/FISTP.
    FpuIntStore { mem: MemRef, pop: bool },
    FpuSetCw { mem: MemRef },
    FpuGetCw { mem: MemRef },
    /// FNSTSW m16 or (mem = None) FNSTSW AX.
    FpuGetSw { mem: Option<MemRef> },
    FpuClearEx,
    FpuInit,
    FpuFree { i: u8 },
    FpuIncStp,
    FpuDecStp,
    /// EMMS: leave MMX mode, tags all-empty.
    Emms,

    // MMX / XMM register traffic.
    MmxRead { dst: Vreg, mm: u8 },
    MmxWrite { mm: u8, src: Vreg },
    XmmRead { dst: Vreg, xmm: u8 },
    XmmWrite { xmm: u8, src: Vreg },

    // Vector ALU.
    Packed {
        op: PackedOp,
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
    },
    VFloat {
        op: VFloatOp,
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
    },
    VFloatSqrt { dst: Vreg, src: Vreg },
    /// CMPPS/CMPSS with predicate imm (0..7): lanes become all-ones masks.
    VFloatCmp {
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
        pred: u8,
    },
    /// COMISS/UCOMISS: compares scalars and materializes ZF/PF/CF.
    SseComi {
        lhs: Vreg,
        rhs: Vreg,
        quiet: bool,
    },
    /// Writes an F32 into lane 0 of `base`, other lanes unchanged (MOVSS and
    /// the scalar-arithmetic write-back path).
    InsertF32 { dst: Vreg, base: Vreg, src: Vreg },
    /// SHUFPS.
    Shuffle {
        dst: Vreg,
        lhs: Vreg,
        rhs: Vreg,
        imm: u8,
    },
    /// CVTSI2SS.
    CvtIntToF32 { dst: Vreg, src: Vreg },
    /// CVTSS2SI / CVTTSS2SI.
    CvtF32ToInt { dst: Vreg, src: Vreg, trunc: bool },
    SetMxcsr { src: Vreg },
    GetMxcsr { dst: Vreg },

    Barrier { kind: BarrierKind },
}

/// Control-flow terminator; exactly one per block, always last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    Jmp { target: u32 },
    Jcc {
        cond: Cond,
        target: u32,
        fallthrough: u32,
    },
    /// Branch on a materialized value: taken when the vreg is nonzero.
    /// Used where the condition is not a flag predicate (LOOP, JECXZ).
    JccVreg {
        cond: Vreg,
        target: u32,
        fallthrough: u32,
    },
    /// Computed jump or indirect call; the next guest address is a vreg.
    Indirect { addr: Vreg },
    /// RET: like `Indirect` but never chained and recognisable as a return.
    Ret { addr: Vreg },
    /// INT imm8 / INT3 / INTO (taken): deliver to the embedder, resume after.
    Interrupt { vector: u8, next: u32 },
    /// HLT-class stop: give control back to the dispatcher.
    Halt { next: u32 },
}

/// One decoded basic block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrBlock {
    pub start: u32,
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

/// A function is one or more blocks sharing an entry address; the decoder
/// produces one entry block per call and later calls fill in branch targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFunction {
    pub entry: u32,
    pub blocks: Vec<IrBlock>,
}

impl IrFunction {
    #[must_use]
    pub fn entry_block(&self) -> &IrBlock {
        &self.blocks[0]
    }
}

/// How an instruction touches a vreg; used by the register allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VregRole {
    Def,
    Use,
}

impl Inst {
    /// Visits every vreg this instruction defines or uses, in operand order.
    pub fn visit_vregs(&self, mut f: impl FnMut(Vreg, VregRole)) {
        use VregRole::{Def, Use};
        let mut mem = |m: &MemRef, f: &mut dyn FnMut(Vreg, VregRole)| {
            if let Some(b) = m.base {
                f(b, Use);
            }
            if let Some(i) = m.index {
                f(i, Use);
            }
        };
        match self {
            Inst::Const { dst, .. } => f(*dst, Def),
            Inst::ReadReg { dst, .. } => f(*dst, Def),
            Inst::WriteReg { src, .. } => f(*src, Use),
            Inst::Load { dst, mem: m } => {
                mem(m, &mut f);
                f(*dst, Def);
            }
            Inst::Store { mem: m, src } => {
                mem(m, &mut f);
                f(*src, Use);
            }
            Inst::Lea { dst, mem: m } => {
                mem(m, &mut f);
                f(*dst, Def);
            }
            Inst::Alu { dst, lhs, rhs, .. } => {
                f(*lhs, Use);
                f(*rhs, Use);
                f(*dst, Def);
            }
            Inst::Shift {
                dst, src, count, ..
            } => {
                f(*src, Use);
                f(*count, Use);
                f(*dst, Def);
            }
            Inst::Not { dst, src } => {
                f(*src, Use);
                f(*dst, Def);
            }
            Inst::Neg { dst, src, .. } => {
                f(*src, Use);
                f(*dst, Def);
            }
            Inst::MulWide {
                dst_hi,
                dst_lo,
                lhs,
                rhs,
                ..
            } => {
                f(*lhs, Use);
                f(*rhs, Use);
                f(*dst_hi, Def);
                f(*dst_lo, Def);
            }
            Inst::Imul { dst, lhs, rhs } => {
                f(*lhs, Use);
                f(*rhs, Use);
                f(*dst, Def);
            }
            Inst::DivRem {
                dst_quot,
                dst_rem,
                hi,
                lo,
                divisor,
                ..
            } => {
                f(*hi, Use);
                f(*lo, Use);
                f(*divisor, Use);
                f(*dst_quot, Def);
                f(*dst_rem, Def);
            }
            Inst::Ext { dst, src, .. } => {
                f(*src, Use);
                f(*dst, Def);
            }
            Inst::CmpFlags { lhs, rhs } | Inst::TestFlags { lhs, rhs } => {
                f(*lhs, Use);
                f(*rhs, Use);
            }
            Inst::EvalCond { dst, .. } => f(*dst, Def),
            Inst::SetNz { dst, src } => {
                f(*src, Use);
                f(*dst, Def);
            }
            Inst::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => {
                f(*cond, Use);
                f(*if_true, Use);
                f(*if_false, Use);
                f(*dst, Def);
            }
            Inst::ReadFlags { dst } => f(*dst, Def),
            Inst::WriteFlags { src } => f(*src, Use),
            Inst::FpuLoadMem { mem: m }
            | Inst::FpuIntLoad { mem: m }
            | Inst::FpuSetCw { mem: m }
            | Inst::FpuGetCw { mem: m } => mem(m, &mut f),
            Inst::FpuStoreMem { mem: m, .. } | Inst::FpuIntStore { mem: m, .. } => mem(m, &mut f),
            Inst::FpuArith { mem: m, .. } | Inst::FpuCom { mem: m, .. } => {
                if let Some(m) = m {
                    mem(m, &mut f);
                }
            }
            Inst::FpuGetSw { mem: m } => {
                if let Some(m) = m {
                    mem(m, &mut f);
                }
            }
            Inst::FpuLoadSt { .. }
            | Inst::FpuStoreSt { .. }
            | Inst::FpuExchange { .. }
            | Inst::FpuTst
            | Inst::FpuXam
            | Inst::FpuChs
            | Inst::FpuAbs
            | Inst::FpuTrans { .. }
            | Inst::FpuConstLoad { .. }
            | Inst::FpuClearEx
            | Inst::FpuInit
            | Inst::FpuFree { .. }
            | Inst::FpuIncStp
            | Inst::FpuDecStp
            | Inst::Emms
            | Inst::Barrier { .. } => {}
            Inst::MmxRead { dst, .. } | Inst::XmmRead { dst, .. } => f(*dst, Def),
            Inst::MmxWrite { src, .. } | Inst::XmmWrite { src, .. } => f(*src, Use),
            Inst::InsertF32 { dst, base, src } => {
                f(*base, Use);
                f(*src, Use);
                f(*dst, Def);
            }
            Inst::Packed { dst, lhs, rhs, .. }
            | Inst::VFloat { dst, lhs, rhs, .. }
            | Inst::VFloatCmp { dst, lhs, rhs, .. }
            | Inst::Shuffle { dst, lhs, rhs, .. } => {
                f(*lhs, Use);
                f(*rhs, Use);
                f(*dst, Def);
            }
            Inst::VFloatSqrt { dst, src }
            | Inst::CvtIntToF32 { dst, src }
            | Inst::CvtF32ToInt { dst, src, .. } => {
                f(*src, Use);
                f(*dst, Def);
            }
            Inst::SseComi { lhs, rhs, .. } => {
                f(*lhs, Use);
                f(*rhs, Use);
            }
            Inst::SetMxcsr { src } => f(*src, Use),
            Inst::GetMxcsr { dst } => f(*dst, Def),
        }
    }

    /// True when the instruction can raise a guest-visible exception while
    /// executing (used to suppress reorderings the emitter must not make).
    #[must_use]
    pub fn can_fault(&self) -> bool {
        matches!(
            self,
            Inst::DivRem { .. }
                | Inst::Load { .. }
                | Inst::Store { .. }
                | Inst::FpuLoadMem { .. }
                | Inst::FpuStoreMem { .. }
                | Inst::FpuIntLoad { .. }
                | Inst::FpuIntStore { .. }
        )
    }
}

impl Terminator {
    pub fn visit_vregs(&self, mut f: impl FnMut(Vreg, VregRole)) {
        match self {
            Terminator::Indirect { addr } | Terminator::Ret { addr } => f(*addr, VregRole::Use),
            Terminator::JccVreg { cond, .. } => f(*cond, VregRole::Use),
            _ => {}
        }
    }
}

impl IrBlock {
    /// Checks the per-block SSA invariant: every used vreg was defined by an
    /// earlier instruction, and no vreg is defined twice.
    #[must_use]
    pub fn ssa_ok(&self) -> bool {
        let mut defined: HashSet<u32> = HashSet::new();
        let mut ok = true;
        for inst in &self.insts {
            // Uses are visited before the instruction's defs take effect, so
            // collect defs separately per instruction.
            let mut defs = Vec::new();
            inst.visit_vregs(|v, role| match role {
                VregRole::Use => {
                    if !defined.contains(&v.id) {
                        ok = false;
                    }
                }
                VregRole::Def => defs.push(v.id),
            });
            for d in defs {
                if !defined.insert(d) {
                    ok = false;
                }
            }
        }
        self.term.visit_vregs(|v, _| {
            if !defined.contains(&v.id) {
                ok = false;
            }
        });
        ok
    }
}

/// Builder used by the decoder; hands out sequential vreg ids.
#[derive(Debug, Default)]
pub struct IrBuilder {
    insts: Vec<Inst>,
    next_vreg: u32,
}

impl IrBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vreg(&mut self, ty: DataType) -> Vreg {
        let id = self.next_vreg;
        self.next_vreg += 1;
        Vreg { id, ty }
    }

    pub fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    pub fn const_val(&mut self, value: i64, ty: DataType) -> Vreg {
        let dst = self.vreg(ty);
        self.push(Inst::Const { dst, value });
        dst
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[must_use]
    pub fn finish(self, start: u32, term: Terminator) -> IrBlock {
        IrBlock {
            start,
            insts: self.insts,
            term,
        }
    }
}

fn fmt_mem(m: &MemRef) -> String {
    let mut s = String::from("[");
    let mut first = true;
    if let Some(b) = m.base {
        let _ = write!(s, "v{}", b.id);
        first = false;
    }
    if let Some(i) = m.index {
        if !first {
            s.push('+');
        }
        let _ = write!(s, "v{}*{}", i.id, m.scale);
        first = false;
    }
    if m.disp != 0 || first {
        if !first && m.disp >= 0 {
            s.push('+');
        }
        if m.disp < 0 {
            let _ = write!(s, "-{:#x}", (m.disp as i64).unsigned_abs());
        } else {
            let _ = write!(s, "{:#x}", m.disp);
        }
    }
    s.push(']');
    s
}

fn fmt_flags(flags: FlagSet) -> String {
    if flags.is_empty() {
        return String::new();
    }
    let mut parts = Vec::new();
    for (name, bit) in [
        ("CF", FlagSet::CF),
        ("PF", FlagSet::PF),
        ("AF", FlagSet::AF),
        ("ZF", FlagSet::ZF),
        ("SF", FlagSet::SF),
        ("OF", FlagSet::OF),
    ] {
        if flags.contains(bit) {
            parts.push(name);
        }
    }
    format!(" ; flags={}", parts.join("|"))
}

fn reg_name(reg: Gpr, width: Width, high8: bool) -> String {
    let full = reg.name();
    match width {
        Width::W32 | Width::W64 => full.to_string(),
        Width::W16 => full[1..].to_string(),
        Width::W8 => {
            let base = &full[1..2];
            if high8 {
                format!("{base}h")
            } else {
                format!("{base}l")
            }
        }
    }
}

impl IrBlock {
    /// Renders the block in the textual form the tests assert against.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = format!("block {:#x}:\n", self.start);
        for inst in &self.insts {
            let _ = writeln!(out, "  {}", inst.to_text());
        }
        let _ = writeln!(out, "  term {}", self.term.to_text());
        out
    }
}

impl Inst {
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Inst::Const { dst, value } => {
                format!("v{} = const.{} {:#x}", dst.id, dst.ty.name(), value)
            }
            Inst::ReadReg {
                dst,
                reg,
                width,
                high8,
            } => format!("v{} = read.{}", dst.id, reg_name(*reg, *width, *high8)),
            Inst::WriteReg {
                reg,
                width,
                high8,
                src,
            } => format!("write.{} v{}", reg_name(*reg, *width, *high8), src.id),
            Inst::Load { dst, mem } => {
                format!("v{} = load.{} {}", dst.id, mem.ty.name(), fmt_mem(mem))
            }
            Inst::Store { mem, src } => {
                format!("store.{} {}, v{}", mem.ty.name(), fmt_mem(mem), src.id)
            }
            Inst::Lea { dst, mem } => format!("v{} = lea {}", dst.id, fmt_mem(mem)),
            Inst::Alu {
                op,
                dst,
                lhs,
                rhs,
                flags,
            } => {
                let name = match op {
                    AluOp::Add => "add",
                    AluOp::Adc => "adc",
                    AluOp::Sub => "sub",
                    AluOp::Sbb => "sbb",
                    AluOp::And => "and",
                    AluOp::Or => "or",
                    AluOp::Xor => "xor",
                };
                format!(
                    "v{} = {}.{} v{}, v{}{}",
                    dst.id,
                    name,
                    dst.ty.name(),
                    lhs.id,
                    rhs.id,
                    fmt_flags(*flags)
                )
            }
            Inst::Shift {
                op,
                dst,
                src,
                count,
                flags,
            } => {
                let name = match op {
                    ShiftOp::Shl => "shl",
                    ShiftOp::Shr => "shr",
                    ShiftOp::Sar => "sar",
                    ShiftOp::Rol => "rol",
                    ShiftOp::Ror => "ror",
                    ShiftOp::Rcl => "rcl",
                    ShiftOp::Rcr => "rcr",
                };
                format!(
                    "v{} = {}.{} v{}, v{}{}",
                    dst.id,
                    name,
                    dst.ty.name(),
                    src.id,
                    count.id,
                    fmt_flags(*flags)
                )
            }
            Inst::Not { dst, src } => format!("v{} = not.{} v{}", dst.id, dst.ty.name(), src.id),
            Inst::Neg { dst, src, flags } => format!(
                "v{} = neg.{} v{}{}",
                dst.id,
                dst.ty.name(),
                src.id,
                fmt_flags(*flags)
            ),
            Inst::MulWide {
                signed,
                dst_hi,
                dst_lo,
                lhs,
                rhs,
            } => format!(
                "v{}:v{} = {}.{} v{}, v{}",
                dst_hi.id,
                dst_lo.id,
                if *signed { "imulw" } else { "mulw" },
                dst_lo.ty.name(),
                lhs.id,
                rhs.id
            ),
            Inst::Imul { dst, lhs, rhs } => format!(
                "v{} = imul.{} v{}, v{}",
                dst.id,
                dst.ty.name(),
                lhs.id,
                rhs.id
            ),
            Inst::DivRem {
                signed,
                dst_quot,
                dst_rem,
                hi,
                lo,
                divisor,
            } => format!(
                "v{}:v{} = {}.{} v{}:v{}, v{}",
                dst_quot.id,
                dst_rem.id,
                if *signed { "idiv" } else { "div" },
                dst_quot.ty.name(),
                hi.id,
                lo.id,
                divisor.id
            ),
            Inst::Ext { dst, src, sign } => format!(
                "v{} = {}.{} v{}",
                dst.id,
                if *sign { "sext" } else { "zext" },
                dst.ty.name(),
                src.id
            ),
            Inst::CmpFlags { lhs, rhs } => format!(
                "cmpflags.{} v{}, v{}{}",
                lhs.ty.name(),
                lhs.id,
                rhs.id,
                fmt_flags(FlagSet::ALU)
            ),
            Inst::TestFlags { lhs, rhs } => format!(
                "testflags.{} v{}, v{}{}",
                lhs.ty.name(),
                lhs.id,
                rhs.id,
                fmt_flags(FlagSet::ALU)
            ),
            Inst::EvalCond { dst, cond } => format!("v{} = evalcond.{}", dst.id, cond.name()),
            Inst::SetNz { dst, src } => format!("v{} = setnz v{}", dst.id, src.id),
            Inst::Select {
                dst,
                cond,
                if_true,
                if_false,
            } => format!(
                "v{} = select v{}, v{}, v{}",
                dst.id, cond.id, if_true.id, if_false.id
            ),
            Inst::ReadFlags { dst } => format!("v{} = readflags", dst.id),
            Inst::WriteFlags { src } => format!("writeflags v{}", src.id),
            Inst::FpuLoadMem { mem } => format!("fld.{} {}", mem.ty.name(), fmt_mem(mem)),
            Inst::FpuLoadSt { i } => format!("fld st{i}"),
            Inst::FpuStoreMem { mem, pop } => format!(
                "{}.{} {}",
                if *pop { "fstp" } else { "fst" },
                mem.ty.name(),
                fmt_mem(mem)
            ),
            Inst::FpuStoreSt { i, pop } => {
                format!("{} st{}", if *pop { "fstp" } else { "fst" }, i)
            }
            Inst::FpuExchange { i } => format!("fxch st{i}"),
            Inst::FpuArith {
                op,
                st,
                st0_dst,
                pop,
                mem,
            } => {
                let name = match op {
                    FpuArithOp::Add => "fadd",
                    FpuArithOp::Sub => "fsub",
                    FpuArithOp::Subr => "fsubr",
                    FpuArithOp::Mul => "fmul",
                    FpuArithOp::Div => "fdiv",
                    FpuArithOp::Divr => "fdivr",
                };
                match mem {
                    Some(m) => format!("{}.{} {}", name, m.ty.name(), fmt_mem(m)),
                    None => {
                        let p = if *pop { "p" } else { "" };
                        if *st0_dst {
                            format!("{name}{p} st0, st{st}")
                        } else {
                            format!("{name}{p} st{st}, st0")
                        }
                    }
                }
            }
            Inst::FpuCom { mem, st, pops } => match mem {
                Some(m) => format!(
                    "fcom{}.{} {}",
                    if *pops > 0 { "p" } else { "" },
                    m.ty.name(),
                    fmt_mem(m)
                ),
                None => format!(
                    "fcom{} st{}",
                    match pops {
                        0 => "",
                        1 => "p",
                        _ => "pp",
                    },
                    st
                ),
            },
            Inst::FpuTst => "ftst".to_string(),
            Inst::FpuXam => "fxam".to_string(),
            Inst::FpuChs => "fchs".to_string(),
            Inst::FpuAbs => "fabs".to_string(),
            Inst::FpuTrans { op } => {
                let name = match op {
                    FpuTransOp::F2xm1 => "f2xm1",
                    FpuTransOp::Yl2x => "fyl2x",
                    FpuTransOp::Ptan => "fptan",
                    FpuTransOp::Patan => "fpatan",
                    FpuTransOp::Xtract => "fxtract",
                    FpuTransOp::Prem1 => "fprem1",
                    FpuTransOp::Prem => "fprem",
                    FpuTransOp::Yl2xp1 => "fyl2xp1",
                    FpuTransOp::Sqrt => "fsqrt",
                    FpuTransOp::Sincos => "fsincos",
                    FpuTransOp::Rndint => "frndint",
                    FpuTransOp::Scale => "fscale",
                    FpuTransOp::Sin => "fsin",
                    FpuTransOp::Cos => "fcos",
                };
                name.to_string()
            }
            Inst::FpuConstLoad { k } => {
                let name = match k {
                    FpuConst::One => "fld1",
                    FpuConst::L2t => "fldl2t",
                    FpuConst::L2e => "fldl2e",
                    FpuConst::Pi => "fldpi",
                    FpuConst::Lg2 => "fldlg2",
                    FpuConst::Ln2 => "fldln2",
                    FpuConst::Zero => "fldz",
                };
                name.to_string()
            }
            Inst::FpuIntLoad { mem } => format!("fild.{} {}", mem.ty.name(), fmt_mem(mem)),
            Inst::FpuIntStore { mem, pop } => format!(
                "{}.{} {}",
                if *pop { "fistp" } else { "fist" },
                mem.ty.name(),
                fmt_mem(mem)
            ),
            Inst::FpuSetCw { mem } => format!("fldcw {}", fmt_mem(mem)),
            Inst::FpuGetCw { mem } => format!("fnstcw {}", fmt_mem(mem)),
            Inst::FpuGetSw { mem } => match mem {
                Some(m) => format!("fnstsw {}", fmt_mem(m)),
                None => "fnstsw ax".to_string(),
            },
            Inst::FpuClearEx => "fnclex".to_string(),
            Inst::FpuInit => "fninit".to_string(),
            Inst::FpuFree { i } => format!("ffree st{i}"),
            Inst::FpuIncStp => "fincstp".to_string(),
            Inst::FpuDecStp => "fdecstp".to_string(),
            Inst::Emms => "emms".to_string(),
            Inst::MmxRead { dst, mm } => format!("v{} = read.mm{}", dst.id, mm),
            Inst::MmxWrite { mm, src } => format!("write.mm{} v{}", mm, src.id),
            Inst::XmmRead { dst, xmm } => format!("v{} = read.xmm{}", dst.id, xmm),
            Inst::XmmWrite { xmm, src } => format!("write.xmm{} v{}", xmm, src.id),
            Inst::Packed { op, dst, lhs, rhs } => {
                let name = match op {
                    PackedOp::Add => "padd",
                    PackedOp::AddSat => "padds",
                    PackedOp::AddSatU => "paddus",
                    PackedOp::Sub => "psub",
                    PackedOp::SubSat => "psubs",
                    PackedOp::SubSatU => "psubus",
                    PackedOp::MulLo => "pmull",
                    PackedOp::MulHi => "pmulh",
                    PackedOp::And => "pand",
                    PackedOp::AndNot => "pandn",
                    PackedOp::Or => "por",
                    PackedOp::Xor => "pxor",
                    PackedOp::CmpEq => "pcmpeq",
                    PackedOp::CmpGt => "pcmpgt",
                    PackedOp::Sll => "psll",
                    PackedOp::Srl => "psrl",
                    PackedOp::Sra => "psra",
                    PackedOp::PackSs => "packss",
                    PackedOp::PackUs => "packus",
                    PackedOp::UnpackLo => "punpckl",
                    PackedOp::UnpackHi => "punpckh",
                };
                format!(
                    "v{} = {}.{} v{}, v{}",
                    dst.id,
                    name,
                    dst.ty.name(),
                    lhs.id,
                    rhs.id
                )
            }
            Inst::VFloat { op, dst, lhs, rhs } => {
                let name = match op {
                    VFloatOp::Add => "fadd",
                    VFloatOp::Sub => "fsub",
                    VFloatOp::Mul => "fmul",
                    VFloatOp::Div => "fdiv",
                    VFloatOp::Min => "fmin",
                    VFloatOp::Max => "fmax",
                };
                format!(
                    "v{} = {}.{} v{}, v{}",
                    dst.id,
                    name,
                    dst.ty.name(),
                    lhs.id,
                    rhs.id
                )
            }
            Inst::VFloatSqrt { dst, src } => {
                format!("v{} = fsqrt.{} v{}", dst.id, dst.ty.name(), src.id)
            }
            Inst::VFloatCmp {
                dst,
                lhs,
                rhs,
                pred,
            } => format!(
                "v{} = fcmp.{} v{}, v{}, pred={}",
                dst.id,
                dst.ty.name(),
                lhs.id,
                rhs.id,
                pred
            ),
            Inst::SseComi { lhs, rhs, quiet } => format!(
                "{} v{}, v{}",
                if *quiet { "ucomiss" } else { "comiss" },
                lhs.id,
                rhs.id
            ),
            Inst::InsertF32 { dst, base, src } => {
                format!("v{} = insertss v{}, v{}", dst.id, base.id, src.id)
            }
            Inst::Shuffle { dst, lhs, rhs, imm } => format!(
                "v{} = shufps v{}, v{}, {:#x}",
                dst.id, lhs.id, rhs.id, imm
            ),
            Inst::CvtIntToF32 { dst, src } => format!("v{} = cvtsi2ss v{}", dst.id, src.id),
            Inst::CvtF32ToInt { dst, src, trunc } => format!(
                "v{} = {} v{}",
                dst.id,
                if *trunc { "cvttss2si" } else { "cvtss2si" },
                src.id
            ),
            Inst::SetMxcsr { src } => format!("ldmxcsr v{}", src.id),
            Inst::GetMxcsr { dst } => format!("v{} = stmxcsr", dst.id),
            Inst::Barrier { kind } => {
                let name = match kind {
                    BarrierKind::DataMemory => "dmb",
                    BarrierKind::DataSync => "dsb",
                    BarrierKind::InstructionSync => "isb",
                };
                format!("barrier.{name}")
            }
        }
    }
}

impl Terminator {
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Terminator::Jmp { target } => format!("jmp {target:#x}"),
            Terminator::Jcc {
                cond,
                target,
                fallthrough,
            } => format!("jcc.{} {:#x}, {:#x}", cond.name(), target, fallthrough),
            Terminator::JccVreg {
                cond,
                target,
                fallthrough,
            } => format!("jcc v{}, {:#x}, {:#x}", cond.id, target, fallthrough),
            Terminator::Indirect { addr } => format!("jmp [v{}]", addr.id),
            Terminator::Ret { addr } => format!("ret [v{}]", addr.id),
            Terminator::Interrupt { vector, next } => {
                format!("int {vector:#x}, next={next:#x}")
            }
            Terminator::Halt { next } => format!("hlt, next={next:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_sequential_vregs() {
        let mut b = IrBuilder::new();
        let v0 = b.const_val(5, DataType::I32);
        let v1 = b.vreg(DataType::I32);
        assert_eq!(v0.id, 0);
        assert_eq!(v1.id, 1);
    }

    #[test]
    fn ssa_check_catches_use_before_def() {
        let bad = IrBlock {
            start: 0,
            insts: vec![Inst::WriteReg {
                reg: Gpr::Eax,
                width: Width::W32,
                high8: false,
                src: Vreg {
                    id: 7,
                    ty: DataType::I32,
                },
            }],
            term: Terminator::Jmp { target: 0x10 },
        };
        assert!(!bad.ssa_ok());
    }

    #[test]
    fn text_form_is_stable() {
        let mut b = IrBuilder::new();
        let v0 = b.const_val(5, DataType::I32);
        b.push(Inst::WriteReg {
            reg: Gpr::Eax,
            width: Width::W32,
            high8: false,
            src: v0,
        });
        let block = b.finish(0x1000, Terminator::Jmp { target: 0x1005 });
        assert_eq!(
            block.to_text(),
            "block 0x1000:\n  v0 = const.i32 0x5\n  write.eax v0\n  term jmp 0x1005\n"
        );
        assert!(block.ssa_ok());
    }
}
