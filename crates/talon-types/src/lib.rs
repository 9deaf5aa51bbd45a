//! Scalar types shared across the translator: operand widths, IR data types,
//! guest register names, condition codes, flag sets, guest exceptions, and
//! memory barrier kinds.

use bitflags::bitflags;

/// Integer operand width of a guest operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
        }
    }

    #[must_use]
    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    #[must_use]
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W16 => 0xffff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }

    #[must_use]
    pub fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    /// Sign-extends a value of this width to 64 bits.
    #[must_use]
    pub fn sign_extend(self, value: u64) -> i64 {
        match self {
            Width::W8 => value as u8 as i8 as i64,
            Width::W16 => value as u16 as i16 as i64,
            Width::W32 => value as u32 as i32 as i64,
            Width::W64 => value as i64,
        }
    }

    #[must_use]
    pub fn sign_bit(self, value: u64) -> bool {
        (value >> (self.bits() - 1)) & 1 != 0
    }
}

/// Data type carried by every IR operand.
///
/// Vector types encode both the register width (64-bit MMX vs 128-bit XMM)
/// and the lane shape the operation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    F80,
    /// MMX, 8 lanes of 8 bits.
    V64B8,
    /// MMX, 4 lanes of 16 bits.
    V64H4,
    /// MMX, 2 lanes of 32 bits.
    V64S2,
    /// MMX, one 64-bit lane (PSLLQ/PSRLQ).
    V64D1,
    /// XMM, 16 lanes of 8 bits.
    V128B16,
    /// XMM, 8 lanes of 16 bits.
    V128H8,
    /// XMM, 4 lanes of 32 bits.
    V128S4,
    /// XMM, 2 lanes of 64 bits.
    V128D2,
    Ptr,
}

impl DataType {
    #[must_use]
    pub fn size_bytes(self) -> u32 {
        match self {
            DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 | DataType::Ptr => 4,
            DataType::I64 | DataType::U64 | DataType::F64 => 8,
            DataType::F80 => 10,
            DataType::V64B8 | DataType::V64H4 | DataType::V64S2 | DataType::V64D1 => 8,
            DataType::V128B16 | DataType::V128H8 | DataType::V128S4 | DataType::V128D2 => 16,
        }
    }

    /// Natural alignment used for spill-slot sizing.
    #[must_use]
    pub fn align_bytes(self) -> u32 {
        match self {
            DataType::F80 => 16,
            other => other.size_bytes(),
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64 | DataType::F80)
    }

    #[must_use]
    pub fn is_vector(self) -> bool {
        matches!(
            self,
            DataType::V64B8
                | DataType::V64H4
                | DataType::V64S2
                | DataType::V64D1
                | DataType::V128B16
                | DataType::V128H8
                | DataType::V128S4
                | DataType::V128D2
        )
    }

    /// True when the register allocator must place values of this type in a
    /// NEON register (or a NEON-compatible spill slot).
    #[must_use]
    pub fn needs_neon(self) -> bool {
        self.is_float() || self.is_vector()
    }

    /// Lane count for vector types, 1 otherwise.
    #[must_use]
    pub fn lanes(self) -> u32 {
        match self {
            DataType::V64B8 => 8,
            DataType::V64H4 => 4,
            DataType::V64S2 => 2,
            DataType::V64D1 => 1,
            DataType::V128B16 => 16,
            DataType::V128H8 => 8,
            DataType::V128S4 => 4,
            DataType::V128D2 => 2,
            _ => 1,
        }
    }

    #[must_use]
    pub fn integer_width(self) -> Option<Width> {
        match self {
            DataType::I8 | DataType::U8 => Some(Width::W8),
            DataType::I16 | DataType::U16 => Some(Width::W16),
            DataType::I32 | DataType::U32 | DataType::Ptr => Some(Width::W32),
            DataType::I64 | DataType::U64 => Some(Width::W64),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U16 => "u16",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F80 => "f80",
            DataType::V64B8 => "v64.b8",
            DataType::V64H4 => "v64.h4",
            DataType::V64S2 => "v64.s2",
            DataType::V64D1 => "v64.d1",
            DataType::V128B16 => "v128.b16",
            DataType::V128H8 => "v128.h8",
            DataType::V128S4 => "v128.s4",
            DataType::V128D2 => "v128.d2",
            DataType::Ptr => "ptr",
        }
    }
}

/// Guest general-purpose registers in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    #[must_use]
    pub fn from_index(idx: u8) -> Option<Gpr> {
        Self::ALL.get(idx as usize).copied()
    }

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Gpr::Eax => "eax",
            Gpr::Ecx => "ecx",
            Gpr::Edx => "edx",
            Gpr::Ebx => "ebx",
            Gpr::Esp => "esp",
            Gpr::Ebp => "ebp",
            Gpr::Esi => "esi",
            Gpr::Edi => "edi",
        }
    }
}

/// x86 condition codes in Jcc encoding order (0x0..0xF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Nb = 0x3,
    Z = 0x4,
    Nz = 0x5,
    Be = 0x6,
    Nbe = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Nl = 0xd,
    Le = 0xe,
    Nle = 0xf,
}

impl Cond {
    #[must_use]
    pub fn from_encoding(cc: u8) -> Option<Cond> {
        const TABLE: [Cond; 16] = [
            Cond::O,
            Cond::No,
            Cond::B,
            Cond::Nb,
            Cond::Z,
            Cond::Nz,
            Cond::Be,
            Cond::Nbe,
            Cond::S,
            Cond::Ns,
            Cond::P,
            Cond::Np,
            Cond::L,
            Cond::Nl,
            Cond::Le,
            Cond::Nle,
        ];
        TABLE.get(cc as usize).copied()
    }

    #[must_use]
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Evaluates the condition from the six arithmetic flags.
    #[must_use]
    pub fn eval(self, cf: bool, pf: bool, zf: bool, sf: bool, of: bool) -> bool {
        match self {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Nb => !cf,
            Cond::Z => zf,
            Cond::Nz => !zf,
            Cond::Be => cf || zf,
            Cond::Nbe => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Nl => sf == of,
            Cond::Le => zf || (sf != of),
            Cond::Nle => !zf && (sf == of),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Cond::O => "o",
            Cond::No => "no",
            Cond::B => "b",
            Cond::Nb => "nb",
            Cond::Z => "e",
            Cond::Nz => "ne",
            Cond::Be => "be",
            Cond::Nbe => "a",
            Cond::S => "s",
            Cond::Ns => "ns",
            Cond::P => "p",
            Cond::Np => "np",
            Cond::L => "l",
            Cond::Nl => "ge",
            Cond::Le => "le",
            Cond::Nle => "g",
        }
    }
}

/// Individual arithmetic flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Of,
}

bitflags! {
    /// Set of arithmetic flags affected or observed by an operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagSet: u8 {
        const CF = 1 << 0;
        const PF = 1 << 1;
        const AF = 1 << 2;
        const ZF = 1 << 3;
        const SF = 1 << 4;
        const OF = 1 << 5;
    }
}

impl FlagSet {
    pub const ALU: FlagSet = FlagSet::CF
        .union(FlagSet::PF)
        .union(FlagSet::AF)
        .union(FlagSet::ZF)
        .union(FlagSet::SF)
        .union(FlagSet::OF);

    #[must_use]
    pub fn without(self, other: FlagSet) -> FlagSet {
        self.difference(other)
    }
}

/// EFLAGS bit positions.
pub const EFLAGS_CF: u32 = 1 << 0;
pub const EFLAGS_PF: u32 = 1 << 2;
pub const EFLAGS_AF: u32 = 1 << 4;
pub const EFLAGS_ZF: u32 = 1 << 6;
pub const EFLAGS_SF: u32 = 1 << 7;
pub const EFLAGS_DF: u32 = 1 << 10;
pub const EFLAGS_OF: u32 = 1 << 11;
/// Bit 1 is always set on real hardware.
pub const EFLAGS_FIXED: u32 = 1 << 1;
/// Bits an arithmetic operation may rewrite.
pub const EFLAGS_ARITH_MASK: u32 =
    EFLAGS_CF | EFLAGS_PF | EFLAGS_AF | EFLAGS_ZF | EFLAGS_SF | EFLAGS_OF;

/// Guest-visible CPU exceptions, by x86 vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    X87Fpu = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloat = 19,
}

impl Exception {
    #[must_use]
    pub fn vector(self) -> u8 {
        self as u8
    }
}

/// Memory barrier kinds the IR can carry and the emitter lowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierKind {
    /// DMB ISH.
    DataMemory,
    /// DSB ISH.
    DataSync,
    /// ISB.
    InstructionSync,
}

/// Host log levels used by the embedder callback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_sign_extend() {
        assert_eq!(Width::W8.sign_extend(0x80), -128);
        assert_eq!(Width::W16.sign_extend(0x7fff), 0x7fff);
        assert_eq!(Width::W32.sign_extend(0xffff_ffff), -1);
    }

    #[test]
    fn cond_encoding_round_trips() {
        for cc in 0..16u8 {
            let cond = Cond::from_encoding(cc).unwrap();
            assert_eq!(cond.encoding(), cc);
        }
        assert!(Cond::from_encoding(16).is_none());
    }

    #[test]
    fn cond_eval_matches_x86_tables() {
        // JBE: CF || ZF.
        assert!(Cond::Be.eval(true, false, false, false, false));
        assert!(Cond::Be.eval(false, false, true, false, false));
        assert!(!Cond::Be.eval(false, false, false, false, false));
        // JL: SF != OF.
        assert!(Cond::L.eval(false, false, false, true, false));
        assert!(!Cond::L.eval(false, false, false, true, true));
        // JG: !ZF && SF == OF.
        assert!(Cond::Nle.eval(false, false, false, true, true));
        assert!(!Cond::Nle.eval(false, false, true, true, true));
    }

    #[test]
    fn vector_types_need_neon() {
        assert!(DataType::V64H4.needs_neon());
        assert!(DataType::F80.needs_neon());
        assert!(!DataType::I32.needs_neon());
        assert_eq!(DataType::V128S4.lanes(), 4);
        assert_eq!(DataType::V128S4.size_bytes(), 16);
    }
}
