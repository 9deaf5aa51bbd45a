//! The x87/MMX/SSE register bank.
//!
//! Eight 10-byte physical slots back both the rotating x87 stack and the
//! flat MMX registers (which alias the low 64 bits of the slots in physical
//! order, not stack order). The XMM file is independent.

use crate::f80::{F80, F80Class, Precision, Rounding};

// Status word bits.
pub const FSW_IE: u16 = 1 << 0;
pub const FSW_DE: u16 = 1 << 1;
pub const FSW_ZE: u16 = 1 << 2;
pub const FSW_OE: u16 = 1 << 3;
pub const FSW_UE: u16 = 1 << 4;
pub const FSW_PE: u16 = 1 << 5;
/// Stack fault.
pub const FSW_SF: u16 = 1 << 6;
/// Error summary: OR of unmasked exception flags.
pub const FSW_ES: u16 = 1 << 7;
pub const FSW_C0: u16 = 1 << 8;
pub const FSW_C1: u16 = 1 << 9;
pub const FSW_C2: u16 = 1 << 10;
pub const FSW_C3: u16 = 1 << 14;
pub const FSW_BUSY: u16 = 1 << 15;
const FSW_TOP_SHIFT: u16 = 11;
const FSW_TOP_MASK: u16 = 0x7 << FSW_TOP_SHIFT;
pub const FSW_EXC_MASK: u16 = FSW_IE | FSW_DE | FSW_ZE | FSW_OE | FSW_UE | FSW_PE;

// Control word bits.
pub const FCW_IM: u16 = 1 << 0;
pub const FCW_DM: u16 = 1 << 1;
pub const FCW_ZM: u16 = 1 << 2;
pub const FCW_OM: u16 = 1 << 3;
pub const FCW_UM: u16 = 1 << 4;
pub const FCW_PM: u16 = 1 << 5;
pub const FCW_DEFAULT: u16 = 0x037f;

// MXCSR bits (SSE).
pub const MXCSR_IE: u32 = 1 << 0;
pub const MXCSR_DE: u32 = 1 << 1;
pub const MXCSR_ZE: u32 = 1 << 2;
pub const MXCSR_OE: u32 = 1 << 3;
pub const MXCSR_UE: u32 = 1 << 4;
pub const MXCSR_PE: u32 = 1 << 5;
pub const MXCSR_DEFAULT: u32 = 0x1f80;

/// Per-slot tag values, two bits each in the tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Valid = 0,
    Zero = 1,
    Special = 2,
    Empty = 3,
}

impl Tag {
    #[must_use]
    pub fn from_bits(bits: u16) -> Tag {
        match bits & 3 {
            0 => Tag::Valid,
            1 => Tag::Zero,
            2 => Tag::Special,
            _ => Tag::Empty,
        }
    }

    /// Classification of an 80-bit image, as re-derived after MMX use.
    #[must_use]
    pub fn derive(value: &F80) -> Tag {
        match value.classify() {
            F80Class::Zero => Tag::Zero,
            F80Class::Normal => Tag::Valid,
            _ => Tag::Special,
        }
    }
}

/// Which view last touched the shared bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BankMode {
    X87,
    Mmx,
}

// Layout-stable: the JIT addresses the XMM file at a fixed offset.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct FpuBank {
    regs: [[u8; 10]; 8],
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u16,
    mode: BankMode,
    pub xmm: [u128; 8],
    pub mxcsr: u32,
}

impl Default for FpuBank {
    fn default() -> Self {
        Self::new()
    }
}

impl FpuBank {
    #[must_use]
    pub fn new() -> FpuBank {
        FpuBank {
            regs: [[0; 10]; 8],
            fcw: FCW_DEFAULT,
            fsw: 0,
            ftw: 0xffff,
            mode: BankMode::X87,
            xmm: [0; 8],
            mxcsr: MXCSR_DEFAULT,
        }
    }

    /// FNINIT: control 0x037F, status 0, all slots empty.
    pub fn init(&mut self) {
        self.fcw = FCW_DEFAULT;
        self.fsw = 0;
        self.ftw = 0xffff;
        self.mode = BankMode::X87;
    }

    /// FNCLEX: clears exception flags, stack fault, summary and busy.
    pub fn clear_exceptions(&mut self) {
        self.fsw &= !(FSW_EXC_MASK | FSW_SF | FSW_ES | FSW_BUSY);
    }

    #[must_use]
    pub fn top(&self) -> u8 {
        ((self.fsw & FSW_TOP_MASK) >> FSW_TOP_SHIFT) as u8
    }

    pub fn set_top(&mut self, top: u8) {
        self.fsw = (self.fsw & !FSW_TOP_MASK) | (u16::from(top & 7) << FSW_TOP_SHIFT);
    }

    /// Physical slot backing ST(i).
    #[must_use]
    pub fn phys(&self, i: u8) -> u8 {
        (self.top().wrapping_add(i)) & 7
    }

    #[must_use]
    pub fn tag(&self, slot: u8) -> Tag {
        Tag::from_bits(self.ftw >> (2 * u16::from(slot & 7)))
    }

    pub fn set_tag(&mut self, slot: u8, tag: Tag) {
        let shift = 2 * u16::from(slot & 7);
        self.ftw = (self.ftw & !(3 << shift)) | ((tag as u16) << shift);
    }

    /// Raw slot access in physical order (MMX view, snapshot/restore).
    #[must_use]
    pub fn slot(&self, slot: u8) -> F80 {
        F80::from_bytes(self.regs[(slot & 7) as usize])
    }

    pub fn set_slot(&mut self, slot: u8, value: F80) {
        self.regs[(slot & 7) as usize] = value.bytes();
    }

    /// Signals exception flags and recomputes the error summary.
    pub fn signal(&mut self, flags: u16) {
        self.fsw |= flags & (FSW_EXC_MASK | FSW_SF);
        self.update_summary();
    }

    fn update_summary(&mut self) {
        let unmasked = self.fsw & FSW_EXC_MASK & !(self.fcw & FSW_EXC_MASK);
        if unmasked != 0 {
            self.fsw |= FSW_ES | FSW_BUSY;
        } else {
            self.fsw &= !(FSW_ES | FSW_BUSY);
        }
    }

    pub fn set_cc(&mut self, c0: bool, c1: bool, c2: bool, c3: bool) {
        self.fsw &= !(FSW_C0 | FSW_C1 | FSW_C2 | FSW_C3);
        if c0 {
            self.fsw |= FSW_C0;
        }
        if c1 {
            self.fsw |= FSW_C1;
        }
        if c2 {
            self.fsw |= FSW_C2;
        }
        if c3 {
            self.fsw |= FSW_C3;
        }
    }

    #[must_use]
    pub fn precision(&self) -> Precision {
        Precision::from_bits(self.fcw >> 8)
    }

    #[must_use]
    pub fn rounding(&self) -> Rounding {
        Rounding::from_bits(self.fcw >> 10)
    }

    /// Ensures the bank is in x87 view, re-deriving tags if MMX ran since
    /// the last x87 instruction.
    pub fn x87_enter(&mut self) {
        if self.mode == BankMode::Mmx {
            for slot in 0..8 {
                let tag = Tag::derive(&self.slot(slot));
                self.set_tag(slot, tag);
            }
            self.mode = BankMode::X87;
        }
    }

    /// MMX entry rewrite: tag word all-valid, top 0, every slot's exponent
    /// field forced to the unnormal pattern 0xFFFF.
    pub fn mmx_enter(&mut self) {
        self.ftw = 0x0000;
        self.set_top(0);
        for reg in &mut self.regs {
            reg[8] = 0xff;
            reg[9] = 0xff;
        }
        self.mode = BankMode::Mmx;
    }

    /// EMMS: leave MMX mode with every slot tagged empty.
    pub fn emms(&mut self) {
        self.ftw = 0xffff;
        self.mode = BankMode::X87;
    }

    #[must_use]
    pub fn mmx_read(&mut self, n: u8) -> u64 {
        self.mmx_enter();
        u64::from_le_bytes(self.regs[(n & 7) as usize][0..8].try_into().unwrap())
    }

    pub fn mmx_write(&mut self, n: u8, value: u64) {
        self.mmx_enter();
        let reg = &mut self.regs[(n & 7) as usize];
        reg[0..8].copy_from_slice(&value.to_le_bytes());
        reg[8] = 0xff;
        reg[9] = 0xff;
    }

    /// Reads ST(i); an empty slot signals IE+SF and yields the indefinite
    /// QNaN (masked-operation behaviour).
    pub fn st(&mut self, i: u8) -> F80 {
        let slot = self.phys(i);
        if self.tag(slot) == Tag::Empty {
            self.signal(FSW_IE | FSW_SF);
            return F80::QNAN;
        }
        self.slot(slot)
    }

    /// Peeks ST(i) without fault side effects.
    #[must_use]
    pub fn st_peek(&self, i: u8) -> Option<F80> {
        let slot = self.phys(i);
        if self.tag(slot) == Tag::Empty {
            None
        } else {
            Some(self.slot(slot))
        }
    }

    #[must_use]
    pub fn st_is_empty(&self, i: u8) -> bool {
        self.tag(self.phys(i)) == Tag::Empty
    }

    /// Writes ST(i) and keeps the slot tag coherent.
    pub fn st_write(&mut self, i: u8, value: F80) {
        let slot = self.phys(i);
        self.set_slot(slot, value);
        let tag = Tag::derive(&value);
        self.set_tag(slot, tag);
    }

    /// Pushes a value: decrements top modulo 8 and writes the new top slot.
    /// Overflow (new slot not empty) sets IE+SF with C1 = 1 but the push
    /// still proceeds, matching masked x87 behaviour.
    pub fn push(&mut self, value: F80) {
        let new_top = self.top().wrapping_sub(1) & 7;
        if self.tag(new_top) != Tag::Empty {
            self.signal(FSW_IE | FSW_SF);
            self.fsw |= FSW_C1;
        }
        self.set_top(new_top);
        self.set_slot(new_top, value);
        let tag = Tag::derive(&value);
        self.set_tag(new_top, tag);
    }

    /// Pops the top slot. Underflow on an empty top sets IE+SF with C3 and
    /// returns zero.
    pub fn pop(&mut self) -> F80 {
        let top = self.top();
        if self.tag(top) == Tag::Empty {
            self.signal(FSW_IE | FSW_SF);
            self.fsw |= FSW_C3;
            self.set_top(top.wrapping_add(1) & 7);
            return F80::ZERO;
        }
        let value = self.slot(top);
        self.set_tag(top, Tag::Empty);
        self.set_top(top.wrapping_add(1) & 7);
        value
    }

    /// True when pushing `n` values would hit non-empty slots; used by the
    /// two-result helpers (FPTAN, FSINCOS) to check before mutating.
    #[must_use]
    pub fn would_overflow(&self, n: u8) -> bool {
        (1..=n).any(|k| self.tag(self.top().wrapping_sub(k) & 7) != Tag::Empty)
    }

    /// FFREE: tags ST(i) empty without moving top.
    pub fn free(&mut self, i: u8) {
        let slot = self.phys(i);
        self.set_tag(slot, Tag::Empty);
    }

    pub fn inc_top(&mut self) {
        let t = self.top();
        self.set_top(t.wrapping_add(1) & 7);
    }

    pub fn dec_top(&mut self) {
        let t = self.top();
        self.set_top(t.wrapping_sub(1) & 7);
    }

    /// FXAM: classifies ST(0) into C3/C2/C0 with C1 = sign.
    pub fn examine(&mut self) {
        let top = self.top();
        let (c3, c2, c0, c1) = if self.tag(top) == Tag::Empty {
            (true, false, true, false)
        } else {
            let v = self.slot(top);
            let sign = v.sign();
            match v.classify() {
                F80Class::Zero => (true, false, false, sign),
                F80Class::Normal => (false, true, false, sign),
                F80Class::Denormal | F80Class::Unnormal => (true, true, false, sign),
                F80Class::Infinity => (false, true, true, sign),
                F80Class::NaN => (false, false, true, sign),
            }
        };
        self.set_cc(c0, c1, c2, c3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_rotates_top() {
        let mut bank = FpuBank::new();
        bank.push(F80::ONE);
        assert_eq!(bank.top(), 7);
        assert_eq!(bank.tag(7), Tag::Valid);
        let v = bank.pop();
        assert_eq!(v, F80::ONE);
        assert_eq!(bank.top(), 0);
        assert_eq!(bank.tag(7), Tag::Empty);
    }

    #[test]
    fn pop_of_empty_stack_underflows() {
        let mut bank = FpuBank::new();
        let v = bank.pop();
        assert_eq!(v, F80::ZERO);
        assert_ne!(bank.fsw & FSW_IE, 0);
        assert_ne!(bank.fsw & FSW_SF, 0);
        assert_ne!(bank.fsw & FSW_C3, 0);
    }

    #[test]
    fn push_into_full_stack_sets_c1_but_proceeds() {
        let mut bank = FpuBank::new();
        for _ in 0..8 {
            bank.push(F80::ONE);
        }
        assert_eq!(bank.fsw & FSW_IE, 0);
        bank.push(F80::PI);
        assert_ne!(bank.fsw & FSW_IE, 0);
        assert_ne!(bank.fsw & FSW_C1, 0);
        assert_eq!(bank.st(0), F80::PI);
    }

    #[test]
    fn tag_word_tracks_slot_contents() {
        let mut bank = FpuBank::new();
        bank.push(F80::ZERO);
        assert_eq!(bank.tag(bank.phys(0)), Tag::Zero);
        bank.push(F80::QNAN);
        assert_eq!(bank.tag(bank.phys(0)), Tag::Special);
    }

    #[test]
    fn mmx_entry_rewrites_tags_top_and_exponents() {
        let mut bank = FpuBank::new();
        bank.push(F80::ONE);
        bank.push(F80::PI);
        bank.mmx_write(0, 0x0102_0304_0506_0708);
        assert_eq!(bank.ftw, 0x0000);
        assert_eq!(bank.top(), 0);
        for slot in 0..8 {
            let v = bank.slot(slot);
            assert_eq!(v.biased_exponent(), 0x7fff);
            assert!(v.sign());
        }
        assert_eq!(bank.mmx_read(0), 0x0102_0304_0506_0708);
    }

    #[test]
    fn x87_reentry_rederives_tags() {
        let mut bank = FpuBank::new();
        bank.mmx_write(3, 0);
        // Slot 3 low bits are zero but the exponent pattern makes it
        // special, not zero-tagged, after reclassification.
        bank.x87_enter();
        assert_eq!(bank.tag(3), Tag::Special);
    }

    #[test]
    fn emms_empties_all_tags() {
        let mut bank = FpuBank::new();
        bank.mmx_write(0, 1);
        bank.emms();
        assert_eq!(bank.ftw, 0xffff);
    }

    #[test]
    fn error_summary_follows_masks() {
        let mut bank = FpuBank::new();
        bank.signal(FSW_IE);
        assert_eq!(bank.fsw & FSW_ES, 0, "masked exception must not set ES");
        bank.fcw &= !FCW_IM;
        bank.signal(FSW_IE);
        assert_ne!(bank.fsw & FSW_ES, 0);
        bank.clear_exceptions();
        assert_eq!(bank.fsw & (FSW_IE | FSW_ES), 0);
    }

    #[test]
    fn would_overflow_counts_two_slots() {
        let mut bank = FpuBank::new();
        for _ in 0..7 {
            bank.push(F80::ONE);
        }
        assert!(!bank.would_overflow(1));
        assert!(bank.would_overflow(2));
    }
}
