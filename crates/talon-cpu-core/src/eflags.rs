//! Lazy EFLAGS.
//!
//! Flag-producing operations store an operand triple instead of computing
//! the six arithmetic flags; the first observer materializes them. EFLAGS is
//! therefore either "materialized" (the raw value is authoritative) or
//! "pending" (raw value plus an unconsumed record). Writers such as POPF go
//! straight to materialized and drop any pending record.
//!
//! The record layout is `repr(C)`: emitted code stores the triple with plain
//! word stores and calls back in for materialization.

use talon_types::{
    Cond, EFLAGS_AF, EFLAGS_ARITH_MASK, EFLAGS_CF, EFLAGS_FIXED, EFLAGS_OF, EFLAGS_PF, EFLAGS_SF,
    EFLAGS_ZF, Width,
};

/// Operation kinds the materializer can derive flags from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FlagOp {
    Add = 0,
    Adc = 1,
    Sub = 2,
    Sbb = 3,
    /// INC: like Add but CF is preserved from the previous state.
    Inc = 4,
    /// DEC: like Sub but CF is preserved.
    Dec = 5,
    Logic = 6,
    Shl = 7,
    Shr = 8,
    Sar = 9,
}

impl FlagOp {
    #[must_use]
    pub fn from_u32(v: u32) -> Option<FlagOp> {
        Some(match v {
            0 => FlagOp::Add,
            1 => FlagOp::Adc,
            2 => FlagOp::Sub,
            3 => FlagOp::Sbb,
            4 => FlagOp::Inc,
            5 => FlagOp::Dec,
            6 => FlagOp::Logic,
            7 => FlagOp::Shl,
            8 => FlagOp::Shr,
            9 => FlagOp::Sar,
            _ => return None,
        })
    }

    /// True when materialization reads bits of the previous flag value
    /// (preserved CF for INC/DEC, preserved OF for multi-bit shifts). Such
    /// records require the previous record to be materialized first.
    #[must_use]
    pub fn preserves_bits(self) -> bool {
        matches!(
            self,
            FlagOp::Inc | FlagOp::Dec | FlagOp::Shl | FlagOp::Shr | FlagOp::Sar
        )
    }
}

#[derive(Debug, Clone)]
#[repr(C)]
pub struct Eflags {
    raw: u32,
    /// Nonzero while a pending record is unconsumed.
    valid: u32,
    result: u32,
    src1: u32,
    src2: u32,
    op: u32,
    width_bits: u32,
    /// Carry-in for ADC/SBB records.
    aux: u32,
}

fn parity_even(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

impl Eflags {
    #[must_use]
    pub fn new(raw: u32) -> Eflags {
        Eflags {
            raw: raw | EFLAGS_FIXED,
            valid: 0,
            result: 0,
            src1: 0,
            src2: 0,
            op: 0,
            width_bits: 32,
            aux: 0,
        }
    }

    /// Records a flag-producing operation for lazy evaluation.
    pub fn store_op_state(&mut self, op: FlagOp, width: Width, result: u32, src1: u32, src2: u32) {
        self.store_op_state_carry(op, width, result, src1, src2, false);
    }

    /// Like [`Self::store_op_state`] with an explicit carry-in (ADC/SBB).
    pub fn store_op_state_carry(
        &mut self,
        op: FlagOp,
        width: Width,
        result: u32,
        src1: u32,
        src2: u32,
        carry_in: bool,
    ) {
        if op.preserves_bits() {
            // The preserved bits come out of `raw`, so it must be current.
            self.materialize();
        }
        self.result = result;
        self.src1 = src1;
        self.src2 = src2;
        self.op = op as u32;
        self.width_bits = width.bits();
        self.aux = u32::from(carry_in);
        self.valid = 1;
    }

    /// Materializes any pending record into the raw value. Idempotent.
    pub fn materialize(&mut self) {
        if self.valid == 0 {
            return;
        }
        self.valid = 0;

        let width = match self.width_bits {
            8 => Width::W8,
            16 => Width::W16,
            _ => Width::W32,
        };
        let bits = width.bits();
        let mask = width.mask() as u32;
        let r = self.result & mask;
        let a = self.src1 & mask;
        let b = self.src2 & mask;
        let sign = |v: u32| (v >> (bits - 1)) & 1 != 0;

        let old = self.raw;
        let mut f = self.raw & !EFLAGS_ARITH_MASK;
        if r == 0 {
            f |= EFLAGS_ZF;
        }
        if sign(r) {
            f |= EFLAGS_SF;
        }
        if parity_even(r as u8) {
            f |= EFLAGS_PF;
        }

        let op = FlagOp::from_u32(self.op).unwrap_or(FlagOp::Logic);
        match op {
            FlagOp::Add | FlagOp::Adc | FlagOp::Inc => {
                let c = if op == FlagOp::Adc { self.aux as u64 } else { 0 };
                let wide = u64::from(a) + u64::from(b) + c;
                let carry = (wide >> bits) != 0;
                match op {
                    FlagOp::Inc => {
                        if old & EFLAGS_CF != 0 {
                            f |= EFLAGS_CF;
                        }
                    }
                    _ if carry => f |= EFLAGS_CF,
                    _ => {}
                }
                if sign(a) == sign(b) && sign(r) != sign(a) {
                    f |= EFLAGS_OF;
                }
                if ((a ^ b ^ r) >> 4) & 1 != 0 {
                    f |= EFLAGS_AF;
                }
            }
            FlagOp::Sub | FlagOp::Sbb | FlagOp::Dec => {
                let c = if op == FlagOp::Sbb { u64::from(self.aux) } else { 0 };
                let borrow = u64::from(a) < u64::from(b) + c;
                match op {
                    FlagOp::Dec => {
                        if old & EFLAGS_CF != 0 {
                            f |= EFLAGS_CF;
                        }
                    }
                    _ if borrow => f |= EFLAGS_CF,
                    _ => {}
                }
                if sign(a) != sign(b) && sign(r) != sign(a) {
                    f |= EFLAGS_OF;
                }
                if ((a ^ b ^ r) >> 4) & 1 != 0 {
                    f |= EFLAGS_AF;
                }
            }
            FlagOp::Logic => {
                // CF, OF and AF cleared.
            }
            FlagOp::Shl => {
                let count = b & 0x1f;
                if count >= 1 && count <= bits {
                    if (a >> (bits - count)) & 1 != 0 {
                        f |= EFLAGS_CF;
                    }
                }
                if count == 1 {
                    if sign(r) != (f & EFLAGS_CF != 0) {
                        f |= EFLAGS_OF;
                    }
                } else if old & EFLAGS_OF != 0 {
                    // OF is architecturally undefined for count > 1; it is
                    // left at its previous value.
                    f |= EFLAGS_OF;
                }
            }
            FlagOp::Shr | FlagOp::Sar => {
                let count = b & 0x1f;
                if count >= 1 && count <= 32 && (a >> (count - 1)) & 1 != 0 {
                    f |= EFLAGS_CF;
                }
                if op == FlagOp::Shr {
                    if count == 1 {
                        if sign(a) {
                            f |= EFLAGS_OF;
                        }
                    } else if old & EFLAGS_OF != 0 {
                        f |= EFLAGS_OF;
                    }
                }
                // SAR clears OF for any nonzero count.
            }
        }
        self.raw = f | EFLAGS_FIXED;
    }

    /// Reads the full register, materializing first.
    pub fn value(&mut self) -> u32 {
        self.materialize();
        self.raw
    }

    /// Peeks the raw value without forcing materialization; only correct
    /// when no record is pending.
    #[must_use]
    pub fn raw_unchecked(&self) -> u32 {
        self.raw
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.valid != 0
    }

    /// Writer path (POPF, SAHF): materialized value replaces everything.
    pub fn set_value(&mut self, value: u32) {
        self.raw = value | EFLAGS_FIXED;
        self.valid = 0;
    }

    pub fn set_flag(&mut self, flag_mask: u32, set: bool) {
        self.materialize();
        if set {
            self.raw |= flag_mask;
        } else {
            self.raw &= !flag_mask;
        }
    }

    pub fn get_flag(&mut self, flag_mask: u32) -> bool {
        self.materialize();
        self.raw & flag_mask != 0
    }

    /// Evaluates a Jcc condition (encodings 0x0..0xF).
    pub fn evaluate_condition(&mut self, cond: Cond) -> bool {
        self.materialize();
        let f = self.raw;
        cond.eval(
            f & EFLAGS_CF != 0,
            f & EFLAGS_PF != 0,
            f & EFLAGS_ZF != 0,
            f & EFLAGS_SF != 0,
            f & EFLAGS_OF != 0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_of(op: FlagOp, width: Width, result: u32, a: u32, b: u32) -> u32 {
        let mut e = Eflags::new(0);
        e.store_op_state(op, width, result, a, b);
        e.value() & EFLAGS_ARITH_MASK
    }

    #[test]
    fn add_carry_and_overflow() {
        // 0xFFFFFFFF + 1 = 0: CF, ZF, AF, PF.
        let f = flags_of(FlagOp::Add, Width::W32, 0, 0xffff_ffff, 1);
        assert_ne!(f & EFLAGS_CF, 0);
        assert_ne!(f & EFLAGS_ZF, 0);
        assert_ne!(f & EFLAGS_AF, 0);
        assert_eq!(f & EFLAGS_OF, 0);

        // 0x7FFFFFFF + 1: signed overflow, no carry.
        let f = flags_of(FlagOp::Add, Width::W32, 0x8000_0000, 0x7fff_ffff, 1);
        assert_eq!(f & EFLAGS_CF, 0);
        assert_ne!(f & EFLAGS_OF, 0);
        assert_ne!(f & EFLAGS_SF, 0);
    }

    #[test]
    fn sub_borrow() {
        let f = flags_of(FlagOp::Sub, Width::W32, 0xffff_ffff, 0, 1);
        assert_ne!(f & EFLAGS_CF, 0);
        assert_ne!(f & EFLAGS_SF, 0);
        let f = flags_of(FlagOp::Sub, Width::W32, 1, 2, 1);
        assert_eq!(f & EFLAGS_CF, 0);
        assert_eq!(f & EFLAGS_ZF, 0);
    }

    #[test]
    fn inc_preserves_carry() {
        let mut e = Eflags::new(EFLAGS_CF);
        e.store_op_state(FlagOp::Inc, Width::W32, 1, 0, 1);
        let f = e.value();
        assert_ne!(f & EFLAGS_CF, 0, "INC must not clobber CF");
        assert_eq!(f & EFLAGS_ZF, 0);
    }

    #[test]
    fn shl_count_one_of_rule() {
        // 0x40 << 1 = 0x80 (W8): CF = 0, MSB(result) = 1 → OF set.
        let f = flags_of(FlagOp::Shl, Width::W8, 0x80, 0x40, 1);
        assert_eq!(f & EFLAGS_CF, 0);
        assert_ne!(f & EFLAGS_OF, 0);

        // 0x80 << 1 = 0 (W8): CF = 1, MSB(result) = 0 → OF set.
        let f = flags_of(FlagOp::Shl, Width::W8, 0, 0x80, 1);
        assert_ne!(f & EFLAGS_CF, 0);
        assert_ne!(f & EFLAGS_OF, 0);
    }

    #[test]
    fn shift_count_above_one_leaves_of_untouched() {
        let mut e = Eflags::new(EFLAGS_OF);
        e.store_op_state(FlagOp::Shl, Width::W32, 4 << 3, 4, 3);
        assert_ne!(e.value() & EFLAGS_OF, 0, "OF preserved for count > 1");

        let mut e = Eflags::new(0);
        e.store_op_state(FlagOp::Shl, Width::W32, 4 << 3, 4, 3);
        assert_eq!(e.value() & EFLAGS_OF, 0);
    }

    #[test]
    fn sar_clears_of() {
        let mut e = Eflags::new(EFLAGS_OF);
        e.store_op_state(FlagOp::Sar, Width::W32, 1, 2, 1);
        assert_eq!(e.value() & EFLAGS_OF, 0);
    }

    #[test]
    fn shr_carry_is_last_bit_out() {
        let f = flags_of(FlagOp::Shr, Width::W32, 0b10, 0b101, 1);
        assert_ne!(f & EFLAGS_CF, 0);
        let f = flags_of(FlagOp::Shr, Width::W32, 0b1, 0b110, 1);
        assert_eq!(f & EFLAGS_CF, 0);
    }

    #[test]
    fn adc_includes_carry_in() {
        // 0xFFFFFFFF + 0 + carry = 0 with carry out.
        let mut e = Eflags::new(EFLAGS_CF);
        e.store_op_state_carry(FlagOp::Adc, Width::W32, 0, 0xffff_ffff, 0, true);
        let f = e.value();
        assert_ne!(f & EFLAGS_CF, 0);
        assert_ne!(f & EFLAGS_ZF, 0);
    }

    #[test]
    fn observation_clears_pending_once() {
        let mut e = Eflags::new(0);
        e.store_op_state(FlagOp::Add, Width::W32, 3, 1, 2);
        assert!(e.has_pending());
        let _ = e.value();
        assert!(!e.has_pending());
    }

    #[test]
    fn condition_evaluation_matches_flags() {
        let mut e = Eflags::new(0);
        // cmp 1, 2 → below, less.
        e.store_op_state(FlagOp::Sub, Width::W32, 0xffff_ffff, 1, 2);
        assert!(e.evaluate_condition(Cond::B));
        assert!(e.evaluate_condition(Cond::L));
        assert!(!e.evaluate_condition(Cond::Z));
        assert!(e.evaluate_condition(Cond::Le));
        assert!(!e.evaluate_condition(Cond::Nle));
    }
}
