//! Dyadic 80-bit arithmetic and comparison with the x87 special-value
//! policy: NaN and domain errors signal IE and substitute the indefinite
//! QNaN; division by zero signals ZE and produces a signed infinity;
//! denormal operands signal DE and are flushed to signed zero when the
//! denormal mask is set; every result passes through precision control.

use crate::f80::{F80, F80Class};
use crate::state::{FpuBank, FSW_DE, FSW_IE, FSW_OE, FSW_PE, FSW_UE, FSW_ZE, FCW_DM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DyadicOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareResult {
    Less,
    Equal,
    Greater,
    Unordered,
}

/// Applies the denormal-operand policy: DE on observation, flush to signed
/// zero in the masked (flush) regime.
pub fn check_operand(bank: &mut FpuBank, v: F80) -> F80 {
    if v.classify() == F80Class::Denormal {
        bank.signal(FSW_DE);
        if bank.fcw & FCW_DM != 0 {
            return if v.sign() { F80::NEG_ZERO } else { F80::ZERO };
        }
    }
    v
}

/// Rounds a finished result per precision control and records PE/OE/UE.
pub fn round_result(bank: &mut FpuBank, v: F80, operands_finite: bool) -> F80 {
    let (rounded, inexact) = v.apply_precision(bank.precision());
    if inexact {
        bank.signal(FSW_PE);
    }
    if operands_finite {
        match rounded.classify() {
            F80Class::Infinity => bank.signal(FSW_OE | FSW_PE),
            F80Class::Denormal => bank.signal(FSW_UE),
            _ => {}
        }
    }
    rounded
}

/// `a op b` with full special-value handling.
pub fn dyadic(bank: &mut FpuBank, op: DyadicOp, a: F80, b: F80) -> F80 {
    if a.is_nan() || b.is_nan() {
        bank.signal(FSW_IE);
        return F80::QNAN;
    }
    let a = check_operand(bank, a);
    let b = check_operand(bank, b);
    let a_inf = a.is_infinity();
    let b_inf = b.is_infinity();

    match op {
        DyadicOp::Add | DyadicOp::Sub => {
            let b_eff_sign = if op == DyadicOp::Sub { !b.sign() } else { b.sign() };
            if a_inf && b_inf && a.sign() != b_eff_sign {
                bank.signal(FSW_IE);
                return F80::QNAN;
            }
        }
        DyadicOp::Mul => {
            if (a_inf && b.is_zero()) || (b_inf && a.is_zero()) {
                bank.signal(FSW_IE);
                return F80::QNAN;
            }
        }
        DyadicOp::Div => {
            if (a_inf && b_inf) || (a.is_zero() && b.is_zero()) {
                bank.signal(FSW_IE);
                return F80::QNAN;
            }
            if b.is_zero() {
                bank.signal(FSW_ZE);
                let sign = a.sign() ^ b.sign();
                return if sign { F80::NEG_INFINITY } else { F80::INFINITY };
            }
        }
    }

    let x = a.to_f64();
    let y = b.to_f64();
    let r = match op {
        DyadicOp::Add => x + y,
        DyadicOp::Sub => x - y,
        DyadicOp::Mul => x * y,
        DyadicOp::Div => x / y,
    };
    let finite = !a_inf && !b_inf;
    round_result(bank, F80::from_f64(r), finite)
}

/// Three-way comparison; unordered signals IE (FCOM semantics).
pub fn compare(bank: &mut FpuBank, a: F80, b: F80) -> CompareResult {
    if a.is_nan() || b.is_nan() {
        bank.signal(FSW_IE);
        return CompareResult::Unordered;
    }
    let x = a.to_f64();
    let y = b.to_f64();
    if x < y {
        CompareResult::Less
    } else if x > y {
        CompareResult::Greater
    } else {
        CompareResult::Equal
    }
}

/// Writes a comparison result into C0/C2/C3.
pub fn set_compare_cc(bank: &mut FpuBank, r: CompareResult) {
    let (c0, c2, c3) = match r {
        CompareResult::Greater => (false, false, false),
        CompareResult::Less => (true, false, false),
        CompareResult::Equal => (false, false, true),
        CompareResult::Unordered => (true, true, true),
    };
    let c1 = bank.fsw & crate::state::FSW_C1 != 0;
    bank.set_cc(c0, c1, c2, c3);
}

/// FILD-side conversion.
#[must_use]
pub fn from_i64(v: i64) -> F80 {
    F80::from_f64(v as f64)
}

/// FIST-side conversion honouring rounding control; out-of-range and NaN
/// signal IE and produce the integer indefinite value.
pub fn to_int(bank: &mut FpuBank, v: F80, bits: u32) -> i64 {
    let indefinite = match bits {
        16 => i64::from(i16::MIN),
        32 => i64::from(i32::MIN),
        _ => i64::MIN,
    };
    if v.is_nan() || v.is_infinity() {
        bank.signal(FSW_IE);
        return indefinite;
    }
    let (rounded, inexact) = v.round_to_int(bank.rounding());
    let d = rounded.to_f64();
    let (lo, hi) = match bits {
        16 => (i16::MIN as f64, i16::MAX as f64),
        32 => (i32::MIN as f64, i32::MAX as f64),
        _ => (i64::MIN as f64, i64::MAX as f64),
    };
    if d < lo || d > hi {
        bank.signal(FSW_IE);
        return indefinite;
    }
    if inexact {
        bank.signal(FSW_PE);
    }
    d as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FCW_ZM, FSW_ES};

    #[test]
    fn add_and_mul_basic() {
        let mut bank = FpuBank::new();
        let r = dyadic(&mut bank, DyadicOp::Add, F80::from_f64(2.0), F80::from_f64(3.0));
        assert_eq!(r.to_f64(), 5.0);
        let r = dyadic(&mut bank, DyadicOp::Mul, F80::from_f64(2.0), F80::from_f64(3.0));
        assert_eq!(r.to_f64(), 6.0);
        assert_eq!(bank.fsw & FSW_IE, 0);
    }

    #[test]
    fn div_by_zero_produces_signed_infinity() {
        let mut bank = FpuBank::new();
        bank.fcw &= !FCW_ZM; // unmask so the summary bit asserts
        let r = dyadic(&mut bank, DyadicOp::Div, F80::from_f64(-3.0), F80::ZERO);
        assert_eq!(r, F80::NEG_INFINITY);
        assert_ne!(bank.fsw & FSW_ZE, 0);
        assert_ne!(bank.fsw & FSW_ES, 0);

        let mut bank = FpuBank::new();
        let r = dyadic(
            &mut bank,
            DyadicOp::Div,
            F80::from_f64(3.0),
            F80::NEG_ZERO,
        );
        assert_eq!(r, F80::NEG_INFINITY);
    }

    #[test]
    fn zero_over_zero_is_invalid() {
        let mut bank = FpuBank::new();
        let r = dyadic(&mut bank, DyadicOp::Div, F80::ZERO, F80::ZERO);
        assert!(r.is_nan());
        assert_ne!(bank.fsw & FSW_IE, 0);
    }

    #[test]
    fn inf_minus_inf_is_invalid() {
        let mut bank = FpuBank::new();
        let r = dyadic(&mut bank, DyadicOp::Sub, F80::INFINITY, F80::INFINITY);
        assert!(r.is_nan());
        assert_ne!(bank.fsw & FSW_IE, 0);
        // Same-sign addition of infinities stays infinite.
        let mut bank = FpuBank::new();
        let r = dyadic(&mut bank, DyadicOp::Add, F80::INFINITY, F80::INFINITY);
        assert_eq!(r, F80::INFINITY);
        assert_eq!(bank.fsw & FSW_IE, 0);
    }

    #[test]
    fn compare_orders_and_unordered() {
        let mut bank = FpuBank::new();
        assert_eq!(
            compare(&mut bank, F80::ONE, F80::from_f64(2.0)),
            CompareResult::Less
        );
        assert_eq!(
            compare(&mut bank, F80::from_f64(2.0), F80::ONE),
            CompareResult::Greater
        );
        assert_eq!(compare(&mut bank, F80::ONE, F80::ONE), CompareResult::Equal);
        assert_eq!(
            compare(&mut bank, F80::QNAN, F80::ONE),
            CompareResult::Unordered
        );
        assert_ne!(bank.fsw & FSW_IE, 0);
    }

    #[test]
    fn precision_control_single_rounds_product() {
        let mut bank = FpuBank::new();
        bank.fcw &= !(3 << 8); // PC = single
        let a = F80::from_f64(1.0 + f64::EPSILON);
        let r = dyadic(&mut bank, DyadicOp::Add, a, F80::ZERO);
        assert_eq!(r.to_f64(), 1.0);
        assert_ne!(bank.fsw & FSW_PE, 0);
    }

    #[test]
    fn int_round_trip_and_overflow() {
        let mut bank = FpuBank::new();
        assert_eq!(to_int(&mut bank, from_i64(1234), 32), 1234);
        let big = F80::from_f64(1e10);
        assert_eq!(to_int(&mut bank, big, 16), i64::from(i16::MIN));
        assert_ne!(bank.fsw & FSW_IE, 0);
    }
}
