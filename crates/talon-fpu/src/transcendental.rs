//! x87 transcendental helpers.
//!
//! Each helper runs the same three steps: classify the operands, range-reduce
//! where applicable, compute in host double precision and convert back under
//! the current precision and rounding control. Outcomes are reported as a
//! [`HelperStatus`] and mirrored into the condition-code bits: C0 for a
//! negative result, C3 for zero, C1 for precision loss, and C2 = 1 when the
//! input was outside the reduction range and the operand was left untouched.
//!
//! The reduction domain is |x| < 2^63. Between 2^30 and 2^63 the 2π
//! reduction runs in double precision and the precision flag is raised for
//! the bits it loses.

use crate::arith::{check_operand, round_result};
use crate::f80::{F80, F80Class};
use crate::state::{FpuBank, FSW_C1, FSW_C2, FSW_IE, FSW_PE, FSW_SF, FSW_ZE};

/// Outcome of one helper invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperStatus {
    /// Result stored, condition codes updated.
    Completed,
    /// Input outside the reduction domain: C2 set, operand left on the
    /// stack, no result produced.
    PartialResult,
    /// Invalid operand (NaN, ∞ where disallowed, log of a negative):
    /// IE signalled, QNaN substituted.
    InvalidOperand,
    /// A push would overwrite a live slot: IE+SF+C1 signalled, stack
    /// untouched.
    StackFault,
}

/// |x| beyond this is not reduced (C2 = 1).
const REDUCTION_LIMIT: f64 = 9.223_372_036_854_776e18; // 2^63
/// |x| beyond this loses precision during reduction (C1/PE).
const PRECISION_LIMIT: f64 = 1_073_741_824.0; // 2^30

const TWO_PI: f64 = std::f64::consts::TAU;

fn result_cc(bank: &mut FpuBank, value: f64, inexact: bool) {
    bank.set_cc(value < 0.0, inexact, false, value == 0.0);
    if inexact {
        bank.signal(FSW_PE);
    }
}

/// Stores a computed result into ST(i) with precision control and the
/// C0/C1/C3 summary.
fn store_result(bank: &mut FpuBank, i: u8, value: f64, extra_inexact: bool) {
    let rounded = round_result(bank, F80::from_f64(value), true);
    let inexact = extra_inexact || bank.fsw & FSW_PE != 0;
    result_cc(bank, rounded.to_f64(), inexact);
    bank.st_write(i, rounded);
}

fn invalid(bank: &mut FpuBank, i: u8) -> HelperStatus {
    bank.signal(FSW_IE);
    bank.st_write(i, F80::QNAN);
    HelperStatus::InvalidOperand
}

/// Reduces |x| modulo 2π. Returns the reduced value and whether precision
/// was lost, or `None` when x is outside the reduction domain.
fn reduce_2pi(x: f64) -> Option<(f64, bool)> {
    if x.abs() >= REDUCTION_LIMIT {
        return None;
    }
    if x.abs() <= TWO_PI {
        return Some((x, false));
    }
    let mut t = x;
    // Staged reduction: fold extreme magnitudes down before the final
    // modulo so the intermediate remains representable.
    let lost = t.abs() > PRECISION_LIMIT;
    while t.abs() > 1e15 {
        t %= TWO_PI * 1e12;
    }
    t %= TWO_PI;
    if lost {
        tracing::trace!(input = x, reduced = t, "range reduction lost precision");
    }
    Some((t, lost))
}

fn unary_operand(bank: &mut FpuBank) -> Result<F80, HelperStatus> {
    if bank.st_is_empty(0) {
        bank.signal(FSW_IE | FSW_SF);
        return Err(HelperStatus::StackFault);
    }
    let v = bank.st(0);
    Ok(check_operand(bank, v))
}

/// FSIN.
pub fn fsin(bank: &mut FpuBank) -> HelperStatus {
    trig_unary(bank, f64::sin)
}

/// FCOS.
pub fn fcos(bank: &mut FpuBank) -> HelperStatus {
    trig_unary(bank, f64::cos)
}

fn trig_unary(bank: &mut FpuBank, f: fn(f64) -> f64) -> HelperStatus {
    let v = match unary_operand(bank) {
        Ok(v) => v,
        Err(s) => return s,
    };
    match v.classify() {
        F80Class::NaN => return invalid(bank, 0),
        F80Class::Infinity => return invalid(bank, 0),
        _ => {}
    }
    let x = v.to_f64();
    match reduce_2pi(x) {
        None => {
            bank.fsw |= FSW_C2;
            HelperStatus::PartialResult
        }
        Some((r, lost)) => {
            bank.fsw &= !FSW_C2;
            store_result(bank, 0, f(r), lost);
            HelperStatus::Completed
        }
    }
}

/// FPTAN: ST(0) ← tan(ST(0)), then push 1.0. Needs one free slot below the
/// operand; checked before any mutation.
pub fn fptan(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    if bank.would_overflow(1) {
        bank.signal(FSW_IE | FSW_SF);
        bank.fsw |= FSW_C1;
        return HelperStatus::StackFault;
    }
    let raw = bank.st(0);
    let v = check_operand(bank, raw);
    match v.classify() {
        F80Class::NaN | F80Class::Infinity => return invalid(bank, 0),
        _ => {}
    }
    let x = v.to_f64();
    match reduce_2pi(x) {
        None => {
            bank.fsw |= FSW_C2;
            HelperStatus::PartialResult
        }
        Some((r, lost)) => {
            bank.fsw &= !FSW_C2;
            store_result(bank, 0, r.tan(), lost);
            bank.push(F80::ONE);
            HelperStatus::Completed
        }
    }
}

/// FSINCOS: ST(0) ← sin, push cos.
pub fn fsincos(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    if bank.would_overflow(1) {
        bank.signal(FSW_IE | FSW_SF);
        bank.fsw |= FSW_C1;
        return HelperStatus::StackFault;
    }
    let raw = bank.st(0);
    let v = check_operand(bank, raw);
    match v.classify() {
        F80Class::NaN | F80Class::Infinity => return invalid(bank, 0),
        _ => {}
    }
    let x = v.to_f64();
    match reduce_2pi(x) {
        None => {
            bank.fsw |= FSW_C2;
            HelperStatus::PartialResult
        }
        Some((r, lost)) => {
            bank.fsw &= !FSW_C2;
            store_result(bank, 0, r.sin(), lost);
            bank.push(F80::from_f64(r.cos()));
            HelperStatus::Completed
        }
    }
}

/// F2XM1: ST(0) ← 2^ST(0) − 1. Defined for −1 ≤ x ≤ +1; outside that range
/// the result follows the same formula without being architecturally pinned.
pub fn f2xm1(bank: &mut FpuBank) -> HelperStatus {
    let v = match unary_operand(bank) {
        Ok(v) => v,
        Err(s) => return s,
    };
    if v.is_nan() {
        return invalid(bank, 0);
    }
    let x = v.to_f64();
    store_result(bank, 0, x.exp2() - 1.0, false);
    HelperStatus::Completed
}

/// FYL2X: ST(1) ← ST(1) · log2(ST(0)), pop.
pub fn fyl2x(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) || bank.st_is_empty(1) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    let raw_x = bank.st(0);
    let x = check_operand(bank, raw_x);
    let raw_y = bank.st(1);
    let y = check_operand(bank, raw_y);
    if x.is_nan() || y.is_nan() {
        bank.signal(FSW_IE);
        bank.st_write(1, F80::QNAN);
        bank.pop();
        return HelperStatus::InvalidOperand;
    }
    if x.sign() && !x.is_zero() {
        // log of a negative number.
        bank.signal(FSW_IE);
        bank.st_write(1, F80::QNAN);
        bank.pop();
        return HelperStatus::InvalidOperand;
    }
    if x.is_zero() {
        if y.is_zero() {
            bank.signal(FSW_IE);
            bank.st_write(1, F80::QNAN);
            bank.pop();
            return HelperStatus::InvalidOperand;
        }
        // y · log2(0) = y · −∞.
        bank.signal(FSW_ZE);
        let r = if y.sign() { F80::INFINITY } else { F80::NEG_INFINITY };
        bank.st_write(1, r);
        bank.pop();
        return HelperStatus::Completed;
    }
    let r = y.to_f64() * x.to_f64().log2();
    let rounded = round_result(bank, F80::from_f64(r), !x.is_infinity() && !y.is_infinity());
    result_cc(bank, rounded.to_f64(), bank.fsw & FSW_PE != 0);
    bank.st_write(1, rounded);
    bank.pop();
    HelperStatus::Completed
}

/// FYL2XP1: ST(1) ← ST(1) · log2(1 + ST(0)), pop.
pub fn fyl2xp1(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) || bank.st_is_empty(1) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    let raw_x = bank.st(0);
    let x = check_operand(bank, raw_x);
    let raw_y = bank.st(1);
    let y = check_operand(bank, raw_y);
    if x.is_nan() || y.is_nan() || x.to_f64() <= -1.0 {
        bank.signal(FSW_IE);
        bank.st_write(1, F80::QNAN);
        bank.pop();
        return HelperStatus::InvalidOperand;
    }
    let r = y.to_f64() * x.to_f64().ln_1p() * std::f64::consts::LOG2_E;
    let rounded = round_result(bank, F80::from_f64(r), true);
    result_cc(bank, rounded.to_f64(), bank.fsw & FSW_PE != 0);
    bank.st_write(1, rounded);
    bank.pop();
    HelperStatus::Completed
}

/// FPATAN: ST(1) ← atan2(ST(1), ST(0)), pop.
pub fn fpatan(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) || bank.st_is_empty(1) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    let raw_x = bank.st(0);
    let x = check_operand(bank, raw_x);
    let raw_y = bank.st(1);
    let y = check_operand(bank, raw_y);
    if x.is_nan() || y.is_nan() {
        bank.signal(FSW_IE);
        bank.st_write(1, F80::QNAN);
        bank.pop();
        return HelperStatus::InvalidOperand;
    }
    let r = y.to_f64().atan2(x.to_f64());
    let rounded = round_result(bank, F80::from_f64(r), true);
    result_cc(bank, rounded.to_f64(), bank.fsw & FSW_PE != 0);
    bank.st_write(1, rounded);
    bank.pop();
    HelperStatus::Completed
}

/// FSQRT.
pub fn fsqrt(bank: &mut FpuBank) -> HelperStatus {
    let v = match unary_operand(bank) {
        Ok(v) => v,
        Err(s) => return s,
    };
    match v.classify() {
        F80Class::NaN => return invalid(bank, 0),
        F80Class::Zero => {
            // ±0 → ±0 exactly.
            bank.set_cc(false, false, false, true);
            return HelperStatus::Completed;
        }
        _ => {}
    }
    if v.sign() {
        return invalid(bank, 0);
    }
    store_result(bank, 0, v.to_f64().sqrt(), false);
    HelperStatus::Completed
}

/// FPREM (`ieee = false`, truncating quotient) and FPREM1 (`ieee = true`,
/// round-to-nearest quotient). C2 = 1 signals a partial remainder; the low
/// three quotient bits land in C0/C3/C1.
pub fn fprem(bank: &mut FpuBank, ieee: bool) -> HelperStatus {
    if bank.st_is_empty(0) || bank.st_is_empty(1) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    let raw_x = bank.st(0);
    let x = check_operand(bank, raw_x);
    let raw_y = bank.st(1);
    let y = check_operand(bank, raw_y);
    if x.is_nan() || y.is_nan() || x.is_infinity() || y.is_zero() {
        return invalid(bank, 0);
    }
    let xf = x.to_f64();
    let yf = y.to_f64();
    let q = xf / yf;
    if q.abs() >= REDUCTION_LIMIT {
        // Partial reduction: bring the magnitude down without producing the
        // final quotient bits.
        let r = xf % (yf * 1e15);
        bank.fsw |= FSW_C2;
        bank.st_write(0, F80::from_f64(r));
        return HelperStatus::PartialResult;
    }
    let qi = if ieee { q.round_ties_even() } else { q.trunc() };
    let r = xf - qi * yf;
    bank.fsw &= !FSW_C2;
    let bits = (qi.abs() as u64) & 7;
    let c0 = bits & 4 != 0;
    let c3 = bits & 2 != 0;
    let c1 = bits & 1 != 0;
    bank.set_cc(c0, c1, false, c3);
    bank.st_write(0, F80::from_f64(r));
    HelperStatus::Completed
}

/// FSCALE: ST(0) ← ST(0) · 2^trunc(ST(1)).
pub fn fscale(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) || bank.st_is_empty(1) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    let raw_x = bank.st(0);
    let x = check_operand(bank, raw_x);
    let raw_s = bank.st(1);
    let s = check_operand(bank, raw_s);
    if x.is_nan() || s.is_nan() {
        return invalid(bank, 0);
    }
    let e = s.to_f64().trunc();
    let clamped = e.clamp(-32768.0, 32768.0) as i32;
    let r = libm_scalbn(x.to_f64(), clamped);
    let rounded = round_result(bank, F80::from_f64(r), !x.is_infinity());
    bank.st_write(0, rounded);
    HelperStatus::Completed
}

/// FRNDINT.
pub fn frndint(bank: &mut FpuBank) -> HelperStatus {
    let v = match unary_operand(bank) {
        Ok(v) => v,
        Err(s) => return s,
    };
    if v.is_nan() {
        return invalid(bank, 0);
    }
    let (r, inexact) = v.round_to_int(bank.rounding());
    if inexact {
        bank.signal(FSW_PE);
        bank.fsw |= FSW_C1;
    }
    bank.st_write(0, r);
    HelperStatus::Completed
}

/// FXTRACT: ST(0) ← exponent, push significand.
pub fn fxtract(bank: &mut FpuBank) -> HelperStatus {
    if bank.st_is_empty(0) {
        bank.signal(FSW_IE | FSW_SF);
        return HelperStatus::StackFault;
    }
    if bank.would_overflow(1) {
        bank.signal(FSW_IE | FSW_SF);
        bank.fsw |= FSW_C1;
        return HelperStatus::StackFault;
    }
    let v = bank.st(0);
    match v.classify() {
        F80Class::NaN => return invalid(bank, 0),
        F80Class::Zero => {
            bank.signal(FSW_ZE);
            bank.st_write(0, F80::NEG_INFINITY);
            bank.push(v);
            return HelperStatus::Completed;
        }
        _ => {}
    }
    let x = v.to_f64();
    let exponent = x.abs().log2().floor();
    let mantissa = libm_scalbn(x, -(exponent as i32));
    bank.st_write(0, F80::from_f64(exponent));
    bank.push(F80::from_f64(mantissa));
    HelperStatus::Completed
}

/// `x * 2^n` with saturation, without depending on libm.
fn libm_scalbn(x: f64, n: i32) -> f64 {
    let mut r = x;
    let mut n = n;
    while n > 1000 {
        r *= f64::from_bits(0x7fe0_0000_0000_0000); // 2^1023
        n -= 1023;
    }
    while n < -1000 {
        r *= f64::from_bits(0x0010_0000_0000_0000); // 2^-1022
        n += 1022;
    }
    r * exp2i(n)
}

fn exp2i(n: i32) -> f64 {
    if (-1022..=1023).contains(&n) {
        f64::from_bits(((n + 1023) as u64) << 52)
    } else if n > 0 {
        f64::INFINITY
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FSW_C3, FCW_IM};

    fn bank_with(values: &[f64]) -> FpuBank {
        let mut bank = FpuBank::new();
        for v in values {
            bank.push(F80::from_f64(*v));
        }
        bank
    }

    #[test]
    fn fsin_of_small_angle() {
        let mut bank = bank_with(&[std::f64::consts::FRAC_PI_6]);
        assert_eq!(fsin(&mut bank), HelperStatus::Completed);
        assert!((bank.st(0).to_f64() - 0.5).abs() < 1e-15);
        assert_eq!(bank.fsw & FSW_C2, 0);
    }

    #[test]
    fn fsin_out_of_range_sets_c2_and_keeps_operand() {
        let huge = 1e19; // beyond 2^63
        let mut bank = bank_with(&[huge]);
        assert_eq!(fsin(&mut bank), HelperStatus::PartialResult);
        assert_ne!(bank.fsw & FSW_C2, 0);
        assert_eq!(bank.st(0).to_f64(), huge);
    }

    #[test]
    fn fptan_pushes_tangent_then_one() {
        let mut bank = bank_with(&[std::f64::consts::FRAC_PI_4]);
        let top_before = bank.top();
        assert_eq!(fptan(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.top(), top_before.wrapping_sub(1) & 7);
        assert_eq!(bank.st(0).to_f64(), 1.0);
        assert!((bank.st(1).to_f64() - 1.0).abs() < 1e-15);
        assert_eq!(bank.fsw & FSW_C2, 0);
    }

    #[test]
    fn fptan_on_full_stack_faults_without_mutation() {
        let mut bank = FpuBank::new();
        bank.fcw &= !FCW_IM; // unmask invalid so the summary bit asserts
        for i in 0..8u32 {
            bank.push(F80::from_f64(f64::from(i)));
        }
        let fsw_top = bank.top();
        let before: Vec<f64> = (0..8).map(|i| bank.st(i).to_f64()).collect();
        assert_eq!(fptan(&mut bank), HelperStatus::StackFault);
        assert_ne!(bank.fsw & FSW_IE, 0);
        assert_ne!(bank.fsw & FSW_C1, 0);
        assert_ne!(bank.fsw & crate::state::FSW_ES, 0);
        assert_eq!(bank.top(), fsw_top);
        let after: Vec<f64> = (0..8).map(|i| bank.st(i).to_f64()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn fyl2x_computes_y_log2_x() {
        // ST(1) = 3.0, ST(0) = 2.0 → 3·log2(2) = 3.
        let mut bank = bank_with(&[3.0, 2.0]);
        let top_before = bank.top();
        assert_eq!(fyl2x(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.top(), top_before.wrapping_add(1) & 7);
        assert_eq!(bank.st(0).to_f64(), 3.0);
    }

    #[test]
    fn fyl2x_zero_signals_zero_divide() {
        let mut bank = bank_with(&[3.0, 0.0]);
        assert_eq!(fyl2x(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.st(0), F80::NEG_INFINITY);
        assert_ne!(bank.fsw & FSW_ZE, 0);

        let mut bank = bank_with(&[-3.0, 0.0]);
        fyl2x(&mut bank);
        assert_eq!(bank.st(0), F80::INFINITY);
    }

    #[test]
    fn fyl2x_negative_x_is_invalid() {
        let mut bank = bank_with(&[1.0, -2.0]);
        assert_eq!(fyl2x(&mut bank), HelperStatus::InvalidOperand);
        assert!(bank.st(0).is_nan());
        assert_ne!(bank.fsw & FSW_IE, 0);
    }

    #[test]
    fn fsqrt_negative_is_invalid_zero_is_exact() {
        let mut bank = bank_with(&[-4.0]);
        assert_eq!(fsqrt(&mut bank), HelperStatus::InvalidOperand);
        assert!(bank.st(0).is_nan());

        let mut bank = bank_with(&[4.0]);
        assert_eq!(fsqrt(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.st(0).to_f64(), 2.0);

        let mut bank = FpuBank::new();
        bank.push(F80::NEG_ZERO);
        assert_eq!(fsqrt(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.st(0), F80::NEG_ZERO);
        assert_ne!(bank.fsw & FSW_C3, 0);
    }

    #[test]
    fn fprem_produces_quotient_bits() {
        // 17 mod 5 = 2, quotient 3 → C1 = 1, C3 = 1, C0 = 0.
        let mut bank = bank_with(&[5.0, 17.0]);
        assert_eq!(fprem(&mut bank, false), HelperStatus::Completed);
        assert_eq!(bank.st(0).to_f64(), 2.0);
        assert_eq!(bank.fsw & FSW_C2, 0);
        assert_ne!(bank.fsw & FSW_C1, 0);
        assert_ne!(bank.fsw & FSW_C3, 0);
    }

    #[test]
    fn fscale_multiplies_by_power_of_two() {
        let mut bank = bank_with(&[3.0, 1.5]);
        assert_eq!(fscale(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.st(0).to_f64(), 12.0); // 1.5 · 2^3
        assert_eq!(bank.st(1).to_f64(), 3.0);
    }

    #[test]
    fn fxtract_splits_exponent_and_mantissa() {
        let mut bank = bank_with(&[12.0]);
        assert_eq!(fxtract(&mut bank), HelperStatus::Completed);
        assert_eq!(bank.st(0).to_f64(), 1.5); // significand
        assert_eq!(bank.st(1).to_f64(), 3.0); // exponent
    }

    #[test]
    fn f2xm1_matches_exp2() {
        let mut bank = bank_with(&[0.5]);
        assert_eq!(f2xm1(&mut bank), HelperStatus::Completed);
        assert!((bank.st(0).to_f64() - (2f64.powf(0.5) - 1.0)).abs() < 1e-15);
    }
}
