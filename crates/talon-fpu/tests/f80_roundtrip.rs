use proptest::prelude::*;

use talon_fpu::f80::{Precision, Rounding};
use talon_fpu::{F80, F80Class, FpuBank};

proptest! {
    /// Every f64 survives f64 → f80 → f64 bit-exactly (NaN excepted: only
    /// NaN-ness is preserved).
    #[test]
    fn f64_f80_f64_round_trip(bits in any::<u64>()) {
        let v = f64::from_bits(bits);
        let f = F80::from_f64(v);
        let back = f.to_f64();
        if v.is_nan() {
            prop_assert!(back.is_nan());
        } else {
            prop_assert_eq!(back.to_bits(), v.to_bits());
        }
    }

    /// At double precision control, f80 → f64 → f80 is the identity on
    /// values that originated from doubles.
    #[test]
    fn f80_double_precision_idempotent(bits in any::<u64>()) {
        let v = f64::from_bits(bits);
        prop_assume!(!v.is_nan());
        let f = F80::from_f64(v);
        let (once, _) = f.apply_precision(Precision::Double);
        let (twice, inexact) = once.apply_precision(Precision::Double);
        prop_assert_eq!(once, twice);
        prop_assert!(!inexact);
    }

    /// Precision control is idempotent at single precision too.
    #[test]
    fn f80_single_precision_idempotent(bits in any::<u32>()) {
        let v = f64::from(f32::from_bits(bits));
        prop_assume!(!v.is_nan());
        let f = F80::from_f64(v);
        let (once, inexact) = f.apply_precision(Precision::Single);
        prop_assert!(!inexact, "f32-representable value must not round");
        prop_assert_eq!(once, f);
    }

    /// Push/pop sequences keep top in 0..8 and the tag word coherent with
    /// the per-slot classification.
    #[test]
    fn stack_discipline_keeps_tags_coherent(ops in prop::collection::vec(any::<bool>(), 1..64)) {
        let mut bank = FpuBank::new();
        for (i, push) in ops.iter().enumerate() {
            if *push {
                bank.push(F80::from_f64(i as f64));
            } else {
                let _ = bank.pop();
            }
            prop_assert!(bank.top() < 8);
            for slot in 0..8u8 {
                let tag = bank.tag(slot);
                if tag != talon_fpu::Tag::Empty {
                    let derived = talon_fpu::Tag::derive(&bank.slot(slot));
                    prop_assert_eq!(tag, derived);
                }
            }
        }
    }
}

#[test]
fn fixed_class_round_trips() {
    // The spec's enumerated classes: ±0, ±normal, ±∞, QNaN.
    let cases = [
        F80::ZERO,
        F80::NEG_ZERO,
        F80::ONE,
        F80::ONE.neg(),
        F80::PI,
        F80::PI.neg(),
        F80::INFINITY,
        F80::NEG_INFINITY,
    ];
    for v in cases {
        // Equality is at the precision of the control word: the double trip
        // must match the value once rounded to double precision.
        let back = F80::from_f64(v.to_f64());
        let reference = v.apply_precision(Precision::Double).0;
        assert_eq!(back, reference, "{v:?}");
    }
    assert!(F80::from_f64(F80::QNAN.to_f64()).is_nan());
}

#[test]
fn rounding_control_direction() {
    let v = F80::from_f64(1.25);
    assert_eq!(v.round_to_int(Rounding::Down).0.to_f64(), 1.0);
    assert_eq!(v.round_to_int(Rounding::Up).0.to_f64(), 2.0);
    assert_eq!(v.round_to_int(Rounding::Zero).0.to_f64(), 1.0);
    assert_eq!(v.round_to_int(Rounding::Nearest).0.to_f64(), 1.0);
}

#[test]
fn denormal_class_detected() {
    let d = F80::from_parts(false, 0, 1);
    assert_eq!(d.classify(), F80Class::Denormal);
}
