//! 80-bit extended-precision format: a 64-bit significand with an explicit
//! integer bit (bytes 0..8, little-endian) and a sign + 15-bit exponent word
//! (bytes 8..10).

/// One x87 register image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct F80(pub [u8; 10]);

/// Classification of an 80-bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F80Class {
    Zero,
    Normal,
    Denormal,
    /// Nonzero exponent with a clear integer bit; produced by the MMX
    /// aliasing rewrite, invalid as an x87 operand.
    Unnormal,
    Infinity,
    NaN,
}

/// Rounding control field values (FCW bits 10..11, MXCSR bits 13..14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Nearest = 0,
    Down = 1,
    Up = 2,
    Zero = 3,
}

impl Rounding {
    #[must_use]
    pub fn from_bits(bits: u16) -> Rounding {
        match bits & 3 {
            0 => Rounding::Nearest,
            1 => Rounding::Down,
            2 => Rounding::Up,
            _ => Rounding::Zero,
        }
    }
}

/// Precision control field values (FCW bits 8..9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Single = 0,
    Double = 2,
    Extended = 3,
}

impl Precision {
    #[must_use]
    pub fn from_bits(bits: u16) -> Precision {
        match bits & 3 {
            0 => Precision::Single,
            2 => Precision::Double,
            _ => Precision::Extended,
        }
    }
}

const EXP_BIAS: i32 = 16383;
const EXP_MAX: u16 = 0x7fff;

impl F80 {
    pub const ZERO: F80 = F80::from_parts(false, 0, 0);
    pub const NEG_ZERO: F80 = F80::from_parts(true, 0, 0);
    pub const ONE: F80 = F80::from_parts(false, 0x3fff, 0x8000_0000_0000_0000);
    pub const INFINITY: F80 = F80::from_parts(false, EXP_MAX, 0x8000_0000_0000_0000);
    pub const NEG_INFINITY: F80 = F80::from_parts(true, EXP_MAX, 0x8000_0000_0000_0000);
    /// The indefinite QNaN the FPU substitutes on invalid operations.
    pub const QNAN: F80 = F80::from_parts(true, EXP_MAX, 0xc000_0000_0000_0000);

    // x87 constant-load images.
    pub const PI: F80 = F80::from_parts(false, 0x4000, 0xc90f_daa2_2168_c235);
    pub const PI_2: F80 = F80::from_parts(false, 0x3fff, 0xc90f_daa2_2168_c235);
    pub const PI_4: F80 = F80::from_parts(false, 0x3ffe, 0xc90f_daa2_2168_c235);
    pub const L2T: F80 = F80::from_parts(false, 0x4000, 0xd49a_784b_cd1b_8afe);
    pub const L2E: F80 = F80::from_parts(false, 0x3fff, 0xb8aa_3b29_5c17_f0bc);
    pub const LG2: F80 = F80::from_parts(false, 0x3ffd, 0x9a20_9a84_fbcf_f799);
    pub const LN2: F80 = F80::from_parts(false, 0x3ffe, 0xb172_17f7_d1cf_79ac);

    #[must_use]
    pub const fn from_parts(sign: bool, exponent: u16, significand: u64) -> F80 {
        let se = ((sign as u16) << 15) | (exponent & EXP_MAX);
        let s = significand.to_le_bytes();
        let e = se.to_le_bytes();
        F80([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7], e[0], e[1]])
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 10]) -> F80 {
        F80(bytes)
    }

    #[must_use]
    pub fn bytes(&self) -> [u8; 10] {
        self.0
    }

    #[must_use]
    pub fn significand(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }

    #[must_use]
    pub fn biased_exponent(&self) -> u16 {
        u16::from_le_bytes([self.0[8], self.0[9]]) & EXP_MAX
    }

    #[must_use]
    pub fn sign(&self) -> bool {
        self.0[9] & 0x80 != 0
    }

    #[must_use]
    pub fn classify(&self) -> F80Class {
        let exp = self.biased_exponent();
        let sig = self.significand();
        let int_bit = sig & (1 << 63) != 0;
        if exp == EXP_MAX {
            if sig << 1 == 0 {
                F80Class::Infinity
            } else {
                F80Class::NaN
            }
        } else if exp == 0 {
            if sig == 0 {
                F80Class::Zero
            } else {
                F80Class::Denormal
            }
        } else if !int_bit {
            F80Class::Unnormal
        } else {
            F80Class::Normal
        }
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        self.classify() == F80Class::NaN
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.classify() == F80Class::Zero
    }

    #[must_use]
    pub fn is_infinity(&self) -> bool {
        self.classify() == F80Class::Infinity
    }

    /// Lossless conversion from a host double: every f64 is representable.
    #[must_use]
    pub fn from_f64(v: f64) -> F80 {
        let bits = v.to_bits();
        let sign = bits >> 63 != 0;
        let exp = ((bits >> 52) & 0x7ff) as i32;
        let frac = bits & ((1u64 << 52) - 1);
        match exp {
            0x7ff => {
                if frac == 0 {
                    F80::from_parts(sign, EXP_MAX, 0x8000_0000_0000_0000)
                } else {
                    // Preserve the payload, force quiet.
                    F80::from_parts(sign, EXP_MAX, 0xc000_0000_0000_0000 | (frac << 11))
                }
            }
            0 => {
                if frac == 0 {
                    F80::from_parts(sign, 0, 0)
                } else {
                    // f64 subnormal: value = frac * 2^-1074; normal in f80.
                    let n = 63 - frac.leading_zeros() as i32;
                    let sig = frac << (63 - n);
                    let e = -1074 + n + EXP_BIAS;
                    F80::from_parts(sign, e as u16, sig)
                }
            }
            _ => {
                let sig = (1u64 << 63) | (frac << 11);
                let e = exp - 1023 + EXP_BIAS;
                F80::from_parts(sign, e as u16, sig)
            }
        }
    }

    /// Conversion to a host double, rounding to nearest-even. Values outside
    /// the f64 range become infinity or (signed) zero.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        let sign = if self.sign() { -1.0f64 } else { 1.0f64 };
        let exp = self.biased_exponent();
        let sig = self.significand();
        match self.classify() {
            F80Class::Zero => sign * 0.0,
            F80Class::NaN => f64::NAN,
            F80Class::Infinity => sign * f64::INFINITY,
            F80Class::Denormal => {
                // Far below the f64 subnormal range; underflows to zero.
                sign * 0.0
            }
            F80Class::Normal | F80Class::Unnormal => {
                let e2 = i32::from(exp) - EXP_BIAS - 63;
                sign * scale_u64(sig, e2)
            }
        }
    }

    #[must_use]
    pub fn neg(&self) -> F80 {
        let mut b = self.0;
        b[9] ^= 0x80;
        F80(b)
    }

    #[must_use]
    pub fn abs(&self) -> F80 {
        let mut b = self.0;
        b[9] &= 0x7f;
        F80(b)
    }

    /// Rounds the value to the given precision-control mantissa width by a
    /// trip through the matching IEEE binary format. Returns the rounded
    /// value and whether precision was lost. Extended precision is identity.
    #[must_use]
    pub fn apply_precision(&self, pc: Precision) -> (F80, bool) {
        match pc {
            Precision::Extended => (*self, false),
            Precision::Double => {
                let d = self.to_f64();
                let back = F80::from_f64(d);
                let inexact = !self.is_nan() && back != *self;
                (back, inexact)
            }
            Precision::Single => {
                let s = self.to_f64() as f32;
                let back = F80::from_f64(f64::from(s));
                let inexact = !self.is_nan() && back != *self;
                (back, inexact)
            }
        }
    }

    /// Rounds to an integral value under the given rounding control.
    #[must_use]
    pub fn round_to_int(&self, rc: Rounding) -> (F80, bool) {
        match self.classify() {
            F80Class::Zero | F80Class::Infinity | F80Class::NaN => (*self, false),
            _ => {
                let v = self.to_f64();
                let r = match rc {
                    Rounding::Nearest => round_half_even(v),
                    Rounding::Down => v.floor(),
                    Rounding::Up => v.ceil(),
                    Rounding::Zero => v.trunc(),
                };
                (F80::from_f64(r), r != v)
            }
        }
    }
}

/// `sig * 2^e2` without intermediate overflow for in-range results.
fn scale_u64(sig: u64, e2: i32) -> f64 {
    // Split the exponent application so the intermediate stays finite.
    let base = sig as f64;
    if (-1022..=1023).contains(&e2) {
        base * pow2(e2)
    } else if e2 < 0 {
        // Underflow toward the f64 subnormal range: apply in two steps.
        base * pow2(-1022) * pow2(e2 + 1022)
    } else {
        base * pow2(1023) * pow2(e2 - 1023)
    }
}

fn pow2(e: i32) -> f64 {
    if e >= -1022 && e <= 1023 {
        f64::from_bits(((e + 1023) as u64) << 52)
    } else if e < -1022 {
        // Subnormal power of two, or zero below 2^-1074.
        if e < -1074 {
            0.0
        } else {
            f64::from_bits(1u64 << (e + 1074))
        }
    } else {
        f64::INFINITY
    }
}

/// Round-half-to-even in the absence of a host rounding-mode switch.
fn round_half_even(v: f64) -> f64 {
    let floor = v.floor();
    let diff = v - floor;
    if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 {
        floor
    } else if (floor as i64) % 2 == 0 {
        floor
    } else {
        floor + 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_classify_as_expected() {
        assert_eq!(F80::ZERO.classify(), F80Class::Zero);
        assert_eq!(F80::ONE.classify(), F80Class::Normal);
        assert_eq!(F80::PI.classify(), F80Class::Normal);
        assert_eq!(F80::INFINITY.classify(), F80Class::Infinity);
        assert_eq!(F80::QNAN.classify(), F80Class::NaN);
    }

    #[test]
    fn f64_round_trip_exact_values() {
        for v in [0.0, -0.0, 1.0, -1.0, 0.5, 1234.5678, f64::MIN_POSITIVE, 1e300] {
            let f = F80::from_f64(v);
            assert_eq!(f.to_f64().to_bits(), v.to_bits(), "value {v}");
        }
    }

    #[test]
    fn subnormal_f64_becomes_normal_f80() {
        let tiny = f64::from_bits(1); // smallest positive subnormal
        let f = F80::from_f64(tiny);
        assert_eq!(f.classify(), F80Class::Normal);
        assert_eq!(f.to_f64(), tiny);
    }

    #[test]
    fn pi_matches_host_double() {
        assert_eq!(F80::PI.to_f64(), std::f64::consts::PI);
        assert_eq!(F80::LN2.to_f64(), std::f64::consts::LN_2);
        assert_eq!(F80::L2E.to_f64(), std::f64::consts::LOG2_E);
    }

    #[test]
    fn precision_control_single_rounds() {
        let v = F80::from_f64(1.0 + f64::EPSILON);
        let (rounded, inexact) = v.apply_precision(Precision::Single);
        assert!(inexact);
        assert_eq!(rounded.to_f64(), 1.0);
        let (same, inexact) = v.apply_precision(Precision::Extended);
        assert!(!inexact);
        assert_eq!(same, v);
    }

    #[test]
    fn round_to_int_honours_rounding_control() {
        let v = F80::from_f64(2.5);
        assert_eq!(v.round_to_int(Rounding::Nearest).0.to_f64(), 2.0);
        assert_eq!(v.round_to_int(Rounding::Down).0.to_f64(), 2.0);
        assert_eq!(v.round_to_int(Rounding::Up).0.to_f64(), 3.0);
        let n = F80::from_f64(-2.5);
        assert_eq!(n.round_to_int(Rounding::Zero).0.to_f64(), -2.0);
        assert_eq!(n.round_to_int(Rounding::Down).0.to_f64(), -3.0);
    }

    #[test]
    fn unnormal_pattern_detected() {
        // Nonzero exponent, integer bit clear: the MMX rewrite shape.
        let u = F80::from_parts(false, 0x7fff - 1, 0x1234);
        assert_eq!(u.classify(), F80Class::Unnormal);
    }
}
