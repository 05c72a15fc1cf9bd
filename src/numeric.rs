//! Opaque arbitrary-precision numeric library (§1's "out of scope,
//! treated as an opaque numeric library exposing add/sub/mul/div/pow/mod,
//! comparisons, and base-10 conversion").
//!
//! The core pipeline never inspects the representation directly; it only
//! calls through this module's API, so the real implementation could be
//! swapped for a different bignum crate without touching the VM or
//! compiler.

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};

/// A tagged numeric value: either an arbitrary-precision integer or an
/// IEEE-754 double. Integer arithmetic never overflows into silent
/// wraparound (§3: "integer x integer produces big-int").
#[derive(Debug, Clone, PartialEq)]
pub enum Num {
    Int(BigInt),
    Float(f64),
}

impl Num {
    pub fn from_i64(v: i64) -> Self {
        Num::Int(BigInt::from(v))
    }

    pub fn from_f64(v: f64) -> Self {
        Num::Float(v)
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Num::Int(i) => i.is_zero(),
            Num::Float(f) => *f == 0.0,
        }
    }

    pub fn to_f64(&self) -> f64 {
        match self {
            Num::Int(i) => i.to_f64().unwrap_or(f64::NAN),
            Num::Float(f) => *f,
        }
    }

    fn promote(a: &Num, b: &Num) -> bool {
        matches!(a, Num::Float(_)) || matches!(b, Num::Float(_))
    }

    pub fn add(&self, other: &Num) -> Num {
        if Self::promote(self, other) {
            Num::Float(self.to_f64() + other.to_f64())
        } else {
            let (Num::Int(a), Num::Int(b)) = (self, other) else {
                unreachable!()
            };
            Num::Int(a + b)
        }
    }

    pub fn sub(&self, other: &Num) -> Num {
        if Self::promote(self, other) {
            Num::Float(self.to_f64() - other.to_f64())
        } else {
            let (Num::Int(a), Num::Int(b)) = (self, other) else {
                unreachable!()
            };
            Num::Int(a - b)
        }
    }

    pub fn mul(&self, other: &Num) -> Num {
        if Self::promote(self, other) {
            Num::Float(self.to_f64() * other.to_f64())
        } else {
            let (Num::Int(a), Num::Int(b)) = (self, other) else {
                unreachable!()
            };
            Num::Int(a * b)
        }
    }

    /// Integer division truncates toward zero; float division follows
    /// IEEE-754. Division by zero on integers returns `None` so the VM
    /// can raise a runtime error rather than panicking.
    pub fn div(&self, other: &Num) -> Option<Num> {
        if Self::promote(self, other) {
            Some(Num::Float(self.to_f64() / other.to_f64()))
        } else {
            let (Num::Int(a), Num::Int(b)) = (self, other) else {
                unreachable!()
            };
            if b.is_zero() {
                None
            } else {
                Some(Num::Int(a / b))
            }
        }
    }

    pub fn modulo(&self, other: &Num) -> Option<Num> {
        if Self::promote(self, other) {
            Some(Num::Float(self.to_f64().rem_euclid(other.to_f64())))
        } else {
            let (Num::Int(a), Num::Int(b)) = (self, other) else {
                unreachable!()
            };
            if b.is_zero() {
                None
            } else {
                Some(Num::Int(a.div_mod_floor(b).1))
            }
        }
    }

    /// `self ^ other`. Negative integer exponents promote to float.
    pub fn pow(&self, other: &Num) -> Num {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) if !b.is_negative() => {
                match b.to_u32() {
                    Some(exp) => Num::Int(a.pow(exp)),
                    None => Num::Float(self.to_f64().powf(other.to_f64())),
                }
            }
            _ => Num::Float(self.to_f64().powf(other.to_f64())),
        }
    }

    pub fn compare(&self, other: &Num) -> Ordering {
        if Self::promote(self, other) {
            self.to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal)
        } else {
            let (Num::Int(a), Num::Int(b)) = (self, other) else {
                unreachable!()
            };
            a.cmp(b)
        }
    }

    pub fn to_decimal_string(&self) -> String {
        match self {
            Num::Int(i) => i.to_string(),
            Num::Float(f) => f.to_string(),
        }
    }

    /// Rounds a float value to the active micro-frame's decimal-digit
    /// precision (§3 "Precision blocks"); integers are exact and pass
    /// through unchanged.
    pub fn round_to_digits(&self, digits: i64) -> Num {
        match self {
            Num::Int(_) => self.clone(),
            Num::Float(f) => {
                let digits = digits.clamp(0, 17) as i32;
                let factor = 10f64.powi(digits);
                Num::Float((f * factor).round() / factor)
            }
        }
    }
}

trait ToU32Checked {
    fn to_u32(&self) -> Option<u32>;
}

impl ToU32Checked for BigInt {
    fn to_u32(&self) -> Option<u32> {
        ToPrimitive::to_u32(self)
    }
}

impl fmt::Display for Num {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_stays_exact() {
        let a = Num::from_i64(1);
        let b = Num::from_i64(2);
        let c = Num::from_i64(3);
        let result = a.add(&b.mul(&c));
        assert_eq!(result.to_decimal_string(), "7");
    }

    #[test]
    fn division_by_zero_is_none() {
        let a = Num::from_i64(10);
        let z = Num::from_i64(0);
        assert!(a.div(&z).is_none());
    }

    #[test]
    fn float_promotes_across_mixed_ops() {
        let a = Num::from_i64(1);
        let b = Num::from_f64(0.5);
        match a.add(&b) {
            Num::Float(f) => assert_eq!(f, 1.5),
            _ => panic!("expected float promotion"),
        }
    }

    #[test]
    fn big_int_handles_values_beyond_i64() {
        let big = Num::Int(BigInt::from(i64::MAX) * BigInt::from(4));
        let doubled = big.add(&big);
        assert_eq!(
            doubled,
            Num::Int(BigInt::from(i64::MAX) * BigInt::from(8))
        );
    }

    #[test]
    fn comparisons_order_integers() {
        assert_eq!(Num::from_i64(1).compare(&Num::from_i64(2)), Ordering::Less);
        assert_eq!(
            Num::from_i64(500500).compare(&Num::from_i64(500500)),
            Ordering::Equal
        );
    }
}
