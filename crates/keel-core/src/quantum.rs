// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Exact signed fixed-scale quantum arithmetic (DebtUnit).
//!
//! A [`DebtUnit`] is a signed unbounded integer paired with a fixed decimal
//! scale: `real_value = int / 10^scale`. The chain-wide scale is [`SCALE`]
//! (= 6); other scales exist only so wire atoms like `q:0:1` keep their
//! identity through canonicalization.
//!
//! Determinism contract
//! - All arithmetic is exact `BigInt`; overflow cannot occur.
//! - Every quantization boundary rounds half-even (ties to even quotient).
//! - Addition, subtraction, and comparison require identical scales; mixing
//!   scales is a caller error surfaced as [`QuantumError::ScaleMismatch`].
//! - NaN, infinities, and scientific notation never parse.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, Zero};
use thiserror::Error;

/// Chain-wide decimal scale for authoritative quantities.
pub const SCALE: u32 = 6;

/// Errors produced by quantum construction and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantumError {
    /// Two operands carried different scales.
    #[error("scale mismatch: {0} vs {1}")]
    ScaleMismatch(u32, u32),
    /// Division or rational construction with a zero denominator.
    #[error("zero denominator")]
    ZeroDenominator,
    /// `div_int` requires a strictly positive divisor.
    #[error("non-positive divisor")]
    NonPositiveDivisor,
    /// The input string was not a canonical quantum literal.
    #[error("malformed quantum literal")]
    MalformedLiteral,
    /// A decimal string could not be represented exactly at the target scale.
    #[error("decimal not exact at scale {0}")]
    Inexact(u32),
    /// A field declared nonnegative was constructed with a negative value.
    #[error("negative value for nonnegative field")]
    NegativeForbidden,
}

/// Exact signed quantity at a fixed decimal scale.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DebtUnit {
    int: BigInt,
    scale: u32,
}

impl DebtUnit {
    /// Builds a quantum from a raw integer at an explicit scale.
    pub fn new(int: BigInt, scale: u32) -> Self {
        Self { int, scale }
    }

    /// Zero at the chain-wide scale.
    pub fn zero() -> Self {
        Self::new(BigInt::zero(), SCALE)
    }

    /// Builds a quantum from a raw `i64` at the chain-wide scale.
    pub fn from_raw(raw: i64) -> Self {
        Self::new(BigInt::from(raw), SCALE)
    }

    /// Raw integer value (numerator at `10^scale`).
    #[must_use]
    pub fn int_value(&self) -> &BigInt {
        &self.int
    }

    /// The decimal scale of this quantum.
    #[must_use]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// True when the value is negative.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.int.is_negative()
    }

    /// True when the value is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.int.is_zero()
    }

    /// Negation.
    #[must_use]
    pub fn neg(&self) -> Self {
        Self::new(-&self.int, self.scale)
    }

    /// Absolute value.
    #[must_use]
    pub fn abs(&self) -> Self {
        Self::new(self.int.abs(), self.scale)
    }

    /// Checked addition; scales must match.
    pub fn checked_add(&self, other: &Self) -> Result<Self, QuantumError> {
        self.require_scale(other)?;
        Ok(Self::new(&self.int + &other.int, self.scale))
    }

    /// Checked subtraction; scales must match.
    pub fn checked_sub(&self, other: &Self) -> Result<Self, QuantumError> {
        self.require_scale(other)?;
        Ok(Self::new(&self.int - &other.int, self.scale))
    }

    /// Multiplication by an integer.
    #[must_use]
    pub fn mul_int(&self, k: &BigInt) -> Self {
        Self::new(&self.int * k, self.scale)
    }

    /// Division by a strictly positive integer with half-even rounding.
    ///
    /// Let `(quot, rem) = divmod(int, k)` (truncated). If `2·|rem| > k` the
    /// quotient moves away from zero; on a tie it moves only when odd
    /// (toward even).
    pub fn div_int(&self, k: &BigInt) -> Result<Self, QuantumError> {
        if !k.is_positive() {
            return Err(QuantumError::NonPositiveDivisor);
        }
        Ok(Self::new(div_half_even(&self.int, k), self.scale))
    }

    /// Product of two quanta at the same scale, rescaled back half-even.
    pub fn mul_quantum(&self, other: &Self) -> Result<Self, QuantumError> {
        self.require_scale(other)?;
        let product = &self.int * &other.int;
        let divisor = pow10(self.scale);
        Ok(Self::new(div_half_even(&product, &divisor), self.scale))
    }

    /// Total order between two quanta at the same scale.
    pub fn checked_cmp(&self, other: &Self) -> Result<std::cmp::Ordering, QuantumError> {
        self.require_scale(other)?;
        Ok(self.int.cmp(&other.int))
    }

    /// Constructs from a rational `p/q`: reduce by gcd, then round
    /// `p·10^scale / q` half-even.
    pub fn from_rational(p: &BigInt, q: &BigInt, scale: u32) -> Result<Self, QuantumError> {
        if q.is_zero() {
            return Err(QuantumError::ZeroDenominator);
        }
        // Normalize sign into the numerator, then reduce.
        let (mut p, mut q) = if q.is_negative() {
            (-p, -q)
        } else {
            (p.clone(), q.clone())
        };
        let g = p.gcd(&q);
        if !g.is_zero() {
            p /= &g;
            q /= &g;
        }
        let scaled = &p * pow10(scale);
        Ok(Self::new(div_half_even(&scaled, &q), scale))
    }

    /// Parses the canonical wire form `q:<scale>:<signed_int>`.
    pub fn from_wire(s: &str) -> Result<Self, QuantumError> {
        let body = s.strip_prefix("q:").ok_or(QuantumError::MalformedLiteral)?;
        let (scale_str, int_str) = body
            .split_once(':')
            .ok_or(QuantumError::MalformedLiteral)?;
        let scale = parse_canonical_u32(scale_str).ok_or(QuantumError::MalformedLiteral)?;
        let int = parse_canonical_int(int_str).ok_or(QuantumError::MalformedLiteral)?;
        Ok(Self::new(int, scale))
    }

    /// Canonical wire form `q:<scale>:<signed_int>`.
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("q:{}:{}", self.scale, self.int)
    }

    /// Parses a plain decimal string exactly at the given scale.
    ///
    /// `"1.5"` at scale 6 is `q:6:1500000`. Digits beyond the scale must be
    /// zero or the parse rejects; exponents, NaN, and infinities never parse.
    pub fn parse_decimal(s: &str, scale: u32) -> Result<Self, QuantumError> {
        if s.is_empty() {
            return Err(QuantumError::MalformedLiteral);
        }
        let (sign, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((_, "")) => return Err(QuantumError::MalformedLiteral),
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty()
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(QuantumError::MalformedLiteral);
        }
        if int_part.len() > 1 && int_part.starts_with('0') {
            return Err(QuantumError::MalformedLiteral);
        }
        let scale_usize = scale as usize;
        if frac_part.len() > scale_usize && frac_part[scale_usize..].bytes().any(|b| b != b'0') {
            return Err(QuantumError::Inexact(scale));
        }
        let kept = &frac_part[..frac_part.len().min(scale_usize)];
        let mut raw = int_part.to_owned();
        raw.push_str(kept);
        for _ in kept.len()..scale_usize {
            raw.push('0');
        }
        let mut int: BigInt = raw.parse().map_err(|_| QuantumError::MalformedLiteral)?;
        if sign {
            int = -int;
        }
        if sign && int.is_zero() {
            return Err(QuantumError::MalformedLiteral);
        }
        Ok(Self::new(int, scale))
    }

    /// Rejects negative values; used for fields declared nonnegative.
    pub fn require_nonnegative(&self) -> Result<(), QuantumError> {
        if self.is_negative() {
            return Err(QuantumError::NegativeForbidden);
        }
        Ok(())
    }

    fn require_scale(&self, other: &Self) -> Result<(), QuantumError> {
        if self.scale != other.scale {
            return Err(QuantumError::ScaleMismatch(self.scale, other.scale));
        }
        Ok(())
    }
}

/// `10^scale` as a `BigInt`.
pub fn pow10(scale: u32) -> BigInt {
    BigInt::from(10u32).pow(scale)
}

/// Half-even division of `n` by strictly positive `k`.
///
/// Truncated `divmod`, then: move the quotient away from zero when
/// `2·|rem| > k`; on a tie, move only when the quotient is odd.
pub fn div_half_even(n: &BigInt, k: &BigInt) -> BigInt {
    debug_assert!(k.is_positive());
    let (quot, rem) = n.div_rem(k);
    let twice: BigInt = rem.abs() * 2;
    let away = match twice.cmp(k) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => quot.is_odd(),
        std::cmp::Ordering::Less => false,
    };
    if !away {
        return quot;
    }
    if n.is_negative() {
        quot - 1
    } else {
        quot + 1
    }
}

/// Parses a canonical base-10 integer literal: optional `-`, no `+`, no
/// leading zeros (other than the literal `0`), and no `-0`.
pub fn parse_canonical_int(s: &str) -> Option<BigInt> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    if neg && digits == "0" {
        return None;
    }
    let mut int: BigInt = digits.parse().ok()?;
    if neg {
        int = -int;
    }
    Some(int)
}

/// Parses a canonical nonnegative `u32` literal (no sign, no leading zeros).
pub fn parse_canonical_u32(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}
