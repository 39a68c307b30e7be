// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tagged-atom scalar values.
//!
//! Every scalar on the wire is a string with a literal type tag:
//! `i:<decimal>` (integer), `q:<scale>:<signed_int>` (quantum),
//! `b64:<base64url, no padding>` (opaque bytes), `s:<NFC string>` (text).
//! Tags are compared literally — `i:1`, `q:0:1`, and `s:1` are three distinct
//! values with three distinct hashes. Floats, NaN, infinities, and scientific
//! notation never parse.

use num_bigint::BigInt;
use num_traits::Signed;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::quantum::{parse_canonical_int, pow10, DebtUnit, SCALE};

/// Errors produced while decoding tagged atoms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// The atom carried no recognized tag.
    #[error("unknown value tag")]
    UnknownTag,
    /// The tag was recognized but the body was malformed.
    #[error("malformed {0} atom")]
    MalformedBody(&'static str),
}

/// A type-tagged scalar value.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
    /// Arbitrary-precision integer (`i:` tag).
    Int(BigInt),
    /// Fixed-scale quantum (`q:<scale>:` tag).
    Quantum(DebtUnit),
    /// Opaque bytes (`b64:` tag, URL-safe alphabet, no padding).
    Bytes(Vec<u8>),
    /// NFC-normalized Unicode text (`s:` tag).
    Str(String),
}

impl Value {
    /// Builds a text atom, applying NFC normalization.
    pub fn text(s: impl AsRef<str>) -> Self {
        Self::Str(s.as_ref().nfc().collect())
    }

    /// Builds an integer atom.
    pub fn int(i: impl Into<BigInt>) -> Self {
        Self::Int(i.into())
    }

    /// Parses an atom from its tagged wire form.
    pub fn from_wire(s: &str) -> Result<Self, ValueError> {
        if let Some(body) = s.strip_prefix("i:") {
            let int =
                parse_canonical_int(body).ok_or(ValueError::MalformedBody("i:"))?;
            return Ok(Self::Int(int));
        }
        if s.starts_with("q:") {
            let q = DebtUnit::from_wire(s).map_err(|_| ValueError::MalformedBody("q:"))?;
            return Ok(Self::Quantum(q));
        }
        if let Some(body) = s.strip_prefix("b64:") {
            let bytes = URL_SAFE_NO_PAD
                .decode(body)
                .map_err(|_| ValueError::MalformedBody("b64:"))?;
            // Round-trip guard: the alphabet admits multiple encodings of the
            // final partial group; only the canonical one is accepted.
            if URL_SAFE_NO_PAD.encode(&bytes) != body {
                return Err(ValueError::MalformedBody("b64:"));
            }
            return Ok(Self::Bytes(bytes));
        }
        if let Some(body) = s.strip_prefix("s:") {
            if body.nfc().ne(body.chars()) {
                return Err(ValueError::MalformedBody("s:"));
            }
            return Ok(Self::Str(body.to_owned()));
        }
        Err(ValueError::UnknownTag)
    }

    /// Canonical tagged wire form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Int(i) => format!("i:{i}"),
            Self::Quantum(q) => q.to_wire(),
            Self::Bytes(b) => format!("b64:{}", URL_SAFE_NO_PAD.encode(b)),
            Self::Str(s) => format!("s:{s}"),
        }
    }

    /// Raw scale-6 numeric magnitude of this atom, when it has one.
    ///
    /// Integers are lifted to the chain scale (`n · 10^6`); quanta must
    /// already be at the chain scale. Bytes and text are non-numeric.
    #[must_use]
    pub fn numeric_raw(&self) -> Option<BigInt> {
        match self {
            Self::Int(i) => Some(i * pow10(SCALE)),
            Self::Quantum(q) if q.scale() == SCALE => Some(q.int_value().clone()),
            Self::Quantum(_) | Self::Bytes(_) | Self::Str(_) => None,
        }
    }

    /// True for numeric atoms that are strictly positive.
    #[must_use]
    pub fn is_strictly_positive(&self) -> bool {
        self.numeric_raw().is_some_and(|raw| raw.is_positive())
    }
}
