// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Curvature matrix registry.
//!
//! A curvature matrix is a symmetric nonnegative N×N rational matrix indexed
//! by block, stored sparsely as reduced upper-triangle entries. The canonical
//! JSON form mandates a fixed, non-alphabetical top-level field order
//! (`matrix_id, version, entry_mode, symmetry_mode, domain_mode, block_count,
//! entries`) and per-entry order (`i, j, num, den`), so this module writes
//! its canonical bytes by hand instead of going through the sorted-map
//! serializer. Numerators and denominators are canonical base-10 strings on
//! the wire; block indices and counts are plain JSON integers.
//!
//! Validation is a single strict pass: any asymmetry (lower-triangle entry),
//! negative numerator, nonpositive denominator, unreduced fraction, explicit
//! zero, out-of-range index, duplicate or unsorted cell, or unknown field
//! rejects the whole matrix.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use num_integer::Integer;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};
use thiserror::Error;

use crate::ident::{sha3_256, Hash};

/// Entry-mode id for sparse upper-triangle storage.
pub const ENTRY_MODE_UPPER_SPARSE: &str = "upper_triangle.sparse.v1";
/// Symmetry-mode id: entries mirror across the diagonal.
pub const SYMMETRY_MODE_SYMMETRIC: &str = "symmetric.v1";
/// Domain-mode id: all entries are nonnegative.
pub const DOMAIN_MODE_NONNEG: &str = "nonneg.v1";

/// One stored upper-triangle cell, as a reduced nonnegative rational.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MatrixEntry {
    /// Row block index (`i ≤ j`).
    pub i: u32,
    /// Column block index.
    pub j: u32,
    /// Reduced numerator (`num > 0` for stored cells).
    pub num: BigInt,
    /// Reduced denominator (`den > 0`).
    pub den: BigInt,
}

/// A validated curvature matrix.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CurvatureMatrix {
    /// Registry key.
    pub matrix_id: String,
    /// Version id pinned by the policy bundle.
    pub version: String,
    /// Number of blocks (the matrix is `block_count × block_count`).
    pub block_count: u32,
    /// Stored upper-triangle cells, sorted by `(i, j)`.
    pub entries: Vec<MatrixEntry>,
}

/// Rejections produced while validating a curvature matrix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CurvatureError {
    /// A cell appeared with `i > j`.
    #[error("lower-triangle entry at ({0},{1})")]
    LowerTriangleEntry(u32, u32),
    /// A numerator was negative.
    #[error("negative numerator at ({0},{1})")]
    NegativeNumerator(u32, u32),
    /// A denominator was zero or negative.
    #[error("nonpositive denominator at ({0},{1})")]
    NonpositiveDenominator(u32, u32),
    /// `gcd(num, den) != 1`.
    #[error("unreduced fraction at ({0},{1})")]
    Unreduced(u32, u32),
    /// A stored cell was zero; sparse mode stores nonzero cells only.
    #[error("explicit zero entry at ({0},{1})")]
    ExplicitZero(u32, u32),
    /// A block index was out of `0..block_count`.
    #[error("block index out of range at ({0},{1})")]
    IndexOutOfRange(u32, u32),
    /// Cells were out of `(i,j)` order or duplicated.
    #[error("entries not strictly sorted at ({0},{1})")]
    UnsortedEntries(u32, u32),
    /// The matrix id was empty.
    #[error("empty matrix id")]
    EmptyMatrixId,
    /// Lookup of an unregistered matrix id.
    #[error("unknown matrix id: {0}")]
    UnknownMatrix(String),
    /// A matrix id was registered twice.
    #[error("duplicate matrix id: {0}")]
    DuplicateMatrix(String),
}

impl CurvatureMatrix {
    /// Validates structure and content; returns the matrix on success.
    pub fn validated(self) -> Result<Self, CurvatureError> {
        if self.matrix_id.is_empty() {
            return Err(CurvatureError::EmptyMatrixId);
        }
        let mut prev: Option<(u32, u32)> = None;
        for e in &self.entries {
            if e.i > e.j {
                return Err(CurvatureError::LowerTriangleEntry(e.i, e.j));
            }
            if e.i >= self.block_count || e.j >= self.block_count {
                return Err(CurvatureError::IndexOutOfRange(e.i, e.j));
            }
            if e.den.is_zero() || e.den.is_negative() {
                return Err(CurvatureError::NonpositiveDenominator(e.i, e.j));
            }
            if e.num.is_negative() {
                return Err(CurvatureError::NegativeNumerator(e.i, e.j));
            }
            if e.num.is_zero() {
                return Err(CurvatureError::ExplicitZero(e.i, e.j));
            }
            if !e.num.gcd(&e.den).is_one() {
                return Err(CurvatureError::Unreduced(e.i, e.j));
            }
            if let Some(p) = prev {
                if (e.i, e.j) <= p {
                    return Err(CurvatureError::UnsortedEntries(e.i, e.j));
                }
            }
            prev = Some((e.i, e.j));
        }
        Ok(self)
    }

    /// Returns the cell value at `(i, j)`, mirroring across the diagonal.
    /// Missing cells are zero.
    #[must_use]
    pub fn entry(&self, i: u32, j: u32) -> BigRational {
        let (a, b) = if i <= j { (i, j) } else { (j, i) };
        self.entries
            .iter()
            .find(|e| e.i == a && e.j == b)
            .map_or_else(BigRational::zero, |e| {
                BigRational::new(e.num.clone(), e.den.clone())
            })
    }

    /// Canonical bytes with the mandated fixed field order.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("{\"matrix_id\":");
        push_json_string(&mut out, &self.matrix_id);
        out.push_str(",\"version\":");
        push_json_string(&mut out, &self.version);
        out.push_str(",\"entry_mode\":");
        push_json_string(&mut out, ENTRY_MODE_UPPER_SPARSE);
        out.push_str(",\"symmetry_mode\":");
        push_json_string(&mut out, SYMMETRY_MODE_SYMMETRIC);
        out.push_str(",\"domain_mode\":");
        push_json_string(&mut out, DOMAIN_MODE_NONNEG);
        out.push_str(&format!(",\"block_count\":{}", self.block_count));
        out.push_str(",\"entries\":[");
        for (idx, e) in self.entries.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            out.push_str(&format!(
                "{{\"i\":{},\"j\":{},\"num\":\"{}\",\"den\":\"{}\"}}",
                e.i, e.j, e.num, e.den
            ));
        }
        out.push_str("]}");
        out.into_bytes()
    }

    /// SHA3-256 digest of the canonical bytes.
    #[must_use]
    pub fn hash(&self) -> Hash {
        sha3_256(&self.canonical_bytes())
    }

    /// Builds the N-block identity matrix (diagonal `1/1`).
    pub fn identity(matrix_id: impl Into<String>, version: impl Into<String>, n: u32) -> Self {
        let entries = (0..n)
            .map(|k| MatrixEntry {
                i: k,
                j: k,
                num: BigInt::one(),
                den: BigInt::one(),
            })
            .collect();
        Self {
            matrix_id: matrix_id.into(),
            version: version.into(),
            block_count: n,
            entries,
        }
    }
}

fn push_json_string(out: &mut String, s: &str) {
    // The ids constrained here are plain ASCII identifiers; escape the two
    // characters JSON requires anyway so the writer stays total.
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

/// Allowlist of curvature matrices keyed by `matrix_id`.
#[derive(Debug, Default)]
pub struct CurvatureRegistry {
    matrices: BTreeMap<String, (CurvatureMatrix, Hash)>,
}

impl CurvatureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and registers a matrix; computes and stores its hash.
    pub fn register(&mut self, matrix: CurvatureMatrix) -> Result<Hash, CurvatureError> {
        let matrix = matrix.validated()?;
        if self.matrices.contains_key(&matrix.matrix_id) {
            return Err(CurvatureError::DuplicateMatrix(matrix.matrix_id));
        }
        let hash = matrix.hash();
        self.matrices
            .insert(matrix.matrix_id.clone(), (matrix, hash));
        Ok(hash)
    }

    /// Looks up a registered matrix and its hash.
    pub fn lookup(&self, matrix_id: &str) -> Result<(&CurvatureMatrix, &Hash), CurvatureError> {
        self.matrices
            .get(matrix_id)
            .map(|(m, h)| (m, h))
            .ok_or_else(|| CurvatureError::UnknownMatrix(matrix_id.to_owned()))
    }
}
