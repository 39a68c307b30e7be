// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resource-cap metering for exact-arithmetic accumulation.
//!
//! Caps replace timeouts: every bound is computed from declared inputs, so a
//! cap trip is deterministic and always terminal. The meter is scratch state
//! scoped to one batch attempt (or one verifier step); it never outlives it.

use num_bigint::BigInt;
use num_rational::BigRational;

use crate::error::TerminalCode;
use crate::policy::ResourceCaps;

/// Per-attempt cap accounting.
#[derive(Debug)]
pub struct CostMeter<'a> {
    caps: &'a ResourceCaps,
    matrix_terms: u64,
    v_activations: u64,
}

impl<'a> CostMeter<'a> {
    /// Creates a meter over the bundle's caps.
    pub fn new(caps: &'a ResourceCaps) -> Self {
        Self {
            caps,
            matrix_terms: 0,
            v_activations: 0,
        }
    }

    /// Checks one big integer against `max_bigint_bits`.
    pub fn check_bits(&self, n: &BigInt) -> Result<(), TerminalCode> {
        if let Some(max) = self.caps.max_bigint_bits {
            if n.bits() > max {
                return Err(TerminalCode::CapBigintBits);
            }
        }
        Ok(())
    }

    /// Checks both legs of a rational against `max_bigint_bits`.
    ///
    /// Reduction happens after every elementary operation, so a blow-up here
    /// is a blow-up of the reduced common-denominator form (`lcm_overflow`
    /// rather than a plain scalar width trip).
    pub fn check_rational(&self, r: &BigRational) -> Result<(), TerminalCode> {
        if let Some(max) = self.caps.max_bigint_bits {
            if r.numer().bits() > max || r.denom().bits() > max {
                return Err(TerminalCode::CapLcmOverflow);
            }
        }
        Ok(())
    }

    /// Counts one off-diagonal curvature product against
    /// `max_matrix_accum_terms`.
    pub fn count_matrix_term(&mut self) -> Result<(), TerminalCode> {
        self.matrix_terms += 1;
        if let Some(max) = self.caps.max_matrix_accum_terms {
            if self.matrix_terms > max {
                return Err(TerminalCode::CapMatrixTerms);
            }
        }
        Ok(())
    }

    /// True when appending `extra` off-diagonal products would exceed the
    /// cap. The scheduler uses this to stop *before* forcing the trip.
    #[must_use]
    pub fn matrix_terms_would_exceed(&self, extra: u64) -> bool {
        self.caps
            .max_matrix_accum_terms
            .is_some_and(|max| self.matrix_terms + extra > max)
    }

    /// Counts one contract activation against `max_v_eval_cost`.
    pub fn count_v_activation(&mut self) -> Result<(), TerminalCode> {
        self.v_activations += 1;
        if let Some(max) = self.caps.max_v_eval_cost {
            if self.v_activations > max {
                return Err(TerminalCode::CapVEvalCost);
            }
        }
        Ok(())
    }

    /// Checks an op's touched-field cardinality against
    /// `max_fields_touched_per_op`.
    pub fn check_fields_touched(&self, touched: usize) -> Result<(), TerminalCode> {
        if let Some(max) = self.caps.max_fields_touched_per_op {
            if touched as u64 > max {
                return Err(TerminalCode::CapFieldsTouched);
            }
        }
        Ok(())
    }
}
