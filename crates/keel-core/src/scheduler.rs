// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Greedy curvature-aware batch assembly (`greedy.curv.v1`).
//!
//! Ordering invariant:
//! - Candidates are considered in ascending raw-byte order of `op_id`.
//! - The greedy rule appends the eligible op with the *strictly* minimum
//!   marginal ε̂ cost; ties break to the lexicographically smallest `op_id`.
//!   Iterating candidates in canonical order with a strict `<` comparison
//!   realizes the tie-break with no further machinery.
//! - The append log records the exact append sequence; it is the canonical
//!   witness of scheduler behavior and the input to planning-time
//!   rescheduling.
//!
//! The curvature cost of a batch B is
//! `ε̂(B) = Σ a² + 2·Σ_{i<j} M[bᵢ,bⱼ]·aᵢ·aⱼ` over the raw scale-6 integers
//! of the δ-bounds, accumulated as exact rationals and rounded half-even
//! once into a scale-6 quantum for comparison and storage.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;

use crate::curvature::CurvatureMatrix;
use crate::error::TerminalCode;
use crate::ident::OpId;
use crate::meter::CostMeter;
use crate::plan::{ExecutionPlan, GlbMode, OpSpec};
use crate::policy::ResourceCaps;
use crate::quantum::{div_half_even, DebtUnit, SCALE};

/// The only allowlisted scheduler rule.
pub const SCHEDULER_RULE_GREEDY_CURV_V1: &str = "greedy.curv.v1";

/// An assembled batch: the append log plus its curvature cost.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BatchPlan {
    /// Ops in the exact order the scheduler appended them.
    pub append_log: Vec<OpId>,
    /// ε̂ for the batch, quantized once at assembly.
    pub eps_hat: DebtUnit,
    /// Mode the batch was assembled under.
    pub mode: GlbMode,
}

impl BatchPlan {
    /// Batch size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.append_log.len()
    }

    /// True when no op was appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.append_log.is_empty()
    }

    /// The batch in canonical (`op_id` ascending) order.
    #[must_use]
    pub fn canonical_order(&self) -> Vec<OpId> {
        let mut ops = self.append_log.clone();
        ops.sort();
        ops
    }

    /// Drops the last-appended op (the remove-last-appended transform).
    /// Recomputing ε̂ for the shrunk batch is the caller's job.
    #[must_use]
    pub fn without_last(&self) -> Vec<OpId> {
        let mut ops = self.append_log.clone();
        ops.pop();
        ops
    }
}

/// True when `op` may join a batch under `mode`.
///
/// Mode-D-requiring and float-touching ops are admitted only in mode D; the
/// chain float policy forbids float-touching kernels everywhere else.
#[must_use]
pub fn mode_admits(op: &OpSpec, mode: GlbMode) -> bool {
    match mode {
        GlbMode::D => true,
        GlbMode::C => !op.requires_mode_d && !op.float_touch,
    }
}

/// Computes ε̂ for a fixed batch, metering term count and scalar width.
///
/// Used by the attempter and the replay verifier; batch assembly accumulates
/// the same quantity incrementally.
pub fn eps_hat(
    ops: &[&OpSpec],
    matrix: &CurvatureMatrix,
    meter: &mut CostMeter<'_>,
) -> Result<DebtUnit, TerminalCode> {
    let mut acc = BigRational::zero();
    for (idx, op) in ops.iter().enumerate() {
        let a = op.delta_bound.int_value();
        meter.check_bits(a)?;
        acc += BigRational::from(a * a);
        meter.check_rational(&acc)?;
        for other in &ops[..idx] {
            meter.count_matrix_term()?;
            let m = matrix.entry(other.block, op.block);
            if m.is_zero() {
                continue;
            }
            let pair = BigRational::from(other.delta_bound.int_value() * a * BigInt::from(2));
            acc += m * pair;
            meter.check_rational(&acc)?;
        }
    }
    Ok(quantize(&acc))
}

fn quantize(acc: &BigRational) -> DebtUnit {
    // BigRational keeps the denominator positive; one half-even rounding.
    DebtUnit::new(div_half_even(acc.numer(), acc.denom()), SCALE)
}

/// Assembles a maximal independent batch from the ready set.
///
/// Stops when the batch reaches the effective parallel width, no eligible op
/// remains, or appending any eligible op would force the matrix-terms cap
/// (the scheduler stops *before* a cap can trip; caps that fire anyway are
/// terminal). If nothing is eligible but the ready set is nonempty, the
/// lexicographically smallest ready op is returned as a singleton so the
/// attempter's planning checks can veto it on-ledger rules.
pub fn assemble_batch(
    plan: &ExecutionPlan,
    ready: &[OpId],
    matrix: &CurvatureMatrix,
    caps: &ResourceCaps,
) -> Result<BatchPlan, TerminalCode> {
    let mode = plan.mode;
    let width = plan.max_parallel_width.min(caps.max_parallel_width) as usize;
    let mut meter = CostMeter::new(caps);

    let mut candidates: Vec<&OpSpec> = ready.iter().filter_map(|id| plan.op(id)).collect();
    candidates.sort_by(|a, b| a.op_id.cmp(&b.op_id));

    for op in &candidates {
        meter.check_fields_touched(op.footprint.touched().len())?;
    }

    let mut batch: Vec<&OpSpec> = Vec::new();
    let mut append_log: Vec<OpId> = Vec::new();
    let mut acc = BigRational::zero();

    while batch.len() < width {
        // Appending to a batch of size n adds n off-diagonal products.
        if meter.matrix_terms_would_exceed(batch.len() as u64) {
            break;
        }
        let mut best: Option<(BigRational, usize)> = None;
        for (idx, cand) in candidates.iter().enumerate() {
            if append_log.iter().any(|id| id == &cand.op_id) {
                continue;
            }
            if !mode_admits(cand, mode) {
                continue;
            }
            if !batch
                .iter()
                .all(|member| member.footprint.independent(&cand.footprint))
            {
                continue;
            }
            let marginal = marginal_cost(&batch, cand, matrix, &meter)?;
            // Strict `<` keeps the first (lexicographically smallest) op on ties.
            let better = best
                .as_ref()
                .is_none_or(|(cost, _)| marginal < *cost);
            if better {
                best = Some((marginal, idx));
            }
        }
        let Some((marginal, idx)) = best else {
            break;
        };
        for _ in 0..batch.len() {
            meter.count_matrix_term()?;
        }
        acc += marginal;
        meter.check_rational(&acc)?;
        let chosen = candidates[idx];
        batch.push(chosen);
        append_log.push(chosen.op_id.clone());
    }

    if append_log.is_empty() {
        if let Some(first) = candidates.first() {
            append_log.push(first.op_id.clone());
            acc = BigRational::from(first.delta_bound.int_value() * first.delta_bound.int_value());
        }
    }

    Ok(BatchPlan {
        append_log,
        eps_hat: quantize(&acc),
        mode,
    })
}

fn marginal_cost(
    batch: &[&OpSpec],
    cand: &OpSpec,
    matrix: &CurvatureMatrix,
    meter: &CostMeter<'_>,
) -> Result<BigRational, TerminalCode> {
    let a = cand.delta_bound.int_value();
    meter.check_bits(a)?;
    let mut marginal = BigRational::from(a * a);
    for member in batch {
        let m = matrix.entry(member.block, cand.block);
        if m.is_zero() {
            continue;
        }
        let pair = BigRational::from(member.delta_bound.int_value() * a * BigInt::from(2));
        marginal += m * pair;
        meter.check_rational(&marginal)?;
    }
    Ok(marginal)
}
