// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Closed error taxonomy for the authoritative path.
//!
//! Every failure that can influence chain disposition is drawn from a closed
//! set; no free-form strings enter the hash chain. Batch-time failures are
//! classified by [`FailClass`] and either rescheduled or escalated to a
//! [`TerminalError`] by the main loop. Terminal errors halt the run; they are
//! never appended to the ledger.

use thiserror::Error;

use crate::ident::{Hash, OpId};

/// Batch-time non-terminal failure classes, in classification priority order.
///
/// When several checks fail for one attempt, the highest-priority class wins:
/// `Independence > PolicyVeto > KernelError > DeltaBound > GateEps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailClass {
    /// Re-verification found two batch members with overlapping footprints.
    Independence,
    /// Mode or float policy vetoed the batch at planning time.
    PolicyVeto,
    /// A kernel returned an error.
    KernelError,
    /// Some op's measured δ exceeded its declared bound.
    DeltaBound,
    /// `ε_measured` exceeded `ε̂` (or the configured hard cap).
    GateEps,
}

impl FailClass {
    /// Wire code for the failure class.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Independence => "fail.independence",
            Self::PolicyVeto => "fail.policy_veto",
            Self::KernelError => "fail.kernel_error",
            Self::DeltaBound => "fail.delta_bound",
            Self::GateEps => "fail.gate_eps",
        }
    }

    /// True for failures raised during planning checks (before any kernel
    /// runs); these reschedule by removing the last-appended op.
    #[must_use]
    pub fn is_planning(self) -> bool {
        matches!(self, Self::Independence | Self::PolicyVeto)
    }
}

/// Closed set of terminal error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalCode {
    /// Singleton batch failed with a kernel error.
    KernelErrorSingleton,
    /// Singleton batch failed the δ-bound check.
    DeltaBoundSingleton,
    /// Singleton batch was vetoed by policy.
    PolicyVetoSingleton,
    /// Singleton batch failed the ε gate.
    GateEpsSingleton,
    /// An intermediate big integer exceeded `max_bigint_bits`.
    CapBigintBits,
    /// Off-diagonal accumulation exceeded `max_matrix_accum_terms`.
    CapMatrixTerms,
    /// An op touched more fields than `max_fields_touched_per_op`.
    CapFieldsTouched,
    /// Contract activations exceeded `max_v_eval_cost`.
    CapVEvalCost,
    /// `ε_measured` exceeded the hard `max_epsilon` cap.
    CapEpsilon,
    /// Rational common-denominator reduction exceeded the big-int cap.
    CapLcmOverflow,
    /// An allocation guard tripped during canonicalization or accumulation.
    CapAllocFailed,
    /// A receipt or input claimed a policy digest other than the active one.
    PolicyDigestMismatch,
    /// The curvature matrix digest did not match the bundle.
    MatrixDigestMismatch,
    /// The kernel registry digest did not match the bundle.
    KernelRegistryDigestMismatch,
    /// The initial state hash did not match the plan.
    InitialStateHashMismatch,
    /// The plan's scheduler rule is not allowlisted by the bundle.
    SchedulerRuleNotAllowlisted,
    /// A hard invariant failed for a singleton batch before its kernel ran.
    InvariantViolationSingleton,
}

impl TerminalCode {
    /// Wire code for the terminal error.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::KernelErrorSingleton => "err.kernel_error.singleton",
            Self::DeltaBoundSingleton => "err.delta_bound.singleton",
            Self::PolicyVetoSingleton => "err.policy_veto.singleton",
            Self::GateEpsSingleton => "err.gate_eps.singleton",
            Self::CapBigintBits => "err.cap.bigint_bits_exceeded",
            Self::CapMatrixTerms => "err.cap.matrix_terms_exceeded",
            Self::CapFieldsTouched => "err.cap.fields_touched_exceeded",
            Self::CapVEvalCost => "err.cap.v_eval_cost_exceeded",
            Self::CapEpsilon => "err.cap.epsilon_exceeded",
            Self::CapLcmOverflow => "err.cap.lcm_overflow",
            Self::CapAllocFailed => "err.cap.alloc_failed",
            Self::PolicyDigestMismatch => "err.policy_digest_mismatch",
            Self::MatrixDigestMismatch => "err.matrix_digest_mismatch",
            Self::KernelRegistryDigestMismatch => "err.kernel_registry_digest_mismatch",
            Self::InitialStateHashMismatch => "err.initial_state_hash_mismatch",
            Self::SchedulerRuleNotAllowlisted => "err.scheduler_rule_not_allowlisted",
            Self::InvariantViolationSingleton => "err.invariant_violation.singleton",
        }
    }
}

/// Terminal halt state. The ledger ends at the last accepted commit; this
/// object is produced alongside it, never appended to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} (op={failed_op_id:?}, batch_size={batch_size})", code.code())]
pub struct TerminalError {
    /// Which terminal condition fired.
    pub code: TerminalCode,
    /// Failing op, when one is attributable.
    pub failed_op_id: Option<OpId>,
    /// Previous-hash anchor at the time of the halt.
    pub batch_prev_hash: Hash,
    /// Size of the failing batch (0 when no batch was in flight).
    pub batch_size: usize,
}

impl TerminalError {
    /// Builds a terminal error with no batch in flight.
    pub fn standalone(code: TerminalCode, prev_hash: Hash) -> Self {
        Self {
            code,
            failed_op_id: None,
            batch_prev_hash: prev_hash,
            batch_size: 0,
        }
    }
}

/// Closed set of invariant-time identifiers (never reach a kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantId {
    /// A field declared nonnegative went negative.
    NonnegField,
    /// A normalizer evaluated to zero or a negative value.
    NormalizerNonpositive,
    /// A residual referenced a missing or non-numeric field.
    ResidualFieldUnusable,
}

impl InvariantId {
    /// Wire code for the invariant violation.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::NonnegField => "invariant_violation:nonneg_field",
            Self::NormalizerNonpositive => "transition_error:normalizer_nonpositive",
            Self::ResidualFieldUnusable => "transition_error:residual_field_unusable",
        }
    }
}

/// Closed set of action schema rejection identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActionSchemaId {
    /// Unknown key in the action document.
    #[error("action_schema:unknown_key")]
    UnknownKey,
    /// Unknown action kind.
    #[error("action_schema:unknown_kind")]
    UnknownKind,
    /// Target block list was empty, unsorted, or contained duplicates.
    #[error("action_schema:bad_blocks")]
    BadBlocks,
    /// A numeric string was not canonical, or a float leaked in.
    #[error("action_schema:non_canonical_number")]
    NonCanonicalNumber,
    /// A hash reference failed to decode.
    #[error("action_schema:bad_hash")]
    BadHash,
    /// Declared budget was malformed or negative.
    #[error("action_schema:bad_budget")]
    BadBudget,
    /// Declared disturbance was malformed or negative.
    #[error("action_schema:bad_disturbance")]
    BadDisturbance,
    /// Ops in one batch declared conflicting disturbance event labels.
    #[error("action_schema:mixed_event_label")]
    MixedEventLabel,
}
