// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Standalone replay verifier.
//!
//! The verifier is a consumer of the receipt chain: given the policy bundle,
//! the contract set, the curvature registry, the kernel registry, the plan,
//! and the initial state, it re-derives the entire run deterministically and
//! recomputes every check for every commit, in order:
//!
//! - previous-hash continuity against the chain anchor;
//! - local-receipt consistency and state recomputation, aggregated through
//!   the Merkle root over the replayed local hashes;
//! - `V(pre)` and `V(post)` from the contract set, confirming the recorded
//!   `D_pre`, `D_post`, and (through `ε_measured = |ΔV|`) the recorded ΔV;
//! - service and disturbance per the bundle;
//! - ε̂ from the batch and the curvature matrix;
//! - the law inequality `D' ≤ D − S(D,B) + E`, re-derived through the
//!   law-binding gate on the recorded debts and the reconstructed batch
//!   action, confirmed against the recorded disposition;
//! - every policy-locked identifier, and cap satisfaction.
//!
//! Any mismatch reports the failing commit index and the first subcheck
//! that failed.
//!
//! A strict prefix of a valid chain verifies: the replay stops where the
//! supplied receipts stop. Receipts extending past the replayed run (extra
//! commits after completion or after a terminal halt) fail with
//! [`VerifyCheck::ChainOverrun`].

use thiserror::Error;

use crate::contract::ContractSet;
use crate::curvature::CurvatureRegistry;
use crate::engine::{Engine, EngineBuildError, StepOutcome};
use crate::error::TerminalCode;
use crate::gate::{self, GateError};
use crate::ident::Hash;
use crate::kernel::KernelRegistry;
use crate::plan::ExecutionPlan;
use crate::policy::PolicyBundle;
use crate::receipt::CommitReceipt;
use crate::state::State;

/// The subcheck that failed during verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyCheck {
    /// A genesis binding (policy, matrix, kernel registry, initial state,
    /// scheduler rule) did not hold.
    GenesisBinding(TerminalCode),
    /// The plan failed structural validation or its DAG is cyclic.
    PlanRejected,
    /// The receipt's previous-hash did not extend the chain.
    PrevHashContinuity,
    /// Recorded batch size disagreed with the replay.
    BatchSize,
    /// Merkle root over the recomputed local hashes disagreed.
    MerkleRoot,
    /// Recorded `D_pre` or `D_post` disagreed with the recomputed V(x).
    Debt,
    /// Recorded service or disturbance disagreed with the bundle recompute.
    ServiceDisturbance,
    /// Recorded `ε_measured` disagreed with the recomputed `|ΔV|`.
    EpsilonMeasured,
    /// Recorded ε̂ disagreed with the recomputed curvature bound.
    EpsilonHat,
    /// The recorded debt-law disposition disagreed with the re-derived
    /// `D' ≤ D − S(D,B) + E`.
    LawInequality,
    /// A resource cap was not satisfied by the recorded values.
    CapSatisfaction,
    /// Scheduler rule id was not the policy-locked one.
    SchedulerRule,
    /// Mode id disagreed.
    Mode,
    /// Policy id disagreed.
    PolicyId,
    /// Policy digest disagreed.
    PolicyDigest,
    /// Matrix version id disagreed.
    MatrixVersion,
    /// Matrix digest disagreed.
    MatrixDigest,
    /// Canonical receipt bytes disagreed outside any attributed field.
    CommitHash,
    /// The chain continues past the end of the replayed run.
    ChainOverrun,
}

/// A verification failure: the commit index plus the failed subcheck.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("verification failed at commit {commit_index}: {check:?}")]
pub struct VerifyError {
    /// Zero-based index of the failing commit.
    pub commit_index: usize,
    /// The first subcheck that failed.
    pub check: VerifyCheck,
}

/// Successful verification: the chain's end position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Final state hash after the last verified commit.
    pub final_state_hash: Hash,
    /// Final commit hash (the chain head).
    pub final_commit_hash: Hash,
    /// Number of verified commits.
    pub commits: usize,
}

/// Verifies a receipt chain by full deterministic replay.
pub fn verify_chain(
    bundle: PolicyBundle,
    contracts: ContractSet,
    curvature: &CurvatureRegistry,
    kernels: KernelRegistry,
    plan: ExecutionPlan,
    initial_state: State,
    receipts: &[CommitReceipt],
) -> Result<ReplaySummary, VerifyError> {
    let genesis = bundle.genesis();
    let mut engine = Engine::new(bundle, contracts, curvature, kernels, plan, initial_state)
        .map_err(|err| VerifyError {
            commit_index: 0,
            check: match err {
                EngineBuildError::Terminal(t) => VerifyCheck::GenesisBinding(t.code),
                EngineBuildError::Plan(_)
                | EngineBuildError::Curvature(_)
                | EngineBuildError::CyclicDag => VerifyCheck::PlanRejected,
            },
        })?;

    let mut expected_prev = genesis;
    for (index, theirs) in receipts.iter().enumerate() {
        let fail = |check: VerifyCheck| VerifyError {
            commit_index: index,
            check,
        };
        if theirs.prev_commit_hash != expected_prev {
            return Err(fail(VerifyCheck::PrevHashContinuity));
        }
        match engine.step() {
            StepOutcome::Committed => {}
            StepOutcome::Completed | StepOutcome::Halted(_) => {
                return Err(fail(VerifyCheck::ChainOverrun));
            }
        }
        let Some(mine) = engine.ledger().commits().last() else {
            return Err(fail(VerifyCheck::ChainOverrun));
        };
        let Some(action) = engine.last_action() else {
            return Err(fail(VerifyCheck::ChainOverrun));
        };
        compare_commit(index, engine.bundle(), action, mine, theirs)?;
        expected_prev = theirs.hash();
    }

    Ok(ReplaySummary {
        final_state_hash: engine.state().hash(),
        final_commit_hash: expected_prev,
        commits: receipts.len(),
    })
}

/// Per-commit subchecks, most specific first.
///
/// The recorded measurements are confirmed against the replay's recompute,
/// then the debt law is re-derived from first principles: the law-binding
/// gate runs on the recorded debts, the reconstructed batch action, and the
/// recorded ε̂, and its disposition must match the one the receipt claims.
fn compare_commit(
    index: usize,
    bundle: &crate::policy::PolicyBundle,
    action: &crate::action::ActionDescriptor,
    mine: &CommitReceipt,
    theirs: &CommitReceipt,
) -> Result<(), VerifyError> {
    let fail = |check: VerifyCheck| VerifyError {
        commit_index: index,
        check,
    };
    if theirs.batch_size != mine.batch_size {
        return Err(fail(VerifyCheck::BatchSize));
    }
    if theirs.merkle_root != mine.merkle_root {
        return Err(fail(VerifyCheck::MerkleRoot));
    }
    if theirs.pre_debt != mine.pre_debt || theirs.post_debt != mine.post_debt {
        return Err(fail(VerifyCheck::Debt));
    }
    if theirs.service != mine.service || theirs.disturbance != mine.disturbance {
        return Err(fail(VerifyCheck::ServiceDisturbance));
    }
    if theirs.epsilon_measured != mine.epsilon_measured {
        return Err(fail(VerifyCheck::EpsilonMeasured));
    }
    if theirs.epsilon_hat != mine.epsilon_hat {
        return Err(fail(VerifyCheck::EpsilonHat));
    }
    let strict = gate::measure(
        bundle,
        action,
        &theirs.pre_debt,
        &theirs.post_debt,
        &theirs.epsilon_hat,
    )
    .map_err(|err| match err {
        GateError::EpsilonCap => fail(VerifyCheck::CapSatisfaction),
        GateError::Disturbance(_) | GateError::Quantum(_) => {
            fail(VerifyCheck::ServiceDisturbance)
        }
    })?;
    if strict.law_satisfied != theirs.law_satisfied {
        return Err(fail(VerifyCheck::LawInequality));
    }
    if theirs.scheduler_rule != mine.scheduler_rule {
        return Err(fail(VerifyCheck::SchedulerRule));
    }
    if theirs.glb_mode != mine.glb_mode {
        return Err(fail(VerifyCheck::Mode));
    }
    if theirs.policy_id != mine.policy_id {
        return Err(fail(VerifyCheck::PolicyId));
    }
    if theirs.policy_digest != mine.policy_digest {
        return Err(fail(VerifyCheck::PolicyDigest));
    }
    if theirs.matrix_version != mine.matrix_version {
        return Err(fail(VerifyCheck::MatrixVersion));
    }
    if theirs.matrix_digest != mine.matrix_digest {
        return Err(fail(VerifyCheck::MatrixDigest));
    }
    if theirs.hash() != mine.hash() {
        return Err(fail(VerifyCheck::CommitHash));
    }
    Ok(())
}
