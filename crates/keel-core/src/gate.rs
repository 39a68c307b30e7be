// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The measured gate.
//!
//! Given pre-state debt `D = V(x)`, post-state debt `D' = V(x̃)`, a declared
//! budget `B`, and a verified disturbance `E`, the gate accepts iff
//!
//! ```text
//! D' ≤ D − S(D,B) + E      (the law)
//! ε_measured = |D' − D| ≤ ε̂(B)   (the curvature gate)
//! ```
//!
//! Both comparisons are integer-exact on the shared quantum scale. A law or
//! ε violation is the `fail.gate_eps` class; exceeding the optional hard
//! `max_epsilon` cap is terminal. No receipt is ever emitted for a failure.

use thiserror::Error;

use crate::action::ActionDescriptor;
use crate::error::TerminalCode;
use crate::policy::{DisturbanceError, PolicyBundle};
use crate::quantum::{DebtUnit, QuantumError};

/// The measured quantities for one gate decision.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GateOutcome {
    /// `D = V(pre)`.
    pub pre_debt: DebtUnit,
    /// `D' = V(post)`.
    pub post_debt: DebtUnit,
    /// `ΔV = D' − D` (signed).
    pub delta_v: DebtUnit,
    /// `S(D, B)` under the bundled service law.
    pub service: DebtUnit,
    /// The verified disturbance `E`.
    pub disturbance: DebtUnit,
    /// `ε_measured = |ΔV|`.
    pub eps_measured: DebtUnit,
    /// Whether `D' ≤ D − S(D,B) + E` held, regardless of which gate ran.
    pub law_satisfied: bool,
    /// Whether the gate accepted.
    pub accepted: bool,
}

/// Non-accepting gate evaluations that are not simple law/ε rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The declared disturbance failed policy verification.
    #[error("disturbance rejected: {0}")]
    Disturbance(#[from] DisturbanceError),
    /// `ε_measured` exceeded the hard `max_epsilon` cap (terminal).
    #[error("{}", TerminalCode::CapEpsilon.code())]
    EpsilonCap,
    /// Scale mismatch in gate arithmetic.
    #[error("quantum error: {0}")]
    Quantum(#[from] QuantumError),
}

/// Verifies the disturbance, computes service, and decides the full
/// transition-level gate: the law *and* the curvature comparison.
///
/// `accepted` is false when the law or the ε̂ comparison fails; hard-cap
/// violations surface as [`GateError::EpsilonCap`] instead because caps
/// never reschedule.
pub fn measure(
    bundle: &PolicyBundle,
    action: &ActionDescriptor,
    pre_debt: &DebtUnit,
    post_debt: &DebtUnit,
    eps_hat: &DebtUnit,
) -> Result<GateOutcome, GateError> {
    evaluate(bundle, action, pre_debt, post_debt, eps_hat, true)
}

/// Decides the batch gate: `ε_measured ≤ ε̂` plus the optional hard cap.
///
/// The debt law binds single-action admission; a batch of mutually
/// independent ops is admitted on its curvature bound alone, with service
/// and disturbance still measured and recorded. Disturbance verification
/// applies either way.
pub fn measure_batch(
    bundle: &PolicyBundle,
    action: &ActionDescriptor,
    pre_debt: &DebtUnit,
    post_debt: &DebtUnit,
    eps_hat: &DebtUnit,
) -> Result<GateOutcome, GateError> {
    evaluate(bundle, action, pre_debt, post_debt, eps_hat, false)
}

fn evaluate(
    bundle: &PolicyBundle,
    action: &ActionDescriptor,
    pre_debt: &DebtUnit,
    post_debt: &DebtUnit,
    eps_hat: &DebtUnit,
    law_binds: bool,
) -> Result<GateOutcome, GateError> {
    bundle
        .disturbance
        .verify(&action.disturbance, action.event_label.as_deref())?;

    let service = bundle.service.service(pre_debt, &action.budget)?;
    let delta_v = post_debt.checked_sub(pre_debt)?;
    let eps_measured = delta_v.abs();

    if let Some(max_eps) = &bundle.caps.max_epsilon {
        if eps_measured.checked_cmp(max_eps)? == std::cmp::Ordering::Greater {
            return Err(GateError::EpsilonCap);
        }
    }

    // D' ≤ D − S(D,B) + E, integer-exact at the shared scale.
    let allowed = pre_debt
        .checked_sub(&service)?
        .checked_add(&action.disturbance)?;
    let law_ok = post_debt.checked_cmp(&allowed)? != std::cmp::Ordering::Greater;
    let eps_ok = eps_measured.checked_cmp(eps_hat)? != std::cmp::Ordering::Greater;

    Ok(GateOutcome {
        pre_debt: pre_debt.clone(),
        post_debt: post_debt.clone(),
        delta_v,
        service,
        disturbance: action.disturbance.clone(),
        eps_measured,
        law_satisfied: law_ok,
        accepted: if law_binds { law_ok && eps_ok } else { eps_ok },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::policy::{
        DisturbancePolicy, ResourceCaps, ServiceLaw, VIOLATION_POLICY_WEIGHTED_RESIDUAL,
    };
    use crate::scheduler::SCHEDULER_RULE_GREEDY_CURV_V1;
    use std::collections::BTreeMap;

    fn q(raw: i64) -> DebtUnit {
        DebtUnit::from_raw(raw)
    }

    fn bundle() -> PolicyBundle {
        PolicyBundle {
            policy_id: "policy.test.v1".to_owned(),
            violation_policy: VIOLATION_POLICY_WEIGHTED_RESIDUAL.to_owned(),
            service: ServiceLaw::LinearCapped { mu: q(1_000_000) },
            disturbance: DisturbancePolicy::Dp0,
            matrix_version: "m.test.v1".to_owned(),
            matrix_digest: [1u8; 32],
            kernel_registry_digest: [2u8; 32],
            scheduler_rule: SCHEDULER_RULE_GREEDY_CURV_V1.to_owned(),
            caps: ResourceCaps::unbounded(4),
            genesis_prev_hash: None,
        }
    }

    fn action(budget_raw: i64) -> ActionDescriptor {
        ActionDescriptor {
            kind: ActionKind::StateUpdate,
            blocks: vec![0],
            payload: BTreeMap::new(),
            budget: q(budget_raw),
            disturbance: q(0),
            event_label: None,
            policy_digest: [7u8; 32],
        }
    }

    #[test]
    fn accept_at_equality() {
        // D = 1.0, B = 0.5, μ = 1.0, E = 0: accept iff D' ≤ 0.5.
        let out = measure(
            &bundle(),
            &action(500_000),
            &q(1_000_000),
            &q(500_000),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(out.accepted);
        assert_eq!(out.service, q(500_000));
    }

    #[test]
    fn reject_by_one_tick() {
        let out = measure(
            &bundle(),
            &action(500_000),
            &q(1_000_000),
            &q(500_001),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(!out.accepted);
    }

    #[test]
    fn zero_budget_preserves_debt() {
        // S(D, 0) = 0, so any debt decrease must come from the transition.
        let out = measure(
            &bundle(),
            &action(0),
            &q(1_000_000),
            &q(1_000_000),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(out.accepted);
        assert_eq!(out.service, q(0));
        let out = measure(
            &bundle(),
            &action(0),
            &q(1_000_000),
            &q(1_000_001),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(!out.accepted);
    }

    #[test]
    fn eps_gate_rejects_by_one_tick() {
        // ΔV = 10_000_000_001 against ε̂ = 10_000_000_000: one tick over.
        let out = measure_batch(
            &bundle(),
            &action(0),
            &q(0),
            &q(10_000_000_001),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(!out.accepted);
        assert_eq!(out.eps_measured, q(10_000_000_001));
        let out = measure_batch(
            &bundle(),
            &action(0),
            &q(0),
            &q(10_000_000_000),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(out.accepted);
    }

    #[test]
    fn batch_gate_admits_debt_increases_within_eps() {
        // Debt rises from zero; the law would reject, the batch gate does
        // not — admission is the curvature bound. Both record the law
        // disposition identically.
        let out = measure_batch(
            &bundle(),
            &action(500_000),
            &q(0),
            &q(2500),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(out.accepted);
        assert!(!out.law_satisfied);
        let strict = measure(
            &bundle(),
            &action(500_000),
            &q(0),
            &q(2500),
            &q(10_000_000_000),
        )
        .unwrap();
        assert!(!strict.accepted);
        assert!(!strict.law_satisfied);
    }

    #[test]
    fn epsilon_hard_cap_is_terminal() {
        let mut b = bundle();
        b.caps.max_epsilon = Some(q(100));
        let got = measure(&b, &action(1_000_000), &q(0), &q(101), &q(10_000));
        assert_eq!(got, Err(GateError::EpsilonCap));
    }

    #[test]
    fn dp0_rejects_declared_disturbance() {
        let mut a = action(0);
        a.disturbance = q(1);
        let got = measure(&bundle(), &a, &q(0), &q(0), &q(10_000));
        assert!(matches!(got, Err(GateError::Disturbance(_))));
    }

    #[test]
    fn disturbance_raises_the_allowance() {
        let mut b = bundle();
        b.disturbance = DisturbancePolicy::Dp1 { e_max: q(10) };
        let mut a = action(0);
        a.disturbance = q(10);
        // D' = D + E is admissible under the law.
        let out = measure(&b, &a, &q(100), &q(110), &q(10_000_000_000)).unwrap();
        assert!(out.accepted);
        let mut a = action(0);
        a.disturbance = q(10);
        let out = measure(&b, &a, &q(100), &q(111), &q(10_000_000_000)).unwrap();
        assert!(!out.accepted);
    }
}
