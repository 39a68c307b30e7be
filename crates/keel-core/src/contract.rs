// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Contract sets and the violation functional V(x).
//!
//! ```text
//! V(x) = Σ_{k∈K, A_k(x)} w_k · Σ_i (r_{k,i}(x) / σ_k(x))²
//! ```
//!
//! Residual functions, normalizer specs, and applicability predicates are
//! closed registries keyed by stable id — the function is chosen by data,
//! never by reflection, and unknown ids reject at build time. Weights are
//! reduced rationals. The whole evaluation is exact rational arithmetic with
//! one half-even rounding at the very end; no rational is ever approximated
//! and no norm comparison ever divides.
//!
//! V is a function of state alone: action payloads never enter it, and an
//! inapplicable contract contributes exactly zero (its predicate is decided
//! before any arithmetic).

use num_bigint::BigInt;
use num_integer::Integer;
use num_rational::BigRational;
use num_traits::{One, Signed, Zero};
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::canon;
use crate::error::{InvariantId, TerminalCode};
use crate::ident::{FieldId, Hash};
use crate::meter::CostMeter;
use crate::quantum::{DebtUnit, QuantumError, SCALE};
use crate::state::State;
use crate::value::Value;

/// Errors surfaced while evaluating V(x).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VError {
    /// A hard invariant failed (nonpositive normalizer, unusable residual field).
    #[error("{}", .0.code())]
    Invariant(InvariantId),
    /// A resource cap tripped during accumulation.
    #[error("{}", .0.code())]
    Cap(TerminalCode),
    /// Scale mismatch reaching the final quantization.
    #[error("quantum error: {0}")]
    Quantum(#[from] QuantumError),
}

/// Errors produced while building a contract set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractBuildError {
    /// Residual function id not in the allowlist.
    #[error("unknown residual fn: {0}")]
    UnknownResidual(String),
    /// Normalizer spec id not in the allowlist.
    #[error("unknown normalizer spec: {0}")]
    UnknownNormalizer(String),
    /// Applicability predicate id not in the allowlist.
    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),
    /// Weight was negative, had a nonpositive denominator, or was unreduced.
    #[error("malformed weight")]
    MalformedWeight,
    /// A constant normalizer parameter was not strictly positive.
    #[error("nonpositive normalizer constant")]
    NonpositiveNormalizerConst,
}

// =============================================================================
// Weights
// =============================================================================

/// A contract weight: a reduced rational with `num ≥ 0`, `den > 0`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Weight {
    num: BigInt,
    den: BigInt,
}

impl Weight {
    /// Validates and builds a weight. The input must already be reduced —
    /// this is the wire rule; unreduced weights reject.
    pub fn new(num: BigInt, den: BigInt) -> Result<Self, ContractBuildError> {
        if num.is_negative() || !den.is_positive() || !num.gcd(&den).is_one() {
            return Err(ContractBuildError::MalformedWeight);
        }
        Ok(Self { num, den })
    }

    /// Builds a weight from any nonnegative rational, reducing by gcd first.
    /// `2/4` and `50/100` construct the same weight as `1/2`.
    pub fn reduced(num: BigInt, den: BigInt) -> Result<Self, ContractBuildError> {
        if num.is_negative() || !den.is_positive() {
            return Err(ContractBuildError::MalformedWeight);
        }
        let g = num.gcd(&den);
        if g.is_one() || g.is_zero() {
            return Self::new(num, den);
        }
        Self::new(&num / &g, &den / &g)
    }

    /// The weight as an exact rational.
    #[must_use]
    pub fn to_rational(&self) -> BigRational {
        BigRational::new(self.num.clone(), self.den.clone())
    }

    fn canonical_doc(&self) -> Json {
        json!({ "den": self.den.to_string(), "num": self.num.to_string() })
    }
}

// =============================================================================
// Allowlisted residuals, normalizers, predicates
// =============================================================================

/// Allowlisted residual functions, dispatched by stable id.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ResidualFn {
    /// `res.field.v1` — the raw value of one field.
    Field {
        /// The observed field.
        field: FieldId,
    },
    /// `res.field_minus_target.v1` — the field's offset from a fixed target.
    FieldMinusTarget {
        /// The observed field.
        field: FieldId,
        /// The target the field is measured against.
        target: DebtUnit,
    },
}

impl ResidualFn {
    /// Builds a residual from its wire id.
    pub fn from_id(
        id: &str,
        field: FieldId,
        target: Option<DebtUnit>,
    ) -> Result<Self, ContractBuildError> {
        match (id, target) {
            ("res.field.v1", None) => Ok(Self::Field { field }),
            ("res.field_minus_target.v1", Some(target)) => {
                Ok(Self::FieldMinusTarget { field, target })
            }
            _ => Err(ContractBuildError::UnknownResidual(id.to_owned())),
        }
    }

    /// The stable id this residual dispatches under.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Field { .. } => "res.field.v1",
            Self::FieldMinusTarget { .. } => "res.field_minus_target.v1",
        }
    }

    /// Evaluates the residual vector as raw chain-scale integers.
    ///
    /// A missing field reads as zero; a present non-numeric field is a hard
    /// invariant failure.
    fn eval(&self, state: &State) -> Result<Vec<BigInt>, InvariantId> {
        let raw_of = |field: &FieldId| -> Result<BigInt, InvariantId> {
            match state.get(field) {
                None => Ok(BigInt::zero()),
                Some(v) => v
                    .numeric_raw()
                    .ok_or(InvariantId::ResidualFieldUnusable),
            }
        };
        match self {
            Self::Field { field } => Ok(vec![raw_of(field)?]),
            Self::FieldMinusTarget { field, target } => {
                Ok(vec![raw_of(field)? - target.int_value()])
            }
        }
    }

    fn canonical_doc(&self) -> Json {
        match self {
            Self::Field { field } => json!({
                "field": field.to_hex(),
                "fn": format!("id:{}", self.id()),
            }),
            Self::FieldMinusTarget { field, target } => json!({
                "field": field.to_hex(),
                "fn": format!("id:{}", self.id()),
                "target": target.to_wire(),
            }),
        }
    }
}

/// Allowlisted normalizer specs. Normalizers must evaluate strictly positive.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NormalizerSpec {
    /// `norm.const.v1` — a fixed positive quantum.
    Const {
        /// The constant normalizer value.
        sigma: DebtUnit,
    },
    /// `norm.field.v1` — the value of a state field, checked positive at eval.
    Field {
        /// The field supplying σ.
        field: FieldId,
    },
}

impl NormalizerSpec {
    /// Builds a normalizer from its wire id.
    pub fn from_id(
        id: &str,
        sigma: Option<DebtUnit>,
        field: Option<FieldId>,
    ) -> Result<Self, ContractBuildError> {
        match (id, sigma, field) {
            ("norm.const.v1", Some(sigma), None) => {
                if sigma.is_negative() || sigma.is_zero() {
                    return Err(ContractBuildError::NonpositiveNormalizerConst);
                }
                Ok(Self::Const { sigma })
            }
            ("norm.field.v1", None, Some(field)) => Ok(Self::Field { field }),
            _ => Err(ContractBuildError::UnknownNormalizer(id.to_owned())),
        }
    }

    /// The stable id this normalizer dispatches under.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Const { .. } => "norm.const.v1",
            Self::Field { .. } => "norm.field.v1",
        }
    }

    /// Evaluates σ as a raw chain-scale integer, strictly positive.
    fn eval(&self, state: &State) -> Result<BigInt, InvariantId> {
        let raw = match self {
            Self::Const { sigma } => sigma.int_value().clone(),
            Self::Field { field } => state
                .get(field)
                .and_then(Value::numeric_raw)
                .ok_or(InvariantId::NormalizerNonpositive)?,
        };
        if !raw.is_positive() {
            return Err(InvariantId::NormalizerNonpositive);
        }
        Ok(raw)
    }

    fn canonical_doc(&self) -> Json {
        match self {
            Self::Const { sigma } => json!({
                "sigma": sigma.to_wire(),
                "spec": format!("id:{}", self.id()),
            }),
            Self::Field { field } => json!({
                "field": field.to_hex(),
                "spec": format!("id:{}", self.id()),
            }),
        }
    }
}

/// Allowlisted applicability predicates.
///
/// Applicability is part of the state: `pred.block_active.v1` reads a
/// declared activity field from the snapshot, never an external toggle.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Predicate {
    /// `pred.always.v1` — always applicable.
    Always,
    /// `pred.field_positive.v1` — applicable when a numeric field is `> 0`.
    FieldPositive {
        /// The gating field.
        field: FieldId,
    },
    /// `pred.block_active.v1` — applicable when an integer activity field is
    /// present and nonzero.
    BlockActive {
        /// The activity field.
        field: FieldId,
    },
}

impl Predicate {
    /// Builds a predicate from its wire id.
    pub fn from_id(id: &str, field: Option<FieldId>) -> Result<Self, ContractBuildError> {
        match (id, field) {
            ("pred.always.v1", None) => Ok(Self::Always),
            ("pred.field_positive.v1", Some(field)) => Ok(Self::FieldPositive { field }),
            ("pred.block_active.v1", Some(field)) => Ok(Self::BlockActive { field }),
            _ => Err(ContractBuildError::UnknownPredicate(id.to_owned())),
        }
    }

    /// The stable id this predicate dispatches under.
    #[must_use]
    pub fn id(&self) -> &'static str {
        match self {
            Self::Always => "pred.always.v1",
            Self::FieldPositive { .. } => "pred.field_positive.v1",
            Self::BlockActive { .. } => "pred.block_active.v1",
        }
    }

    /// Decides applicability on the snapshot. Never performs arithmetic.
    #[must_use]
    pub fn applies(&self, state: &State) -> bool {
        match self {
            Self::Always => true,
            Self::FieldPositive { field } => state
                .get(field)
                .is_some_and(Value::is_strictly_positive),
            Self::BlockActive { field } => match state.get(field) {
                Some(Value::Int(i)) => !i.is_zero(),
                _ => false,
            },
        }
    }

    fn canonical_doc(&self) -> Json {
        match self {
            Self::Always => json!({ "pred": format!("id:{}", self.id()) }),
            Self::FieldPositive { field } | Self::BlockActive { field } => json!({
                "field": field.to_hex(),
                "pred": format!("id:{}", self.id()),
            }),
        }
    }
}

// =============================================================================
// Contracts
// =============================================================================

/// One contract: a weighted, normalized residual with an applicability gate.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Contract {
    /// Stable contract id.
    pub contract_id: String,
    /// Residual function.
    pub residual: ResidualFn,
    /// Declared residual dimension.
    pub residual_dim: u32,
    /// Normalizer spec.
    pub normalizer: NormalizerSpec,
    /// Reduced rational weight.
    pub weight: Weight,
    /// Applicability predicate.
    pub predicate: Predicate,
    /// Contract version.
    pub version: u32,
}

impl Contract {
    fn canonical_doc(&self) -> Json {
        json!({
            "contract_id": format!("id:{}", self.contract_id),
            "normalizer": self.normalizer.canonical_doc(),
            "predicate": self.predicate.canonical_doc(),
            "residual": self.residual.canonical_doc(),
            "residual_dim": format!("i:{}", self.residual_dim),
            "version": format!("i:{}", self.version),
            "weight": self.weight.canonical_doc(),
        })
    }
}

/// An ordered list of contracts with a canonical identity.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ContractSet {
    /// Contracts in declaration order (the order is part of the identity).
    pub contracts: Vec<Contract>,
}

impl ContractSet {
    /// Canonical JSON document: the ordered contract array.
    #[must_use]
    pub fn canonical_doc(&self) -> Json {
        Json::Array(self.contracts.iter().map(Contract::canonical_doc).collect())
    }

    /// Canonical bytes.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canon::to_canonical_bytes(&self.canonical_doc())
    }

    /// Contract set identity: SHA3-256 of the canonical bytes.
    #[must_use]
    pub fn id(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }

    /// Evaluates V(x) on a snapshot.
    ///
    /// Exact rational accumulation (auto-reduced after every elementary op),
    /// one half-even rounding at the end, metered against `max_v_eval_cost`
    /// and `max_bigint_bits`.
    pub fn eval_v(&self, state: &State, meter: &mut CostMeter<'_>) -> Result<DebtUnit, VError> {
        let mut total = BigRational::zero();
        for contract in &self.contracts {
            if !contract.predicate.applies(state) {
                continue;
            }
            meter.count_v_activation().map_err(VError::Cap)?;
            let residuals = contract.residual.eval(state).map_err(VError::Invariant)?;
            let sigma = contract.normalizer.eval(state).map_err(VError::Invariant)?;
            let mut sum_sq = BigInt::zero();
            for r in &residuals {
                meter.check_bits(r).map_err(VError::Cap)?;
                sum_sq += r * r;
                meter.check_bits(&sum_sq).map_err(VError::Cap)?;
            }
            let sigma_sq = &sigma * &sigma;
            meter.check_bits(&sigma_sq).map_err(VError::Cap)?;
            let term =
                contract.weight.to_rational() * BigRational::new(sum_sq, sigma_sq);
            meter.check_rational(&term).map_err(VError::Cap)?;
            total += term;
            meter.check_rational(&total).map_err(VError::Cap)?;
        }
        Ok(DebtUnit::from_rational(
            total.numer(),
            total.denom(),
            SCALE,
        )?)
    }
}

/// Compares `‖r₁‖²/σ₁²` against `‖r₂‖²/σ₂²` by cross-multiplication.
///
/// Division would round and can invert an inequality; comparing
/// `‖r₁‖²·σ₂²` against `‖r₂‖²·σ₁²` on plain integers cannot.
#[must_use]
pub fn norm_cmp(
    r1_sq: &BigInt,
    sigma1: &BigInt,
    r2_sq: &BigInt,
    sigma2: &BigInt,
) -> std::cmp::Ordering {
    let lhs = r1_sq * (sigma2 * sigma2);
    let rhs = r2_sq * (sigma1 * sigma1);
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ResourceCaps;
    use std::collections::BTreeMap;

    fn fid(n: u8) -> FieldId {
        let mut raw = [0u8; 16];
        raw[15] = n;
        FieldId(raw)
    }

    fn one_contract(weight: Weight) -> Contract {
        Contract {
            contract_id: "c.load".to_owned(),
            residual: ResidualFn::Field { field: fid(1) },
            residual_dim: 1,
            normalizer: NormalizerSpec::Const {
                sigma: DebtUnit::from_raw(1_000_000),
            },
            weight,
            predicate: Predicate::Always,
            version: 1,
        }
    }

    fn state_with(raw: i64) -> State {
        let mut fields = BTreeMap::new();
        fields.insert(fid(1), Value::Quantum(DebtUnit::from_raw(raw)));
        State::with_fields("schema.test.v1", fields)
    }

    fn eval(set: &ContractSet, state: &State) -> DebtUnit {
        let caps = ResourceCaps::unbounded(4);
        let mut meter = CostMeter::new(&caps);
        set.eval_v(state, &mut meter).unwrap()
    }

    #[test]
    fn v_matches_the_worked_example() {
        // r = 0.05, σ = 1.0, w = 1: V = (50000/1000000)² = 0.0025 = q:6:2500.
        let set = ContractSet {
            contracts: vec![one_contract(
                Weight::new(BigInt::one(), BigInt::one()).unwrap(),
            )],
        };
        assert_eq!(eval(&set, &state_with(50_000)), DebtUnit::from_raw(2500));
        assert_eq!(eval(&set, &state_with(0)), DebtUnit::zero());
    }

    #[test]
    fn weight_equivalence_across_representations() {
        // On the wire, unreduced weights reject outright.
        assert!(Weight::new(BigInt::from(2), BigInt::from(4)).is_err());
        assert!(Weight::new(BigInt::from(50), BigInt::from(100)).is_err());
        // Programmatic construction reduces first: 1/2, 2/4, and 50/100
        // yield the identical quantum.
        let expect = DebtUnit::from_raw(1250);
        for (num, den) in [(1, 2), (2, 4), (50, 100)] {
            let set = ContractSet {
                contracts: vec![one_contract(
                    Weight::reduced(BigInt::from(num), BigInt::from(den)).unwrap(),
                )],
            };
            assert_eq!(eval(&set, &state_with(50_000)), expect, "{num}/{den}");
        }
    }

    #[test]
    fn weight_rejects_negative_and_nonpositive_den() {
        assert!(Weight::new(BigInt::from(-1), BigInt::from(2)).is_err());
        assert!(Weight::new(BigInt::one(), BigInt::from(0)).is_err());
        assert!(Weight::new(BigInt::one(), BigInt::from(-2)).is_err());
        assert!(Weight::new(BigInt::zero(), BigInt::one()).is_ok());
    }

    #[test]
    fn inapplicable_contracts_contribute_zero_strictly() {
        // The predicate gates before arithmetic: with the contract gated off,
        // even a normalizer that would reject never evaluates.
        let mut contract = one_contract(Weight::new(BigInt::one(), BigInt::one()).unwrap());
        contract.normalizer = NormalizerSpec::Field { field: fid(9) };
        contract.predicate = Predicate::BlockActive { field: fid(2) };
        let set = ContractSet {
            contracts: vec![contract],
        };
        assert_eq!(eval(&set, &state_with(50_000)), DebtUnit::zero());
    }

    #[test]
    fn nonpositive_normalizer_rejects() {
        let mut contract = one_contract(Weight::new(BigInt::one(), BigInt::one()).unwrap());
        contract.normalizer = NormalizerSpec::Field { field: fid(1) };
        let set = ContractSet {
            contracts: vec![contract],
        };
        let caps = ResourceCaps::unbounded(4);
        let mut meter = CostMeter::new(&caps);
        assert_eq!(
            set.eval_v(&state_with(0), &mut meter),
            Err(VError::Invariant(InvariantId::NormalizerNonpositive))
        );
        let mut meter = CostMeter::new(&caps);
        assert_eq!(
            set.eval_v(&state_with(-5), &mut meter),
            Err(VError::Invariant(InvariantId::NormalizerNonpositive))
        );
    }

    #[test]
    fn const_normalizer_must_be_positive_at_build() {
        assert!(NormalizerSpec::from_id("norm.const.v1", Some(DebtUnit::zero()), None).is_err());
        assert!(
            NormalizerSpec::from_id("norm.const.v1", Some(DebtUnit::from_raw(-1)), None).is_err()
        );
    }

    #[test]
    fn unknown_ids_reject() {
        assert!(ResidualFn::from_id("res.bogus.v1", fid(1), None).is_err());
        assert!(NormalizerSpec::from_id("norm.bogus.v1", None, Some(fid(1))).is_err());
        assert!(Predicate::from_id("pred.bogus.v1", None).is_err());
    }

    #[test]
    fn v_eval_cost_counts_activations_only() {
        let active = one_contract(Weight::new(BigInt::one(), BigInt::one()).unwrap());
        let mut gated = active.clone();
        gated.predicate = Predicate::BlockActive { field: fid(2) };
        let set = ContractSet {
            contracts: vec![active, gated],
        };
        let caps = ResourceCaps {
            max_v_eval_cost: Some(1),
            ..ResourceCaps::unbounded(4)
        };
        let mut meter = CostMeter::new(&caps);
        // Only one contract activates; the cap of 1 holds.
        assert!(set.eval_v(&state_with(50_000), &mut meter).is_ok());
    }

    #[test]
    fn cross_multiplication_never_divides() {
        // 1/4 vs 2/9 compared exactly: 1·9 = 9 > 2·4 = 8.
        assert_eq!(
            norm_cmp(
                &BigInt::one(),
                &BigInt::from(2),
                &BigInt::from(2),
                &BigInt::from(3)
            ),
            std::cmp::Ordering::Greater
        );
        // Integer division would have said 0 == 0.
        assert_eq!(BigInt::one() / BigInt::from(4), BigInt::from(2) / BigInt::from(9));
    }

    #[test]
    fn contract_set_id_is_order_sensitive() {
        let a = one_contract(Weight::new(BigInt::one(), BigInt::one()).unwrap());
        let mut b = a.clone();
        b.contract_id = "c.other".to_owned();
        let ab = ContractSet {
            contracts: vec![a.clone(), b.clone()],
        };
        let ba = ContractSet {
            contracts: vec![b, a],
        };
        assert_ne!(ab.id(), ba.id());
    }
}
