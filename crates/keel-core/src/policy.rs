// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chain-wide frozen policy bundle.
//!
//! The bundle is built once at chain genesis and never mutated; its SHA3-256
//! digest is pinned into every receipt, and any mid-chain digest drift is a
//! terminal error. Service laws and disturbance policies are tagged variants
//! whose parameters are frozen at bundle-build time — verification depends
//! only on the variant tag and its parameters, never on anything ambient.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::canon::{self, FLOAT_POLICY_FORBID};
use crate::ident::{hash_to_wire, Hash};
use crate::quantum::DebtUnit;
use crate::scheduler::SCHEDULER_RULE_GREEDY_CURV_V1;

/// Violation-policy id for the weighted normalized-residual functional.
pub const VIOLATION_POLICY_WEIGHTED_RESIDUAL: &str = "v.weighted_residual.v1";

/// The only allowlisted DP3 disturbance model: identically zero.
pub const DISTURBANCE_MODEL_ZERO: &str = "dist.model.zero.v1";

/// Service law instance: a deterministic, monotone function of `(D, B)` with
/// `S(D,0) = S(0,B) = 0` and `0 ≤ S(D,B) ≤ D`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ServiceLaw {
    /// `S(D, B) = min(D, μ·B)`.
    LinearCapped {
        /// Service rate μ as a chain-scale quantum.
        mu: DebtUnit,
    },
}

impl ServiceLaw {
    /// Stable law id.
    #[must_use]
    pub fn law_id(&self) -> &'static str {
        match self {
            Self::LinearCapped { .. } => "linear_capped.v1",
        }
    }

    /// Computes the service `S(D, B)`.
    ///
    /// Negative debt or budget never reaches this point (both are declared
    /// nonnegative); the min keeps the result bounded by `D` regardless.
    pub fn service(
        &self,
        debt: &DebtUnit,
        budget: &DebtUnit,
    ) -> Result<DebtUnit, crate::quantum::QuantumError> {
        match self {
            Self::LinearCapped { mu } => {
                let capped = mu.mul_quantum(budget)?;
                Ok(if debt.checked_cmp(&capped)? == std::cmp::Ordering::Less {
                    debt.clone()
                } else {
                    capped
                })
            }
        }
    }

    fn canonical_doc(&self) -> Json {
        match self {
            Self::LinearCapped { mu } => json!({
                "law": format!("id:{}", self.law_id()),
                "mu": mu.to_wire(),
            }),
        }
    }
}

/// Disturbance policy class, frozen at bundle-build time.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum DisturbancePolicy {
    /// `DP0`: disturbances are forbidden (`E = 0`).
    Dp0,
    /// `DP1`: `0 ≤ E ≤ Ē` for the bundled bound.
    Dp1 {
        /// Upper bound `Ē`.
        e_max: DebtUnit,
    },
    /// `DP2`: `E ≤ β(event_type)`, with `β(absent) = 0`.
    Dp2 {
        /// Per-event-label bounds β.
        beta: BTreeMap<String, DebtUnit>,
    },
    /// `DP3`: `E` must equal a model-computed value bit-exactly.
    Dp3 {
        /// Allowlisted disturbance model id.
        model_id: String,
    },
}

/// Rejections produced by disturbance verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisturbanceError {
    /// A disturbance was declared negative.
    #[error("negative disturbance")]
    Negative,
    /// `DP0` requires `E = 0`.
    #[error("disturbance forbidden under DP0")]
    ForbiddenUnderDp0,
    /// The declared disturbance exceeded its policy bound.
    #[error("disturbance exceeds bound")]
    ExceedsBound,
    /// `DP3` model disagreement.
    #[error("disturbance does not match model value")]
    ModelMismatch,
    /// The bundled DP3 model id is not allowlisted.
    #[error("unknown disturbance model: {0}")]
    UnknownModel(String),
    /// Internal scale mismatch while comparing quanta.
    #[error("quantum error: {0}")]
    Quantum(#[from] crate::quantum::QuantumError),
}

impl DisturbancePolicy {
    /// Stable class id.
    #[must_use]
    pub fn class_id(&self) -> &'static str {
        match self {
            Self::Dp0 => "dp0.v1",
            Self::Dp1 { .. } => "dp1.v1",
            Self::Dp2 { .. } => "dp2.v1",
            Self::Dp3 { .. } => "dp3.v1",
        }
    }

    /// Verifies a declared disturbance against this policy.
    pub fn verify(
        &self,
        e: &DebtUnit,
        event_label: Option<&str>,
    ) -> Result<(), DisturbanceError> {
        if e.is_negative() {
            return Err(DisturbanceError::Negative);
        }
        match self {
            Self::Dp0 => {
                if !e.is_zero() {
                    return Err(DisturbanceError::ForbiddenUnderDp0);
                }
                Ok(())
            }
            Self::Dp1 { e_max } => {
                if e.checked_cmp(e_max)? == std::cmp::Ordering::Greater {
                    return Err(DisturbanceError::ExceedsBound);
                }
                Ok(())
            }
            Self::Dp2 { beta } => {
                let bound = event_label
                    .and_then(|label| beta.get(label))
                    .cloned()
                    .unwrap_or_else(DebtUnit::zero);
                if e.checked_cmp(&bound)? == std::cmp::Ordering::Greater {
                    return Err(DisturbanceError::ExceedsBound);
                }
                Ok(())
            }
            Self::Dp3 { model_id } => {
                let modeled = match model_id.as_str() {
                    DISTURBANCE_MODEL_ZERO => DebtUnit::zero(),
                    other => return Err(DisturbanceError::UnknownModel(other.to_owned())),
                };
                if e != &modeled {
                    return Err(DisturbanceError::ModelMismatch);
                }
                Ok(())
            }
        }
    }

    fn canonical_doc(&self) -> Json {
        match self {
            Self::Dp0 => json!({ "class": format!("id:{}", self.class_id()) }),
            Self::Dp1 { e_max } => json!({
                "class": format!("id:{}", self.class_id()),
                "e_max": e_max.to_wire(),
            }),
            Self::Dp2 { beta } => {
                let beta_doc: BTreeMap<&str, String> = beta
                    .iter()
                    .map(|(label, bound)| (label.as_str(), bound.to_wire()))
                    .collect();
                json!({
                    "beta": beta_doc,
                    "class": format!("id:{}", self.class_id()),
                })
            }
            Self::Dp3 { model_id } => json!({
                "class": format!("id:{}", self.class_id()),
                "model": format!("id:{model_id}"),
            }),
        }
    }
}

/// Optional resource caps, all enforced as `≤` (exceeding is terminal).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ResourceCaps {
    /// Per-scalar bit bound during δ-norm and ε̂ accumulation.
    pub max_bigint_bits: Option<u64>,
    /// Bound on off-diagonal products contributing to ε̂.
    pub max_matrix_accum_terms: Option<u64>,
    /// Bound on `|R ∪ W|` per op.
    pub max_fields_touched_per_op: Option<u64>,
    /// Bound on contract activations contributing to V.
    pub max_v_eval_cost: Option<u64>,
    /// Optional hard cap on `ε_measured`.
    pub max_epsilon: Option<DebtUnit>,
    /// Maximum batch size.
    pub max_parallel_width: u32,
}

impl ResourceCaps {
    /// Caps with nothing optional set and the given width.
    pub fn unbounded(max_parallel_width: u32) -> Self {
        Self {
            max_bigint_bits: None,
            max_matrix_accum_terms: None,
            max_fields_touched_per_op: None,
            max_v_eval_cost: None,
            max_epsilon: None,
            max_parallel_width,
        }
    }

    fn canonical_doc(&self) -> Json {
        let mut caps = serde_json::Map::new();
        if let Some(v) = self.max_bigint_bits {
            caps.insert("max_bigint_bits".to_owned(), json!(format!("i:{v}")));
        }
        if let Some(v) = self.max_matrix_accum_terms {
            caps.insert("max_matrix_accum_terms".to_owned(), json!(format!("i:{v}")));
        }
        if let Some(v) = self.max_fields_touched_per_op {
            caps.insert(
                "max_fields_touched_per_op".to_owned(),
                json!(format!("i:{v}")),
            );
        }
        if let Some(v) = self.max_v_eval_cost {
            caps.insert("max_v_eval_cost".to_owned(), json!(format!("i:{v}")));
        }
        if let Some(v) = &self.max_epsilon {
            caps.insert("max_epsilon".to_owned(), json!(v.to_wire()));
        }
        caps.insert(
            "max_parallel_width".to_owned(),
            json!(format!("i:{}", self.max_parallel_width)),
        );
        Json::Object(caps)
    }
}

/// The frozen chain-wide configuration.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PolicyBundle {
    /// Bundle id.
    pub policy_id: String,
    /// Violation-policy id (see [`VIOLATION_POLICY_WEIGHTED_RESIDUAL`]).
    pub violation_policy: String,
    /// Service law instance.
    pub service: ServiceLaw,
    /// Disturbance policy class and parameters.
    pub disturbance: DisturbancePolicy,
    /// Curvature matrix version id.
    pub matrix_version: String,
    /// Digest of the curvature matrix canonical bytes.
    pub matrix_digest: Hash,
    /// Digest of the kernel registry.
    pub kernel_registry_digest: Hash,
    /// Allowed scheduler rule (must be `greedy.curv.v1`).
    pub scheduler_rule: String,
    /// Resource caps.
    pub caps: ResourceCaps,
    /// Genesis previous-hash override; absent means 32 zero bytes.
    pub genesis_prev_hash: Option<Hash>,
}

impl PolicyBundle {
    /// True when the plan's scheduler rule is the allowlisted one.
    #[must_use]
    pub fn allows_scheduler_rule(&self, rule: &str) -> bool {
        rule == self.scheduler_rule && rule == SCHEDULER_RULE_GREEDY_CURV_V1
    }

    /// The chain's genesis previous-hash.
    #[must_use]
    pub fn genesis(&self) -> Hash {
        self.genesis_prev_hash
            .unwrap_or(crate::ident::GENESIS_PREV_HASH)
    }

    /// Canonical JSON document (sorted tagged atoms).
    #[must_use]
    pub fn canonical_doc(&self) -> Json {
        let mut doc = serde_json::Map::new();
        doc.insert(
            "policy_id".to_owned(),
            json!(format!("id:{}", self.policy_id)),
        );
        doc.insert(
            "violation_policy".to_owned(),
            json!(format!("id:{}", self.violation_policy)),
        );
        doc.insert("service_law".to_owned(), self.service.canonical_doc());
        doc.insert("disturbance".to_owned(), self.disturbance.canonical_doc());
        doc.insert(
            "matrix_version".to_owned(),
            json!(format!("id:{}", self.matrix_version)),
        );
        doc.insert(
            "matrix_digest".to_owned(),
            json!(hash_to_wire(&self.matrix_digest)),
        );
        doc.insert(
            "kernel_registry_digest".to_owned(),
            json!(hash_to_wire(&self.kernel_registry_digest)),
        );
        doc.insert(
            "scheduler_rule".to_owned(),
            json!(format!("id:{}", self.scheduler_rule)),
        );
        doc.insert("float_policy".to_owned(), json!(FLOAT_POLICY_FORBID));
        doc.insert("caps".to_owned(), self.caps.canonical_doc());
        if let Some(genesis) = &self.genesis_prev_hash {
            doc.insert("genesis_prev_hash".to_owned(), json!(hash_to_wire(genesis)));
        }
        Json::Object(doc)
    }

    /// Canonical bytes of the bundle.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canon::to_canonical_bytes(&self.canonical_doc())
    }

    /// SHA3-256 digest pinned into every receipt.
    #[must_use]
    pub fn digest(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }
}
