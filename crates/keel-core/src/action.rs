// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Action descriptors.
//!
//! An action is the declared shape of a transition: a kind from a closed set,
//! the target blocks it touches, a payload of tagged atoms, a declared budget,
//! and an optional disturbance declaration. Actions are content-addressed:
//! `action_hash = SHA3-256(canonical bytes)`, and every action claims the
//! policy digest it was built against.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

use crate::canon;
use crate::error::ActionSchemaId;
use crate::ident::{hash_to_wire, Hash};
use crate::quantum::{DebtUnit, SCALE};
use crate::value::Value;

/// Closed set of declared action types.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ActionKind {
    /// Ordinary field writes.
    StateUpdate,
    /// Activate a contract.
    ContractActivate,
    /// Deactivate a contract.
    ContractDeactivate,
    /// Update a declared parameter.
    ParameterUpdate,
    /// Enforce a boundary condition.
    BoundaryEnforce,
}

impl ActionKind {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateUpdate => "state_update",
            Self::ContractActivate => "contract_activate",
            Self::ContractDeactivate => "contract_deactivate",
            Self::ParameterUpdate => "parameter_update",
            Self::BoundaryEnforce => "boundary_enforce",
        }
    }

    /// Parses a wire name; unknown kinds reject.
    pub fn from_str_strict(s: &str) -> Result<Self, ActionSchemaId> {
        match s {
            "state_update" => Ok(Self::StateUpdate),
            "contract_activate" => Ok(Self::ContractActivate),
            "contract_deactivate" => Ok(Self::ContractDeactivate),
            "parameter_update" => Ok(Self::ParameterUpdate),
            "boundary_enforce" => Ok(Self::BoundaryEnforce),
            _ => Err(ActionSchemaId::UnknownKind),
        }
    }
}

/// A validated action descriptor.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ActionDescriptor {
    /// Declared action type.
    pub kind: ActionKind,
    /// Target block indices: nonempty, sorted, unique.
    pub blocks: Vec<u32>,
    /// Structured payload; tagged atoms only, sorted by key.
    pub payload: BTreeMap<String, Value>,
    /// Declared budget (nonnegative chain-scale quantum).
    pub budget: DebtUnit,
    /// Declared disturbance admission (nonnegative; zero when undeclared).
    pub disturbance: DebtUnit,
    /// Optional disturbance event label.
    pub event_label: Option<String>,
    /// The policy digest this action claims.
    pub policy_digest: Hash,
}

impl ActionDescriptor {
    /// Validates the structural invariants of the descriptor.
    pub fn validate(&self) -> Result<(), ActionSchemaId> {
        if self.blocks.is_empty() {
            return Err(ActionSchemaId::BadBlocks);
        }
        if self.blocks.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ActionSchemaId::BadBlocks);
        }
        if self.budget.is_negative() || self.budget.scale() != SCALE {
            return Err(ActionSchemaId::BadBudget);
        }
        if self.disturbance.is_negative() || self.disturbance.scale() != SCALE {
            return Err(ActionSchemaId::BadDisturbance);
        }
        Ok(())
    }

    /// Canonical JSON document for this action.
    #[must_use]
    pub fn canonical_doc(&self) -> Json {
        let blocks: Vec<Json> = self
            .blocks
            .iter()
            .map(|b| json!(format!("i:{b}")))
            .collect();
        let payload: BTreeMap<&str, String> = self
            .payload
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_wire()))
            .collect();
        let mut doc = serde_json::Map::new();
        doc.insert("blocks".to_owned(), Json::Array(blocks));
        doc.insert("budget".to_owned(), json!(self.budget.to_wire()));
        doc.insert(
            "disturbance".to_owned(),
            json!(self.disturbance.to_wire()),
        );
        if let Some(label) = &self.event_label {
            doc.insert("event_label".to_owned(), json!(format!("s:{label}")));
        }
        doc.insert("kind".to_owned(), json!(format!("id:{}", self.kind.as_str())));
        doc.insert("payload".to_owned(), json!(payload));
        doc.insert(
            "policy_digest".to_owned(),
            json!(hash_to_wire(&self.policy_digest)),
        );
        Json::Object(doc)
    }

    /// Action hash: SHA3-256 of the canonical bytes.
    #[must_use]
    pub fn hash(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }
}
