// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Execution plans: OpSpecs and the operation DAG.
//!
//! A plan is the immutable input the scheduler works from: a tuple of
//! operation specs with declared footprints and bounds, a set of dependency
//! edges, and the policy identity it was lowered against. Declaration order
//! carries no meaning — every consumer orders ops canonically by `op_id`
//! bytes, so reordering the OpSpec tuple cannot change the ledger.

use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::action::{ActionDescriptor, ActionKind};
use crate::canon;
use crate::error::ActionSchemaId;
use crate::footprint::{FieldSet, Footprint};
use crate::ident::{hash_to_wire, Hash, OpId};
use crate::kernel::Params;
use crate::quantum::{DebtUnit, SCALE};

/// Scheduler execution mode (the "glb mode" pinned into local receipts).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GlbMode {
    /// Conservative mode: float-touching ops are vetoed.
    C,
    /// Mode D: admits ops that declare a mode-D requirement or float touch.
    D,
}

impl GlbMode {
    /// Stable wire id.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::C => "glb.c.v1",
            Self::D => "glb.d.v1",
        }
    }

    /// Parses the wire id; unknown modes reject.
    pub fn from_id(s: &str) -> Result<Self, PlanError> {
        match s {
            "glb.c.v1" => Ok(Self::C),
            "glb.d.v1" => Ok(Self::D),
            _ => Err(PlanError::UnknownMode(s.to_owned())),
        }
    }
}

/// Dependency edge kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EdgeKind {
    /// Write-after-read ordering.
    War,
    /// Write-after-write ordering.
    Waw,
    /// Explicit control dependency from the source program.
    ControlExplicit,
}

impl EdgeKind {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::War => "WAR",
            Self::Waw => "WAW",
            Self::ControlExplicit => "control.explicit",
        }
    }

    /// Parses the wire name; unknown kinds reject.
    pub fn from_str_strict(s: &str) -> Result<Self, PlanError> {
        match s {
            "WAR" => Ok(Self::War),
            "WAW" => Ok(Self::Waw),
            "control.explicit" => Ok(Self::ControlExplicit),
            _ => Err(PlanError::UnknownEdgeKind(s.to_owned())),
        }
    }
}

/// One dependency edge `(predecessor, successor)`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PlanEdge {
    /// The op that must commit first.
    pub from: OpId,
    /// The op unblocked by the commit.
    pub to: OpId,
    /// Edge kind.
    pub kind: EdgeKind,
}

/// Per-operation specification.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OpSpec {
    /// Stable op identifier (derived upstream from module digest, source
    /// path, and binder index).
    pub op_id: OpId,
    /// Registry id of the kernel this op runs.
    pub kernel_id: String,
    /// SHA3-256 of the allowlisted kernel body.
    pub kernel_hash: Hash,
    /// Frozen kernel parameters.
    pub params: Params,
    /// Declared read/write footprint (disjoint sets).
    pub footprint: Footprint,
    /// Curvature block index.
    pub block: u32,
    /// δ-bound `a` (strictly positive chain-scale quantum).
    pub delta_bound: DebtUnit,
    /// True when the op may only run in mode D.
    pub requires_mode_d: bool,
    /// True when the kernel touches floating point internally.
    pub float_touch: bool,
    /// Declared budget for this op's share of the batch action.
    pub budget: DebtUnit,
    /// Declared disturbance admission for this op.
    pub disturbance: DebtUnit,
    /// Optional disturbance event label.
    pub event_label: Option<String>,
}

impl OpSpec {
    /// Digest of the declared footprint.
    #[must_use]
    pub fn footprint_digest(&self) -> Hash {
        self.footprint.digest()
    }

    /// Canonical JSON document with sorted sets.
    #[must_use]
    pub fn canonical_doc(&self) -> Json {
        let params: std::collections::BTreeMap<&str, String> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_wire()))
            .collect();
        let mut doc = serde_json::Map::new();
        doc.insert("block".to_owned(), json!(format!("i:{}", self.block)));
        doc.insert("budget".to_owned(), json!(self.budget.to_wire()));
        doc.insert(
            "delta_bound".to_owned(),
            json!(self.delta_bound.to_wire()),
        );
        doc.insert(
            "disturbance".to_owned(),
            json!(self.disturbance.to_wire()),
        );
        if let Some(label) = &self.event_label {
            doc.insert("event_label".to_owned(), json!(format!("s:{label}")));
        }
        doc.insert(
            "float_touch".to_owned(),
            json!(self.float_touch),
        );
        doc.insert("footprint".to_owned(), self.footprint.canonical_doc());
        doc.insert(
            "footprint_digest".to_owned(),
            json!(hash_to_wire(&self.footprint_digest())),
        );
        doc.insert(
            "kernel_hash".to_owned(),
            json!(hash_to_wire(&self.kernel_hash)),
        );
        doc.insert(
            "kernel_id".to_owned(),
            json!(format!("id:{}", self.kernel_id)),
        );
        doc.insert("op_id".to_owned(), json!(self.op_id.to_wire()));
        doc.insert("params".to_owned(), json!(params));
        doc.insert(
            "requires_mode_d".to_owned(),
            json!(self.requires_mode_d),
        );
        Json::Object(doc)
    }
}

/// Rejections produced while validating a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// An op's read and write sets overlapped.
    #[error("op {0:?} has overlapping read/write sets")]
    OverlappingFootprint(OpId),
    /// An op declared a nonpositive δ-bound.
    #[error("op {0:?} has nonpositive delta bound")]
    NonPositiveDeltaBound(OpId),
    /// An op declared a negative budget or disturbance.
    #[error("op {0:?} has negative budget or disturbance")]
    NegativeBudget(OpId),
    /// Two ops shared an id.
    #[error("duplicate op id {0:?}")]
    DuplicateOpId(OpId),
    /// An edge referenced an op not in the plan.
    #[error("edge references unknown op {0:?}")]
    UnknownEdgeOp(OpId),
    /// Max parallel width was zero.
    #[error("zero parallel width")]
    ZeroWidth,
    /// `abort_on_kernel_error` must be true.
    #[error("abort_on_kernel_error must be set")]
    AbortFlagNotSet,
    /// Unknown scheduler mode id.
    #[error("unknown mode id: {0}")]
    UnknownMode(String),
    /// Unknown edge kind.
    #[error("unknown edge kind: {0}")]
    UnknownEdgeKind(String),
    /// A quantum in the plan was not at the chain scale.
    #[error("op {0:?} declares an off-scale quantum")]
    OffScaleQuantum(OpId),
}

/// A validated execution plan.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExecutionPlan {
    /// Policy bundle id the plan was lowered against.
    pub policy_id: String,
    /// Policy bundle digest the plan claims.
    pub policy_digest: Hash,
    /// Hash of the initial state the plan starts from.
    pub initial_state_hash: Hash,
    /// Operation specs (declaration order is not meaningful).
    pub ops: Vec<OpSpec>,
    /// Dependency edges.
    pub edges: Vec<PlanEdge>,
    /// Maximum batch size.
    pub max_parallel_width: u32,
    /// Scheduler rule id (must be allowlisted by the bundle).
    pub scheduler_rule: String,
    /// Scheduler mode.
    pub mode: GlbMode,
    /// Fields that must remain nonnegative across every patch.
    pub nonneg_fields: FieldSet,
    /// Kernel errors abort the run (the only supported setting).
    pub abort_on_kernel_error: bool,
}

impl ExecutionPlan {
    /// Validates structural invariants; returns the plan on success.
    pub fn validated(self) -> Result<Self, PlanError> {
        if self.max_parallel_width == 0 {
            return Err(PlanError::ZeroWidth);
        }
        if !self.abort_on_kernel_error {
            return Err(PlanError::AbortFlagNotSet);
        }
        let mut seen: std::collections::BTreeSet<&OpId> = std::collections::BTreeSet::new();
        for op in &self.ops {
            if !seen.insert(&op.op_id) {
                return Err(PlanError::DuplicateOpId(op.op_id.clone()));
            }
            if op.footprint.reads.intersects(&op.footprint.writes) {
                return Err(PlanError::OverlappingFootprint(op.op_id.clone()));
            }
            if op.delta_bound.scale() != SCALE
                || op.budget.scale() != SCALE
                || op.disturbance.scale() != SCALE
            {
                return Err(PlanError::OffScaleQuantum(op.op_id.clone()));
            }
            if op.delta_bound.is_negative() || op.delta_bound.is_zero() {
                return Err(PlanError::NonPositiveDeltaBound(op.op_id.clone()));
            }
            if op.budget.is_negative() || op.disturbance.is_negative() {
                return Err(PlanError::NegativeBudget(op.op_id.clone()));
            }
        }
        for edge in &self.edges {
            if !seen.contains(&edge.from) {
                return Err(PlanError::UnknownEdgeOp(edge.from.clone()));
            }
            if !seen.contains(&edge.to) {
                return Err(PlanError::UnknownEdgeOp(edge.to.clone()));
            }
        }
        Ok(self)
    }

    /// Looks up an op by id.
    #[must_use]
    pub fn op(&self, id: &OpId) -> Option<&OpSpec> {
        self.ops.iter().find(|op| &op.op_id == id)
    }

    /// Canonical JSON document. Ops and edges are emitted in canonical order
    /// so that declaration order cannot leak into the plan id.
    #[must_use]
    pub fn canonical_doc(&self) -> Json {
        let mut ops: Vec<&OpSpec> = self.ops.iter().collect();
        ops.sort_by(|a, b| a.op_id.cmp(&b.op_id));
        let ops: Vec<Json> = ops.iter().map(|op| op.canonical_doc()).collect();
        let mut edges: Vec<&PlanEdge> = self.edges.iter().collect();
        edges.sort_by(|a, b| {
            (&a.from, &a.to, a.kind.as_str()).cmp(&(&b.from, &b.to, b.kind.as_str()))
        });
        let edges: Vec<Json> = edges
            .iter()
            .map(|e| json!([e.from.to_wire(), e.to.to_wire(), e.kind.as_str()]))
            .collect();
        let nonneg: Vec<Json> = self
            .nonneg_fields
            .iter()
            .map(|id| json!(id.to_hex()))
            .collect();
        json!({
            "abort_on_kernel_error": self.abort_on_kernel_error,
            "edges": edges,
            "initial_state_hash": hash_to_wire(&self.initial_state_hash),
            "max_parallel_width": format!("i:{}", self.max_parallel_width),
            "mode": format!("id:{}", self.mode.id()),
            "nonneg_fields": nonneg,
            "ops": ops,
            "policy_digest": hash_to_wire(&self.policy_digest),
            "policy_id": format!("id:{}", self.policy_id),
            "scheduler_rule": format!("id:{}", self.scheduler_rule),
        })
    }

    /// Plan id: SHA3-256 of the canonical bytes.
    #[must_use]
    pub fn plan_id(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }

    /// Reconstructs the canonical batch action for a set of ops.
    ///
    /// Kind is `state_update`; target blocks are the sorted dedup union of
    /// op blocks; budget and disturbance are the op sums; the event label
    /// must be uniform across the ops that declare one.
    pub fn batch_action(
        &self,
        ops: &[&OpSpec],
        policy_digest: Hash,
    ) -> Result<ActionDescriptor, ActionSchemaId> {
        let mut blocks: Vec<u32> = ops.iter().map(|op| op.block).collect();
        blocks.sort_unstable();
        blocks.dedup();
        let mut budget = DebtUnit::zero();
        let mut disturbance = DebtUnit::zero();
        let mut label: Option<&String> = None;
        for op in ops {
            budget = budget
                .checked_add(&op.budget)
                .map_err(|_| ActionSchemaId::BadBudget)?;
            disturbance = disturbance
                .checked_add(&op.disturbance)
                .map_err(|_| ActionSchemaId::BadDisturbance)?;
            if let Some(l) = &op.event_label {
                match label {
                    None => label = Some(l),
                    Some(existing) if existing == l => {}
                    Some(_) => return Err(ActionSchemaId::MixedEventLabel),
                }
            }
        }
        let action = ActionDescriptor {
            kind: ActionKind::StateUpdate,
            blocks,
            payload: std::collections::BTreeMap::new(),
            budget,
            disturbance,
            event_label: label.cloned(),
            policy_digest,
        };
        action.validate()?;
        Ok(action)
    }
}
