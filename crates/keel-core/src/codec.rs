// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Strict document parsers for every wire schema.
//!
//! Parse, then validate, never trust: every document is read through a
//! field reader that consumes keys one by one and rejects anything left
//! over, so an unknown field anywhere — a receipt especially — is a decode
//! failure. Numeric strings must be canonical (`i:` atoms, no `+`, no
//! leading zeros), hashes must carry `h:`, ids `id:`. Emission reuses the
//! types' own canonical documents, so `parse(emit(x)) == x` by
//! construction.

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};
use thiserror::Error;

use crate::canon::{CANON_ID_SORTED_JSON_V1, FLOAT_POLICY_FORBID};
use crate::contract::{
    Contract, ContractBuildError, ContractSet, NormalizerSpec, Predicate, ResidualFn, Weight,
};
use crate::curvature::{
    CurvatureError, CurvatureMatrix, MatrixEntry, DOMAIN_MODE_NONNEG, ENTRY_MODE_UPPER_SPARSE,
    SYMMETRY_MODE_SYMMETRIC,
};
use crate::error::TerminalError;
use crate::footprint::{FieldSet, Footprint};
use crate::ident::{hash_from_wire, hash_to_wire, FieldId, Hash, IdentError, OpId};
use crate::kernel::Params;
use crate::plan::{EdgeKind, ExecutionPlan, GlbMode, OpSpec, PlanEdge, PlanError};
use crate::policy::{DisturbancePolicy, PolicyBundle, ResourceCaps, ServiceLaw};
use crate::quantum::{parse_canonical_int, DebtUnit, QuantumError, SCALE};
use crate::receipt::CommitReceipt;
use crate::state::State;
use crate::value::{Value, ValueError};

/// Decode failures for wire documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The document was not a JSON object where one was required.
    #[error("expected object")]
    NotAnObject,
    /// The document was not a JSON array where one was required.
    #[error("expected array")]
    NotAnArray,
    /// A required field was absent.
    #[error("missing field: {0}")]
    Missing(&'static str),
    /// A field was present that the schema does not define.
    #[error("unknown field: {0}")]
    UnknownField(String),
    /// A field had the wrong shape.
    #[error("malformed field: {0}")]
    Malformed(&'static str),
    /// A constant field did not carry its pinned value.
    #[error("unsupported value for {0}")]
    Unsupported(&'static str),
    /// Identifier decode failure.
    #[error("ident: {0}")]
    Ident(#[from] IdentError),
    /// Quantum literal decode failure.
    #[error("quantum: {0}")]
    Quantum(#[from] QuantumError),
    /// Tagged-atom decode failure.
    #[error("value: {0}")]
    Value(#[from] ValueError),
    /// Contract construction rejection.
    #[error("contract: {0}")]
    Contract(#[from] ContractBuildError),
    /// Curvature matrix rejection.
    #[error("curvature: {0}")]
    Curvature(#[from] CurvatureError),
    /// Plan rejection.
    #[error("plan: {0}")]
    Plan(#[from] PlanError),
    /// Fields were out of canonical order or duplicated.
    #[error("fields not in canonical order")]
    NonCanonicalOrder,
}

// =============================================================================
// Field reader
// =============================================================================

/// Consumes an object's fields one by one; leftovers are unknown fields.
struct FieldReader<'a> {
    map: &'a Map<String, Json>,
    consumed: std::collections::BTreeSet<&'a str>,
}

impl<'a> FieldReader<'a> {
    fn new(doc: &'a Json) -> Result<Self, DecodeError> {
        let map = doc.as_object().ok_or(DecodeError::NotAnObject)?;
        Ok(Self {
            map,
            consumed: std::collections::BTreeSet::new(),
        })
    }

    fn take(&mut self, key: &'static str) -> Result<&'a Json, DecodeError> {
        let value = self.map.get(key).ok_or(DecodeError::Missing(key))?;
        self.consumed.insert(key);
        Ok(value)
    }

    fn take_opt(&mut self, key: &'static str) -> Option<&'a Json> {
        let value = self.map.get(key)?;
        self.consumed.insert(key);
        Some(value)
    }

    fn take_str(&mut self, key: &'static str) -> Result<&'a str, DecodeError> {
        self.take(key)?
            .as_str()
            .ok_or(DecodeError::Malformed(key))
    }

    fn take_bool(&mut self, key: &'static str) -> Result<bool, DecodeError> {
        self.take(key)?
            .as_bool()
            .ok_or(DecodeError::Malformed(key))
    }

    fn take_hash(&mut self, key: &'static str) -> Result<Hash, DecodeError> {
        Ok(hash_from_wire(self.take_str(key)?)?)
    }

    fn take_id(&mut self, key: &'static str) -> Result<String, DecodeError> {
        let s = self.take_str(key)?;
        s.strip_prefix("id:")
            .map(str::to_owned)
            .ok_or(DecodeError::Malformed(key))
    }

    fn take_quantum(&mut self, key: &'static str) -> Result<DebtUnit, DecodeError> {
        let q = DebtUnit::from_wire(self.take_str(key)?)?;
        if q.scale() != SCALE {
            return Err(DecodeError::Malformed(key));
        }
        Ok(q)
    }

    fn take_index(&mut self, key: &'static str) -> Result<u32, DecodeError> {
        parse_index(self.take_str(key)?).ok_or(DecodeError::Malformed(key))
    }

    fn finish(self) -> Result<(), DecodeError> {
        for key in self.map.keys() {
            if !self.consumed.contains(key.as_str()) {
                return Err(DecodeError::UnknownField(key.clone()));
            }
        }
        Ok(())
    }
}

fn parse_index(s: &str) -> Option<u32> {
    let body = s.strip_prefix("i:")?;
    crate::quantum::parse_canonical_u32(body)
}

fn parse_count(s: &str) -> Option<u64> {
    let body = s.strip_prefix("i:")?;
    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if body.len() > 1 && body.starts_with('0') {
        return None;
    }
    body.parse().ok()
}

fn parse_text_atom(doc: &Json, key: &'static str) -> Result<String, DecodeError> {
    let s = doc.as_str().ok_or(DecodeError::Malformed(key))?;
    match Value::from_wire(s)? {
        Value::Str(text) => Ok(text),
        _ => Err(DecodeError::Malformed(key)),
    }
}

// =============================================================================
// State
// =============================================================================

/// Parses a canonical state document.
pub fn parse_state(doc: &Json) -> Result<State, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let canon_id = r.take_str("canon_id")?;
    if canon_id != CANON_ID_SORTED_JSON_V1 {
        return Err(DecodeError::Unsupported("canon_id"));
    }
    let float_policy = r.take_str("float_policy")?;
    if float_policy != FLOAT_POLICY_FORBID {
        return Err(DecodeError::Unsupported("float_policy"));
    }
    let schema_id = r.take_str("schema_id")?.to_owned();
    let fields_doc = r.take("fields")?.as_array().ok_or(DecodeError::NotAnArray)?;
    r.finish()?;

    let mut fields: BTreeMap<FieldId, Value> = BTreeMap::new();
    let mut prev: Option<FieldId> = None;
    for pair in fields_doc {
        let pair = pair.as_array().ok_or(DecodeError::Malformed("fields"))?;
        if pair.len() != 2 {
            return Err(DecodeError::Malformed("fields"));
        }
        let id_str = pair[0].as_str().ok_or(DecodeError::Malformed("fields"))?;
        let id = FieldId::from_hex(id_str)?;
        if prev.is_some_and(|p| p >= id) {
            return Err(DecodeError::NonCanonicalOrder);
        }
        prev = Some(id);
        let atom = pair[1].as_str().ok_or(DecodeError::Malformed("fields"))?;
        fields.insert(id, Value::from_wire(atom)?);
    }
    Ok(State::with_fields(schema_id, fields))
}

// =============================================================================
// Policy bundle
// =============================================================================

/// Parses a policy bundle document.
pub fn parse_policy(doc: &Json) -> Result<PolicyBundle, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let policy_id = r.take_id("policy_id")?;
    let violation_policy = r.take_id("violation_policy")?;
    let service = parse_service_law(r.take("service_law")?)?;
    let disturbance = parse_disturbance(r.take("disturbance")?)?;
    let matrix_version = r.take_id("matrix_version")?;
    let matrix_digest = r.take_hash("matrix_digest")?;
    let kernel_registry_digest = r.take_hash("kernel_registry_digest")?;
    let scheduler_rule = r.take_id("scheduler_rule")?;
    let float_policy = r.take_str("float_policy")?;
    if float_policy != FLOAT_POLICY_FORBID {
        return Err(DecodeError::Unsupported("float_policy"));
    }
    let caps = parse_caps(r.take("caps")?)?;
    let genesis_prev_hash = match r.take_opt("genesis_prev_hash") {
        Some(value) => Some(hash_from_wire(
            value.as_str().ok_or(DecodeError::Malformed("genesis_prev_hash"))?,
        )?),
        None => None,
    };
    r.finish()?;
    Ok(PolicyBundle {
        policy_id,
        violation_policy,
        service,
        disturbance,
        matrix_version,
        matrix_digest,
        kernel_registry_digest,
        scheduler_rule,
        caps,
        genesis_prev_hash,
    })
}

fn parse_service_law(doc: &Json) -> Result<ServiceLaw, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let law = r.take_id("law")?;
    match law.as_str() {
        "linear_capped.v1" => {
            let mu = r.take_quantum("mu")?;
            r.finish()?;
            Ok(ServiceLaw::LinearCapped { mu })
        }
        _ => Err(DecodeError::Unsupported("law")),
    }
}

fn parse_disturbance(doc: &Json) -> Result<DisturbancePolicy, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let class = r.take_id("class")?;
    let policy = match class.as_str() {
        "dp0.v1" => DisturbancePolicy::Dp0,
        "dp1.v1" => DisturbancePolicy::Dp1 {
            e_max: r.take_quantum("e_max")?,
        },
        "dp2.v1" => {
            let beta_doc = r.take("beta")?.as_object().ok_or(DecodeError::NotAnObject)?;
            let mut beta = BTreeMap::new();
            for (label, bound) in beta_doc {
                let bound = DebtUnit::from_wire(
                    bound.as_str().ok_or(DecodeError::Malformed("beta"))?,
                )?;
                beta.insert(label.clone(), bound);
            }
            DisturbancePolicy::Dp2 { beta }
        }
        "dp3.v1" => DisturbancePolicy::Dp3 {
            model_id: r.take_id("model")?,
        },
        _ => return Err(DecodeError::Unsupported("class")),
    };
    r.finish()?;
    Ok(policy)
}

fn parse_caps(doc: &Json) -> Result<ResourceCaps, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let take_count = |r: &mut FieldReader<'_>, key: &'static str| -> Result<Option<u64>, DecodeError> {
        match r.take_opt(key) {
            Some(value) => {
                let s = value.as_str().ok_or(DecodeError::Malformed(key))?;
                Ok(Some(parse_count(s).ok_or(DecodeError::Malformed(key))?))
            }
            None => Ok(None),
        }
    };
    let max_bigint_bits = take_count(&mut r, "max_bigint_bits")?;
    let max_matrix_accum_terms = take_count(&mut r, "max_matrix_accum_terms")?;
    let max_fields_touched_per_op = take_count(&mut r, "max_fields_touched_per_op")?;
    let max_v_eval_cost = take_count(&mut r, "max_v_eval_cost")?;
    let max_epsilon = match r.take_opt("max_epsilon") {
        Some(value) => Some(DebtUnit::from_wire(
            value.as_str().ok_or(DecodeError::Malformed("max_epsilon"))?,
        )?),
        None => None,
    };
    let max_parallel_width = r.take_index("max_parallel_width")?;
    r.finish()?;
    Ok(ResourceCaps {
        max_bigint_bits,
        max_matrix_accum_terms,
        max_fields_touched_per_op,
        max_v_eval_cost,
        max_epsilon,
        max_parallel_width,
    })
}

// =============================================================================
// Contract set
// =============================================================================

/// Parses a contract set document (an ordered array of contracts).
pub fn parse_contracts(doc: &Json) -> Result<ContractSet, DecodeError> {
    let contracts_doc = doc.as_array().ok_or(DecodeError::NotAnArray)?;
    let mut contracts = Vec::with_capacity(contracts_doc.len());
    for contract_doc in contracts_doc {
        contracts.push(parse_contract(contract_doc)?);
    }
    Ok(ContractSet { contracts })
}

fn parse_contract(doc: &Json) -> Result<Contract, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let contract_id = r.take_id("contract_id")?;
    let residual = parse_residual(r.take("residual")?)?;
    let normalizer = parse_normalizer(r.take("normalizer")?)?;
    let predicate = parse_predicate(r.take("predicate")?)?;
    let residual_dim = r.take_index("residual_dim")?;
    let version = r.take_index("version")?;
    let weight = parse_weight(r.take("weight")?)?;
    r.finish()?;
    Ok(Contract {
        contract_id,
        residual,
        residual_dim,
        normalizer,
        weight,
        predicate,
        version,
    })
}

fn parse_residual(doc: &Json) -> Result<ResidualFn, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let id = r.take_id("fn")?;
    let field = FieldId::from_hex(r.take_str("field")?)?;
    let target = match r.take_opt("target") {
        Some(value) => Some(DebtUnit::from_wire(
            value.as_str().ok_or(DecodeError::Malformed("target"))?,
        )?),
        None => None,
    };
    r.finish()?;
    Ok(ResidualFn::from_id(&id, field, target)?)
}

fn parse_normalizer(doc: &Json) -> Result<NormalizerSpec, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let id = r.take_id("spec")?;
    let sigma = match r.take_opt("sigma") {
        Some(value) => Some(DebtUnit::from_wire(
            value.as_str().ok_or(DecodeError::Malformed("sigma"))?,
        )?),
        None => None,
    };
    let field = match r.take_opt("field") {
        Some(value) => Some(FieldId::from_hex(
            value.as_str().ok_or(DecodeError::Malformed("field"))?,
        )?),
        None => None,
    };
    r.finish()?;
    Ok(NormalizerSpec::from_id(&id, sigma, field)?)
}

fn parse_predicate(doc: &Json) -> Result<Predicate, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let id = r.take_id("pred")?;
    let field = match r.take_opt("field") {
        Some(value) => Some(FieldId::from_hex(
            value.as_str().ok_or(DecodeError::Malformed("field"))?,
        )?),
        None => None,
    };
    r.finish()?;
    Ok(Predicate::from_id(&id, field)?)
}

fn parse_weight(doc: &Json) -> Result<Weight, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let num = parse_canonical_int(r.take_str("num")?).ok_or(DecodeError::Malformed("num"))?;
    let den = parse_canonical_int(r.take_str("den")?).ok_or(DecodeError::Malformed("den"))?;
    r.finish()?;
    Ok(Weight::new(num, den)?)
}

// =============================================================================
// Curvature matrix
// =============================================================================

/// Parses and validates a curvature matrix document.
pub fn parse_matrix(doc: &Json) -> Result<CurvatureMatrix, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let matrix_id = r.take_str("matrix_id")?.to_owned();
    let version = r.take_str("version")?.to_owned();
    if r.take_str("entry_mode")? != ENTRY_MODE_UPPER_SPARSE {
        return Err(DecodeError::Unsupported("entry_mode"));
    }
    if r.take_str("symmetry_mode")? != SYMMETRY_MODE_SYMMETRIC {
        return Err(DecodeError::Unsupported("symmetry_mode"));
    }
    if r.take_str("domain_mode")? != DOMAIN_MODE_NONNEG {
        return Err(DecodeError::Unsupported("domain_mode"));
    }
    let block_count = r
        .take("block_count")?
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(DecodeError::Malformed("block_count"))?;
    let entries_doc = r.take("entries")?.as_array().ok_or(DecodeError::NotAnArray)?;
    r.finish()?;

    let mut entries = Vec::with_capacity(entries_doc.len());
    for entry_doc in entries_doc {
        let mut er = FieldReader::new(entry_doc)?;
        let i = er
            .take("i")?
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(DecodeError::Malformed("i"))?;
        let j = er
            .take("j")?
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or(DecodeError::Malformed("j"))?;
        let num = parse_canonical_int(er.take_str("num")?).ok_or(DecodeError::Malformed("num"))?;
        let den = parse_canonical_int(er.take_str("den")?).ok_or(DecodeError::Malformed("den"))?;
        er.finish()?;
        entries.push(MatrixEntry { i, j, num, den });
    }
    Ok(CurvatureMatrix {
        matrix_id,
        version,
        block_count,
        entries,
    }
    .validated()?)
}

// =============================================================================
// Execution plan
// =============================================================================

/// Parses and validates an execution plan document.
pub fn parse_plan(doc: &Json) -> Result<ExecutionPlan, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let abort_on_kernel_error = r.take_bool("abort_on_kernel_error")?;
    let edges_doc = r.take("edges")?.as_array().ok_or(DecodeError::NotAnArray)?;
    let initial_state_hash = r.take_hash("initial_state_hash")?;
    let max_parallel_width = r.take_index("max_parallel_width")?;
    let mode = GlbMode::from_id(&r.take_id("mode")?)?;
    let nonneg_doc = r
        .take("nonneg_fields")?
        .as_array()
        .ok_or(DecodeError::NotAnArray)?;
    let ops_doc = r.take("ops")?.as_array().ok_or(DecodeError::NotAnArray)?;
    let policy_digest = r.take_hash("policy_digest")?;
    let policy_id = r.take_id("policy_id")?;
    let scheduler_rule = r.take_id("scheduler_rule")?;
    r.finish()?;

    let mut nonneg_fields = FieldSet::default();
    for id in nonneg_doc {
        nonneg_fields.insert(FieldId::from_hex(
            id.as_str().ok_or(DecodeError::Malformed("nonneg_fields"))?,
        )?);
    }
    let mut ops = Vec::with_capacity(ops_doc.len());
    for op_doc in ops_doc {
        ops.push(parse_op(op_doc)?);
    }
    let mut edges = Vec::with_capacity(edges_doc.len());
    for edge_doc in edges_doc {
        let triple = edge_doc.as_array().ok_or(DecodeError::Malformed("edges"))?;
        if triple.len() != 3 {
            return Err(DecodeError::Malformed("edges"));
        }
        let from = OpId::from_wire(triple[0].as_str().ok_or(DecodeError::Malformed("edges"))?)?;
        let to = OpId::from_wire(triple[1].as_str().ok_or(DecodeError::Malformed("edges"))?)?;
        let kind =
            EdgeKind::from_str_strict(triple[2].as_str().ok_or(DecodeError::Malformed("edges"))?)?;
        edges.push(PlanEdge { from, to, kind });
    }
    Ok(ExecutionPlan {
        policy_id,
        policy_digest,
        initial_state_hash,
        ops,
        edges,
        max_parallel_width,
        scheduler_rule,
        mode,
        nonneg_fields,
        abort_on_kernel_error,
    }
    .validated()?)
}

fn parse_op(doc: &Json) -> Result<OpSpec, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let block = r.take_index("block")?;
    let budget = r.take_quantum("budget")?;
    let delta_bound = r.take_quantum("delta_bound")?;
    let disturbance = r.take_quantum("disturbance")?;
    let event_label = match r.take_opt("event_label") {
        Some(value) => Some(parse_text_atom(value, "event_label")?),
        None => None,
    };
    let float_touch = r.take_bool("float_touch")?;
    let footprint = parse_footprint(r.take("footprint")?)?;
    let footprint_digest = r.take_hash("footprint_digest")?;
    let kernel_hash = r.take_hash("kernel_hash")?;
    let kernel_id = r.take_id("kernel_id")?;
    let op_id = OpId::from_wire(r.take_str("op_id")?)?;
    let params_doc = r.take("params")?.as_object().ok_or(DecodeError::NotAnObject)?;
    let requires_mode_d = r.take_bool("requires_mode_d")?;
    r.finish()?;

    if footprint.digest() != footprint_digest {
        return Err(DecodeError::Malformed("footprint_digest"));
    }
    let mut params = Params::new();
    for (key, atom) in params_doc {
        let atom = atom.as_str().ok_or(DecodeError::Malformed("params"))?;
        params.insert(key.clone(), Value::from_wire(atom)?);
    }
    Ok(OpSpec {
        op_id,
        kernel_id,
        kernel_hash,
        params,
        footprint,
        block,
        delta_bound,
        requires_mode_d,
        float_touch,
        budget,
        disturbance,
        event_label,
    })
}

fn parse_footprint(doc: &Json) -> Result<Footprint, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let reads_doc = r.take("reads")?.as_array().ok_or(DecodeError::NotAnArray)?;
    let writes_doc = r.take("writes")?.as_array().ok_or(DecodeError::NotAnArray)?;
    r.finish()?;
    let mut reads = FieldSet::default();
    for id in reads_doc {
        reads.insert(FieldId::from_hex(
            id.as_str().ok_or(DecodeError::Malformed("reads"))?,
        )?);
    }
    let mut writes = FieldSet::default();
    for id in writes_doc {
        writes.insert(FieldId::from_hex(
            id.as_str().ok_or(DecodeError::Malformed("writes"))?,
        )?);
    }
    Ok(Footprint { reads, writes })
}

// =============================================================================
// Receipts
// =============================================================================

/// Parses a receipt chain document (an array of commit receipts). Unknown
/// fields reject.
pub fn parse_receipts(doc: &Json) -> Result<Vec<CommitReceipt>, DecodeError> {
    let receipts_doc = doc.as_array().ok_or(DecodeError::NotAnArray)?;
    let mut receipts = Vec::with_capacity(receipts_doc.len());
    for receipt_doc in receipts_doc {
        receipts.push(parse_commit_receipt(receipt_doc)?);
    }
    Ok(receipts)
}

fn parse_commit_receipt(doc: &Json) -> Result<CommitReceipt, DecodeError> {
    let mut r = FieldReader::new(doc)?;
    let batch_size = r.take_index("batch_size")?;
    let disturbance = r.take_quantum("disturbance")?;
    let epsilon_hat = r.take_quantum("epsilon_hat")?;
    let epsilon_measured = r.take_quantum("epsilon_measured")?;
    let glb_mode = GlbMode::from_id(&r.take_id("glb_mode")?)?;
    let law_satisfied = r.take_bool("law_satisfied")?;
    let matrix_digest = r.take_hash("matrix_digest")?;
    let matrix_version = r.take_id("matrix_version")?;
    let merkle_root = r.take_hash("merkle_root")?;
    let policy_digest = r.take_hash("policy_digest")?;
    let policy_id = r.take_id("policy_id")?;
    let post_debt = r.take_quantum("post_debt")?;
    let pre_debt = r.take_quantum("pre_debt")?;
    let prev_commit_hash = r.take_hash("prev_commit_hash")?;
    let scheduler_rule = r.take_id("scheduler_rule")?;
    let service = r.take_quantum("service")?;
    r.finish()?;
    Ok(CommitReceipt {
        prev_commit_hash,
        batch_size,
        merkle_root,
        scheduler_rule,
        glb_mode,
        policy_id,
        policy_digest,
        matrix_version,
        matrix_digest,
        pre_debt,
        post_debt,
        service,
        disturbance,
        law_satisfied,
        epsilon_measured,
        epsilon_hat,
    })
}

/// Emits the receipt chain as its canonical JSON array.
pub fn emit_receipts(receipts: &[CommitReceipt]) -> Json {
    Json::Array(receipts.iter().map(CommitReceipt::canonical_doc).collect())
}

/// Emits a terminal error object. Never appended to the ledger.
pub fn emit_terminal(error: &TerminalError) -> Json {
    let mut doc = Map::new();
    doc.insert(
        "batch_prev_hash".to_owned(),
        Json::String(hash_to_wire(&error.batch_prev_hash)),
    );
    doc.insert(
        "batch_size".to_owned(),
        Json::String(format!("i:{}", error.batch_size)),
    );
    doc.insert(
        "error_code".to_owned(),
        Json::String(format!("id:{}", error.code.code())),
    );
    if let Some(op) = &error.failed_op_id {
        doc.insert("failed_op_id".to_owned(), Json::String(op.to_wire()));
    }
    Json::Object(doc)
}

/// Emits the module receipt for `keel plan`: the plan id bound to every
/// input digest.
pub fn emit_plan_receipt(plan: &ExecutionPlan) -> Json {
    serde_json::json!({
        "initial_state_hash": hash_to_wire(&plan.initial_state_hash),
        "op_count": format!("i:{}", plan.ops.len()),
        "plan_id": hash_to_wire(&plan.plan_id()),
        "policy_digest": hash_to_wire(&plan.policy_digest),
        "policy_id": format!("id:{}", plan.policy_id),
        "scheduler_rule": format!("id:{}", plan.scheduler_rule),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_round_trips_through_canonical_doc() {
        let doc = json!({
            "canon_id": "sorted_json_bytes.v1",
            "fields": [["00000000000000000000000000000001", "q:6:50000"]],
            "float_policy": "float.forbid.v1",
            "schema_id": "schema.test.v1",
        });
        let state = parse_state(&doc).unwrap();
        assert_eq!(state.canonical_doc(), doc);
        assert_eq!(parse_state(&state.canonical_doc()).unwrap(), state);
    }

    #[test]
    fn state_rejects_unknown_fields_and_disorder() {
        let doc = json!({
            "canon_id": "sorted_json_bytes.v1",
            "fields": [],
            "float_policy": "float.forbid.v1",
            "schema_id": "schema.test.v1",
            "extra": 1,
        });
        assert!(matches!(
            parse_state(&doc),
            Err(DecodeError::UnknownField(_))
        ));
        let doc = json!({
            "canon_id": "sorted_json_bytes.v1",
            "fields": [
                ["00000000000000000000000000000002", "i:1"],
                ["00000000000000000000000000000001", "i:1"],
            ],
            "float_policy": "float.forbid.v1",
            "schema_id": "schema.test.v1",
        });
        assert_eq!(parse_state(&doc), Err(DecodeError::NonCanonicalOrder));
    }

    #[test]
    fn policy_round_trips() {
        let bundle = PolicyBundle {
            policy_id: "policy.test.v1".to_owned(),
            violation_policy: "v.weighted_residual.v1".to_owned(),
            service: ServiceLaw::LinearCapped {
                mu: DebtUnit::from_raw(1_000_000),
            },
            disturbance: DisturbancePolicy::Dp1 {
                e_max: DebtUnit::from_raw(10),
            },
            matrix_version: "m.test.v1".to_owned(),
            matrix_digest: [1u8; 32],
            kernel_registry_digest: [2u8; 32],
            scheduler_rule: "greedy.curv.v1".to_owned(),
            caps: ResourceCaps {
                max_bigint_bits: Some(4096),
                max_matrix_accum_terms: None,
                max_fields_touched_per_op: Some(64),
                max_v_eval_cost: None,
                max_epsilon: Some(DebtUnit::from_raw(1_000_000)),
                max_parallel_width: 8,
            },
            genesis_prev_hash: None,
        };
        let parsed = parse_policy(&bundle.canonical_doc()).unwrap();
        assert_eq!(parsed, bundle);
        assert_eq!(parsed.digest(), bundle.digest());
    }

    #[test]
    fn receipt_with_unknown_field_rejects() {
        let mut doc = CommitReceipt {
            prev_commit_hash: [0u8; 32],
            batch_size: 1,
            merkle_root: [1u8; 32],
            scheduler_rule: "greedy.curv.v1".to_owned(),
            glb_mode: GlbMode::C,
            policy_id: "policy.test.v1".to_owned(),
            policy_digest: [2u8; 32],
            matrix_version: "m.test.v1".to_owned(),
            matrix_digest: [3u8; 32],
            pre_debt: DebtUnit::zero(),
            post_debt: DebtUnit::zero(),
            service: DebtUnit::zero(),
            disturbance: DebtUnit::zero(),
            law_satisfied: true,
            epsilon_measured: DebtUnit::zero(),
            epsilon_hat: DebtUnit::from_raw(1),
        }
        .canonical_doc();
        assert!(parse_receipts(&json!([doc.clone()])).is_ok());
        doc.as_object_mut()
            .unwrap()
            .insert("note".to_owned(), json!("s:extra"));
        assert!(matches!(
            parse_receipts(&json!([doc])),
            Err(DecodeError::UnknownField(_))
        ));
    }

    #[test]
    fn matrix_parse_is_strict() {
        let doc = json!({
            "matrix_id": "m.test",
            "version": "v1",
            "entry_mode": "upper_triangle.sparse.v1",
            "symmetry_mode": "symmetric.v1",
            "domain_mode": "nonneg.v1",
            "block_count": 2,
            "entries": [{"i": 0, "j": 1, "num": "1", "den": "2"}],
        });
        let matrix = parse_matrix(&doc).unwrap();
        assert_eq!(matrix.block_count, 2);
        // Leading-zero literals reject through the canonical int parser.
        let bad = json!({
            "matrix_id": "m.test",
            "version": "v1",
            "entry_mode": "upper_triangle.sparse.v1",
            "symmetry_mode": "symmetric.v1",
            "domain_mode": "nonneg.v1",
            "block_count": 2,
            "entries": [{"i": 0, "j": 1, "num": "01", "den": "2"}],
        });
        assert!(parse_matrix(&bad).is_err());
    }

    #[test]
    fn terminal_error_document_shape() {
        let doc = emit_terminal(&TerminalError {
            code: crate::error::TerminalCode::GateEpsSingleton,
            failed_op_id: Some(OpId::new("op.a").unwrap()),
            batch_prev_hash: [0u8; 32],
            batch_size: 1,
        });
        assert_eq!(doc["error_code"], json!("id:err.gate_eps.singleton"));
        assert_eq!(doc["failed_op_id"], json!("id:op.a"));
        assert_eq!(doc["batch_size"], json!("i:1"));
    }
}
