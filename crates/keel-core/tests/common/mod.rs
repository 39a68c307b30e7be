// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared harness for end-to-end engine and replay tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use num_bigint::BigInt;
use num_traits::One;

use keel_core::contract::{Contract, NormalizerSpec, Predicate, ResidualFn, Weight};
use keel_core::engine::Engine;
use keel_core::footprint::Footprint;
use keel_core::kernel::{KernelRegistry, Params};
use keel_core::plan::{ExecutionPlan, GlbMode, OpSpec, PlanEdge};
use keel_core::policy::{
    DisturbancePolicy, PolicyBundle, ResourceCaps, ServiceLaw, VIOLATION_POLICY_WEIGHTED_RESIDUAL,
};
use keel_core::scheduler::SCHEDULER_RULE_GREEDY_CURV_V1;
use keel_core::telemetry::{TelemetryEvent, TelemetrySink};
use keel_core::{
    ContractSet, CurvatureMatrix, CurvatureRegistry, DebtUnit, FieldId, OpId, State, Value,
};

/// Field id with a single distinguishing trailing byte.
pub fn fid(n: u8) -> FieldId {
    let mut raw = [0u8; 16];
    raw[15] = n;
    FieldId(raw)
}

pub fn oid(s: &str) -> OpId {
    OpId::new(s).unwrap()
}

/// An op that sets `field` to a quantum of `raw` via the builtin kernel.
pub fn set_op(id: &str, field: u8, raw: i64, delta_bound: i64, kernels: &KernelRegistry) -> OpSpec {
    let mut params = Params::new();
    params.insert("field".to_owned(), Value::Str(fid(field).to_hex()));
    params.insert("value".to_owned(), Value::Quantum(DebtUnit::from_raw(raw)));
    OpSpec {
        op_id: oid(id),
        kernel_id: "kern.set_field.v1".to_owned(),
        kernel_hash: kernels.lookup("kern.set_field.v1").unwrap().kernel_hash,
        params,
        footprint: Footprint {
            reads: std::iter::empty().collect(),
            writes: std::iter::once(fid(field)).collect(),
        },
        block: 0,
        delta_bound: DebtUnit::from_raw(delta_bound),
        requires_mode_d: false,
        float_touch: false,
        budget: DebtUnit::from_raw(500_000),
        disturbance: DebtUnit::zero(),
        event_label: None,
    }
}

/// One contract observing `field` against a constant normalizer.
pub fn observe_contract(field: u8, weight_num: i64, sigma_raw: i64) -> Contract {
    Contract {
        contract_id: format!("c.observe.{field}"),
        residual: ResidualFn::Field { field: fid(field) },
        residual_dim: 1,
        normalizer: NormalizerSpec::Const {
            sigma: DebtUnit::from_raw(sigma_raw),
        },
        weight: Weight::new(BigInt::from(weight_num), BigInt::one()).unwrap(),
        predicate: Predicate::Always,
        version: 1,
    }
}

/// Full genesis fixture: bundle, contracts, matrix registry, plan, state.
pub struct Genesis {
    pub bundle: PolicyBundle,
    pub contracts: ContractSet,
    pub curvature: CurvatureRegistry,
    pub plan: ExecutionPlan,
    pub state: State,
}

impl Genesis {
    /// Builds a genesis over the identity matrix and the builtin kernels.
    pub fn new(ops: Vec<OpSpec>, edges: Vec<PlanEdge>, contracts: Vec<Contract>) -> Self {
        let kernels = KernelRegistry::builtin();
        let mut curvature = CurvatureRegistry::new();
        let matrix = CurvatureMatrix::identity("m.identity", "v1", 8);
        let matrix_digest = curvature.register(matrix).unwrap();
        let bundle = PolicyBundle {
            policy_id: "policy.test.v1".to_owned(),
            violation_policy: VIOLATION_POLICY_WEIGHTED_RESIDUAL.to_owned(),
            service: ServiceLaw::LinearCapped {
                mu: DebtUnit::from_raw(1_000_000),
            },
            disturbance: DisturbancePolicy::Dp0,
            matrix_version: "m.identity".to_owned(),
            matrix_digest,
            kernel_registry_digest: kernels.digest(),
            scheduler_rule: SCHEDULER_RULE_GREEDY_CURV_V1.to_owned(),
            caps: ResourceCaps::unbounded(8),
            genesis_prev_hash: None,
        };
        let state = State::new("schema.test.v1");
        let plan = ExecutionPlan {
            policy_id: bundle.policy_id.clone(),
            policy_digest: bundle.digest(),
            initial_state_hash: state.hash(),
            ops,
            edges,
            max_parallel_width: 8,
            scheduler_rule: SCHEDULER_RULE_GREEDY_CURV_V1.to_owned(),
            mode: GlbMode::C,
            nonneg_fields: keel_core::FieldSet::default(),
            abort_on_kernel_error: true,
        };
        Self {
            bundle,
            contracts: ContractSet { contracts },
            curvature,
            plan,
            state,
        }
    }

    /// Re-stamps the plan after a bundle or state mutation.
    pub fn rebind(&mut self) {
        self.plan.policy_digest = self.bundle.digest();
        self.plan.initial_state_hash = self.state.hash();
    }

    pub fn engine(&self) -> Engine {
        Engine::new(
            self.bundle.clone(),
            self.contracts.clone(),
            &self.curvature,
            KernelRegistry::builtin(),
            self.plan.clone(),
            self.state.clone(),
        )
        .unwrap()
    }
}

/// Telemetry sink that records every event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingSink {
    fn event(&self, event: &TelemetryEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Convenience: writes for a single-field patch, for expected-state checks.
pub fn single_write(field: u8, raw: i64) -> BTreeMap<FieldId, Value> {
    let mut writes = BTreeMap::new();
    writes.insert(fid(field), Value::Quantum(DebtUnit::from_raw(raw)));
    writes
}
