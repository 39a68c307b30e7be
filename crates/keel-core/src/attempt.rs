// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The batch attempt pipeline.
//!
//! An attempt takes an assembled batch and either produces a commit (new
//! state, local receipts, commit receipt) or a classified failure. The
//! pipeline order realizes the classification priority
//! `independence > policy_veto > kernel_error > delta_bound > gate_eps`:
//!
//! 1. planning checks — independence re-verification, mode/float policy,
//!    action reconstruction, disturbance verification;
//! 2. kernel execution — every kernel runs against the *same* pre-state,
//!    restricted to its declared reads; outputs are projected to `W`;
//! 3. δ-bound check — `Σ d² ≤ a²` per op over the numeric fields of
//!    `R ∪ W`, in plain integers (the squared 2-norm, no roots, no division);
//! 4. disjoint patching in `op_id`-sorted order;
//! 5. ε measurement and the gate;
//! 6. receipt assembly.
//!
//! Failures emit nothing; only an accepted batch produces receipts.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use num_traits::Zero;

use crate::contract::{ContractSet, VError};
use crate::curvature::CurvatureMatrix;
use crate::error::{FailClass, TerminalCode};
use crate::gate::{self, GateError, GateOutcome};
use crate::ident::{FieldId, Hash, OpId};
use crate::kernel::KernelRegistry;
use crate::meter::CostMeter;
use crate::plan::{ExecutionPlan, OpSpec};
use crate::policy::PolicyBundle;
use crate::quantum::DebtUnit;
use crate::receipt::{leaf_sequence, merkle_root, CommitReceipt, LocalReceipt};
use crate::scheduler::{self, BatchPlan};
use crate::state::State;
use crate::value::Value;

/// Read-only context shared by every attempt in a run.
#[derive(Debug)]
pub struct BatchContext<'a> {
    /// The frozen policy bundle.
    pub bundle: &'a PolicyBundle,
    /// The contract set driving V(x).
    pub contracts: &'a ContractSet,
    /// The curvature matrix pinned by the bundle.
    pub matrix: &'a CurvatureMatrix,
    /// The kernel allowlist.
    pub kernels: &'a KernelRegistry,
    /// The execution plan.
    pub plan: &'a ExecutionPlan,
}

/// A cap trip during an attempt, with op attribution when one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapTrip {
    /// The terminal code.
    pub code: TerminalCode,
    /// The op being processed when the cap fired.
    pub op: Option<OpId>,
}

/// Result of one batch attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The batch committed.
    Committed(Box<CommittedBatch>),
    /// The batch failed with a classified, non-terminal failure.
    Failed {
        /// Highest-priority failure class observed.
        class: FailClass,
        /// Failing op, when attributable.
        op: Option<OpId>,
    },
}

/// Everything an accepted batch produces.
#[derive(Debug)]
pub struct CommittedBatch {
    /// The commit receipt (not yet appended).
    pub receipt: CommitReceipt,
    /// Per-op local receipts in canonical op order.
    pub locals: Vec<LocalReceipt>,
    /// The batch-patched post-state.
    pub post_state: State,
    /// The gate measurements.
    pub gate: GateOutcome,
    /// The reconstructed canonical batch action.
    pub action: crate::action::ActionDescriptor,
    /// The batch in canonical order.
    pub batch_ops: Vec<OpId>,
}

/// Attempts a batch against the shared pre-state.
pub fn attempt_batch(
    ctx: &BatchContext<'_>,
    batch: &BatchPlan,
    pre_state: &State,
    prev_commit: Hash,
) -> Result<AttemptOutcome, CapTrip> {
    let ordered = batch.canonical_order();
    let specs: Vec<&OpSpec> = ordered.iter().filter_map(|id| ctx.plan.op(id)).collect();
    let mut meter = CostMeter::new(&ctx.bundle.caps);

    // ── 1. Planning checks ──────────────────────────────────────────────
    for (idx, a) in specs.iter().enumerate() {
        for b in &specs[idx + 1..] {
            if !a.footprint.independent(&b.footprint) {
                return Ok(AttemptOutcome::Failed {
                    class: FailClass::Independence,
                    op: Some(b.op_id.clone()),
                });
            }
        }
    }
    for spec in &specs {
        if !scheduler::mode_admits(spec, batch.mode) {
            return Ok(AttemptOutcome::Failed {
                class: FailClass::PolicyVeto,
                op: Some(spec.op_id.clone()),
            });
        }
        meter
            .check_fields_touched(spec.footprint.touched().len())
            .map_err(|code| CapTrip {
                code,
                op: Some(spec.op_id.clone()),
            })?;
    }
    let action = match ctx.plan.batch_action(&specs, ctx.bundle.digest()) {
        Ok(action) => action,
        Err(_) => {
            return Ok(AttemptOutcome::Failed {
                class: FailClass::PolicyVeto,
                op: None,
            });
        }
    };
    if ctx
        .bundle
        .disturbance
        .verify(&action.disturbance, action.event_label.as_deref())
        .is_err()
    {
        return Ok(AttemptOutcome::Failed {
            class: FailClass::PolicyVeto,
            op: None,
        });
    }

    // ── 2. Pre-state debt ───────────────────────────────────────────────
    let pre_debt = eval_v(ctx.contracts, pre_state, &mut meter)?;

    // ── 3. Kernel execution on the shared pre-state ─────────────────────
    let mut per_op_writes: Vec<(usize, BTreeMap<FieldId, Value>)> = Vec::new();
    for (idx, spec) in specs.iter().enumerate() {
        let registered = match ctx.kernels.lookup(&spec.kernel_id) {
            Ok(k) => k,
            Err(_) => {
                return Ok(AttemptOutcome::Failed {
                    class: FailClass::KernelError,
                    op: Some(spec.op_id.clone()),
                });
            }
        };
        let view = pre_state.restricted(&spec.footprint.reads);
        let produced = match registered.kernel().run(&view, &spec.params) {
            Ok(state) => state,
            Err(_) => {
                return Ok(AttemptOutcome::Failed {
                    class: FailClass::KernelError,
                    op: Some(spec.op_id.clone()),
                });
            }
        };
        // Never trust kernel output outside W.
        let mut writes = BTreeMap::new();
        for field in spec.footprint.writes.iter() {
            if let Some(value) = produced.get(field) {
                writes.insert(*field, value.clone());
            }
        }
        // Declared-nonnegative fields reject negative writes before any
        // state is patched; an inadmissible write is the kernel's failure.
        for (field, value) in &writes {
            if ctx.plan.nonneg_fields.contains(field) {
                if let Some(raw) = value.numeric_raw() {
                    if raw < BigInt::zero() {
                        return Ok(AttemptOutcome::Failed {
                            class: FailClass::KernelError,
                            op: Some(spec.op_id.clone()),
                        });
                    }
                }
            }
        }
        per_op_writes.push((idx, writes));
    }

    // ── 4. δ-bound check over single-op patched states ──────────────────
    let mut patched_states: Vec<State> = Vec::with_capacity(specs.len());
    for (idx, writes) in &per_op_writes {
        let spec = specs[*idx];
        let patched = pre_state.patched(writes);
        let delta_sq = delta_squared(pre_state, &patched, spec, &meter).map_err(|code| {
            CapTrip {
                code,
                op: Some(spec.op_id.clone()),
            }
        })?;
        let bound = spec.delta_bound.int_value();
        if delta_sq > bound * bound {
            return Ok(AttemptOutcome::Failed {
                class: FailClass::DeltaBound,
                op: Some(spec.op_id.clone()),
            });
        }
        patched_states.push(patched);
    }

    // ── 5. Disjoint patching in op_id order ─────────────────────────────
    let mut merged: BTreeMap<FieldId, Value> = BTreeMap::new();
    for (_, writes) in &per_op_writes {
        for (field, value) in writes {
            merged.insert(*field, value.clone());
        }
    }
    let post_state = pre_state.patched(&merged);

    // ── 6. ε measurement and gate ───────────────────────────────────────
    let post_debt = eval_v(ctx.contracts, &post_state, &mut meter)?;
    let outcome = match gate::measure_batch(
        ctx.bundle,
        &action,
        &pre_debt,
        &post_debt,
        &batch.eps_hat,
    ) {
        Ok(outcome) => outcome,
        Err(GateError::EpsilonCap) => {
            return Err(CapTrip {
                code: TerminalCode::CapEpsilon,
                op: None,
            });
        }
        Err(GateError::Disturbance(_)) => {
            return Ok(AttemptOutcome::Failed {
                class: FailClass::PolicyVeto,
                op: None,
            });
        }
        Err(GateError::Quantum(_)) => {
            return Ok(AttemptOutcome::Failed {
                class: FailClass::PolicyVeto,
                op: None,
            });
        }
    };
    if !outcome.accepted {
        return Ok(AttemptOutcome::Failed {
            class: FailClass::GateEps,
            op: None,
        });
    }

    // ── 7. Receipt assembly ─────────────────────────────────────────────
    let pre_hash = pre_state.hash();
    let locals: Vec<LocalReceipt> = specs
        .iter()
        .zip(&patched_states)
        .map(|(spec, patched)| LocalReceipt {
            op_id: spec.op_id.clone(),
            kernel_hash: spec.kernel_hash,
            footprint_digest: spec.footprint_digest(),
            block: spec.block,
            delta_bound: spec.delta_bound.clone(),
            policy_id: ctx.bundle.policy_id.clone(),
            glb_mode: batch.mode,
            pre_state_hash: pre_hash,
            post_state_hash: patched.hash(),
            prev_commit_hash: prev_commit,
        })
        .collect();
    let local_hashes: Vec<Hash> = locals.iter().map(LocalReceipt::hash).collect();
    let root = merkle_root(&leaf_sequence(&local_hashes));
    let receipt = CommitReceipt {
        prev_commit_hash: prev_commit,
        batch_size: specs.len() as u32,
        merkle_root: root,
        scheduler_rule: ctx.plan.scheduler_rule.clone(),
        glb_mode: batch.mode,
        policy_id: ctx.bundle.policy_id.clone(),
        policy_digest: ctx.bundle.digest(),
        matrix_version: ctx.bundle.matrix_version.clone(),
        matrix_digest: ctx.bundle.matrix_digest,
        pre_debt: outcome.pre_debt.clone(),
        post_debt: outcome.post_debt.clone(),
        service: outcome.service.clone(),
        disturbance: outcome.disturbance.clone(),
        law_satisfied: outcome.law_satisfied,
        epsilon_measured: outcome.eps_measured.clone(),
        epsilon_hat: batch.eps_hat.clone(),
    };

    Ok(AttemptOutcome::Committed(Box::new(CommittedBatch {
        receipt,
        locals,
        post_state,
        gate: outcome,
        action,
        batch_ops: ordered,
    })))
}

fn eval_v(
    contracts: &ContractSet,
    state: &State,
    meter: &mut CostMeter<'_>,
) -> Result<DebtUnit, CapTrip> {
    contracts.eval_v(state, meter).map_err(|err| match err {
        VError::Cap(code) => CapTrip { code, op: None },
        // Invariant failures during V never reach a kernel; they halt the
        // run the same way a singleton invariant rejection does.
        VError::Invariant(_) | VError::Quantum(_) => CapTrip {
            code: TerminalCode::InvariantViolationSingleton,
            op: None,
        },
    })
}

/// Squared δ-norm for one op: `Σ d²` over the numeric fields of `R ∪ W`,
/// with `d` the raw chain-scale difference between the patched and the pre
/// state. Comparison against `a²` stays in plain integers.
fn delta_squared(
    pre: &State,
    patched: &State,
    spec: &OpSpec,
    meter: &CostMeter<'_>,
) -> Result<BigInt, TerminalCode> {
    let mut sum = BigInt::zero();
    for field in spec.footprint.touched().iter() {
        let before = pre.get(field).and_then(Value::numeric_raw);
        let after = patched.get(field).and_then(Value::numeric_raw);
        let (before, after) = match (before, after) {
            (None, None) => continue,
            (b, a) => (b.unwrap_or_else(BigInt::zero), a.unwrap_or_else(BigInt::zero)),
        };
        let d = after - before;
        meter.check_bits(&d)?;
        sum += &d * &d;
        meter.check_bits(&sum)?;
    }
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Contract, NormalizerSpec, Predicate, ResidualFn, Weight};
    use crate::footprint::Footprint;
    use crate::kernel::Params;
    use crate::plan::tests::plan;
    use crate::policy::{
        DisturbancePolicy, ResourceCaps, ServiceLaw, VIOLATION_POLICY_WEIGHTED_RESIDUAL,
    };
    use crate::scheduler::{assemble_batch, SCHEDULER_RULE_GREEDY_CURV_V1};
    use num_traits::One;

    fn fid(n: u8) -> FieldId {
        let mut raw = [0u8; 16];
        raw[15] = n;
        FieldId(raw)
    }

    fn oid(s: &str) -> OpId {
        OpId::new(s).unwrap()
    }

    fn set_op(id: &str, field: u8, raw: i64, delta_bound: i64) -> OpSpec {
        let mut params = Params::new();
        params.insert("field".to_owned(), Value::Str(fid(field).to_hex()));
        params.insert(
            "value".to_owned(),
            Value::Quantum(DebtUnit::from_raw(raw)),
        );
        OpSpec {
            op_id: oid(id),
            kernel_id: "kern.set_field.v1".to_owned(),
            kernel_hash: [3u8; 32],
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

    fn contracts() -> ContractSet {
        ContractSet {
            contracts: vec![Contract {
                contract_id: "c.load".to_owned(),
                residual: ResidualFn::Field { field: fid(1) },
                residual_dim: 1,
                normalizer: NormalizerSpec::Const {
                    sigma: DebtUnit::from_raw(1_000_000),
                },
                weight: Weight::new(BigInt::one(), BigInt::one()).unwrap(),
                predicate: Predicate::Always,
                version: 1,
            }],
        }
    }

    fn bundle(matrix: &CurvatureMatrix, kernels: &KernelRegistry) -> PolicyBundle {
        PolicyBundle {
            policy_id: "policy.test.v1".to_owned(),
            violation_policy: VIOLATION_POLICY_WEIGHTED_RESIDUAL.to_owned(),
            service: ServiceLaw::LinearCapped {
                mu: DebtUnit::from_raw(1_000_000),
            },
            disturbance: DisturbancePolicy::Dp0,
            matrix_version: matrix.matrix_id.clone(),
            matrix_digest: matrix.hash(),
            kernel_registry_digest: kernels.digest(),
            scheduler_rule: SCHEDULER_RULE_GREEDY_CURV_V1.to_owned(),
            caps: ResourceCaps::unbounded(4),
            genesis_prev_hash: None,
        }
    }

    struct Fixture {
        plan: ExecutionPlan,
        matrix: CurvatureMatrix,
        kernels: KernelRegistry,
        bundle: PolicyBundle,
        contracts: ContractSet,
    }

    fn fixture(ops: Vec<OpSpec>) -> Fixture {
        let matrix = CurvatureMatrix::identity("m.test", "v1", 4);
        let kernels = KernelRegistry::builtin();
        let bundle = bundle(&matrix, &kernels);
        let mut ops = ops;
        for op in &mut ops {
            op.kernel_hash = kernels.lookup(&op.kernel_id).unwrap().kernel_hash;
        }
        let plan = plan(ops, vec![]);
        Fixture {
            plan,
            matrix,
            kernels,
            bundle,
            contracts: contracts(),
        }
    }

    fn attempt(fx: &Fixture, ready: &[OpId], state: &State) -> Result<AttemptOutcome, CapTrip> {
        let batch = assemble_batch(&fx.plan, ready, &fx.matrix, &fx.bundle.caps).unwrap();
        let ctx = BatchContext {
            bundle: &fx.bundle,
            contracts: &fx.contracts,
            matrix: &fx.matrix,
            kernels: &fx.kernels,
            plan: &fx.plan,
        };
        attempt_batch(&ctx, &batch, state, [0u8; 32])
    }

    #[test]
    fn accepting_singleton_produces_chained_receipts() {
        // Writes 0.05 to the observed field: V goes 0 → 2500, ε̂ = 10^10.
        let fx = fixture(vec![set_op("op.a", 1, 50_000, 100_000)]);
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state).unwrap();
        let AttemptOutcome::Committed(committed) = got else {
            panic!("expected commit");
        };
        assert_eq!(committed.receipt.batch_size, 1);
        assert_eq!(committed.gate.pre_debt, DebtUnit::zero());
        assert_eq!(committed.gate.post_debt, DebtUnit::from_raw(2500));
        assert_eq!(
            committed.receipt.epsilon_measured,
            DebtUnit::from_raw(2500)
        );
        // The gate measurements are persisted into the receipt verbatim.
        assert_eq!(committed.receipt.pre_debt, DebtUnit::zero());
        assert_eq!(committed.receipt.post_debt, DebtUnit::from_raw(2500));
        assert_eq!(committed.receipt.service, DebtUnit::zero());
        assert_eq!(committed.receipt.disturbance, DebtUnit::zero());
        // Debt rose from zero: the law disposition is recorded false even
        // though the curvature gate admitted the batch.
        assert!(!committed.receipt.law_satisfied);
        assert_eq!(committed.action.budget, DebtUnit::from_raw(500_000));
        // Single local receipt: the Merkle root is the local hash itself.
        assert_eq!(committed.locals.len(), 1);
        assert_eq!(committed.receipt.merkle_root, committed.locals[0].hash());
        assert_eq!(
            committed.post_state.get(&fid(1)),
            Some(&Value::Quantum(DebtUnit::from_raw(50_000)))
        );
    }

    #[test]
    fn delta_bound_violation_is_classified() {
        // Write of 0.05 against a δ-bound of 0.01: 50000² > 10000².
        let fx = fixture(vec![set_op("op.a", 1, 50_000, 10_000)]);
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state).unwrap();
        let AttemptOutcome::Failed { class, op } = got else {
            panic!("expected failure");
        };
        assert_eq!(class, FailClass::DeltaBound);
        assert_eq!(op, Some(oid("op.a")));
    }

    #[test]
    fn gate_eps_rejection_when_v_shift_exceeds_eps_hat() {
        // δ passes exactly (50000 ≤ 50000) but a doubled weight and a tight
        // normalizer push |ΔV| = 2·50000² past ε̂ = 50000².
        let fx = {
            let mut fx = fixture(vec![set_op("op.a", 1, 50_000, 50_000)]);
            fx.contracts.contracts[0].weight =
                Weight::new(BigInt::from(2), BigInt::one()).unwrap();
            fx.contracts.contracts[0].normalizer = NormalizerSpec::Const {
                sigma: DebtUnit::from_raw(1000),
            };
            fx
        };
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state).unwrap();
        let AttemptOutcome::Failed { class, .. } = got else {
            panic!("expected failure");
        };
        assert_eq!(class, FailClass::GateEps);
    }

    #[test]
    fn kernel_error_is_classified_with_the_op() {
        // Missing "value" param makes the kernel fail.
        let mut op = set_op("op.a", 1, 0, 100_000);
        op.params.remove("value");
        let fx = fixture(vec![op]);
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state).unwrap();
        let AttemptOutcome::Failed { class, op } = got else {
            panic!("expected failure");
        };
        assert_eq!(class, FailClass::KernelError);
        assert_eq!(op, Some(oid("op.a")));
    }

    #[test]
    fn kernel_output_outside_w_is_discarded() {
        // The kernel writes field 2, but the op declares W = {3}: nothing
        // of the kernel's output survives projection.
        let mut op = set_op("op.a", 2, 50_000, 100_000);
        op.footprint = Footprint {
            reads: std::iter::empty().collect(),
            writes: std::iter::once(fid(3)).collect(),
        };
        let fx = fixture(vec![op]);
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state).unwrap();
        let AttemptOutcome::Committed(committed) = got else {
            panic!("expected commit");
        };
        assert!(committed.post_state.get(&fid(2)).is_none());
        assert!(committed.post_state.get(&fid(3)).is_none());
    }

    #[test]
    fn nonneg_field_write_rejects_before_patching() {
        let mut fx = fixture(vec![set_op("op.a", 1, -5, 100_000)]);
        fx.plan.nonneg_fields.insert(fid(1));
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state).unwrap();
        let AttemptOutcome::Failed { class, .. } = got else {
            panic!("expected failure");
        };
        assert_eq!(class, FailClass::KernelError);
    }

    #[test]
    fn epsilon_hard_cap_trips_terminal() {
        let mut fx = fixture(vec![set_op("op.a", 1, 50_000, 100_000)]);
        fx.bundle.caps.max_epsilon = Some(DebtUnit::from_raw(100));
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state);
        assert_eq!(
            got.unwrap_err(),
            CapTrip {
                code: TerminalCode::CapEpsilon,
                op: None
            }
        );
    }

    #[test]
    fn bigint_cap_during_delta_norm_is_terminal() {
        // A kernel writing a ~5000-bit integer trips max_bigint_bits in the
        // δ-norm accumulation; the bound itself stays narrow so assembly
        // passes and the trip is attributable to the op.
        let mut op = set_op("op.a", 1, 0, 1_000_000);
        op.params.insert(
            "value".to_owned(),
            Value::Int(BigInt::from(1) << 5000usize),
        );
        let mut fx = fixture(vec![op]);
        fx.bundle.caps.max_bigint_bits = Some(4096);
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a")], &state);
        let trip = got.unwrap_err();
        assert_eq!(trip.code, TerminalCode::CapBigintBits);
        assert_eq!(trip.op, Some(oid("op.a")));
    }

    #[test]
    fn batch_patching_is_op_id_ordered_and_disjoint() {
        let fx = fixture(vec![
            set_op("op.b", 2, 10, 100_000),
            set_op("op.a", 3, 20, 100_000),
        ]);
        let state = State::new("schema.test.v1");
        let got = attempt(&fx, &[oid("op.a"), oid("op.b")], &state).unwrap();
        let AttemptOutcome::Committed(committed) = got else {
            panic!("expected commit");
        };
        assert_eq!(committed.batch_ops, vec![oid("op.a"), oid("op.b")]);
        assert_eq!(
            committed.post_state.get(&fid(2)),
            Some(&Value::Quantum(DebtUnit::from_raw(10)))
        );
        assert_eq!(
            committed.post_state.get(&fid(3)),
            Some(&Value::Quantum(DebtUnit::from_raw(20)))
        );
    }
}
