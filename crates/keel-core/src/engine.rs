// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Main loop: assemble → attempt → commit or transform → loop.
//!
//! The engine owns the ledger anchor, the state snapshot, the dependency
//! tracker, and the cumulative resource accounting; nothing outside the loop
//! mutates them. Failure handling is mechanical:
//!
//! - planning failures (`independence`, `policy_veto`) drop the last entry of
//!   the batch's append log and retry — strictly monotonic, each retry is one
//!   op smaller;
//! - execution failures (`kernel_error`, `delta_bound`, `gate_eps`) isolate
//!   the lexicographically smallest `op_id` as the next batch and return the
//!   rest to the ready set with in-degrees reset;
//! - a failing singleton, or any cap exhaustion, halts with a terminal
//!   error. Caps never reschedule. No receipt is emitted for any failure.

use std::sync::Arc;

use thiserror::Error;

use crate::action::ActionDescriptor;
use crate::attempt::{attempt_batch, AttemptOutcome, BatchContext, CommittedBatch};
use crate::contract::ContractSet;
use crate::curvature::{CurvatureError, CurvatureMatrix, CurvatureRegistry};
use crate::error::{FailClass, TerminalCode, TerminalError};
use crate::ident::{Hash, OpId};
use crate::kernel::KernelRegistry;
use crate::ledger::{Ledger, RuntimeState};
use crate::meter::CostMeter;
use crate::plan::{ExecutionPlan, PlanError};
use crate::policy::PolicyBundle;
use crate::scheduler::{assemble_batch, eps_hat, BatchPlan};
use crate::state::State;
use crate::telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink};
use crate::tracker::DependencyTracker;

/// Failures constructing an engine (chain genesis).
#[derive(Debug, Error)]
pub enum EngineBuildError {
    /// A policy-locked digest did not match its input.
    #[error("{0}")]
    Terminal(TerminalError),
    /// The plan failed structural validation.
    #[error("plan rejected: {0}")]
    Plan(#[from] PlanError),
    /// The bundle referenced an unregistered curvature matrix.
    #[error("curvature rejected: {0}")]
    Curvature(#[from] CurvatureError),
    /// The plan DAG contains a cycle.
    #[error("plan DAG is cyclic")]
    CyclicDag,
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Hash of the final state snapshot.
    pub final_state_hash: Hash,
    /// Hash of the final commit (the chain head).
    pub final_commit_hash: Hash,
    /// Number of commits appended.
    pub commits: usize,
}

/// Disposition of a run: every op committed, or a deterministic halt.
///
/// A halt is a modeled outcome, not a Rust error — the ledger simply ends at
/// the last accepted commit.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every op committed; the chain is complete.
    Completed(RunSummary),
    /// The run halted; the terminal error was never appended.
    Halted(TerminalError),
}

/// Disposition of a single engine step.
#[derive(Debug)]
pub enum StepOutcome {
    /// One commit was appended.
    Committed,
    /// Every op has already committed; nothing to do.
    Completed,
    /// The run halted.
    Halted(TerminalError),
}

/// The deterministic coherence-gating engine.
pub struct Engine {
    bundle: PolicyBundle,
    contracts: ContractSet,
    matrix: CurvatureMatrix,
    kernels: KernelRegistry,
    plan: ExecutionPlan,
    tracker: DependencyTracker,
    runtime: RuntimeState,
    ledger: Ledger,
    last_action: Option<ActionDescriptor>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("policy_id", &self.bundle.policy_id)
            .field("ops", &self.plan.ops.len())
            .field("commits", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds an engine at chain genesis, verifying every policy-locked
    /// binding before any step runs.
    pub fn new(
        bundle: PolicyBundle,
        contracts: ContractSet,
        curvature: &CurvatureRegistry,
        kernels: KernelRegistry,
        plan: ExecutionPlan,
        initial_state: State,
    ) -> Result<Self, EngineBuildError> {
        let plan = plan.validated()?;
        let genesis = bundle.genesis();
        let terminal =
            |code: TerminalCode| EngineBuildError::Terminal(TerminalError::standalone(code, genesis));

        if plan.policy_digest != bundle.digest() {
            return Err(terminal(TerminalCode::PolicyDigestMismatch));
        }
        if !bundle.allows_scheduler_rule(&plan.scheduler_rule) {
            return Err(terminal(TerminalCode::SchedulerRuleNotAllowlisted));
        }
        let (matrix, matrix_hash) = curvature.lookup(&bundle.matrix_version)?;
        if *matrix_hash != bundle.matrix_digest {
            return Err(terminal(TerminalCode::MatrixDigestMismatch));
        }
        if kernels.digest() != bundle.kernel_registry_digest {
            return Err(terminal(TerminalCode::KernelRegistryDigestMismatch));
        }
        for op in &plan.ops {
            let registered = kernels
                .lookup(&op.kernel_id)
                .map_err(|_| terminal(TerminalCode::KernelRegistryDigestMismatch))?;
            if registered.kernel_hash != op.kernel_hash {
                return Err(terminal(TerminalCode::KernelRegistryDigestMismatch));
            }
        }
        if initial_state.hash() != plan.initial_state_hash {
            return Err(terminal(TerminalCode::InitialStateHashMismatch));
        }
        for field in plan.nonneg_fields.iter() {
            if let Some(raw) = initial_state.get(field).and_then(crate::value::Value::numeric_raw)
            {
                if raw < num_bigint::BigInt::from(0) {
                    return Err(terminal(TerminalCode::InvariantViolationSingleton));
                }
            }
        }

        let tracker = DependencyTracker::new(&plan);
        if has_cycle(&tracker) {
            return Err(EngineBuildError::CyclicDag);
        }
        let all_ops: Vec<OpId> = plan.ops.iter().map(|op| op.op_id.clone()).collect();
        let runtime = RuntimeState::genesis(initial_state, genesis, all_ops);
        let ledger = Ledger::new(genesis);
        let matrix = matrix.clone();

        Ok(Self {
            bundle,
            contracts,
            matrix,
            kernels,
            plan,
            tracker,
            runtime,
            ledger,
            last_action: None,
            telemetry: Arc::new(NullTelemetrySink),
        })
    }

    /// Installs a telemetry sink. Sinks observe; they never steer.
    pub fn set_telemetry(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.telemetry = sink;
    }

    /// The receipt ledger accumulated so far.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The current state snapshot.
    #[must_use]
    pub fn state(&self) -> &State {
        &self.runtime.state
    }

    /// The active policy bundle.
    #[must_use]
    pub fn bundle(&self) -> &PolicyBundle {
        &self.bundle
    }

    /// The canonical batch action of the most recent commit, if any.
    /// The replay verifier uses this to re-derive the law inequality.
    #[must_use]
    pub fn last_action(&self) -> Option<&ActionDescriptor> {
        self.last_action.as_ref()
    }

    /// Runs the plan to completion or a deterministic halt.
    pub fn run(&mut self) -> RunOutcome {
        loop {
            match self.step() {
                StepOutcome::Committed => {}
                StepOutcome::Completed => {
                    return RunOutcome::Completed(RunSummary {
                        final_state_hash: self.runtime.state.hash(),
                        final_commit_hash: self.ledger.head(),
                        commits: self.ledger.len(),
                    });
                }
                StepOutcome::Halted(halt) => return RunOutcome::Halted(halt),
            }
        }
    }

    /// Advances by exactly one commit: assemble a batch from the ready set
    /// and descend until it commits or the run halts.
    pub fn step(&mut self) -> StepOutcome {
        if self.tracker.all_committed() {
            return StepOutcome::Completed;
        }
        let ready = self.tracker.ready_set();
        if ready.is_empty() {
            // Acyclicity is verified at genesis; an empty ready set with
            // pending ops cannot occur on any reachable path.
            return StepOutcome::Halted(self.terminal(
                TerminalCode::InvariantViolationSingleton,
                None,
                0,
            ));
        }
        let batch = match assemble_batch(&self.plan, &ready, &self.matrix, &self.bundle.caps) {
            Ok(batch) => batch,
            Err(code) => return StepOutcome::Halted(self.terminal(code, None, 0)),
        };
        self.telemetry
            .event(&TelemetryEvent::BatchAssembled { size: batch.len() });
        match self.descend(batch) {
            Ok(()) => StepOutcome::Committed,
            Err(halt) => {
                self.telemetry
                    .event(&TelemetryEvent::Halted { code: halt.code });
                StepOutcome::Halted(halt)
            }
        }
    }

    /// One descent: attempt the batch, transforming on failure until a
    /// commit lands or a terminal condition fires. Width is monotonically
    /// non-increasing across retries within a descent.
    fn descend(&mut self, mut batch: BatchPlan) -> Result<(), TerminalError> {
        loop {
            let ctx = BatchContext {
                bundle: &self.bundle,
                contracts: &self.contracts,
                matrix: &self.matrix,
                kernels: &self.kernels,
                plan: &self.plan,
            };
            let outcome = attempt_batch(&ctx, &batch, &self.runtime.state, self.runtime.prev_commit)
                .map_err(|trip| self.terminal(trip.code, trip.op, batch.len()))?;
            match outcome {
                AttemptOutcome::Committed(committed) => {
                    self.commit(*committed)?;
                    return Ok(());
                }
                AttemptOutcome::Failed { class, op } => {
                    self.telemetry.event(&TelemetryEvent::BatchFailed {
                        class,
                        size: batch.len(),
                    });
                    batch = self.transform(batch, class, op)?;
                }
            }
        }
    }

    fn commit(&mut self, committed: CommittedBatch) -> Result<(), TerminalError> {
        // The anchor invariant (runtime.prev_commit == ledger.head()) makes a
        // chain break unreachable; it still halts rather than corrupting.
        let commit_hash = self
            .ledger
            .append(committed.receipt)
            .map_err(|_| self.terminal(TerminalCode::InvariantViolationSingleton, None, 0))?;
        self.runtime
            .advance(committed.post_state, commit_hash, &committed.batch_ops);
        self.last_action = Some(committed.action);
        for op in &committed.batch_ops {
            self.tracker.mark_committed(op);
        }
        self.telemetry.event(&TelemetryEvent::CommitAppended {
            index: self.ledger.len() - 1,
            commit_hash,
        });
        Ok(())
    }

    /// Applies the deterministic rescheduling transform for `class`.
    fn transform(
        &mut self,
        batch: BatchPlan,
        class: FailClass,
        failed_op: Option<OpId>,
    ) -> Result<BatchPlan, TerminalError> {
        if batch.len() <= 1 {
            let code = match class {
                FailClass::KernelError => TerminalCode::KernelErrorSingleton,
                FailClass::DeltaBound => TerminalCode::DeltaBoundSingleton,
                FailClass::GateEps => TerminalCode::GateEpsSingleton,
                FailClass::PolicyVeto | FailClass::Independence => {
                    TerminalCode::PolicyVetoSingleton
                }
            };
            let op = failed_op.or_else(|| batch.append_log.first().cloned());
            return Err(self.terminal(code, op, batch.len()));
        }
        if class.is_planning() {
            // Remove-last-appended: retry with the append log minus its tail.
            let remaining = batch.without_last();
            self.rebuild(remaining, batch.mode)
        } else {
            // Split-lexmin: isolate the smallest op_id, return the rest to
            // the ready set with in-degrees reset to zero.
            let ordered = batch.canonical_order();
            let lexmin = ordered[0].clone();
            let peeled: Vec<OpId> = ordered.into_iter().skip(1).collect();
            self.tracker.reset_to_ready(&peeled);
            self.rebuild(vec![lexmin], batch.mode)
        }
    }

    fn rebuild(
        &self,
        ops: Vec<OpId>,
        mode: crate::plan::GlbMode,
    ) -> Result<BatchPlan, TerminalError> {
        let mut sorted = ops.clone();
        sorted.sort();
        let specs: Vec<&crate::plan::OpSpec> =
            sorted.iter().filter_map(|id| self.plan.op(id)).collect();
        let mut meter = CostMeter::new(&self.bundle.caps);
        let eps = eps_hat(&specs, &self.matrix, &mut meter)
            .map_err(|code| self.terminal(code, None, ops.len()))?;
        Ok(BatchPlan {
            append_log: ops,
            eps_hat: eps,
            mode,
        })
    }

    fn terminal(&self, code: TerminalCode, op: Option<OpId>, batch_size: usize) -> TerminalError {
        TerminalError {
            code,
            failed_op_id: op,
            batch_prev_hash: self.runtime.prev_commit,
            batch_size,
        }
    }
}

/// Kahn's check over a cloned tracker: if repeatedly draining the ready set
/// cannot commit every op, the DAG has a cycle.
fn has_cycle(tracker: &DependencyTracker) -> bool {
    let mut probe = tracker.clone();
    loop {
        let ready = probe.ready_set();
        if ready.is_empty() {
            return !probe.all_committed();
        }
        for op in ready {
            probe.mark_committed(&op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{EdgeKind, GlbMode, PlanEdge};

    // Engine construction failures are covered here; full end-to-end runs
    // live in the integration tests.

    use crate::contract::{Contract, NormalizerSpec, Predicate, ResidualFn, Weight};
    use crate::footprint::Footprint;
    use crate::ident::FieldId;
    use crate::kernel::Params;
    use crate::plan::OpSpec;
    use crate::policy::{
        DisturbancePolicy, ResourceCaps, ServiceLaw, VIOLATION_POLICY_WEIGHTED_RESIDUAL,
    };
    use crate::quantum::DebtUnit;
    use crate::scheduler::SCHEDULER_RULE_GREEDY_CURV_V1;
    use crate::value::Value;
    use num_bigint::BigInt;
    use num_traits::One;

    fn fid(n: u8) -> FieldId {
        let mut raw = [0u8; 16];
        raw[15] = n;
        FieldId(raw)
    }

    fn oid(s: &str) -> OpId {
        OpId::new(s).unwrap()
    }

    fn set_op(id: &str, field: u8, raw: i64, kernels: &KernelRegistry) -> OpSpec {
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
            delta_bound: DebtUnit::from_raw(100_000),
            requires_mode_d: false,
            float_touch: false,
            budget: DebtUnit::from_raw(500_000),
            disturbance: DebtUnit::zero(),
            event_label: None,
        }
    }

    struct Genesis {
        bundle: PolicyBundle,
        contracts: ContractSet,
        curvature: CurvatureRegistry,
        plan: ExecutionPlan,
        state: State,
    }

    fn genesis(ops: Vec<OpSpec>, edges: Vec<PlanEdge>) -> Genesis {
        let kernels = KernelRegistry::builtin();
        let mut curvature = CurvatureRegistry::new();
        let matrix = CurvatureMatrix::identity("m.test", "v1", 4);
        let matrix_digest = curvature.register(matrix).unwrap();
        let bundle = PolicyBundle {
            policy_id: "policy.test.v1".to_owned(),
            violation_policy: VIOLATION_POLICY_WEIGHTED_RESIDUAL.to_owned(),
            service: ServiceLaw::LinearCapped {
                mu: DebtUnit::from_raw(1_000_000),
            },
            disturbance: DisturbancePolicy::Dp0,
            matrix_version: "m.test".to_owned(),
            matrix_digest,
            kernel_registry_digest: kernels.digest(),
            scheduler_rule: SCHEDULER_RULE_GREEDY_CURV_V1.to_owned(),
            caps: ResourceCaps::unbounded(4),
            genesis_prev_hash: None,
        };
        let state = State::new("schema.test.v1");
        let plan = ExecutionPlan {
            policy_id: bundle.policy_id.clone(),
            policy_digest: bundle.digest(),
            initial_state_hash: state.hash(),
            ops,
            edges,
            max_parallel_width: 4,
            scheduler_rule: SCHEDULER_RULE_GREEDY_CURV_V1.to_owned(),
            mode: GlbMode::C,
            nonneg_fields: crate::footprint::FieldSet::default(),
            abort_on_kernel_error: true,
        };
        let contracts = ContractSet {
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
        };
        Genesis {
            bundle,
            contracts,
            curvature,
            plan,
            state,
        }
    }

    fn build(g: Genesis) -> Result<Engine, EngineBuildError> {
        Engine::new(
            g.bundle,
            g.contracts,
            &g.curvature,
            KernelRegistry::builtin(),
            g.plan,
            g.state,
        )
    }

    #[test]
    fn genesis_binds_policy_digest() {
        let kernels = KernelRegistry::builtin();
        let mut g = genesis(vec![set_op("op.a", 1, 10, &kernels)], vec![]);
        g.plan.policy_digest = [9u8; 32];
        let err = build(g).unwrap_err();
        assert!(matches!(
            err,
            EngineBuildError::Terminal(TerminalError {
                code: TerminalCode::PolicyDigestMismatch,
                ..
            })
        ));
    }

    #[test]
    fn genesis_binds_initial_state_hash() {
        let kernels = KernelRegistry::builtin();
        let mut g = genesis(vec![set_op("op.a", 1, 10, &kernels)], vec![]);
        g.plan.initial_state_hash = [9u8; 32];
        let err = build(g).unwrap_err();
        assert!(matches!(
            err,
            EngineBuildError::Terminal(TerminalError {
                code: TerminalCode::InitialStateHashMismatch,
                ..
            })
        ));
    }

    #[test]
    fn genesis_rejects_foreign_scheduler_rule() {
        let kernels = KernelRegistry::builtin();
        let mut g = genesis(vec![set_op("op.a", 1, 10, &kernels)], vec![]);
        g.plan.scheduler_rule = "greedy.other.v1".to_owned();
        let err = build(g).unwrap_err();
        assert!(matches!(
            err,
            EngineBuildError::Terminal(TerminalError {
                code: TerminalCode::SchedulerRuleNotAllowlisted,
                ..
            })
        ));
    }

    #[test]
    fn genesis_rejects_kernel_hash_drift() {
        let kernels = KernelRegistry::builtin();
        let mut op = set_op("op.a", 1, 10, &kernels);
        op.kernel_hash = [9u8; 32];
        let g = genesis(vec![op], vec![]);
        let err = build(g).unwrap_err();
        assert!(matches!(
            err,
            EngineBuildError::Terminal(TerminalError {
                code: TerminalCode::KernelRegistryDigestMismatch,
                ..
            })
        ));
    }

    #[test]
    fn genesis_rejects_cyclic_dag() {
        let kernels = KernelRegistry::builtin();
        let g = genesis(
            vec![
                set_op("op.a", 1, 10, &kernels),
                set_op("op.b", 2, 10, &kernels),
            ],
            vec![
                PlanEdge {
                    from: oid("op.a"),
                    to: oid("op.b"),
                    kind: EdgeKind::ControlExplicit,
                },
                PlanEdge {
                    from: oid("op.b"),
                    to: oid("op.a"),
                    kind: EdgeKind::ControlExplicit,
                },
            ],
        );
        assert!(matches!(build(g).unwrap_err(), EngineBuildError::CyclicDag));
    }
}
