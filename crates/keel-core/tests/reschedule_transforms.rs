// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rescheduling transforms: split-lexmin and remove-last-appended.

mod common;

use common::{oid, set_op, Genesis, RecordingSink};
use keel_core::engine::RunOutcome;
use keel_core::error::{FailClass, TerminalCode};
use keel_core::kernel::KernelRegistry;
use keel_core::telemetry::TelemetryEvent;

// =============================================================================
// Split-lexmin: execution failure peels the lexicographically smallest op
// =============================================================================

#[test]
fn split_lexmin_isolates_smallest_op_id() {
    let kernels = KernelRegistry::builtin();
    // op.m's write (0.2) exceeds its δ-bound (0.1); op.a and op.z are fine.
    // The batch [op.a, op.m, op.z] fails `delta_bound`, split-lexmin makes
    // [op.a] the next batch, and the rest return to ready.
    let g = Genesis::new(
        vec![
            set_op("op.z", 3, 10, 100_000, &kernels),
            set_op("op.a", 1, 10, 100_000, &kernels),
            set_op("op.m", 2, 200_000, 100_000, &kernels),
        ],
        vec![],
        vec![],
    );
    let mut engine = g.engine();
    let sink = RecordingSink::shared();
    engine.set_telemetry(sink.clone());

    let RunOutcome::Halted(terminal) = engine.run() else {
        panic!("expected halt: op.m can never pass its bound");
    };
    // The descent: [a,m,z] fails, [a] commits, [m,z] fails, [m] is terminal.
    assert_eq!(terminal.code, TerminalCode::DeltaBoundSingleton);
    assert_eq!(terminal.failed_op_id, Some(oid("op.m")));
    assert_eq!(terminal.batch_size, 1);

    let events = sink.events();
    let failures: Vec<(FailClass, usize)> = events
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::BatchFailed { class, size } => Some((*class, *size)),
            _ => None,
        })
        .collect();
    assert_eq!(
        failures,
        vec![
            (FailClass::DeltaBound, 3),
            (FailClass::DeltaBound, 2),
            (FailClass::DeltaBound, 1),
        ]
    );
    // Only op.a (the first peeled lexmin) committed before the halt: the
    // second descent peeled op.m, whose singleton retry was terminal.
    assert_eq!(engine.ledger().len(), 1);
    assert_eq!(engine.ledger().commits()[0].batch_size, 1);
}

#[test]
fn split_lexmin_recovers_when_the_fault_is_not_the_lexmin() {
    let kernels = KernelRegistry::builtin();
    // Only op.z is faulty. Width descends: [a,m,z] fails, [a] commits,
    // [m,z] fails, [m] commits, [z] is terminal.
    let g = Genesis::new(
        vec![
            set_op("op.a", 1, 10, 100_000, &kernels),
            set_op("op.m", 2, 10, 100_000, &kernels),
            set_op("op.z", 3, 200_000, 100_000, &kernels),
        ],
        vec![],
        vec![],
    );
    let mut engine = g.engine();
    let RunOutcome::Halted(terminal) = engine.run() else {
        panic!("expected halt");
    };
    assert_eq!(terminal.code, TerminalCode::DeltaBoundSingleton);
    assert_eq!(terminal.failed_op_id, Some(oid("op.z")));
    assert_eq!(engine.ledger().len(), 2);
}

// =============================================================================
// Remove-last-appended: planning failure drops exactly the last append
// =============================================================================

#[test]
fn remove_last_appended_shrinks_by_one_and_commits() {
    let kernels = KernelRegistry::builtin();
    // op.a and op.b share the "surge" label; op.c declares "quake". The
    // scheduler appends a, b, c (equal marginals, lex order); the planning
    // check flags the mixed labels, the retry uses [a, b], which commits;
    // op.c then commits alone.
    let mut a = set_op("op.a", 1, 10, 100_000, &kernels);
    a.event_label = Some("surge".to_owned());
    let mut b = set_op("op.b", 2, 10, 100_000, &kernels);
    b.event_label = Some("surge".to_owned());
    let mut c = set_op("op.c", 3, 10, 100_000, &kernels);
    c.event_label = Some("quake".to_owned());
    let g = Genesis::new(vec![a, b, c], vec![], vec![]);

    let mut engine = g.engine();
    let sink = RecordingSink::shared();
    engine.set_telemetry(sink.clone());
    let RunOutcome::Completed(summary) = engine.run() else {
        panic!("expected completion");
    };
    assert_eq!(summary.commits, 2);
    assert_eq!(engine.ledger().commits()[0].batch_size, 2);
    assert_eq!(engine.ledger().commits()[1].batch_size, 1);

    let failures: Vec<(FailClass, usize)> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::BatchFailed { class, size } => Some((*class, *size)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![(FailClass::PolicyVeto, 3)]);
}

#[test]
fn policy_veto_singleton_is_terminal() {
    let kernels = KernelRegistry::builtin();
    // A float-touching op in mode C is never eligible; the scheduler hands
    // it over as a singleton and the planning veto halts the run.
    let mut a = set_op("op.a", 1, 10, 100_000, &kernels);
    a.float_touch = true;
    let g = Genesis::new(vec![a], vec![], vec![]);
    let mut engine = g.engine();
    let RunOutcome::Halted(terminal) = engine.run() else {
        panic!("expected halt");
    };
    assert_eq!(terminal.code, TerminalCode::PolicyVetoSingleton);
    assert_eq!(terminal.failed_op_id, Some(oid("op.a")));
    assert!(engine.ledger().is_empty());
}

// =============================================================================
// Width monotonicity within a descent
// =============================================================================

#[test]
fn width_is_monotonically_non_increasing_within_a_descent() {
    let kernels = KernelRegistry::builtin();
    let g = Genesis::new(
        vec![
            set_op("op.a", 1, 10, 100_000, &kernels),
            set_op("op.b", 2, 10, 100_000, &kernels),
            set_op("op.c", 3, 200_000, 100_000, &kernels),
        ],
        vec![],
        vec![],
    );
    let mut engine = g.engine();
    let sink = RecordingSink::shared();
    engine.set_telemetry(sink.clone());
    let _ = engine.run();

    // Between consecutive assemble events, failing sizes never increase.
    let mut last_assembled: Option<usize> = None;
    let mut current: Option<usize> = None;
    for event in sink.events() {
        match event {
            TelemetryEvent::BatchAssembled { size } => {
                last_assembled = Some(size);
                current = Some(size);
            }
            TelemetryEvent::BatchFailed { size, .. } => {
                assert!(size <= current.unwrap_or(size), "width grew within a descent");
                current = Some(size);
            }
            _ => {}
        }
    }
    assert!(last_assembled.is_some());
}
