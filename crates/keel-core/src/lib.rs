// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! keel-core: deterministic coherence-gating runtime.
//!
//! Keel accepts proposed state transitions, measures a violation functional
//! on the resulting state, and either commits the transition (emitting a
//! hash-chained receipt) or rejects it under a frozen policy. Every accepted
//! step replays byte-for-byte across platforms.
//!
//! The crate is split along the two load-bearing subsystems:
//! - the **measured gate**: exact quantum arithmetic, canonical encoders, the
//!   violation functional, the service/budget/disturbance law, and chained
//!   receipt emission ([`quantum`], [`contract`], [`gate`], [`receipt`]);
//! - the **deterministic scheduler**: dependency tracking, greedy
//!   curvature-bounded batch assembly, batch attempts, and the rescheduling
//!   transforms ([`tracker`], [`scheduler`], [`attempt`], [`engine`]).
//!
//! The replay verifier ([`replay`]) is a standalone consumer of the receipt
//! chain: it re-derives the run deterministically and confirms, per commit,
//! the chain anchors, the Merkle aggregation, the recorded debts, service,
//! and disturbance, both ε values, the debt-law disposition, and every
//! policy-locked identifier.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

/// Action descriptors: declared transition metadata bound to the gate.
pub mod action;
/// Batch attempt pipeline: planning checks, kernel execution, δ-check, patch, gate.
pub mod attempt;
/// Canonical JSON byte emission and digest helpers.
pub mod canon;
/// Strict document parsers for every wire schema.
pub mod codec;
/// Contract sets and the violation functional V(x).
pub mod contract;
/// Curvature matrix registry.
pub mod curvature;
/// Main loop, failure classification, and rescheduling transforms.
pub mod engine;
/// Closed error taxonomy shared across the gate and scheduler.
pub mod error;
/// Read/write footprints and independence checks.
pub mod footprint;
/// The measured gate: debt, service, disturbance, and the law inequality.
pub mod gate;
/// Identifier types, SHA3-256 digests, and `h:`-tagged hex.
pub mod ident;
/// Kernel trait, builtin kernels, and the kernel registry.
pub mod kernel;
/// Append-only commit ledger and runtime state.
pub mod ledger;
/// Resource-cap metering for big-integer accumulation.
pub mod meter;
/// Execution plans: OpSpecs and the operation DAG.
pub mod plan;
/// Frozen chain-wide policy bundle.
pub mod policy;
/// Exact scale-6 quantum arithmetic (DebtUnit).
pub mod quantum;
/// Local and commit receipts, Merkle aggregation, hash chaining.
pub mod receipt;
/// Standalone replay verifier.
pub mod replay;
/// Greedy curvature-aware batch scheduler (`greedy.curv.v1`).
pub mod scheduler;
/// Immutable state snapshots keyed by field id.
pub mod state;
/// Telemetry seam; sinks never influence receipt bytes.
pub mod telemetry;
/// In-degree bookkeeping and canonical ready-set computation.
pub mod tracker;
/// Tagged-atom scalar values (`i:` / `q:` / `b64:` / `s:`).
pub mod value;

pub use action::{ActionDescriptor, ActionKind};
pub use attempt::{AttemptOutcome, BatchContext};
pub use contract::{Contract, ContractSet, Weight};
pub use curvature::{CurvatureMatrix, CurvatureRegistry, MatrixEntry};
pub use engine::{Engine, RunOutcome, RunSummary};
pub use error::{FailClass, InvariantId, TerminalCode, TerminalError};
pub use footprint::{FieldSet, Footprint};
pub use gate::GateOutcome;
pub use ident::{FieldId, Hash, OpId, GENESIS_PREV_HASH};
pub use kernel::{Kernel, KernelError, KernelRegistry};
pub use ledger::{Ledger, RuntimeState};
pub use plan::{EdgeKind, ExecutionPlan, GlbMode, OpSpec};
pub use policy::{DisturbancePolicy, PolicyBundle, ResourceCaps, ServiceLaw};
pub use quantum::{DebtUnit, QuantumError, SCALE};
pub use receipt::{merkle_root, CommitReceipt, LocalReceipt};
pub use replay::{verify_chain, ReplaySummary, VerifyCheck, VerifyError};
pub use scheduler::{assemble_batch, BatchPlan, SCHEDULER_RULE_GREEDY_CURV_V1};
pub use state::State;
pub use telemetry::{NullTelemetrySink, TelemetryEvent, TelemetrySink};
pub use tracker::DependencyTracker;
pub use value::Value;
