// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Keel developer CLI.
//!
//! Three subcommands over the canonical wire documents:
//! - `keel plan <plan.json>` — validate a plan and print its module receipt;
//! - `keel run …` — execute a plan, writing the receipt ledger and printing
//!   the final hashes, or the terminal error object;
//! - `keel verify …` — replay a receipt chain and report validity.
//!
//! Exit status: 0 on success (chain valid / run completed), 1 on a terminal
//! error or verification failure, 2 on input errors. All diagnostics go to
//! `tracing`; only canonical JSON and the final summary lines go to stdout.
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
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions
)]

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as Json;

use keel_core::codec;
use keel_core::engine::{Engine, RunOutcome};
use keel_core::ident::hash_to_wire;
use keel_core::kernel::KernelRegistry;
use keel_core::replay::verify_chain;
use keel_core::telemetry::{TelemetryEvent, TelemetrySink};
use keel_core::CurvatureRegistry;

/// Deterministic coherence-gating runtime CLI.
#[derive(Debug, Parser)]
#[command(name = "keel", version, about)]
struct Cli {
    /// Emit scheduler/gate telemetry at debug level.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a plan document and print its module receipt.
    Plan {
        /// Path to the plan JSON document.
        plan: PathBuf,
    },
    /// Execute a plan, producing a receipt ledger or a terminal error.
    Run {
        /// Policy bundle document.
        #[arg(long)]
        policy: PathBuf,
        /// Contract set document.
        #[arg(long)]
        contracts: PathBuf,
        /// Curvature matrix document.
        #[arg(long)]
        matrix: PathBuf,
        /// Execution plan document.
        #[arg(long)]
        plan: PathBuf,
        /// Initial state document.
        #[arg(long)]
        initial_state: PathBuf,
        /// Where to write the receipt ledger (canonical JSON array).
        #[arg(long)]
        receipts_out: Option<PathBuf>,
    },
    /// Replay a receipt chain and report validity.
    Verify {
        /// Policy bundle document.
        #[arg(long)]
        policy: PathBuf,
        /// Contract set document.
        #[arg(long)]
        contracts: PathBuf,
        /// Curvature matrix document.
        #[arg(long)]
        matrix: PathBuf,
        /// Execution plan document.
        #[arg(long)]
        plan: PathBuf,
        /// Initial state document.
        #[arg(long)]
        initial_state: PathBuf,
        /// Receipt ledger to verify.
        #[arg(long)]
        receipts: PathBuf,
    },
}

/// Bridges engine telemetry into `tracing` at debug level.
struct TracingSink;

impl TelemetrySink for TracingSink {
    fn event(&self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::BatchAssembled { size } => {
                tracing::debug!(size = *size, "batch assembled");
            }
            TelemetryEvent::BatchFailed { class, size } => {
                tracing::debug!(class = class.code(), size = *size, "batch failed");
            }
            TelemetryEvent::CommitAppended { index, commit_hash } => {
                tracing::debug!(
                    index = *index,
                    commit = %hex::encode(commit_hash),
                    "commit appended"
                );
            }
            TelemetryEvent::Halted { code } => {
                tracing::debug!(code = code.code(), "halted");
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match dispatch(cli.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn dispatch(command: Command) -> Result<ExitCode> {
    match command {
        Command::Plan { plan } => cmd_plan(&plan),
        Command::Run {
            policy,
            contracts,
            matrix,
            plan,
            initial_state,
            receipts_out,
        } => cmd_run(
            &policy,
            &contracts,
            &matrix,
            &plan,
            &initial_state,
            receipts_out.as_deref(),
        ),
        Command::Verify {
            policy,
            contracts,
            matrix,
            plan,
            initial_state,
            receipts,
        } => cmd_verify(&policy, &contracts, &matrix, &plan, &initial_state, &receipts),
    }
}

fn read_json(path: &Path) -> Result<Json> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn print_json(doc: &Json) -> Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, doc).context("writing stdout")?;
    out.write_all(b"\n").context("writing stdout")?;
    Ok(())
}

fn print_line(line: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(line.as_bytes()).context("writing stdout")?;
    out.write_all(b"\n").context("writing stdout")?;
    Ok(())
}

fn cmd_plan(plan_path: &Path) -> Result<ExitCode> {
    let plan = codec::parse_plan(&read_json(plan_path)?).context("plan rejected")?;
    print_json(&codec::emit_plan_receipt(&plan))?;
    Ok(ExitCode::SUCCESS)
}

struct ChainInputs {
    bundle: keel_core::PolicyBundle,
    contracts: keel_core::ContractSet,
    curvature: CurvatureRegistry,
    plan: keel_core::ExecutionPlan,
    state: keel_core::State,
}

fn load_chain_inputs(
    policy: &Path,
    contracts: &Path,
    matrix: &Path,
    plan: &Path,
    initial_state: &Path,
) -> Result<ChainInputs> {
    let bundle = codec::parse_policy(&read_json(policy)?).context("policy rejected")?;
    let contracts = codec::parse_contracts(&read_json(contracts)?).context("contracts rejected")?;
    let matrix = codec::parse_matrix(&read_json(matrix)?).context("matrix rejected")?;
    let mut curvature = CurvatureRegistry::new();
    curvature.register(matrix).context("matrix rejected")?;
    let plan = codec::parse_plan(&read_json(plan)?).context("plan rejected")?;
    let state = codec::parse_state(&read_json(initial_state)?).context("state rejected")?;
    Ok(ChainInputs {
        bundle,
        contracts,
        curvature,
        plan,
        state,
    })
}

fn cmd_run(
    policy: &Path,
    contracts: &Path,
    matrix: &Path,
    plan: &Path,
    initial_state: &Path,
    receipts_out: Option<&Path>,
) -> Result<ExitCode> {
    let inputs = load_chain_inputs(policy, contracts, matrix, plan, initial_state)?;
    let mut engine = Engine::new(
        inputs.bundle,
        inputs.contracts,
        &inputs.curvature,
        KernelRegistry::builtin(),
        inputs.plan,
        inputs.state,
    )
    .context("chain genesis rejected")?;
    engine.set_telemetry(Arc::new(TracingSink));

    let outcome = engine.run();
    if let Some(path) = receipts_out {
        let doc = codec::emit_receipts(engine.ledger().commits());
        fs::write(path, serde_json::to_vec(&doc).context("encoding receipts")?)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    match outcome {
        RunOutcome::Completed(summary) => {
            print_line(&format!(
                "final_commit_hash={}",
                hash_to_wire(&summary.final_commit_hash)
            ))?;
            print_line(&format!(
                "final_state_hash={}",
                hash_to_wire(&summary.final_state_hash)
            ))?;
            print_line(&format!("commits={}", summary.commits))?;
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Halted(terminal) => {
            print_json(&codec::emit_terminal(&terminal))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn cmd_verify(
    policy: &Path,
    contracts: &Path,
    matrix: &Path,
    plan: &Path,
    initial_state: &Path,
    receipts: &Path,
) -> Result<ExitCode> {
    let inputs = load_chain_inputs(policy, contracts, matrix, plan, initial_state)?;
    let chain = codec::parse_receipts(&read_json(receipts)?).context("receipts rejected")?;
    match verify_chain(
        inputs.bundle,
        inputs.contracts,
        &inputs.curvature,
        KernelRegistry::builtin(),
        inputs.plan,
        inputs.state,
        &chain,
    ) {
        Ok(summary) => {
            print_line("chain: valid")?;
            print_line(&format!(
                "final_commit_hash={}",
                hash_to_wire(&summary.final_commit_hash)
            ))?;
            print_line(&format!(
                "final_state_hash={}",
                hash_to_wire(&summary.final_state_hash)
            ))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            print_line(&format!(
                "chain: invalid at commit {} ({:?})",
                failure.commit_index, failure.check
            ))?;
            Ok(ExitCode::FAILURE)
        }
    }
}
