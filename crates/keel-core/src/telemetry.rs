// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Telemetry seam for the main loop.
//!
//! Sinks observe scheduler and gate events; they can never influence receipt
//! bytes, and the engine never blocks on them. The default sink discards
//! everything.

use crate::error::{FailClass, TerminalCode};
use crate::ident::Hash;

/// One observable engine event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    /// A batch was assembled from the ready set.
    BatchAssembled {
        /// Append-log length.
        size: usize,
    },
    /// A batch attempt failed and will be transformed.
    BatchFailed {
        /// The classified failure.
        class: FailClass,
        /// Size of the failing batch.
        size: usize,
    },
    /// A commit receipt was appended to the ledger.
    CommitAppended {
        /// Zero-based commit index.
        index: usize,
        /// The commit hash (the new chain head).
        commit_hash: Hash,
    },
    /// The run halted with a terminal error.
    Halted {
        /// The terminal code.
        code: TerminalCode,
    },
}

/// Receives engine events.
pub trait TelemetrySink: Send + Sync {
    /// Observes one event.
    fn event(&self, event: &TelemetryEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetrySink;

impl TelemetrySink for NullTelemetrySink {
    fn event(&self, _event: &TelemetryEvent) {}
}
