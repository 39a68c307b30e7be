// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Append-only commit ledger and runtime state.
//!
//! The ledger anchor (previous-hash), the state snapshot, and the
//! committed/pending partition are owned exclusively by the main loop;
//! nothing outside it mutates them. Across commits, receipts are totally
//! ordered by the hash chain: each commit's `prev_commit_hash` equals the
//! hash of the immediately preceding commit (or the genesis hash before the
//! first commit).

use std::collections::BTreeSet;

use thiserror::Error;

use crate::ident::{Hash, OpId};
use crate::receipt::CommitReceipt;
use crate::state::State;

/// Errors produced while appending to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The receipt's previous-hash did not equal the current head.
    #[error("receipt does not extend the chain head")]
    BrokenChain,
}

/// Append-only sequence of commit receipts anchored at genesis.
#[derive(Clone, Debug)]
pub struct Ledger {
    genesis: Hash,
    commits: Vec<CommitReceipt>,
    head: Hash,
}

impl Ledger {
    /// Creates an empty ledger anchored at `genesis`.
    pub fn new(genesis: Hash) -> Self {
        Self {
            genesis,
            commits: Vec::new(),
            head: genesis,
        }
    }

    /// The genesis previous-hash.
    #[must_use]
    pub fn genesis(&self) -> Hash {
        self.genesis
    }

    /// The current chain head: the last commit hash, or genesis.
    #[must_use]
    pub fn head(&self) -> Hash {
        self.head
    }

    /// Appends a commit receipt; it must extend the current head.
    pub fn append(&mut self, receipt: CommitReceipt) -> Result<Hash, LedgerError> {
        if receipt.prev_commit_hash != self.head {
            return Err(LedgerError::BrokenChain);
        }
        let hash = receipt.hash();
        self.commits.push(receipt);
        self.head = hash;
        Ok(hash)
    }

    /// The committed receipts, oldest first.
    #[must_use]
    pub fn commits(&self) -> &[CommitReceipt] {
        &self.commits
    }

    /// Number of commits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// True before the first commit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

/// The mutable position of a run: state snapshot, chain anchor, and the
/// committed/pending partition of the plan's ops.
#[derive(Clone, Debug)]
pub struct RuntimeState {
    /// Current state snapshot.
    pub state: State,
    /// Hash of the most recently appended commit (or genesis).
    pub prev_commit: Hash,
    /// Ops already committed.
    pub committed: BTreeSet<OpId>,
    /// Ops not yet committed.
    pub pending: BTreeSet<OpId>,
}

impl RuntimeState {
    /// Creates the initial runtime state: nothing committed, everything
    /// pending, anchored at genesis.
    pub fn genesis(state: State, genesis: Hash, all_ops: impl IntoIterator<Item = OpId>) -> Self {
        Self {
            state,
            prev_commit: genesis,
            committed: BTreeSet::new(),
            pending: all_ops.into_iter().collect(),
        }
    }

    /// Advances past a commit: swap state, move ops across the partition,
    /// re-anchor.
    pub fn advance(&mut self, new_state: State, commit_hash: Hash, batch: &[OpId]) {
        self.state = new_state;
        self.prev_commit = commit_hash;
        for op in batch {
            self.pending.remove(op);
            self.committed.insert(op.clone());
        }
    }

    /// Checks the partition invariant: committed and pending are disjoint
    /// and jointly cover the given op universe.
    #[must_use]
    pub fn partition_holds(&self, all_ops: &BTreeSet<OpId>) -> bool {
        if self.committed.intersection(&self.pending).next().is_some() {
            return false;
        }
        let union: BTreeSet<&OpId> = self.committed.union(&self.pending).collect();
        union.len() == all_ops.len() && all_ops.iter().all(|op| union.contains(op))
    }
}
