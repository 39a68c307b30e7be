// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Local and commit receipts.
//!
//! A local receipt binds one op's execution (kernel, footprint, δ-bound,
//! pre/post state hashes) to the chain anchor. A commit receipt aggregates a
//! batch: the Merkle root of its local hashes, the scheduler identity, the
//! policy and matrix digests, and the measured/estimated ε pair. The commit
//! hash becomes the next previous-hash.
//!
//! Hash split (wire contract, preserved bit-exact): receipt identities are
//! SHA3-256 over canonical JSON bytes; Merkle interior nodes are SHA-256 over
//! the raw 32-byte leaves, duplicating the last node on odd counts. A root
//! over a single leaf is that leaf — no duplication is applied.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::canon;
use crate::ident::{hash_to_wire, Hash, OpId};
use crate::plan::GlbMode;
use crate::quantum::DebtUnit;

/// Receipt for a single op within a committed batch.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LocalReceipt {
    /// The op this receipt covers.
    pub op_id: OpId,
    /// Kernel body hash.
    pub kernel_hash: Hash,
    /// Declared footprint digest.
    pub footprint_digest: Hash,
    /// Curvature block index.
    pub block: u32,
    /// Declared δ-bound.
    pub delta_bound: DebtUnit,
    /// Policy bundle id.
    pub policy_id: String,
    /// Mode the batch ran under.
    pub glb_mode: GlbMode,
    /// Hash of the shared pre-state.
    pub pre_state_hash: Hash,
    /// Hash of the single-op patched state.
    pub post_state_hash: Hash,
    /// Chain anchor at attempt time.
    pub prev_commit_hash: Hash,
}

impl LocalReceipt {
    /// Canonical JSON document (sorted keys, tagged atoms).
    #[must_use]
    pub fn canonical_doc(&self) -> serde_json::Value {
        json!({
            "block": format!("i:{}", self.block),
            "delta_bound": self.delta_bound.to_wire(),
            "footprint_digest": hash_to_wire(&self.footprint_digest),
            "glb_mode": format!("id:{}", self.glb_mode.id()),
            "kernel_hash": hash_to_wire(&self.kernel_hash),
            "op_id": self.op_id.to_wire(),
            "policy_id": format!("id:{}", self.policy_id),
            "post_state_hash": hash_to_wire(&self.post_state_hash),
            "pre_state_hash": hash_to_wire(&self.pre_state_hash),
            "prev_commit_hash": hash_to_wire(&self.prev_commit_hash),
        })
    }

    /// Local hash: SHA3-256 of the canonical bytes.
    #[must_use]
    pub fn hash(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }
}

/// Receipt for a committed batch; its hash anchors the next commit.
///
/// Beyond the chain anchors and policy-locked identifiers, a commit records
/// the gate measurements themselves — pre/post debt, service, disturbance,
/// and the debt-law disposition — so the replay verifier can recompute and
/// confirm each one independently.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommitReceipt {
    /// Chain anchor this commit extends.
    pub prev_commit_hash: Hash,
    /// Number of ops in the batch.
    pub batch_size: u32,
    /// Merkle root over the byte-sorted local hashes.
    pub merkle_root: Hash,
    /// Scheduler rule id.
    pub scheduler_rule: String,
    /// Mode the batch ran under.
    pub glb_mode: GlbMode,
    /// Policy bundle id.
    pub policy_id: String,
    /// Policy bundle digest.
    pub policy_digest: Hash,
    /// Curvature matrix version id.
    pub matrix_version: String,
    /// Curvature matrix digest.
    pub matrix_digest: Hash,
    /// `D = V(pre)` for the batch.
    pub pre_debt: DebtUnit,
    /// `D' = V(post)` for the batch.
    pub post_debt: DebtUnit,
    /// `S(D, B)` under the bundled service law.
    pub service: DebtUnit,
    /// The verified disturbance `E`.
    pub disturbance: DebtUnit,
    /// Whether `D' ≤ D − S(D,B) + E` held for the batch action.
    pub law_satisfied: bool,
    /// `ε_measured = |ΔV|` for the batch.
    pub epsilon_measured: DebtUnit,
    /// ε̂ for the batch.
    pub epsilon_hat: DebtUnit,
}

impl CommitReceipt {
    /// Canonical JSON document (sorted keys, tagged atoms).
    #[must_use]
    pub fn canonical_doc(&self) -> serde_json::Value {
        json!({
            "batch_size": format!("i:{}", self.batch_size),
            "disturbance": self.disturbance.to_wire(),
            "epsilon_hat": self.epsilon_hat.to_wire(),
            "epsilon_measured": self.epsilon_measured.to_wire(),
            "glb_mode": format!("id:{}", self.glb_mode.id()),
            "law_satisfied": self.law_satisfied,
            "matrix_digest": hash_to_wire(&self.matrix_digest),
            "matrix_version": format!("id:{}", self.matrix_version),
            "merkle_root": hash_to_wire(&self.merkle_root),
            "policy_digest": hash_to_wire(&self.policy_digest),
            "policy_id": format!("id:{}", self.policy_id),
            "post_debt": self.post_debt.to_wire(),
            "pre_debt": self.pre_debt.to_wire(),
            "prev_commit_hash": hash_to_wire(&self.prev_commit_hash),
            "scheduler_rule": format!("id:{}", self.scheduler_rule),
            "service": self.service.to_wire(),
        })
    }

    /// Commit hash: SHA3-256 of the canonical bytes.
    #[must_use]
    pub fn hash(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }
}

/// Merkle root over raw 32-byte leaves.
///
/// Pairwise SHA-256; on an odd node count the last node is duplicated. A
/// single leaf is its own root. Callers pass the local hashes already sorted
/// byte-ascending (the canonical leaf sequence).
#[must_use]
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    let Some(first) = leaves.first() else {
        // Empty batches never commit; the zero root is inert.
        return [0u8; 32];
    };
    if leaves.len() == 1 {
        return *first;
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut hasher = Sha256::new();
            hasher.update(left);
            hasher.update(right);
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    level[0]
}

/// Byte-sorts local hashes into the canonical Merkle leaf sequence.
#[must_use]
pub fn leaf_sequence(local_hashes: &[Hash]) -> Vec<Hash> {
    let mut leaves = local_hashes.to_vec();
    leaves.sort_unstable();
    leaves
}
