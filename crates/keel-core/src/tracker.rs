// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dependency tracking and ready-set computation.
//!
//! The tracker owns the in-degree bookkeeping for the operation DAG. It is
//! mutable through exactly two operations: marking an op committed
//! (decrementing each successor, in sorted successor order) and resetting
//! peeled ops back to ready (in-degree forced to zero). The ready set is
//! always returned in canonical `op_id` byte order.

use std::collections::{BTreeMap, BTreeSet};

use crate::ident::OpId;
use crate::plan::ExecutionPlan;

/// In-degree bookkeeping over the plan DAG.
#[derive(Clone, Debug)]
pub struct DependencyTracker {
    in_degree: BTreeMap<OpId, usize>,
    successors: BTreeMap<OpId, Vec<OpId>>,
    committed: BTreeSet<OpId>,
}

impl DependencyTracker {
    /// Builds the tracker from a plan's edges. Parallel edges between the
    /// same pair count once.
    pub fn new(plan: &ExecutionPlan) -> Self {
        let mut in_degree: BTreeMap<OpId, usize> = BTreeMap::new();
        let mut successors: BTreeMap<OpId, Vec<OpId>> = BTreeMap::new();
        for op in &plan.ops {
            in_degree.insert(op.op_id.clone(), 0);
            successors.insert(op.op_id.clone(), Vec::new());
        }
        let mut seen_pairs: BTreeSet<(OpId, OpId)> = BTreeSet::new();
        for edge in &plan.edges {
            if !seen_pairs.insert((edge.from.clone(), edge.to.clone())) {
                continue;
            }
            if let Some(deg) = in_degree.get_mut(&edge.to) {
                *deg += 1;
            }
            if let Some(succs) = successors.get_mut(&edge.from) {
                succs.push(edge.to.clone());
            }
        }
        for succs in successors.values_mut() {
            succs.sort();
        }
        Self {
            in_degree,
            successors,
            committed: BTreeSet::new(),
        }
    }

    /// Ops with in-degree zero and not yet committed, in canonical order.
    #[must_use]
    pub fn ready_set(&self) -> Vec<OpId> {
        self.in_degree
            .iter()
            .filter(|(id, deg)| **deg == 0 && !self.committed.contains(*id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Marks an op committed; decrements each successor in sorted order.
    pub fn mark_committed(&mut self, op: &OpId) {
        if !self.committed.insert(op.clone()) {
            return;
        }
        if let Some(succs) = self.successors.get(op) {
            for succ in succs.clone() {
                if let Some(deg) = self.in_degree.get_mut(&succ) {
                    *deg = deg.saturating_sub(1);
                }
            }
        }
    }

    /// Returns peeled ops to the ready set: in-degree forced to zero.
    pub fn reset_to_ready(&mut self, ops: &[OpId]) {
        for op in ops {
            if let Some(deg) = self.in_degree.get_mut(op) {
                *deg = 0;
            }
        }
    }

    /// True when every op has committed.
    #[must_use]
    pub fn all_committed(&self) -> bool {
        self.committed.len() == self.in_degree.len()
    }

    /// Ops committed so far, in canonical order.
    #[must_use]
    pub fn committed(&self) -> &BTreeSet<OpId> {
        &self.committed
    }

    /// Ops not yet committed, in canonical order.
    #[must_use]
    pub fn pending(&self) -> Vec<OpId> {
        self.in_degree
            .keys()
            .filter(|id| !self.committed.contains(*id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{op, plan};
    use crate::plan::{EdgeKind, PlanEdge};

    fn oid(s: &str) -> OpId {
        OpId::new(s).unwrap()
    }

    fn edge(from: &str, to: &str) -> PlanEdge {
        PlanEdge {
            from: oid(from),
            to: oid(to),
            kind: EdgeKind::ControlExplicit,
        }
    }

    #[test]
    fn ready_set_is_canonically_ordered() {
        let p = plan(
            vec![
                op("op.z", &[], &[1], 0),
                op("op.a", &[], &[2], 0),
                op("op.m", &[], &[3], 0),
            ],
            vec![],
        );
        let tracker = DependencyTracker::new(&p);
        assert_eq!(
            tracker.ready_set(),
            vec![oid("op.a"), oid("op.m"), oid("op.z")]
        );
    }

    #[test]
    fn commit_unblocks_successors() {
        let p = plan(
            vec![
                op("op.a", &[], &[1], 0),
                op("op.b", &[], &[2], 0),
                op("op.c", &[], &[3], 0),
            ],
            vec![edge("op.a", "op.b"), edge("op.a", "op.c")],
        );
        let mut tracker = DependencyTracker::new(&p);
        assert_eq!(tracker.ready_set(), vec![oid("op.a")]);
        tracker.mark_committed(&oid("op.a"));
        assert_eq!(tracker.ready_set(), vec![oid("op.b"), oid("op.c")]);
        assert!(!tracker.all_committed());
        tracker.mark_committed(&oid("op.b"));
        tracker.mark_committed(&oid("op.c"));
        assert!(tracker.all_committed());
    }

    #[test]
    fn parallel_edges_count_once() {
        let p = plan(
            vec![op("op.a", &[], &[1], 0), op("op.b", &[], &[2], 0)],
            vec![
                edge("op.a", "op.b"),
                PlanEdge {
                    from: oid("op.a"),
                    to: oid("op.b"),
                    kind: EdgeKind::Waw,
                },
            ],
        );
        let mut tracker = DependencyTracker::new(&p);
        tracker.mark_committed(&oid("op.a"));
        // One decrement suffices; a double-counted edge would leave op.b blocked.
        assert_eq!(tracker.ready_set(), vec![oid("op.b")]);
    }

    #[test]
    fn reset_to_ready_keeps_zero_in_degree() {
        let p = plan(
            vec![op("op.a", &[], &[1], 0), op("op.b", &[], &[2], 0)],
            vec![],
        );
        let mut tracker = DependencyTracker::new(&p);
        tracker.reset_to_ready(&[oid("op.b")]);
        assert_eq!(tracker.ready_set(), vec![oid("op.a"), oid("op.b")]);
    }

    #[test]
    fn double_commit_is_idempotent() {
        let p = plan(
            vec![op("op.a", &[], &[1], 0), op("op.b", &[], &[2], 0)],
            vec![edge("op.a", "op.b")],
        );
        let mut tracker = DependencyTracker::new(&p);
        tracker.mark_committed(&oid("op.a"));
        tracker.mark_committed(&oid("op.a"));
        assert_eq!(tracker.ready_set(), vec![oid("op.b")]);
    }
}
