//! The flat, per-rank executable form of a `Transition` (spec.md §4.E): a
//! `TransitionPlan` backends actually walk, as opposed to the
//! whole-group `Transition` the planner produces.
//!
//! spec.md names `Send`, `Recv`, `PackAndSend`, `RecvAndUnpack`, `Pack`,
//! `Unpack` and `Copy` as the action vocabulary. Here, `Pack`/`Send` and
//! `Recv`/`Unpack` collapse into single `Send`/`Recv` actions: `Mapping`
//! already separates addressing (`Layout::offset`) from storage, so a
//! backend realizing a `Send` action just calls `Mapping::pack` on the
//! named slice immediately before handing the bytes to its transport —
//! there is no separate staging step worth representing. `Copy` and `Init`
//! need no transport at all and stay as named here.

use crate::index::Slice;
use crate::partitioning::AccessIntent;
use crate::reduce::ReduceOp;
use crate::transition::Transition;

/// One step of a rank's realized transition plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Copy `slice` from the old `Mapping` into the new one; no transport.
    Copy {
        /// The region copied.
        slice: Slice,
    },
    /// Fill `slice` in the new `Mapping` with the access intent's identity
    /// value (for `Reduce`) or zero (otherwise); no transport.
    Init {
        /// The region initialized.
        slice: Slice,
        /// The access intent this region was created under.
        intent: AccessIntent,
    },
    /// Pack `slice` out of the old `Mapping` and send it to `peer`.
    Send {
        /// The destination rank.
        peer: usize,
        /// The region sent.
        slice: Slice,
    },
    /// Receive `slice`'s worth of bytes from `peer` and unpack them into the
    /// new `Mapping`, combining with `reduce` if present (otherwise
    /// overwriting).
    Recv {
        /// The source rank.
        peer: usize,
        /// The region received.
        slice: Slice,
        /// The combining operator, if this region accumulates
        /// contributions from more than one peer.
        reduce: Option<ReduceOp>,
    },
}

impl Action {
    /// The peer this action communicates with, if any.
    pub fn peer(&self) -> Option<usize> {
        match self {
            Action::Send { peer, .. } | Action::Recv { peer, .. } => Some(*peer),
            Action::Copy { .. } | Action::Init { .. } => None,
        }
    }

    /// The region this action touches.
    pub fn slice(&self) -> Slice {
        match self {
            Action::Copy { slice }
            | Action::Init { slice, .. }
            | Action::Send { slice, .. }
            | Action::Recv { slice, .. } => *slice,
        }
    }
}

/// A rank's full realized plan: every `Action` it must take to move from
/// the old partitioning to the new one, in a fixed order (`Copy`/`Init`
/// first since they touch no transport, then `Send`, then `Recv`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionPlan {
    actions: Vec<Action>,
}

impl TransitionPlan {
    /// Realizes `transition` into `rank`'s flat plan.
    pub fn for_rank(transition: &Transition, rank: usize) -> Self {
        let mut actions = Vec::new();

        for local in transition.locals.iter().filter(|l| l.rank == rank) {
            actions.push(Action::Copy { slice: local.slice });
        }
        for init in transition.inits.iter().filter(|i| i.rank == rank) {
            actions.push(Action::Init { slice: init.slice, intent: init.intent });
        }
        for send in transition.sends.iter().filter(|s| s.from_rank == rank) {
            actions.push(Action::Send { peer: send.to_rank, slice: send.slice });
        }
        for recv in transition.recvs.iter().filter(|r| r.to_rank == rank) {
            actions.push(Action::Recv { peer: recv.from_rank, slice: recv.slice, reduce: recv.reduce });
        }

        TransitionPlan { actions }
    }

    /// The plan's actions, in execution order.
    pub fn actions(&self) -> &[Action] { &self.actions }

    /// True if this rank has nothing to do for this transition.
    pub fn is_empty(&self) -> bool { self.actions.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Space;
    use crate::partitioning::{Assignment, Partitioning};
    use crate::transition::plan;

    fn sl(bounds: &[(i64, i64)]) -> Slice { Slice::new(bounds).unwrap() }

    #[test]
    fn plan_splits_by_rank_and_orders_copy_before_transport() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let old = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(4, 8)]), intent: AccessIntent::Write },
            ],
        )
        .unwrap();
        let new = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 5)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(5, 8)]), intent: AccessIntent::Write },
            ],
        )
        .unwrap();
        let transition = plan(Some(&old), &new);

        let plan0 = TransitionPlan::for_rank(&transition, 0);
        assert!(matches!(plan0.actions()[0], Action::Copy { .. }));
        assert!(plan0.actions().iter().any(|a| matches!(a, Action::Recv { .. })));

        let plan1 = TransitionPlan::for_rank(&transition, 1);
        assert!(plan1.actions().iter().any(|a| matches!(a, Action::Send { .. })));
    }

    #[test]
    fn empty_plan_for_uninvolved_rank() {
        let space = Space::new(&[(0, 4)]).unwrap();
        let old = Partitioning::new(
            &space,
            vec![Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write }],
        )
        .unwrap();
        let transition = plan(Some(&old), &old);
        let plan5 = TransitionPlan::for_rank(&transition, 5);
        assert!(plan5.is_empty());
    }
}
