//! The transition planner (spec.md §4.C): given an old and a new
//! `Partitioning` over the same `Space`, compute what data each rank must
//! keep locally, send, receive, or initialize fresh to realize the new
//! partitioning.
//!
//! Grounded on the teacher's preference for pure, I/O-free transform
//! functions taking owned data in and returning a plan (`consolidation.rs`'s
//! `consolidate_slice`): `plan` touches no backend, no socket, no
//! allocation beyond its own output.

use crate::index::Slice;
use crate::partitioning::{AccessIntent, Partitioning};
use crate::reduce::ReduceOp;

/// A region this rank already holds under the old partitioning and keeps,
/// unchanged in content, under the new one (a pure local re-registration,
/// no bytes move, though it may still require a copy between two separate
/// `Mapping` buffers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCopy {
    /// The rank keeping this region.
    pub rank: usize,
    /// The region kept.
    pub slice: Slice,
}

/// A region of a new assignment with no corresponding data anywhere under
/// the old partitioning: freshly initialized (zeroed for plain writers, the
/// operator's identity for a `Reduce` assignment).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitEntry {
    /// The rank initializing this region.
    pub rank: usize,
    /// The region initialized.
    pub slice: Slice,
    /// The access intent this region was created under (so a `Reduce`
    /// region is seeded with the operator's identity, not zero).
    pub intent: AccessIntent,
}

/// A region an old-partitioning rank must send to a new-partitioning rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendEntry {
    /// The rank sending (owned this region under the old partitioning).
    pub from_rank: usize,
    /// The rank receiving (will own this region under the new
    /// partitioning).
    pub to_rank: usize,
    /// The region sent.
    pub slice: Slice,
}

/// The receiving half of a `SendEntry`: same region, same two ranks, plus
/// whether this contribution must be combined with others already received
/// for the same new-partitioning assignment (`Reduce` access intent) or
/// simply overwrites whatever was there (any other intent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvEntry {
    /// The rank receiving (will own this region under the new
    /// partitioning).
    pub to_rank: usize,
    /// The rank this contribution comes from.
    pub from_rank: usize,
    /// The region received.
    pub slice: Slice,
    /// `Some(op)` if this contribution must be combined into the
    /// accumulator rather than simply written, `None` otherwise.
    pub reduce: Option<ReduceOp>,
}

/// A reduction record (spec.md §3/§4.C step 3): a `Reduce`-intent region of
/// the new partitioning, naming the full input subgroup (every old-rank
/// owner whose intent included `Write`/`ReadWrite`/`Reduce` over the
/// overlapping indices) and output subgroup (every new-rank owner of that
/// region under `Reduce`), rather than a per-pair send/recv. A backend
/// realizes this by having the lowest-rank output member receive from
/// every input member, combine with the type's reduce, then forward the
/// result to the rest of the output subgroup — or, when both subgroups are
/// the full group, by delegating to a native all-reduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceRecord {
    /// Ranks contributing a value to be combined.
    pub input_group: Vec<usize>,
    /// Ranks that end up holding the combined result.
    pub output_group: Vec<usize>,
    /// The region combined.
    pub slice: Slice,
    /// The combining operator.
    pub op: ReduceOp,
}

/// The full set of data movements required to realize a new `Partitioning`
/// from an old one, over every rank in the group at once. A backend's
/// `exec` step filters this down to the entries naming its own rank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Regions kept by the same rank across both partitionings.
    pub locals: Vec<LocalCopy>,
    /// Regions with no antecedent data, freshly initialized.
    pub inits: Vec<InitEntry>,
    /// Regions one rank must send to another, for non-`Reduce` intents.
    pub sends: Vec<SendEntry>,
    /// Regions one rank must receive from another, for non-`Reduce`
    /// intents.
    pub recvs: Vec<RecvEntry>,
    /// Reduction records for `Reduce`-intent regions of the new
    /// partitioning; see `ReduceRecord`.
    pub red: Vec<ReduceRecord>,
}

impl Transition {
    /// True if this transition moves or initializes no data at all (the
    /// new partitioning is identical in coverage to the old one, held by
    /// the same ranks).
    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
            && self.inits.is_empty()
            && self.sends.is_empty()
            && self.recvs.is_empty()
            && self.red.is_empty()
    }
}

/// Computes the `Transition` from `old` to `new`. `old` may be `None` for a
/// container's very first partitioning, in which case every new assignment
/// is an `Init` (there is nothing yet to copy or receive from).
///
/// For every new assignment, walks the old assignments in order,
/// intersecting the still-unaccounted-for remainder of the new region
/// against each; a same-rank intersection becomes a `LocalCopy`, a
/// different-rank one becomes a matched `SendEntry`/`RecvEntry` pair, and
/// whatever remains once every old assignment has been considered becomes
/// an `InitEntry`.
pub fn plan(old: Option<&Partitioning>, new: &Partitioning) -> Transition {
    let mut transition = Transition::default();

    for new_assignment in new.assignments() {
        let mut remaining = vec![new_assignment.slice];

        if let Some(old) = old {
            for old_assignment in old.assignments() {
                let mut next_remaining = Vec::with_capacity(remaining.len());
                for region in remaining {
                    match region.intersect(&old_assignment.slice) {
                        None => next_remaining.push(region),
                        Some(overlap) => {
                            if old_assignment.rank == new_assignment.rank {
                                transition.locals.push(LocalCopy {
                                    rank: new_assignment.rank,
                                    slice: overlap,
                                });
                            } else if !matches!(new_assignment.intent, AccessIntent::Reduce(_)) {
                                // Reduce-intent regions are handled entirely
                                // by the `red` pass below: their input/output
                                // subgroups, not per-pair sends/recvs, is the
                                // unit a backend realizes a reduction over.
                                transition.sends.push(SendEntry {
                                    from_rank: old_assignment.rank,
                                    to_rank: new_assignment.rank,
                                    slice: overlap,
                                });
                                transition.recvs.push(RecvEntry {
                                    to_rank: new_assignment.rank,
                                    from_rank: old_assignment.rank,
                                    slice: overlap,
                                    reduce: None,
                                });
                            }
                            next_remaining.extend(region.subtract(&overlap));
                        }
                    }
                }
                remaining = next_remaining;
            }
        }

        for region in remaining {
            transition.inits.push(InitEntry {
                rank: new_assignment.rank,
                slice: region,
                intent: new_assignment.intent,
            });
        }
    }

    build_reduce_records(old, new, &mut transition);

    sort_transition(&mut transition);
    transition
}

/// Builds `transition.red` (step 3 of §4.C): for every distinct
/// `(slice, op)` pair named by a `Reduce`-intent assignment of `new`,
/// collects the output subgroup (every new-rank owner of that exact
/// region under that op) and the input subgroup (every old-rank owner
/// whose intent included `Write`/`ReadWrite`/`Reduce` over an overlapping
/// region).
fn build_reduce_records(old: Option<&Partitioning>, new: &Partitioning, transition: &mut Transition) {
    let mut seen: Vec<(Slice, ReduceOp)> = Vec::new();
    for assignment in new.assignments() {
        let op = match assignment.intent {
            AccessIntent::Reduce(op) => op,
            _ => continue,
        };
        if seen.iter().any(|(s, o)| *s == assignment.slice && *o == op) {
            continue;
        }
        seen.push((assignment.slice, op));

        let output_group: Vec<usize> = new
            .assignments()
            .iter()
            .filter(|a| a.slice == assignment.slice && a.intent == AccessIntent::Reduce(op))
            .map(|a| a.rank)
            .collect();

        let mut input_group: Vec<usize> = Vec::new();
        if let Some(old) = old {
            for old_assignment in old.assignments() {
                let contributes = matches!(
                    old_assignment.intent,
                    AccessIntent::Write | AccessIntent::ReadWrite | AccessIntent::Reduce(_)
                );
                if contributes
                    && old_assignment.slice.intersect(&assignment.slice).is_some()
                    && !input_group.contains(&old_assignment.rank)
                {
                    input_group.push(old_assignment.rank);
                }
            }
        }
        input_group.sort_unstable();
        let mut output_group = output_group;
        output_group.sort_unstable();

        transition.red.push(ReduceRecord { input_group, output_group, slice: assignment.slice, op });
    }
}

/// Sorts every list by `(peer_rank, slice.from)`, matching §4.C's ordering
/// requirement (deterministic action ordering across every rank's local
/// plan, so the deadlock-free collective schedule and the flat
/// `TransitionPlan` both see a consistent order).
fn sort_transition(transition: &mut Transition) {
    transition.locals.sort_by_key(|e| (e.rank, e.slice));
    transition.inits.sort_by_key(|e| (e.rank, e.slice));
    transition.sends.sort_by_key(|e| (e.to_rank, e.slice));
    transition.recvs.sort_by_key(|e| (e.from_rank, e.slice));
    transition.red.sort_by_key(|e| e.slice);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Space;
    use crate::partitioning::Assignment;

    fn sl(bounds: &[(i64, i64)]) -> Slice { Slice::new(bounds).unwrap() }

    fn part(space: &Space, assignments: Vec<Assignment>) -> Partitioning {
        Partitioning::new(space, assignments).unwrap()
    }

    #[test]
    fn first_partitioning_is_all_init() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let new = part(
            &space,
            vec![Assignment { rank: 0, slice: sl(&[(0, 8)]), intent: AccessIntent::Write }],
        );
        let t = plan(None, &new);
        assert_eq!(t.inits.len(), 1);
        assert!(t.sends.is_empty() && t.recvs.is_empty() && t.locals.is_empty());
    }

    #[test]
    fn two_rank_exchange() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let old = part(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(4, 8)]), intent: AccessIntent::Write },
            ],
        );
        let new = part(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 5)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(5, 8)]), intent: AccessIntent::Write },
            ],
        );
        let t = plan(Some(&old), &new);
        assert_eq!(t.locals.len(), 2);
        assert_eq!(t.sends.len(), 1);
        assert_eq!(t.recvs.len(), 1);
        assert_eq!(t.sends[0].from_rank, 1);
        assert_eq!(t.sends[0].to_rank, 0);
        assert_eq!(t.sends[0].slice, sl(&[(4, 5)]));
        assert!(t.inits.is_empty());
    }

    #[test]
    fn shrink_drops_a_rank_and_grows_coverage() {
        let space = Space::new(&[(0, 9)]).unwrap();
        let old = part(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 3)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(3, 6)]), intent: AccessIntent::Write },
                Assignment { rank: 2, slice: sl(&[(6, 9)]), intent: AccessIntent::Write },
            ],
        );
        let new = part(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 5)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(5, 9)]), intent: AccessIntent::Write },
            ],
        );
        let t = plan(Some(&old), &new);
        // Rank 2's entire old region is reassigned away; none of it is
        // local to a surviving rank under the same id.
        assert!(t.locals.iter().all(|l| l.rank != 2));
        assert!(t.sends.iter().any(|s| s.from_rank == 2));
        assert!(t.inits.is_empty());
    }

    #[test]
    fn reduce_assignment_produces_a_reduce_record_not_plain_recvs() {
        let space = Space::new(&[(0, 4)]).unwrap();
        let old = part(
            &space,
            vec![Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write }],
        );
        let new = part(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Reduce(ReduceOp::Sum) },
                Assignment { rank: 1, slice: sl(&[(0, 4)]), intent: AccessIntent::Reduce(ReduceOp::Sum) },
            ],
        );
        let t = plan(Some(&old), &new);
        assert!(t.recvs.is_empty());
        assert_eq!(t.red.len(), 1);
        let record = &t.red[0];
        assert_eq!(record.op, ReduceOp::Sum);
        assert_eq!(record.input_group, vec![0]);
        assert_eq!(record.output_group, vec![0, 1]);
        assert_eq!(record.slice, sl(&[(0, 4)]));
    }

    #[test]
    fn manual_subgroup_reduce_record_names_both_subgroups() {
        let space = Space::new(&[(0, 2)]).unwrap();
        let old = part(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 1)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(1, 2)]), intent: AccessIntent::Write },
            ],
        );
        let new = part(&space, vec![Assignment { rank: 2, slice: sl(&[(0, 2)]), intent: AccessIntent::Reduce(ReduceOp::Max) }]);
        let t = plan(Some(&old), &new);
        assert_eq!(t.red.len(), 1);
        assert_eq!(t.red[0].input_group, vec![0, 1]);
        assert_eq!(t.red[0].output_group, vec![2]);
    }
}
