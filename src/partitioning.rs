//! Partitioning (spec.md §2, §3): which process owns which slices of a
//! `Space`, and under what access intent.
//!
//! Grounded on `trace/description.rs`'s invariant-checking constructor style
//! (build, validate, reject) and on `consolidation.rs`'s preference for a
//! free function operating over a sorted vector of ranges rather than a
//! method-heavy API.

use crate::error::{slice_out_of_space, PartgridError};
use crate::index::{Slice, Space};
use crate::reduce::ReduceOp;

/// What a rank may do with the slices it's assigned under a `Partitioning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessIntent {
    /// Read-only: may overlap other ranks' `Read` or `Reduce` slices.
    Read,
    /// Write-only: must not overlap any other rank's `Write`/`ReadWrite`
    /// slice (no two writers own the same index).
    Write,
    /// Read and write: same disjointness requirement as `Write`.
    ReadWrite,
    /// Contributes to a combined value at indices possibly shared with
    /// other `Reduce` ranks, combined with `op`.
    Reduce(ReduceOp),
}

impl AccessIntent {
    fn is_exclusive(self) -> bool {
        matches!(self, AccessIntent::Write | AccessIntent::ReadWrite)
    }
}

/// One rank's slice assignment under a `Partitioning`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Assignment {
    /// Rank within the `Group` this partitioning is defined over.
    pub rank: usize,
    /// The slice owned under `intent`.
    pub slice: Slice,
    /// The access intent granted for `slice`.
    pub intent: AccessIntent,
}

/// A complete assignment of a `Space`'s indices to ranks of a `Group`, each
/// under an access intent.
///
/// Invariants (checked at construction): every slice lies within `space`;
/// no two `Write`/`ReadWrite` assignments (from any ranks) overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partitioning {
    assignments: Vec<Assignment>,
}

impl Partitioning {
    /// Builds a `Partitioning` from a flat assignment list, validating
    /// containment in `space` and exclusive-access disjointness.
    pub fn new(space: &Space, assignments: Vec<Assignment>) -> Result<Self, PartgridError> {
        for a in &assignments {
            if !space.contains(&a.slice) {
                return Err(slice_out_of_space(&a.slice, &format!("rank {} assignment", a.rank)));
            }
        }
        for (i, a) in assignments.iter().enumerate() {
            if !a.intent.is_exclusive() {
                continue;
            }
            for b in &assignments[i + 1..] {
                if !b.intent.is_exclusive() {
                    continue;
                }
                if a.slice.intersect(&b.slice).is_some() {
                    return Err(PartgridError::config(format!(
                        "exclusive-access slices for ranks {} and {} overlap ({} vs {})",
                        a.rank, b.rank, a.slice, b.slice
                    )));
                }
            }
        }
        Ok(Partitioning { assignments })
    }

    /// All assignments, in the order given at construction.
    pub fn assignments(&self) -> &[Assignment] { &self.assignments }

    /// Every assignment belonging to `rank`.
    pub fn for_rank(&self, rank: usize) -> impl Iterator<Item = &Assignment> {
        self.assignments.iter().filter(move |a| a.rank == rank)
    }

    /// The total set of ranks with at least one assignment, in ascending
    /// order and without duplicates.
    pub fn ranks(&self) -> Vec<usize> {
        let mut ranks: Vec<usize> = self.assignments.iter().map(|a| a.rank).collect();
        ranks.sort_unstable();
        ranks.dedup();
        ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sl(bounds: &[(i64, i64)]) -> Slice { Slice::new(bounds).unwrap() }

    #[test]
    fn rejects_slice_outside_space() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let result = Partitioning::new(
            &space,
            vec![Assignment { rank: 0, slice: sl(&[(0, 9)]), intent: AccessIntent::Write }],
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_overlapping_writers() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let result = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 5)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(3, 8)]), intent: AccessIntent::ReadWrite },
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn allows_overlapping_readers_and_reducers() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let result = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 5)]), intent: AccessIntent::Read },
                Assignment { rank: 1, slice: sl(&[(3, 8)]), intent: AccessIntent::Read },
                Assignment { rank: 2, slice: sl(&[(0, 8)]), intent: AccessIntent::Reduce(ReduceOp::Sum) },
            ],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn disjoint_writers_are_fine() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let result = Partitioning::new(
            &space,
            vec![
                Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write },
                Assignment { rank: 1, slice: sl(&[(4, 8)]), intent: AccessIntent::Write },
            ],
        );
        assert!(result.is_ok());
        let p = result.unwrap();
        assert_eq!(p.ranks(), vec![0, 1]);
        assert_eq!(p.for_rank(0).count(), 1);
    }
}
