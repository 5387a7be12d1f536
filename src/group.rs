//! Process groups (spec.md §3): an ordered set of cooperating processes,
//! and derivation of a smaller or reshuffled group from a parent.
//!
//! Grounded on `trace/description.rs`'s small-value-type style (plain
//! accessors over an owned `Vec`, no interior mutability); the `fromParent`
//! derivation bookkeeping is new, since spec.md names it explicitly in §3
//! without handing it an existing analogue in the teacher.

use crate::error::PartgridError;

/// Where one member of a `Group` is reachable: spec.md leaves the location
/// representation open; this crate uses a host/port pair, since that's what
/// the point-to-point backend's rendezvous protocol (§4.G) needs to dial a
/// peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    host: String,
    port: u16,
}

impl Location {
    /// Builds a location from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Location { host: host.into(), port }
    }

    /// The hostname or address.
    pub fn host(&self) -> &str { &self.host }
    /// The port.
    pub fn port(&self) -> u16 { self.port }
}

/// An ordered, fixed set of process locations, plus (for the calling
/// process) its own rank within the set, if it is a member at all.
///
/// Invariant: `myid`, when `Some`, indexes into `locations`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Group {
    locations: Vec<Location>,
    myid: Option<usize>,
}

impl Group {
    /// The trivial one-member group containing only the calling process.
    pub fn singleton(location: Location) -> Self {
        Group { locations: vec![location], myid: Some(0) }
    }

    /// A group over an explicit member list, with `myid` as this process's
    /// rank within it (`None` if this process is not a member — e.g. it is
    /// only coordinating the group's formation).
    pub fn new(locations: Vec<Location>, myid: Option<usize>) -> Result<Self, PartgridError> {
        if locations.is_empty() {
            return Err(PartgridError::config("group must have at least one member"));
        }
        if let Some(id) = myid {
            if id >= locations.len() {
                return Err(PartgridError::config(format!(
                    "myid {id} out of range for a {}-member group",
                    locations.len()
                )));
            }
        }
        Ok(Group { locations, myid })
    }

    /// Number of members.
    pub fn size(&self) -> usize { self.locations.len() }

    /// This process's rank, or `None` if it is not a member.
    pub fn myid(&self) -> Option<i64> {
        self.myid.map(|id| id as i64)
    }

    /// The location of rank `rank`, if in range.
    pub fn location(&self, rank: usize) -> Option<&Location> {
        self.locations.get(rank)
    }

    /// All member locations, in rank order.
    pub fn locations(&self) -> &[Location] { &self.locations }

    /// Derives a child group from `self` (the parent) via a `from_parent`
    /// map giving, for each parent rank in order, either its rank in the
    /// child group or `None` if that process is excluded (spec.md's
    /// `fromParent[parentRank] -> newRank | -1`, using `Option` in place of
    /// the sentinel `-1`).
    ///
    /// `from_parent` must have one entry per parent rank; child ranks named
    /// in it must be a contiguous `0..n` with no gaps or repeats.
    pub fn derive_shrink(&self, from_parent: &[Option<usize>]) -> Result<Self, PartgridError> {
        if from_parent.len() != self.locations.len() {
            return Err(PartgridError::config(format!(
                "fromParent map has {} entries, parent group has {}",
                from_parent.len(),
                self.locations.len()
            )));
        }
        let child_count = from_parent.iter().filter(|r| r.is_some()).count();
        let mut child_locations: Vec<Option<Location>> = vec![None; child_count];
        let mut child_myid = None;
        for (parent_rank, slot) in from_parent.iter().enumerate() {
            if let Some(child_rank) = slot {
                if *child_rank >= child_count {
                    return Err(PartgridError::config(format!(
                        "fromParent maps parent rank {parent_rank} to child rank {child_rank}, \
                         which is out of range for a {child_count}-member child group"
                    )));
                }
                if child_locations[*child_rank].is_some() {
                    return Err(PartgridError::config(format!(
                        "fromParent maps two parent ranks onto child rank {child_rank}"
                    )));
                }
                child_locations[*child_rank] = Some(self.locations[parent_rank].clone());
                if self.myid == Some(parent_rank) {
                    child_myid = Some(*child_rank);
                }
            }
        }
        let locations = child_locations
            .into_iter()
            .enumerate()
            .map(|(rank, loc)| {
                loc.ok_or_else(|| {
                    PartgridError::config(format!("fromParent leaves child rank {rank} unassigned"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Group::new(locations, child_myid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(n: u16) -> Location { Location::new("127.0.0.1", n) }

    #[test]
    fn singleton_is_self_member() {
        let g = Group::singleton(loc(9000));
        assert_eq!(g.size(), 1);
        assert_eq!(g.myid(), Some(0));
    }

    #[test]
    fn new_rejects_out_of_range_myid() {
        assert!(Group::new(vec![loc(1)], Some(1)).is_err());
        assert!(Group::new(vec![loc(1)], Some(0)).is_ok());
    }

    #[test]
    fn derive_shrink_drops_excluded_ranks() {
        let parent = Group::new(vec![loc(1), loc(2), loc(3)], Some(1)).unwrap();
        // Drop rank 0; ranks 1 and 2 become child ranks 0 and 1.
        let child = parent.derive_shrink(&[None, Some(0), Some(1)]).unwrap();
        assert_eq!(child.size(), 2);
        assert_eq!(child.myid(), Some(0));
        assert_eq!(child.location(0), Some(&loc(2)));
        assert_eq!(child.location(1), Some(&loc(3)));
    }

    #[test]
    fn derive_shrink_excludes_the_caller() {
        let parent = Group::new(vec![loc(1), loc(2)], Some(0)).unwrap();
        let child = parent.derive_shrink(&[None, Some(0)]).unwrap();
        assert_eq!(child.myid(), None);
    }

    #[test]
    fn derive_shrink_rejects_bad_maps() {
        let parent = Group::new(vec![loc(1), loc(2)], Some(0)).unwrap();
        // Wrong length.
        assert!(parent.derive_shrink(&[Some(0)]).is_err());
        // Duplicate child rank.
        assert!(parent.derive_shrink(&[Some(0), Some(0)]).is_err());
        // Gap: child rank 1 used without a 0.
        assert!(parent.derive_shrink(&[Some(1), None]).is_err());
    }
}
