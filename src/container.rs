//! `Container` (spec.md §3, §4.D): the user-facing handle over a `Space`,
//! an element `Type`, a `Group`, and whichever `Partitioning`/`Mapping` it
//! currently holds, driving a `Backend` through the transition lifecycle
//! every time its partitioning changes.
//!
//! Grounded on `trace/mod.rs`'s `Trace` (the mutating counterpart of
//! `TraceReader`): a small struct owning both its current data and the
//! machinery (here, a `Box<dyn Backend>`) that advances it, with one
//! entry-point method doing the advancing.

use std::rc::Rc;

use crate::backend::Backend;
use crate::error::PartgridError;
use crate::group::Group;
use crate::index::{Slice, Space};
use crate::logging;
use crate::mapping::Mapping;
use crate::partitioning::{AccessIntent, Partitioning};
use crate::transition;
use crate::types::Type;

/// A partitioned data container: the unit spec.md's operations (§4.D) act
/// on. Owns at most one `Partitioning`/`Mapping` pair at a time — `set_partitioning`
/// replaces it, realizing whatever data movement the transition from the
/// old one requires.
pub struct Container {
    space: Space,
    ty: Type,
    group: Rc<Group>,
    backend: Box<dyn Backend>,
    state: Option<(Rc<Partitioning>, Mapping)>,
}

impl Container {
    /// Creates a container over `space`, typed `ty`, within `group`,
    /// realized by `backend`. Calls `backend.finalize(group)` once, before
    /// any partitioning has been set.
    pub fn new(space: Space, ty: Type, group: Rc<Group>, mut backend: Box<dyn Backend>) -> Result<Self, PartgridError> {
        backend.finalize(&group)?;
        Ok(Container { space, ty, group, backend, state: None })
    }

    /// The index space this container partitions.
    pub fn space(&self) -> &Space { &self.space }

    /// The element type this container holds.
    pub fn ty(&self) -> &Type { &self.ty }

    /// The process group this container is defined over.
    pub fn group(&self) -> &Rc<Group> { &self.group }

    /// The currently active partitioning, if any has been set yet.
    pub fn partitioning(&self) -> Option<&Rc<Partitioning>> {
        self.state.as_ref().map(|(p, _)| p)
    }

    /// This process's local mapping under the active partitioning, if any.
    pub fn mapping(&self) -> Option<&Mapping> {
        self.state.as_ref().map(|(_, m)| m)
    }

    /// This process's local mapping, mutably — for a caller writing fresh
    /// data into a container it owns outright (spec.md's "direct writes"
    /// path, distinct from data arriving through a transition).
    pub fn mapping_mut(&mut self) -> Option<&mut Mapping> {
        self.state.as_mut().map(|(_, m)| m)
    }

    /// Informs the container's backend of a group membership change
    /// (spec.md §4.G.6 elastic resize), and adopts `group` as the
    /// container's own going forward. Does not itself move any data; a
    /// caller follows this with `set_partitioning` to realize the new
    /// group's partitioning.
    pub fn update_group(&mut self, group: Rc<Group>) -> Result<(), PartgridError> {
        self.backend.update_group(&group)?;
        self.group = group;
        Ok(())
    }

    /// Replaces the active partitioning with `new`, driving the backend
    /// through `prepare`/`exec`/`wait`/`cleanup` to realize whatever
    /// `transition::plan` computes between the old partitioning (if any)
    /// and `new`. Blocks until the new mapping is fully populated.
    pub fn set_partitioning(&mut self, new: Partitioning) -> Result<(), PartgridError> {
        let rank = self
            .group
            .myid()
            .ok_or_else(|| PartgridError::config("container's process is not a member of its group"))?
            as usize;

        if !self.ty.supports_reduce() {
            if let Some(bad) = new.assignments().iter().find(|a| matches!(a.intent, AccessIntent::Reduce(_))) {
                return Err(PartgridError::config(format!(
                    "rank {} names Reduce({}) intent over pod type {:?}, which has no reduce operation",
                    bad.rank,
                    match bad.intent {
                        AccessIntent::Reduce(op) => op,
                        _ => unreachable!(),
                    },
                    self.ty.name()
                )));
            }
        }

        let old_partitioning = self.state.as_ref().map(|(p, _)| p.as_ref());
        let transition = transition::plan(old_partitioning, &new);
        logging::transition_planned(&transition);

        let old_mapping_placeholder;
        let old_mapping: &Mapping = match &self.state {
            Some((_, m)) => m,
            None => {
                old_mapping_placeholder = Mapping::new(self.space.empty_slice(), self.ty.elem_size())?;
                &old_mapping_placeholder
            }
        };

        let my_slice = Slice::bounding_box(new.for_rank(rank).map(|a| &a.slice)).unwrap_or_else(|| self.space.empty_slice());
        let mut new_mapping = Mapping::new(my_slice, self.ty.elem_size())?;
        if let Some(primitive) = self.ty.primitive() {
            new_mapping = new_mapping.with_primitive(primitive);
        }

        let id = self.backend.prepare(transition)?;
        self.backend.exec(id, old_mapping, &mut new_mapping, self.ty.elem_size())?;
        self.backend.wait(id, &mut new_mapping)?;
        self.backend.cleanup(id)?;
        logging::transfer_completed(id);

        self.state = Some((Rc::new(new), new_mapping));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::collective::{CollectiveBackend, InProcessCollective};
    use crate::group::Location;
    use crate::partitioning::{AccessIntent, Assignment};

    fn sl(bounds: &[(i64, i64)]) -> Slice { Slice::new(bounds).unwrap() }

    #[test]
    fn first_partitioning_allocates_and_inits() {
        let space = Space::new(&[(0, 8)]).unwrap();
        let group = Rc::new(Group::singleton(Location::new("127.0.0.1", 9000)));
        let collective = InProcessCollective::build_group(1).pop().unwrap();
        let backend = Box::new(CollectiveBackend::new(collective));
        let mut container = Container::new(space.clone(), Type::f64(), group, backend).unwrap();

        let assignment =
            Partitioning::new(&space, vec![Assignment { rank: 0, slice: sl(&[(0, 8)]), intent: AccessIntent::Write }])
                .unwrap();
        container.set_partitioning(assignment).unwrap();

        assert!(container.mapping().unwrap().is_allocated());
        assert_eq!(container.partitioning().unwrap().ranks(), vec![0]);
    }

    #[test]
    fn rejects_set_partitioning_when_not_a_member() {
        let space = Space::new(&[(0, 4)]).unwrap();
        let group = Rc::new(Group::new(vec![Location::new("127.0.0.1", 9000)], None).unwrap());
        let collective = InProcessCollective::build_group(1).pop().unwrap();
        let backend = Box::new(CollectiveBackend::new(collective));
        let mut container = Container::new(space.clone(), Type::f64(), group, backend).unwrap();

        let assignment =
            Partitioning::new(&space, vec![Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Write }])
                .unwrap();
        assert!(container.set_partitioning(assignment).is_err());
    }

    #[test]
    fn rejects_reduce_intent_over_pod_type() {
        use crate::reduce::ReduceOp;

        let space = Space::new(&[(0, 4)]).unwrap();
        let group = Rc::new(Group::singleton(Location::new("127.0.0.1", 9000)));
        let collective = InProcessCollective::build_group(1).pop().unwrap();
        let backend = Box::new(CollectiveBackend::new(collective));
        let ty = Type::pod("opaque", 16).unwrap();
        let mut container = Container::new(space.clone(), ty, group, backend).unwrap();

        let assignment = Partitioning::new(
            &space,
            vec![Assignment { rank: 0, slice: sl(&[(0, 4)]), intent: AccessIntent::Reduce(ReduceOp::Sum) }],
        )
        .unwrap();
        assert!(container.set_partitioning(assignment).is_err());
    }
}
