//! `partgrid` is a library for partitioning an index space across a group
//! of processes, and for moving data between processes as that partitioning
//! changes.
//!
//! A `Container` owns an index `Space` and an element `Type`. At any time it
//! holds one `Partitioning` — an assignment of `Slice`s of the space to
//! process ranks, each tagged with an `AccessIntent` — and a local `Mapping`
//! realizing this process's share of it in memory. Calling
//! `Container::set_partitioning` with a new `Partitioning` computes the
//! `Transition` between the old assignment and the new one and drives a
//! `Backend` through prepare/exec/wait/cleanup to realize it, moving only
//! the data that changed hands.
//!
//! Two backends are provided: `backend::collective`, built on a
//! `Collective` trait for settings with an existing collective-communication
//! layer, and `backend::p2p`, a self-contained socket backend with its own
//! rendezvous bootstrap and wire protocol.
//!
//! # Examples
//!
//! ```ignore
//! use std::rc::Rc;
//! use partgrid::backend::collective::{CollectiveBackend, InProcessCollective};
//! use partgrid::container::Container;
//! use partgrid::group::{Group, Location};
//! use partgrid::index::{Slice, Space};
//! use partgrid::partitioning::{AccessIntent, Assignment, Partitioning};
//! use partgrid::types::Type;
//!
//! let space = Space::new(&[(0, 100)]).unwrap();
//! let group = Rc::new(Group::singleton(Location::new("127.0.0.1", 9000)));
//! let collective = InProcessCollective::build_group(1).pop().unwrap();
//! let backend = Box::new(CollectiveBackend::new(collective));
//! let mut container = Container::new(space.clone(), Type::f64(), group, backend).unwrap();
//!
//! let whole = Slice::new(&[(0, 100)]).unwrap();
//! let partitioning = Partitioning::new(
//!     &space,
//!     vec![Assignment { rank: 0, slice: whole, intent: AccessIntent::Write }],
//! ).unwrap();
//! container.set_partitioning(partitioning).unwrap();
//! ```

pub mod action;
pub mod backend;
pub mod config;
pub mod container;
pub mod error;
pub mod group;
pub mod index;
pub mod logging;
pub mod mapping;
pub mod partitioning;
pub mod reduce;
pub mod transition;
pub mod types;

pub use container::Container;
pub use error::PartgridError;
pub use group::Group;
pub use index::{Slice, Space};
pub use partitioning::{AccessIntent, Partitioning};
pub use types::Type;
