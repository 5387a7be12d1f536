//! The backend contract (spec.md §4.E) and the collective-transport seam
//! it's built on (spec.md §4.F).
//!
//! Grounded on `trace/mod.rs`'s small, fixed-operation-set traits
//! (`Batcher`/`Builder`/`Merger`): a `Backend` is one such trait, not a
//! single monolithic "move data" call, so a `Container` can drive
//! finalize/updateGroup/prepare/exec/wait/probe/cleanup independently and a
//! concrete backend can choose how much of that lifecycle actually blocks.

pub mod collective;
pub mod p2p;

use crate::error::PartgridError;
use crate::group::Group;
use crate::mapping::Mapping;
use crate::reduce::Primitive;
use crate::transition::Transition;

/// A handle identifying one in-flight transfer prepared from a
/// `Transition`. Opaque to callers; a backend is free to interpret it
/// however its own bookkeeping wants (an index into a `Vec`, a generation
/// counter, ...).
pub type TransferId = u64;

/// The seven lifecycle operations spec.md's backend contract names.
///
/// A `Container` drives these directly: `update_group` whenever the
/// process's `Group` membership changes (spec.md §4.G.6's elastic resize),
/// `prepare`/`exec`/`wait` once per `set_partitioning` call, `probe` for
/// non-blocking overlap with other work, `cleanup` once the transfer's
/// result has been consumed, and `finalize` once at shutdown.
pub trait Backend {
    /// One-time setup once this process's location within `group` is
    /// known. Called before any other operation.
    fn finalize(&mut self, group: &Group) -> Result<(), PartgridError>;

    /// Informs the backend that the process group has changed shape (a
    /// resize added or removed members). Must be called before `prepare`
    /// names a transition whose ranks exceed the previously known group.
    fn update_group(&mut self, group: &Group) -> Result<(), PartgridError>;

    /// Registers `plan` for execution, returning a handle to it. spec.md's
    /// own lifecycle table names this step's output a `TransitionPlan` (the
    /// flat, per-rank action list `action::TransitionPlan` realizes); here
    /// `prepare` builds that plan internally (via
    /// `action::TransitionPlan::for_rank`) and stores it keyed by the
    /// `TransferId` it returns, so callers still get an opaque handle
    /// rather than having to carry the plan itself across `exec`/`wait`/
    /// `cleanup`. Does not move any data yet.
    fn prepare(&mut self, plan: Transition) -> Result<TransferId, PartgridError>;

    /// Begins the transfer named by `id`: performs every local `Copy`/
    /// `Init` action against `old_mapping`/`new_mapping` and issues every
    /// `Send` action's bytes to its peer. May complete `Recv` actions
    /// inline if data is already available, but is not required to.
    fn exec(
        &mut self,
        id: TransferId,
        old_mapping: &Mapping,
        new_mapping: &mut Mapping,
        elem_size: usize,
    ) -> Result<(), PartgridError>;

    /// Blocks until every action of `id`'s transfer has completed,
    /// unpacking (and, for a `Reduce` region, combining) any remaining
    /// `Recv` payloads into `new_mapping`.
    fn wait(&mut self, id: TransferId, new_mapping: &mut Mapping) -> Result<(), PartgridError>;

    /// Non-blocking completion check: `Ok(true)` once `wait` would return
    /// immediately.
    fn probe(&mut self, id: TransferId) -> Result<bool, PartgridError>;

    /// Releases any bookkeeping `id` still holds. Callers must not reuse
    /// `id` afterward.
    fn cleanup(&mut self, id: TransferId) -> Result<(), PartgridError>;
}

/// The group-collective transport spec.md §4.F assumes as an external
/// collaborator, the same way the index-space algebra (§1) is assumed
/// available: something the backend is built against, not something this
/// crate imports from elsewhere. `CollectiveBackend` is generic over it;
/// `collective::InProcessCollective` is the concrete, in-process instance
/// used by tests and by default.
pub trait Collective: Send + Sync {
    /// This process's rank within the collective.
    fn index(&self) -> usize;

    /// The total number of ranks participating.
    fn peers(&self) -> usize;

    /// Sends `bytes` to `peer`, blocking until the transport has accepted
    /// the write. If the underlying transport's send buffer fills (`peer`
    /// is itself blocked in its own outgoing send rather than draining its
    /// inbox), this call blocks too — two ranks that `send` to each other
    /// before either `recv`s can deadlock. `CollectiveBackend`'s
    /// double-sweep schedule (spec.md §4.F) exists specifically to avoid
    /// this: it orders every rank's sends and recvs so that of any pair,
    /// one side always recvs before it sends.
    fn send(&self, peer: usize, bytes: &[u8]) -> Result<(), PartgridError>;

    /// Blocks until a message from `peer` is available, and returns it.
    fn recv(&self, peer: usize) -> Result<Vec<u8>, PartgridError>;

    /// Performs an element-wise sum all-reduce over `buffer` (whose
    /// elements are `primitive`-typed) across every rank, leaving the
    /// combined result in `buffer` on every rank. The only reduction every
    /// collective transport is assumed to expose natively; see
    /// `collective::CollectiveBackend` for why other operators always fall
    /// back to a manual subgroup reduce instead of assuming this exists for
    /// them too.
    fn all_reduce_sum(&self, buffer: &mut [u8], primitive: Primitive) -> Result<(), PartgridError>;
}
