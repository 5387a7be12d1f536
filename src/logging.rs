//! The event vocabulary emitted over `tracing` (SPEC_FULL.md §2.2): the
//! library only emits events, it never installs a subscriber itself — that
//! is a bootstrap binary's job (`install_subscriber` below is a
//! convenience for one, not called from any library code path).
//!
//! Grounded on the teacher's own `logging.rs`, which defines a typed event
//! enum (`DifferentialEvent`) that its bootstrap wires into a logger; here
//! the "logger" is just `tracing`'s own dispatch, so there is no `enable()`
//! registration step to mirror, only the event vocabulary itself.

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::group::Group;
use crate::transition::Transition;

/// Emits a bootstrap-complete event: this process has joined `group` at
/// the given rank.
pub fn bootstrap(group: &Group) {
    info!(rank = ?group.myid(), world_size = group.size(), "partgrid bootstrap complete");
}

/// Emits a resize event: the group shrank or grew from `old_size` to
/// `group`'s current size.
pub fn resize(old_size: usize, group: &Group) {
    info!(old_size, new_size = group.size(), "group resized");
}

/// Emits a transition-planned event summarizing the shape of `transition`
/// before a backend realizes it.
pub fn transition_planned(transition: &Transition) {
    info!(
        locals = transition.locals.len(),
        inits = transition.inits.len(),
        sends = transition.sends.len(),
        recvs = transition.recvs.len(),
        "transition planned"
    );
}

/// Emits a transfer-completed event once a backend's `wait` has returned.
pub fn transfer_completed(id: u64) {
    info!(id, "transfer completed");
}

/// Emits a peer-lost event: `lid` disconnected or was dropped by a resize.
pub fn peer_lost(lid: i64) {
    warn!(lid, "peer lost");
}

/// Installs a `tracing-subscriber` formatter reading its filter from
/// `PARTGRID_LOG` (falling back to `info`), for bootstrap binaries that
/// want a sensible default without building their own subscriber. Library
/// code never calls this.
pub fn install_subscriber() {
    let filter = EnvFilter::try_from_env("PARTGRID_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
