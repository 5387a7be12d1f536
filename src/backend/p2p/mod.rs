//! The point-to-point backend (spec.md §4.G): rendezvous bootstrap, the
//! wire protocol, per-connection state, and the readiness-driven event
//! loop that together implement `Backend` without any collective-transport
//! collaborator.

pub mod bootstrap;
pub mod event_loop;
pub mod peer;
pub mod protocol;

pub use bootstrap::{elect_home, resize_peer, run_home, run_peer, run_peer_session, HomeElection, HomeSession};
pub use event_loop::P2pBackend;
