//! The error taxonomy raised to callers of `partgrid`'s synchronous API.
//!
//! `Logic` failures (an invariant the implementation itself is responsible
//! for upholding, such as a send slice's element count disagreeing with
//! granted credit) are not represented here: they are bugs, and surface as
//! `panic!`/`assert!`, matching the propagation policy of spec.md's error
//! handling design.

use crate::index::Slice;

/// Errors raised synchronously to a caller of the core API.
#[derive(Debug, thiserror::Error)]
pub enum PartgridError {
    /// Invalid space/type/group configuration: mismatched dimensions, a
    /// zero-size element, a partitioning with slices outside its space, and
    /// so on. Raised synchronously at the offending API call.
    #[error("config error: {0}")]
    Config(String),

    /// A malformed line, an unknown verb from a registered peer, `data`
    /// without outstanding credit, or a re-registration attempt. The core
    /// logs these at warning and drops the offending command; surfacing one
    /// here means the caller asked to treat it as fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket create/connect/bind/accept/read/write failure, or an
    /// unrecoverable peer failure after whatever retries the backend
    /// attempts at its own discretion. Fatal: no site in the core retries a
    /// `Transport` error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Any allocation failure. Always fatal.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

/// The specific transport failure, kept distinct from the umbrella
/// `PartgridError::Transport` so backend code can match on cause.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `std::io::Error` from a socket operation, tagged with the peer or
    /// listener it occurred on.
    #[error("io error on {context}: {source}")]
    Io {
        /// What the operation was acting on (e.g. "home connect", "lid 3").
        context: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The peer closed the connection mid-exchange.
    #[error("peer {lid} disconnected")]
    PeerGone {
        /// The location-ID of the peer that vanished.
        lid: i64,
    },
}

impl PartgridError {
    /// Shorthand for a `Config` error with a formatted message.
    pub fn config(msg: impl Into<String>) -> Self {
        PartgridError::Config(msg.into())
    }

    /// Shorthand for a `Protocol` error with a formatted message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        PartgridError::Protocol(msg.into())
    }
}

/// A space/slice mismatch detail, used by `partitioning` to explain `Config`
/// errors without forcing every caller to format its own message.
pub(crate) fn slice_out_of_space(slice: &Slice, what: &str) -> PartgridError {
    PartgridError::Config(format!("{what}: slice {slice} does not lie within its space"))
}
