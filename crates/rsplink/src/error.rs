use std::io;

use thiserror::Error;

/// Fatal conditions surfaced by [`GdbStub::listen`](crate::GdbStub::listen)
/// and [`GdbStub::run`](crate::GdbStub::run).
///
/// Per-command failures never show up here; they are answered on the wire
/// with `E<hh>` replies and the session keeps going.
#[derive(Debug, Error)]
pub enum StubError {
    /// The debugger closed its end of the connection.
    #[error("debugger peer disconnected")]
    Disconnected,
    /// Too many consecutive framing or checksum violations; the peer is
    /// not speaking the protocol.
    #[error("connection poisoned by repeated protocol violations")]
    Poisoned,
    /// Socket-level failure (bind, accept, send timeout, reset peer).
    #[error(transparent)]
    Io(#[from] io::Error),
}
