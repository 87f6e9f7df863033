//! Session transports.
//!
//! The delivery loop only needs [`SignalTransport`]; everything else here is
//! the session plumbing that gets a peer into a session in the first place.
//!
//! - [`local`]: in-process bus; every peer lives in the same process.
//! - [`host`]: network session host (advertises, admits, relays).
//! - [`peer`]: network session client (finds, joins).
//! - [`link`]: TCP / UDP byte links under host and peer.

pub mod host;
pub mod link;
pub mod local;
pub mod peer;

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

/// Identifier of a joined session.  Never zero.
pub type SessionId = u32;

/// Bit-flag constants for the `flags` argument of
/// [`SignalTransport::send_signal`].
pub mod flags {
    /// Body was compressed by the sender.
    pub const COMPRESSED: u8 = 0x40;
}

/// A single outbound send failed.  Never fatal to the test.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not joined to a session")]
    NotJoined,
    #[error("session {0} is not the joined session")]
    UnknownSession(SessionId),
    #[error("frame of {size} bytes exceeds the {limit}-byte link limit")]
    TooLarge { size: usize, limit: usize },
    #[error("link send queue is full")]
    Backpressure,
    #[error("link closed")]
    LinkClosed,
}

/// Failure to establish the session.  Always fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("no session advertised for prefix {prefix:?}")]
    NotFound { prefix: String },
    #[error("name {0:?} is already advertised")]
    NameTaken(String),
    #[error("join {name:?} rejected: {reason}")]
    JoinRejected { name: String, reason: String },
    #[error("link closed during session setup")]
    LinkClosed,
    #[error("session setup interrupted")]
    Interrupted,
}

/// What the delivery loop sends through.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Fire one signal body at every other member of `session`.
    async fn send_signal(
        &self,
        session: SessionId,
        body: Vec<u8>,
        ttl_secs: u32,
        flags: u8,
    ) -> Result<(), SendError>;

    /// Name other peers see as the sender of this peer's signals.
    fn unique_name(&self) -> String;

    /// Leave the session.  Idempotent.
    async fn leave(&self);
}
