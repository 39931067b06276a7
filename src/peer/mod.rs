//! Peer wire protocol: handshake, message framing, bitfields, and the
//! per-connection session state machine that drives block requests.
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

/// Errors raised while speaking the peer wire protocol to a single peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("peer sent a piece for an index/offset we did not request")]
    UnexpectedBlock,

    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),

    #[error("peer closed the connection")]
    ConnectionClosed,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
