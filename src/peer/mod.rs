//! Peer wire protocol and download sessions.
//!
//! Implements the BEP 3 peer protocol from the leecher side: the 68-byte
//! handshake, length-prefixed framed messages, the bitfield of advertised
//! pieces, and the per-peer session task that drives a download loop
//! against the shared piece scheduler.
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::Message;
pub use session::PeerSession;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("peer idle timeout")]
    IdleTimeout,

    #[error("bad handshake: {0}")]
    BadHandshake(&'static str),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("malformed message (id {id}, payload {len} bytes)")]
    MalformedMessage { id: u8, len: usize },

    #[error("frame of {0} bytes exceeds the cap")]
    FrameTooLarge(usize),

    #[error("piece index mismatch: expected {expected}, got {got}")]
    PieceIndexMismatch { expected: u32, got: u32 },

    #[error("piece offset mismatch: expected {expected}, got {got}")]
    PieceOffsetMismatch { expected: u32, got: u32 },

    #[error("piece completion failed: {0}")]
    Completion(#[from] crate::storage::StorageError),
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
