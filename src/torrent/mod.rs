//! Torrent metainfo parsing and validation.
//!
//! Turns a parsed bencode dictionary into a validated [`Metainfo`]
//! descriptor and computes the info-hash from the raw source bytes.
use thiserror::Error;

pub mod info_hash;
pub mod metainfo;

pub use metainfo::{AnnounceEntry, FileEntry, Info, Layout, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::ParseError),

    #[error("no tracker URL in announce or announce-list")]
    EmptyAnnounce,

    #[error("info.pieces length is zero or not a multiple of 20")]
    InvalidInfoPiecesLength20,

    #[error("info carries both length and files")]
    AmbiguousMultiOrSingleTorrent,

    #[error("empty name or path component in multi-file torrent")]
    EmptyMultiFileName,

    #[error("empty files list in multi-file torrent")]
    EmptyMultiFile,

    #[error("missing info property: {0}")]
    MissingInfoProperty(&'static str),

    #[error("missing multi-file property: {0}")]
    MissingMultiFileProperty(&'static str),

    #[error("invalid integer for {0}")]
    InvalidInteger(&'static str),

    #[error("{0} is not a string")]
    NotString(&'static str),

    #[error("{0} is not an integer")]
    NotInteger(&'static str),

    #[error("{0} is not a dictionary")]
    NotDictionary(&'static str),

    #[error("{0} is not a list")]
    NotList(&'static str),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("pieces count does not match total size and piece length")]
    InvalidPiecesCount,
}

pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
