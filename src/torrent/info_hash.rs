use crate::bencode::Position;
use sha1::{Digest, Sha1};

/// SHA-1 of the raw `info` dictionary bytes.
///
/// The hash is computed over `source[position]`, never over a
/// re-serialization of the parsed dictionary: trackers and peers identify
/// the torrent by the bytes as they appear in the metainfo file, and a
/// re-encoding is not guaranteed to reproduce them (key order, integer
/// spellings).
pub fn compute(source: &[u8], position: Position) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(&source[position.start..position.end]);
    hasher.finalize().into()
}
