//! Metainfo file structure and parsing.
use super::{info_hash, TorrentError, TorrentResult};
use crate::bencode::{self, Element, Position, Value};

/// A validated torrent descriptor. Owns deep copies of everything it needs;
/// no references into the parse buffer survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<AnnounceEntry>,
    pub info: Info,
    /// Byte range of the `info` dictionary in the original file.
    pub info_position: Position,
    /// SHA-1 of the source bytes at `info_position`.
    pub info_hash: [u8; 20],
}

/// One entry of the multitracker extension's `announce-list`. The outer
/// list index is the tier; tier ordering is recorded but not honored when
/// announcing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceEntry {
    pub url: String,
    pub tier: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Advisory download name; may be empty for single-file torrents.
    pub suggested_name: String,
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 hashes, one per piece.
    pub pieces_sha1: Vec<u8>,
    pub layout: Layout,
}

/// A torrent is either one file or an ordered set of files; the payload is
/// their logical concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Single { length: u64 },
    Multi { files: Vec<FileEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    /// Path components joined with `/`. Kept verbatim here; the piece
    /// writer is responsible for rejecting traversal.
    pub path: String,
}

impl Metainfo {
    pub fn load(path: &std::path::Path) -> TorrentResult<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data)
    }

    /// Parses and validates a metainfo file.
    ///
    /// The top-level value must be a dictionary with at least one tracker
    /// URL (`announce`, or any entry of `announce-list`) and a well-formed
    /// `info` dictionary. Unknown keys are ignored. The info-hash is
    /// computed from the raw `info` byte range of `source`.
    #[tracing::instrument(skip(source), level = "debug")]
    pub fn parse(source: &[u8]) -> TorrentResult<Self> {
        let root = bencode::parse_dict(source)?;

        let announce = match root.find(b"announce") {
            Some(element) => utf8_string(element, "announce")?,
            None => String::new(),
        };
        let announce_list = match root.find(b"announce-list") {
            Some(element) => parse_announce_list(element)?,
            None => Vec::new(),
        };
        if announce.is_empty() && announce_list.iter().all(|entry| entry.url.is_empty()) {
            return Err(TorrentError::EmptyAnnounce);
        }

        let info_element = root
            .find(b"info")
            .ok_or(TorrentError::MissingInfoProperty("info"))?;
        if info_element.as_dict().is_none() {
            return Err(TorrentError::NotDictionary("info"));
        }
        let info = parse_info(info_element)?;
        let info_position = info_element.position;
        let info_hash = info_hash::compute(source, info_position);

        let metainfo = Metainfo {
            announce,
            announce_list,
            info,
            info_position,
            info_hash,
        };
        metainfo.validate_piece_geometry()?;
        Ok(metainfo)
    }

    pub fn total_size(&self) -> u64 {
        match &self.info.layout {
            Layout::Single { length } => *length,
            Layout::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn pieces_count(&self) -> u32 {
        (self.info.pieces_sha1.len() / 20) as u32
    }

    /// Size of piece `index`. All pieces share `piece_length` except the
    /// last, which covers the remainder.
    pub fn piece_size(&self, index: u32) -> u32 {
        let count = self.pieces_count();
        if index + 1 < count {
            self.info.piece_length as u32
        } else {
            (self.total_size() - self.info.piece_length * u64::from(count - 1)) as u32
        }
    }

    pub fn piece_hash(&self, index: u32) -> &[u8] {
        let start = index as usize * 20;
        &self.info.pieces_sha1[start..start + 20]
    }

    // The hash count must agree with the payload size: the last piece must
    // be nonempty and no larger than piece_length.
    fn validate_piece_geometry(&self) -> TorrentResult<()> {
        let count = u64::from(self.pieces_count());
        let total = self.total_size();
        let piece_length = self.info.piece_length;
        if total <= (count - 1) * piece_length || total > count * piece_length {
            return Err(TorrentError::InvalidPiecesCount);
        }
        Ok(())
    }
}

fn utf8_string(element: &Element<'_>, field: &'static str) -> TorrentResult<String> {
    let bytes = element.as_bytes().ok_or(TorrentError::NotString(field))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| TorrentError::InvalidUtf8(field))
}

fn required_u64(element: &Element<'_>, field: &'static str) -> TorrentResult<u64> {
    if !matches!(element.value, Value::Integer(_)) {
        return Err(TorrentError::NotInteger(field));
    }
    element
        .as_u64()
        .filter(|value| *value > 0)
        .ok_or(TorrentError::InvalidInteger(field))
}

fn parse_announce_list(element: &Element<'_>) -> TorrentResult<Vec<AnnounceEntry>> {
    let tiers = element
        .as_list()
        .ok_or(TorrentError::NotList("announce-list"))?;
    let mut entries = Vec::new();
    for (tier, tier_element) in tiers.iter().enumerate() {
        let urls = tier_element
            .as_list()
            .ok_or(TorrentError::NotList("announce-list tier"))?;
        for url_element in urls {
            entries.push(AnnounceEntry {
                url: utf8_string(url_element, "announce-list entry")?,
                tier: tier as i32,
            });
        }
    }
    Ok(entries)
}

/// Extracts and validates the `info` dictionary: name, piece length, the
/// pieces hash blob, and exactly one of `length` / `files`.
fn parse_info(info: &Element<'_>) -> TorrentResult<Info> {
    let suggested_name = match info.find(b"name") {
        Some(element) => utf8_string(element, "name")?,
        None => String::new(),
    };

    let piece_length_element = info
        .find(b"piece length")
        .ok_or(TorrentError::MissingInfoProperty("piece length"))?;
    let piece_length = required_u64(piece_length_element, "piece length")?;

    let pieces_element = info
        .find(b"pieces")
        .ok_or(TorrentError::MissingInfoProperty("pieces"))?;
    let pieces_sha1 = pieces_element
        .as_bytes()
        .ok_or(TorrentError::NotString("pieces"))?;
    if pieces_sha1.is_empty() || pieces_sha1.len() % 20 != 0 {
        return Err(TorrentError::InvalidInfoPiecesLength20);
    }

    let layout = match (info.find(b"length"), info.find(b"files")) {
        (Some(_), Some(_)) => return Err(TorrentError::AmbiguousMultiOrSingleTorrent),
        (None, None) => return Err(TorrentError::MissingInfoProperty("length")),
        (Some(length_element), None) => Layout::Single {
            length: required_u64(length_element, "length")?,
        },
        (None, Some(files_element)) => {
            if suggested_name.is_empty() {
                return Err(TorrentError::EmptyMultiFileName);
            }
            Layout::Multi {
                files: parse_files(files_element)?,
            }
        }
    };

    Ok(Info {
        suggested_name,
        piece_length,
        pieces_sha1: pieces_sha1.to_vec(),
        layout,
    })
}

fn parse_files(element: &Element<'_>) -> TorrentResult<Vec<FileEntry>> {
    let entries = element.as_list().ok_or(TorrentError::NotList("files"))?;
    if entries.is_empty() {
        return Err(TorrentError::EmptyMultiFile);
    }
    let mut files = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.as_dict().is_none() {
            return Err(TorrentError::NotDictionary("files entry"));
        }
        let length_element = entry
            .find(b"length")
            .ok_or(TorrentError::MissingMultiFileProperty("length"))?;
        let length = required_u64(length_element, "length")?;

        let path_element = entry
            .find(b"path")
            .ok_or(TorrentError::MissingMultiFileProperty("path"))?;
        let components = path_element.as_list().ok_or(TorrentError::NotList("path"))?;
        if components.is_empty() {
            return Err(TorrentError::MissingMultiFileProperty("path"));
        }
        let mut path = String::new();
        for component in components {
            let text = utf8_string(component, "path component")?;
            if text.is_empty() {
                return Err(TorrentError::EmptyMultiFileName);
            }
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(&text);
        }
        files.push(FileEntry { length, path });
    }
    Ok(files)
}
