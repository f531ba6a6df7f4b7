//! Bencode parsing and encoding.
//!
//! Bencode is the serialization format of the BitTorrent protocol, used for
//! `.torrent` metainfo files and HTTP tracker responses. The decoder here is
//! zero-copy: parsed values borrow byte slices from the input buffer, and
//! every value records the byte range it was parsed from. Preserving those
//! ranges matters because a torrent's identity is the SHA-1 of the `info`
//! dictionary *exactly as it appears in the source file*.
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{parse, parse_dict, parse_integer, parse_list, parse_string};

/// Half-open byte range `[start, end)` into the buffer a value was parsed
/// from. Invariant: re-reading that range yields the canonical encoding of
/// the value, byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub start: usize,
    pub end: usize,
}

impl Position {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A bencoded value borrowing from the input buffer.
///
/// - `Integer` keeps the raw ASCII digit slice (including a leading `-`),
///   so values of any magnitude survive a parse/encode round-trip.
/// - `Bytes` is an opaque byte string; torrent files routinely store
///   non-UTF-8 data in these (the `pieces` hash blob, for one).
/// - `Dict` preserves source order instead of sorting, again so the source
///   bytes can be reconstructed exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'a> {
    Integer(&'a [u8]),
    Bytes(&'a [u8]),
    List(Vec<Element<'a>>),
    Dict(Vec<(&'a [u8], Element<'a>)>),
}

/// A parsed value together with the byte range it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element<'a> {
    pub value: Value<'a>,
    pub position: Position,
}

impl<'a> Element<'a> {
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self.value {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Element<'a>]> {
        match &self.value {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(&'a [u8], Element<'a>)]> {
        match &self.value {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Interprets an `Integer` element as `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self.value {
            Value::Integer(digits) => std::str::from_utf8(digits).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Interprets an `Integer` element as `u64`; negative values yield `None`.
    pub fn as_u64(&self) -> Option<u64> {
        match self.value {
            Value::Integer(digits) => std::str::from_utf8(digits).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Looks a key up in a `Dict` element; first match wins.
    pub fn find(&self, key: &[u8]) -> Option<&Element<'a>> {
        match &self.value {
            Value::Dict(entries) => entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, element)| element),
            _ => None,
        }
    }
}

/// Which element kind the parser was inside when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Integer,
    String,
    List,
    Dictionary,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementKind::Integer => "integer",
            ElementKind::String => "string",
            ElementKind::List => "list",
            ElementKind::Dictionary => "dictionary",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("missing ':' after string length")]
    MissingStringStart,
    #[error("non-digit or empty string length")]
    UnexpectedStringLength,
    #[error("string length does not fit in u64")]
    BadStringLength,
    #[error("string length exceeds remaining input")]
    StringOutOfBound,
    #[error("malformed integer")]
    BadInteger,
    #[error("missing 'i' at integer start")]
    MissingIntegerStart,
    #[error("missing 'l' at list start")]
    MissingListStart,
    #[error("missing 'e' at list end")]
    MissingListEnd,
    #[error("missing 'd' at dictionary start")]
    MissingDictionaryStart,
    #[error("missing 'e' at dictionary end")]
    MissingDictionaryEnd,
    #[error("dictionary key is not a string")]
    NonStringAsDictionaryKey,
}

/// A parse failure: what went wrong, where, and inside which element kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at byte {offset} while parsing {element}")]
pub struct ParseError {
    pub offset: usize,
    pub element: ElementKind,
    pub kind: ParseErrorKind,
}

pub type Result<T> = std::result::Result<T, ParseError>;
