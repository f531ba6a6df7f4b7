use super::{Element, ElementKind, ParseError, ParseErrorKind, Position, Result, Value};
use tracing::instrument;

/// Parses a sequence of top-level bencoded values until the input is
/// exhausted.
///
/// The decoder makes a single forward pass with a cursor and descends
/// recursively into lists and dictionaries. String contents are borrowed
/// from `input` without copying; only the container vectors allocate.
///
/// A trailing partial token (for example an integer missing its `e`)
/// produces an error, so leftover garbage cannot pass silently.
#[instrument(skip(input), level = "trace")]
pub fn parse(input: &[u8]) -> Result<Vec<Element<'_>>> {
    let mut cursor = Cursor::new(input);
    let mut elements = Vec::new();
    while cursor.peek().is_some() {
        elements.push(cursor.parse_element()?);
    }
    if elements.is_empty() {
        return Err(cursor.error(ElementKind::String, ParseErrorKind::UnexpectedEnd));
    }
    Ok(elements)
}

/// Parses an input expected to consist of a single dictionary, the shape of
/// every `.torrent` file and HTTP tracker response.
#[instrument(skip(input), level = "trace")]
pub fn parse_dict(input: &[u8]) -> Result<Element<'_>> {
    let mut cursor = Cursor::new(input);
    cursor.parse_dictionary()
}

/// Parses a single byte string.
pub fn parse_string(input: &[u8]) -> Result<Element<'_>> {
    Cursor::new(input).parse_byte_string()
}

/// Parses a single integer.
pub fn parse_integer(input: &[u8]) -> Result<Element<'_>> {
    Cursor::new(input).parse_int()
}

/// Parses a single list.
pub fn parse_list(input: &[u8]) -> Result<Element<'_>> {
    Cursor::new(input).parse_seq()
}

struct Cursor<'a> {
    input: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, offset: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.offset).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.offset += 1;
        Some(byte)
    }

    fn remaining(&self) -> usize {
        self.input.len() - self.offset
    }

    fn error(&self, element: ElementKind, kind: ParseErrorKind) -> ParseError {
        ParseError {
            offset: self.offset,
            element,
            kind,
        }
    }

    fn parse_element(&mut self) -> Result<Element<'a>> {
        match self.peek() {
            Some(b'i') => self.parse_int(),
            Some(b'l') => self.parse_seq(),
            Some(b'd') => self.parse_dictionary(),
            // Anything else is treated as a string; a non-digit then fails
            // with the string-length error carrying the right offset.
            _ => self.parse_byte_string(),
        }
    }

    fn parse_byte_string(&mut self) -> Result<Element<'a>> {
        const KIND: ElementKind = ElementKind::String;
        let start = self.offset;
        match self.peek() {
            None => return Err(self.error(KIND, ParseErrorKind::UnexpectedEnd)),
            Some(c) if !c.is_ascii_digit() => {
                return Err(self.error(KIND, ParseErrorKind::UnexpectedStringLength));
            }
            Some(_) => {}
        }
        let mut length: u64 = 0;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            length = length
                .checked_mul(10)
                .and_then(|v| v.checked_add(u64::from(c - b'0')))
                .ok_or_else(|| self.error(KIND, ParseErrorKind::BadStringLength))?;
            self.bump();
        }
        match self.bump() {
            Some(b':') => {}
            _ => return Err(self.error(KIND, ParseErrorKind::MissingStringStart)),
        }
        // A string ending exactly at the last input byte is valid.
        if length > self.remaining() as u64 {
            return Err(self.error(KIND, ParseErrorKind::StringOutOfBound));
        }
        let content = &self.input[self.offset..self.offset + length as usize];
        self.offset += length as usize;
        Ok(Element {
            value: Value::Bytes(content),
            position: Position {
                start,
                end: self.offset,
            },
        })
    }

    fn parse_int(&mut self) -> Result<Element<'a>> {
        const KIND: ElementKind = ElementKind::Integer;
        let start = self.offset;
        match self.peek() {
            None => return Err(self.error(KIND, ParseErrorKind::UnexpectedEnd)),
            Some(b'i') => {
                self.bump();
            }
            Some(_) => return Err(self.error(KIND, ParseErrorKind::MissingIntegerStart)),
        }
        let digits_start = self.offset;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        loop {
            match self.peek() {
                None => return Err(self.error(KIND, ParseErrorKind::UnexpectedEnd)),
                Some(b'e') => break,
                Some(c) if c.is_ascii_digit() => {
                    self.bump();
                }
                Some(_) => return Err(self.error(KIND, ParseErrorKind::BadInteger)),
            }
        }
        let digits = &self.input[digits_start..self.offset];
        let bad = ParseError {
            offset: digits_start,
            element: KIND,
            kind: ParseErrorKind::BadInteger,
        };
        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        if unsigned.is_empty() {
            return Err(bad);
        }
        // `-0` in any spelling, and leading zeros, are invalid.
        if unsigned[0] == b'0' && (digits[0] == b'-' || unsigned.len() > 1) {
            return Err(bad);
        }
        self.bump(); // the 'e'
        Ok(Element {
            value: Value::Integer(digits),
            position: Position {
                start,
                end: self.offset,
            },
        })
    }

    fn parse_seq(&mut self) -> Result<Element<'a>> {
        const KIND: ElementKind = ElementKind::List;
        let start = self.offset;
        match self.peek() {
            None => return Err(self.error(KIND, ParseErrorKind::UnexpectedEnd)),
            Some(b'l') => {
                self.bump();
            }
            Some(_) => return Err(self.error(KIND, ParseErrorKind::MissingListStart)),
        }
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error(KIND, ParseErrorKind::MissingListEnd)),
                Some(b'e') => {
                    self.bump();
                    break;
                }
                Some(_) => items.push(self.parse_element()?),
            }
        }
        Ok(Element {
            value: Value::List(items),
            position: Position {
                start,
                end: self.offset,
            },
        })
    }

    fn parse_dictionary(&mut self) -> Result<Element<'a>> {
        const KIND: ElementKind = ElementKind::Dictionary;
        let start = self.offset;
        match self.peek() {
            None => return Err(self.error(KIND, ParseErrorKind::UnexpectedEnd)),
            Some(b'd') => {
                self.bump();
            }
            Some(_) => return Err(self.error(KIND, ParseErrorKind::MissingDictionaryStart)),
        }
        let mut entries = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.error(KIND, ParseErrorKind::MissingDictionaryEnd)),
                Some(b'e') => {
                    self.bump();
                    break;
                }
                Some(c) if c.is_ascii_digit() => {
                    let key = self.parse_byte_string()?;
                    let value = self.parse_element()?;
                    // parse_byte_string always yields Bytes
                    if let Value::Bytes(key_bytes) = key.value {
                        entries.push((key_bytes, value));
                    }
                }
                Some(_) => {
                    return Err(self.error(KIND, ParseErrorKind::NonStringAsDictionaryKey));
                }
            }
        }
        Ok(Element {
            value: Value::Dict(entries),
            position: Position {
                start,
                end: self.offset,
            },
        })
    }
}
