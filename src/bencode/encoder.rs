use super::{Element, Value};
use std::io::{self, Write};

fn encode_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    write!(writer, "{}:", bytes.len())?;
    writer.write_all(bytes)
}

fn encode_integer<W: Write>(writer: &mut W, digits: &[u8]) -> io::Result<()> {
    writer.write_all(b"i")?;
    writer.write_all(digits)?;
    writer.write_all(b"e")
}

fn encode_list<W: Write>(writer: &mut W, items: &[Element<'_>]) -> io::Result<()> {
    writer.write_all(b"l")?;
    for item in items {
        encode(writer, &item.value)?;
    }
    writer.write_all(b"e")
}

fn encode_dict<W: Write>(writer: &mut W, entries: &[(&[u8], Element<'_>)]) -> io::Result<()> {
    writer.write_all(b"d")?;
    // Entries are emitted in the order they carry; the decoder preserves
    // source order, so a parse/encode round-trip is byte-identical even for
    // dictionaries that were not sorted to begin with.
    for (key, value) in entries {
        encode_bytes(writer, key)?;
        encode(writer, &value.value)?;
    }
    writer.write_all(b"e")
}

/// Writes the canonical encoding of `value`.
pub fn encode<W: Write>(writer: &mut W, value: &Value<'_>) -> io::Result<()> {
    match value {
        Value::Bytes(bytes) => encode_bytes(writer, bytes),
        Value::Integer(digits) => encode_integer(writer, digits),
        Value::List(items) => encode_list(writer, items),
        Value::Dict(entries) => encode_dict(writer, entries),
    }
}

/// Convenience wrapper collecting the encoding into a buffer.
pub fn to_bytes(value: &Value<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = encode(&mut out, value);
    out
}
