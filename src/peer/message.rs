//! Framed peer messages.
//!
//! After the handshake the stream is a sequence of frames: a big-endian
//! `u32` length prefix followed by that many payload bytes. A zero length
//! is a keep-alive; otherwise the first payload byte is the message id.
use super::{PeerError, PeerResult};
use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. The largest legitimate message is a
/// `Piece` frame of one 16 KiB block plus headers; anything near the cap
/// is a hostile or broken peer.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any id this client does not know. Parsed so the session loop can
    /// skip it instead of tearing the connection down.
    Unknown { id: u8 },
}

impl Message {
    /// Serializes the full frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::KeepAlive => out.put_u32(0),
            Message::Choke => put_header(&mut out, ID_CHOKE, 0),
            Message::Unchoke => put_header(&mut out, ID_UNCHOKE, 0),
            Message::Interested => put_header(&mut out, ID_INTERESTED, 0),
            Message::NotInterested => put_header(&mut out, ID_NOT_INTERESTED, 0),
            Message::Have(index) => {
                put_header(&mut out, ID_HAVE, 4);
                out.put_u32(*index);
            }
            Message::Bitfield(bytes) => {
                put_header(&mut out, ID_BITFIELD, bytes.len());
                out.put_slice(bytes);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                put_header(&mut out, ID_REQUEST, 12);
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                put_header(&mut out, ID_PIECE, 8 + data.len());
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                put_header(&mut out, ID_CANCEL, 12);
                out.put_u32(*index);
                out.put_u32(*begin);
                out.put_u32(*length);
            }
            Message::Unknown { id } => put_header(&mut out, *id, 0),
        }
        out
    }

    /// Parses one non-empty frame payload (the length prefix already
    /// stripped by the framing layer).
    pub fn parse(payload: &[u8]) -> PeerResult<Message> {
        if payload.is_empty() {
            return Err(PeerError::MalformedMessage { id: 0, len: 0 });
        }
        let id = payload[0];
        let mut body = &payload[1..];
        let malformed = PeerError::MalformedMessage {
            id,
            len: body.len(),
        };
        let message = match id {
            ID_CHOKE | ID_UNCHOKE | ID_INTERESTED | ID_NOT_INTERESTED => {
                if !body.is_empty() {
                    return Err(malformed);
                }
                match id {
                    ID_CHOKE => Message::Choke,
                    ID_UNCHOKE => Message::Unchoke,
                    ID_INTERESTED => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            ID_HAVE => {
                if body.len() != 4 {
                    return Err(malformed);
                }
                Message::Have(body.get_u32())
            }
            ID_BITFIELD => Message::Bitfield(body.to_vec()),
            ID_REQUEST | ID_CANCEL => {
                if body.len() != 12 {
                    return Err(malformed);
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                let length = body.get_u32();
                if id == ID_REQUEST {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            ID_PIECE => {
                if body.len() < 8 {
                    return Err(malformed);
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: body.to_vec(),
                }
            }
            id => Message::Unknown { id },
        };
        Ok(message)
    }
}

fn put_header(out: &mut Vec<u8>, id: u8, payload_len: usize) {
    out.put_u32(1 + payload_len as u32);
    out.put_u8(id);
}

/// Reads one framed message. A closed stream maps to
/// [`PeerError::ConnectionClosed`] so sessions can tell peer departure
/// from local I/O trouble.
pub async fn read<R>(stream: &mut R) -> PeerResult<Message>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.map_err(map_eof)?;
    let length = u32::from_be_bytes(prefix) as usize;
    if length == 0 {
        return Ok(Message::KeepAlive);
    }
    if length > MAX_FRAME_BYTES {
        return Err(PeerError::FrameTooLarge(length));
    }
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.map_err(map_eof)?;
    Message::parse(&payload)
}

pub async fn write<W>(stream: &mut W, message: &Message) -> PeerResult<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&message.serialize()).await?;
    Ok(())
}

fn map_eof(error: std::io::Error) -> PeerError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        PeerError::ConnectionClosed
    } else {
        PeerError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let frame = message.serialize();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(frame.len(), 4 + length);
        let parsed = Message::parse(&frame[4..]).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0b1100_0000, 0x01]));
        round_trip(Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        });
        round_trip(Message::Piece {
            index: 3,
            begin: 0,
            data: vec![1, 2, 3, 4],
        });
        round_trip(Message::Cancel {
            index: 1,
            begin: 2,
            length: 3,
        });
        round_trip(Message::Unknown { id: 20 });
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn short_have_is_malformed() {
        let err = Message::parse(&[ID_HAVE, 0, 0]).unwrap_err();
        assert!(matches!(
            err,
            PeerError::MalformedMessage { id: ID_HAVE, len: 2 }
        ));
    }

    #[tokio::test]
    async fn framing_reads_keep_alive_and_messages() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&Message::KeepAlive.serialize());
        stream.extend_from_slice(&Message::Have(7).serialize());
        let mut cursor = std::io::Cursor::new(stream);
        assert_eq!(read(&mut cursor).await.unwrap(), Message::KeepAlive);
        assert_eq!(read(&mut cursor).await.unwrap(), Message::Have(7));
        assert!(matches!(
            read(&mut cursor).await.unwrap_err(),
            PeerError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut cursor = std::io::Cursor::new(((1u32 << 21).to_be_bytes()).to_vec());
        assert!(matches!(
            read(&mut cursor).await.unwrap_err(),
            PeerError::FrameTooLarge(_)
        ));
    }
}
