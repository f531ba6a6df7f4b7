//! The BitTorrent peer handshake.
//!
//! The handshake is the first exchange on a fresh peer connection. It
//! proves both sides speak the same protocol and are interested in the
//! same torrent (by info-hash) before any framed message flows.
use super::{PeerError, PeerResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// A fixed 68-byte handshake message: protocol string length (19), the
/// protocol string, 8 reserved bytes (all zero for this client), the
/// info-hash, and the sender's peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates one handshake: the protocol length must be 19
    /// and the protocol string must match. The info-hash is the caller's
    /// concern (see [`Handshake::exchange`]).
    pub async fn read<R>(stream: &mut R) -> PeerResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await.map_err(map_eof)?;
        if buf[0] as usize != PROTOCOL.len() {
            return Err(PeerError::BadHandshake("wrong protocol length"));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(PeerError::BadHandshake("wrong protocol string"));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Writes our handshake, reads the peer's, and checks it refers to the
    /// same torrent. Returns the remote handshake so the caller can record
    /// the remote peer id.
    pub async fn exchange<S>(
        stream: &mut S,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<Handshake>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = Handshake::new(info_hash, peer_id);
        stream.write_all(&ours.serialize()).await?;
        let theirs = Handshake::read(stream).await?;
        if theirs.info_hash != info_hash {
            return Err(PeerError::BadHandshake("info hash mismatch"));
        }
        Ok(theirs)
    }
}

fn map_eof(error: std::io::Error) -> PeerError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        PeerError::ConnectionClosed
    } else {
        PeerError::Io(error)
    }
}
