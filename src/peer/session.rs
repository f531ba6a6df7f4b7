//! One download session against one peer.
//!
//! A session is a single task bound to a single TCP connection, walking a
//! linear lifecycle: connect, handshake, receive the bitfield, declare
//! interest, then loop pulling pieces from the shared scheduler until
//! nothing this peer can serve remains. Any I/O or protocol error ends the
//! session; a piece in flight at that moment goes back to the scheduler's
//! retry queue for another peer to redo from scratch.
use super::{message, Bitfield, Handshake, Message, PeerError, PeerResult};
use crate::scheduler::{PieceState, SharedScheduler};
use crate::tracker::PeerAddress;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Block size for `Request` messages. Everybody uses 2^14; peers close
/// connections on larger requests.
pub const MAX_BLOCK_BYTES: u32 = 16_384;

/// In-flight block requests per peer. Bounds both the peer's send queue
/// and our memory.
pub const MAX_BACKLOG: u32 = 5;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads give up after the keep-alive interval has passed twice over; a
/// peer silent for that long is not coming back.
const IDLE_TIMEOUT: Duration = Duration::from_secs(240);

pub struct PeerSession {
    address: PeerAddress,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    scheduler: SharedScheduler,
}

impl PeerSession {
    pub fn new(
        address: PeerAddress,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        scheduler: SharedScheduler,
    ) -> Self {
        Self {
            address,
            info_hash,
            peer_id,
            scheduler,
        }
    }

    /// Runs the session to completion. `Ok(())` means the peer had nothing
    /// further to offer (or everything is downloaded); errors mean the
    /// connection or the protocol broke.
    #[tracing::instrument(skip(self), fields(peer = %self.address), level = "debug")]
    pub async fn run(self) -> PeerResult<()> {
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.address.socket_addr()))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;
        let remote = Handshake::exchange(&mut stream, self.info_hash, self.peer_id).await?;
        debug!(remote_id = %hex::encode(remote.peer_id), "handshake complete");

        // The bitfield must be the peer's first message.
        let Message::Bitfield(bytes) = read_message(&mut stream).await? else {
            return Err(PeerError::UnexpectedMessage("expected bitfield first"));
        };
        let mut bitfield = Bitfield::from_bytes(bytes);

        message::write(&mut stream, &Message::Unchoke).await?;
        message::write(&mut stream, &Message::Interested).await?;
        let mut choked = true; // peers start out choking us

        loop {
            let Some(mut piece) = self.scheduler.pop(&bitfield) else {
                debug!("no piece left for this peer");
                return Ok(());
            };
            if !bitfield.has_piece(piece.index) {
                // Fresh assignments skip the bitfield filter; hand the
                // piece back for another peer and keep the connection.
                self.scheduler.release(piece);
                continue;
            }
            match download_piece(&mut stream, &mut bitfield, &mut choked, &mut piece).await {
                Ok(()) => {
                    let index = piece.index;
                    if self.scheduler.complete(piece)? {
                        trace!(index, "piece complete");
                        // Advisory; the peer may use it for its own
                        // accounting.
                        message::write(&mut stream, &Message::Have(index)).await?;
                    }
                }
                Err(error) => {
                    self.scheduler.release(piece);
                    return Err(error);
                }
            }
        }
    }
}

/// The inner download loop for one piece: keep the request window full
/// while unchoked, then block on the next message and dispatch it.
async fn download_piece(
    stream: &mut TcpStream,
    bitfield: &mut Bitfield,
    choked: &mut bool,
    piece: &mut PieceState,
) -> PeerResult<()> {
    let mut backlog: u32 = 0;
    while piece.downloaded < piece.size {
        while !*choked && backlog < MAX_BACKLOG && piece.requested < piece.size {
            let length = MAX_BLOCK_BYTES.min(piece.size - piece.requested);
            message::write(
                stream,
                &Message::Request {
                    index: piece.index,
                    begin: piece.requested,
                    length,
                },
            )
            .await?;
            piece.requested += length;
            backlog += 1;
        }
        match read_message(stream).await? {
            Message::KeepAlive => {}
            Message::Choke => *choked = true,
            Message::Unchoke => *choked = false,
            Message::Have(index) => {
                if !bitfield.set_piece(index) {
                    debug!(index, "have for out-of-range piece ignored");
                }
            }
            Message::Piece { index, begin, data } => {
                if index != piece.index {
                    return Err(PeerError::PieceIndexMismatch {
                        expected: piece.index,
                        got: index,
                    });
                }
                // Requests go out in increasing offset order, so a
                // compliant peer answers in the same order.
                if begin != piece.downloaded {
                    return Err(PeerError::PieceOffsetMismatch {
                        expected: piece.downloaded,
                        got: begin,
                    });
                }
                if data.is_empty() || piece.downloaded + data.len() as u32 > piece.size {
                    return Err(PeerError::MalformedMessage {
                        id: 7,
                        len: data.len(),
                    });
                }
                piece.downloaded += data.len() as u32;
                piece.data.extend_from_slice(&data);
                backlog = backlog.saturating_sub(1);
            }
            Message::Bitfield(_) => {
                return Err(PeerError::UnexpectedMessage("bitfield after first message"));
            }
            // This client does not upload; incoming requests are parsed
            // and dropped.
            Message::Request { .. } | Message::Cancel { .. } => {}
            Message::Interested | Message::NotInterested => {}
            Message::Unknown { id } => trace!(id, "ignoring unknown message"),
        }
    }
    Ok(())
}

async fn read_message(stream: &mut TcpStream) -> PeerResult<Message> {
    timeout(IDLE_TIMEOUT, message::read(stream))
        .await
        .map_err(|_| PeerError::IdleTimeout)?
}
