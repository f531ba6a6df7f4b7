//! UDP tracker announce, per BEP 15.
//!
//! Two fixed-layout big-endian datagram exchanges: a connect round-trip
//! that yields a connection id, then the announce proper. Datagrams can
//! vanish, so every send is paired with a receive timeout and
//! retransmitted on the `15 * 2^n` schedule.
use super::{AnnounceParams, AnnounceResponse, PeerAddress, TrackerError, TrackerResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

/// Fixed magic for connect requests, see BEP 15.
const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Announce responses carry at most this many peers; trackers rarely send
/// more than 50.
const MAX_PEERS: usize = 128;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Base receive timeout; doubles on every retransmission.
    pub base_wait: Duration,
    /// Highest retransmission exponent. BEP 15 allows up to 8 (about an
    /// hour of waiting); 4 keeps the worst case under five minutes.
    pub max_retries: u32,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            base_wait: Duration::from_secs(15),
            max_retries: 4,
        }
    }
}

/// Runs the connect and announce exchanges against one tracker.
#[tracing::instrument(skip(params, config), level = "debug")]
pub async fn announce(
    host: &str,
    port: u16,
    params: &AnnounceParams,
    config: &UdpConfig,
) -> TrackerResult<AnnounceResponse> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((host, port)).await?;
    let connection_id = connect_exchange(&socket, config).await?;
    announce_exchange(&socket, connection_id, params, config).await
}

async fn connect_exchange(socket: &UdpSocket, config: &UdpConfig) -> TrackerResult<u64> {
    let transaction_id: u32 = rand::rng().random();
    let packet = build_connect_packet(transaction_id);
    let mut buf = [0u8; 16];
    let len = send_with_retry(socket, &packet, &mut buf, config).await?;
    parse_connect_response(&buf[..len], transaction_id)
}

async fn announce_exchange(
    socket: &UdpSocket,
    connection_id: u64,
    params: &AnnounceParams,
    config: &UdpConfig,
) -> TrackerResult<AnnounceResponse> {
    let transaction_id: u32 = rand::rng().random();
    let key: u32 = rand::rng().random();
    let packet = build_announce_packet(connection_id, transaction_id, key, params);
    let mut buf = vec![0u8; 20 + MAX_PEERS * 6];
    let len = send_with_retry(socket, &packet, &mut buf, config).await?;
    parse_announce_response(&buf[..len], transaction_id)
}

/// Sends `packet` and waits for a reply, retransmitting with exponential
/// backoff until the retry cap. Exhausting the schedule is a
/// [`TrackerError::Timeout`].
async fn send_with_retry(
    socket: &UdpSocket,
    packet: &[u8],
    buf: &mut [u8],
    config: &UdpConfig,
) -> TrackerResult<usize> {
    for attempt in 0..=config.max_retries {
        socket.send(packet).await?;
        let wait = config.base_wait * 2u32.saturating_pow(attempt);
        match timeout(wait, socket.recv(buf)).await {
            Ok(received) => {
                let len = received?;
                if len < 8 {
                    return Err(TrackerError::Protocol("datagram shorter than its header"));
                }
                return Ok(len);
            }
            Err(_) => debug!(attempt, "no response from UDP tracker, retransmitting"),
        }
    }
    Err(TrackerError::Timeout)
}

fn build_connect_packet(transaction_id: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(16);
    let _ = packet.write_u64::<BigEndian>(PROTOCOL_MAGIC);
    let _ = packet.write_u32::<BigEndian>(ACTION_CONNECT);
    let _ = packet.write_u32::<BigEndian>(transaction_id);
    packet
}

fn build_announce_packet(
    connection_id: u64,
    transaction_id: u32,
    key: u32,
    params: &AnnounceParams,
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(98);
    let _ = packet.write_u64::<BigEndian>(connection_id);
    let _ = packet.write_u32::<BigEndian>(ACTION_ANNOUNCE);
    let _ = packet.write_u32::<BigEndian>(transaction_id);
    packet.extend_from_slice(&params.info_hash);
    packet.extend_from_slice(&params.peer_id);
    let _ = packet.write_u64::<BigEndian>(params.downloaded);
    let _ = packet.write_u64::<BigEndian>(params.left);
    let _ = packet.write_u64::<BigEndian>(params.uploaded);
    let _ = packet.write_u32::<BigEndian>(0); // event: none
    let _ = packet.write_u32::<BigEndian>(0); // IP: default
    let _ = packet.write_u32::<BigEndian>(key);
    let _ = packet.write_i32::<BigEndian>(-1); // num_want: default
    let _ = packet.write_u16::<BigEndian>(params.port);
    packet
}

fn parse_connect_response(datagram: &[u8], transaction_id: u32) -> TrackerResult<u64> {
    let mut reader = datagram;
    let action = reader.read_u32::<BigEndian>()?;
    let received_transaction = reader.read_u32::<BigEndian>()?;
    if received_transaction != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reader).into_owned(),
        ));
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::Protocol("unexpected connect action"));
    }
    Ok(reader.read_u64::<BigEndian>()?)
}

fn parse_announce_response(
    datagram: &[u8],
    transaction_id: u32,
) -> TrackerResult<AnnounceResponse> {
    let mut reader = datagram;
    let action = reader.read_u32::<BigEndian>()?;
    let received_transaction = reader.read_u32::<BigEndian>()?;
    if received_transaction != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(
            String::from_utf8_lossy(reader).into_owned(),
        ));
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::Protocol("unexpected announce action"));
    }
    let interval_secs = reader.read_u32::<BigEndian>()?;
    let leechers = reader.read_u32::<BigEndian>()?;
    let seeders = reader.read_u32::<BigEndian>()?;
    if reader.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeersBlobLength(reader.len()));
    }
    let peers = reader
        .chunks_exact(6)
        .map(|chunk| PeerAddress {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect::<Vec<_>>();
    debug!(interval_secs, leechers, seeders, peers = peers.len(), "announce response");
    Ok(AnnounceResponse {
        interval_secs,
        peers,
    })
}
