//! Tracker clients for peer discovery.
//!
//! A torrent names its trackers in `announce` and the multitracker
//! `announce-list`. Each URL is categorized by scheme (`http`/`https` get a
//! GET announce, `udp` the BEP 15 datagram exchange), announced to with the
//! client's current progress, and the compact peer lists are merged and
//! de-duplicated. A tracker that fails only costs a log line; the next one
//! is tried.
use crate::torrent::Metainfo;
use rand::Rng;
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub mod http;
pub mod udp;

pub use udp::UdpConfig;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bencode deserialization error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("tracker returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("tracker timed out")]
    Timeout,

    #[error("compact peers blob has invalid length {0}")]
    InvalidPeersBlobLength(usize),

    #[error("missing required property: {0}")]
    MissingRequiredProperty(&'static str),

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("malformed tracker response: {0}")]
    Protocol(&'static str),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer endpoint from a compact tracker response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddress {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parameters shared by every announce, rebuilt from the scheduler's
/// progress counters each tracker round.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    /// Advertised listening port. Nothing is bound to it; the value is
    /// advisory for trackers.
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval_secs: u32,
    pub peers: Vec<PeerAddress>,
}

/// A tracker URL resolved to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnounceTarget {
    Http { url: Url },
    Udp { host: String, port: u16 },
}

impl fmt::Display for AnnounceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnounceTarget::Http { url } => f.write_str(url.as_str()),
            AnnounceTarget::Udp { host, port } => write!(f, "udp://{host}:{port}"),
        }
    }
}

/// Builds announce targets from `announce` plus every `announce-list`
/// entry. URLs that fail to parse or use an unknown scheme are discarded
/// with a warning; duplicates collapse. Tier order is ignored.
pub fn build_targets(metainfo: &Metainfo) -> Vec<AnnounceTarget> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let urls = std::iter::once(metainfo.announce.as_str())
        .chain(metainfo.announce_list.iter().map(|entry| entry.url.as_str()));
    for raw in urls {
        if raw.is_empty() || !seen.insert(raw.to_owned()) {
            continue;
        }
        match parse_target(raw) {
            Ok(target) => targets.push(target),
            Err(reason) => warn!(url = raw, reason, "discarding tracker URL"),
        }
    }
    targets
}

fn parse_target(raw: &str) -> std::result::Result<AnnounceTarget, &'static str> {
    let url = Url::parse(raw).map_err(|_| "unparseable URL")?;
    match url.scheme() {
        "http" | "https" => Ok(AnnounceTarget::Http { url }),
        "udp" => {
            let host = url.host_str().ok_or("udp tracker without host")?.to_owned();
            let port = url.port().ok_or("udp tracker without port")?;
            Ok(AnnounceTarget::Udp { host, port })
        }
        _ => Err("unsupported scheme"),
    }
}

/// Announces to every target, merging the peer lists and de-duplicating by
/// `(ip, port)`. Failures are logged and skipped; the caller decides what
/// an empty aggregate means.
pub async fn announce_all(
    targets: &[AnnounceTarget],
    params: &AnnounceParams,
    udp_config: &UdpConfig,
) -> Vec<PeerAddress> {
    let mut seen = HashSet::new();
    let mut peers = Vec::new();
    for target in targets {
        let result = match target {
            AnnounceTarget::Http { url } => http::announce(url, params).await,
            AnnounceTarget::Udp { host, port } => {
                udp::announce(host, *port, params, udp_config).await
            }
        };
        match result {
            Ok(response) => {
                debug!(tracker = %target, count = response.peers.len(), "announce succeeded");
                for peer in response.peers {
                    if seen.insert(peer) {
                        peers.push(peer);
                    }
                }
            }
            Err(error) => warn!(tracker = %target, %error, "announce failed"),
        }
    }
    peers
}

/// Generates this client's peer id: a `-TL0001-` prefix and 12 random
/// bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-TL0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes a byte slice per RFC 3986, byte for byte. Used for the
/// `info_hash` and `peer_id` query values, which are raw 20-byte strings
/// and must not go through UTF-8.
pub(crate) fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

/// Splits a compact peers blob into addresses. The blob must be a nonzero
/// multiple of 6 bytes: 4-byte IPv4 then 2-byte port, network order.
pub(crate) fn parse_compact_peers(blob: &[u8]) -> TrackerResult<Vec<PeerAddress>> {
    if blob.is_empty() || blob.len() % 6 != 0 {
        return Err(TrackerError::InvalidPeersBlobLength(blob.len()));
    }
    Ok(blob
        .chunks_exact(6)
        .map(|chunk| PeerAddress {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}
