//! Shared fixtures: torrent builders, a scripted seeder, and a one-shot
//! HTTP tracker, all bound to ephemeral localhost ports.
#![allow(dead_code)]
use sha1::{Digest, Sha1};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use torrent_leech::peer::{message, Handshake, Message};
use torrent_leech::tracker::PeerAddress;

/// Bencodes a single-file torrent whose piece hashes match `payload`.
pub fn build_single_torrent(
    announce: &str,
    name: &str,
    piece_length: usize,
    payload: &[u8],
) -> Vec<u8> {
    let pieces = piece_hashes(payload, piece_length);
    let mut data = Vec::new();
    data.extend_from_slice(
        format!(
            "d8:announce{}:{}4:infod6:lengthi{}e4:name{}:{}12:piece lengthi{}e6:pieces{}:",
            announce.len(),
            announce,
            payload.len(),
            name.len(),
            name,
            piece_length,
            pieces.len(),
        )
        .as_bytes(),
    );
    data.extend_from_slice(&pieces);
    data.extend_from_slice(b"ee");
    data
}

/// Bencodes a multi-file torrent; each entry is `(path, length)` and the
/// hashes cover the concatenated payload. Paths may contain `/`.
pub fn build_multi_torrent(
    announce: &str,
    name: &str,
    piece_length: usize,
    files: &[(&str, u64)],
    payload: &[u8],
) -> Vec<u8> {
    let pieces = piece_hashes(payload, piece_length);
    let mut file_entries = String::new();
    for (path, length) in files {
        let mut path_list = String::new();
        for component in path.split('/') {
            path_list.push_str(&format!("{}:{}", component.len(), component));
        }
        file_entries.push_str(&format!("d6:lengthi{length}e4:pathl{path_list}ee"));
    }
    let mut data = Vec::new();
    data.extend_from_slice(
        format!(
            "d8:announce{}:{}4:infod5:filesl{}e4:name{}:{}12:piece lengthi{}e6:pieces{}:",
            announce.len(),
            announce,
            file_entries,
            name.len(),
            name,
            piece_length,
            pieces.len(),
        )
        .as_bytes(),
    );
    data.extend_from_slice(&pieces);
    data.extend_from_slice(b"ee");
    data
}

fn piece_hashes(payload: &[u8], piece_length: usize) -> Vec<u8> {
    let mut pieces = Vec::new();
    for chunk in payload.chunks(piece_length) {
        let hash: [u8; 20] = Sha1::digest(chunk).into();
        pieces.extend_from_slice(&hash);
    }
    pieces
}

/// A payload of distinguishable bytes so misplaced writes show up.
pub fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i / 256 + i % 251) as u8).collect()
}

pub fn full_bitfield(pieces_count: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; pieces_count.div_ceil(8) as usize];
    for index in 0..pieces_count {
        bytes[(index / 8) as usize] |= 1 << (7 - index % 8);
    }
    bytes
}

pub struct SeederConfig {
    pub payload: Vec<u8>,
    pub piece_length: usize,
    pub bitfield: Vec<u8>,
    /// Serve this many blocks, then drop the connection.
    pub serve_limit: Option<usize>,
    /// Send an explicit Choke after the bitfield, wait this long asserting
    /// no Request arrives, then Unchoke.
    pub choke_for: Option<Duration>,
    /// Before serving anything, wait for this many queued requests.
    pub initial_batch: usize,
}

impl SeederConfig {
    pub fn serving(payload: Vec<u8>, piece_length: usize, pieces_count: u32) -> Self {
        Self {
            payload,
            piece_length,
            bitfield: full_bitfield(pieces_count),
            serve_limit: None,
            choke_for: None,
            initial_batch: 0,
        }
    }
}

#[derive(Debug, Default)]
pub struct SeederReport {
    pub haves: Vec<u32>,
    pub requests: Vec<(u32, u32, u32)>,
    pub requests_while_choked: usize,
}

/// Accepts one leecher connection and plays the seeder side of the
/// protocol until the leecher disconnects (or the serve limit trips).
pub async fn run_seeder(
    listener: TcpListener,
    info_hash: [u8; 20],
    config: SeederConfig,
) -> SeederReport {
    let mut report = SeederReport::default();
    let (mut stream, _) = listener.accept().await.unwrap();

    let theirs = Handshake::read(&mut stream).await.unwrap();
    assert_eq!(theirs.info_hash, info_hash, "leecher sent wrong info hash");
    let ours = Handshake::new(info_hash, *b"-MK0001-mockmockmock");
    stream.write_all(&ours.serialize()).await.unwrap();

    message::write(&mut stream, &Message::Bitfield(config.bitfield.clone()))
        .await
        .unwrap();

    if let Some(window) = config.choke_for {
        message::write(&mut stream, &Message::Choke).await.unwrap();
        // The leecher answers the bitfield with Unchoke + Interested.
        for _ in 0..2 {
            let incoming = message::read(&mut stream).await.unwrap();
            assert!(matches!(incoming, Message::Unchoke | Message::Interested));
        }
        // Nothing else may arrive while the leecher is choked.
        if let Ok(incoming) = tokio::time::timeout(window, message::read(&mut stream)).await {
            if let Message::Request { .. } = incoming.unwrap() {
                report.requests_while_choked += 1;
            }
        }
    }
    message::write(&mut stream, &Message::Unchoke).await.unwrap();

    let mut served = 0usize;
    let mut pending: Vec<(u32, u32, u32)> = Vec::new();
    let mut batch = config.initial_batch;
    loop {
        let incoming = match message::read(&mut stream).await {
            Ok(message) => message,
            Err(_) => break, // leecher is done
        };
        match incoming {
            Message::Request {
                index,
                begin,
                length,
            } => {
                report.requests.push((index, begin, length));
                if config.serve_limit.is_some_and(|limit| served >= limit) {
                    break;
                }
                pending.push((index, begin, length));
                if pending.len() < batch {
                    continue;
                }
                batch = 0;
                for (index, begin, length) in pending.drain(..) {
                    let start = index as usize * config.piece_length + begin as usize;
                    let block = config.payload[start..start + length as usize].to_vec();
                    message::write(
                        &mut stream,
                        &Message::Piece {
                            index,
                            begin,
                            data: block,
                        },
                    )
                    .await
                    .unwrap();
                    served += 1;
                }
            }
            Message::Have(index) => report.haves.push(index),
            _ => {}
        }
    }
    report
}

/// Serves bencoded announce bodies over HTTP until the task is dropped.
pub async fn run_http_tracker(listener: TcpListener, peers: Vec<PeerAddress>) {
    let mut body = Vec::new();
    body.extend_from_slice(format!("d8:intervali1800e5:peers{}:", peers.len() * 6).as_bytes());
    for peer in &peers {
        body.extend_from_slice(&peer.ip.octets());
        body.extend_from_slice(&peer.port.to_be_bytes());
    }
    body.extend_from_slice(b"e");
    run_http_tracker_raw(listener, body).await;
}

/// Same, with a caller-supplied response body.
pub async fn run_http_tracker_raw(listener: TcpListener, body: Vec<u8>) {
    loop {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(header.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.flush().await.unwrap();
    }
}
