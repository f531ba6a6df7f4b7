use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use torrent_leech::client::{Client, ClientConfig, Observer};
use torrent_leech::torrent::Metainfo;
use torrent_leech::tracker::PeerAddress;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tleech", about = "Downloads a torrent's payload and exits")]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output directory
    #[arg(long, default_value = ".")]
    out: PathBuf,

    /// Port reported to trackers (nothing is bound to it)
    #[arg(long, default_value_t = 6881)]
    port: u16,

    /// Cap on concurrent peer connections per tracker round
    #[arg(long, default_value_t = 50)]
    max_peers: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    if let Err(error) = run(Cli::parse()).await {
        eprintln!("tleech: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let metainfo = Metainfo::load(&cli.torrent)
        .with_context(|| format!("loading {}", cli.torrent.display()))?;
    info!(
        name = %metainfo.info.suggested_name,
        pieces = metainfo.pieces_count(),
        size = %pretty_bytes(metainfo.total_size()),
        info_hash = %hex::encode(metainfo.info_hash),
        "loaded torrent"
    );
    let observer = Arc::new(Mutex::new(ProgressLogger::new(&metainfo)));
    let config = ClientConfig {
        out_dir: cli.out,
        port: cli.port,
        max_peers: cli.max_peers,
        ..ClientConfig::default()
    };
    let client = Client::new(metainfo, config, observer)?;
    client.download().await?;
    info!("download complete");
    Ok(())
}

/// Logs download progress, one line per completed piece.
struct ProgressLogger {
    total_bytes: u64,
    pieces_count: u32,
    received_bytes: u64,
    received_pieces: u32,
    total_peers: u32,
    peers_alive: u32,
}

impl ProgressLogger {
    fn new(metainfo: &Metainfo) -> Self {
        Self {
            total_bytes: metainfo.total_size(),
            pieces_count: metainfo.pieces_count(),
            received_bytes: 0,
            received_pieces: 0,
            total_peers: 0,
            peers_alive: 0,
        }
    }
}

impl Observer for ProgressLogger {
    fn on_peer_list_received(&mut self, peers: &[PeerAddress]) {
        self.total_peers = peers.len() as u32;
        self.peers_alive = self.total_peers;
        info!(peers = self.total_peers, "received peer list");
    }

    fn on_piece_completed(&mut self, index: u32, size: u32) {
        self.received_bytes += u64::from(size);
        self.received_pieces += 1;
        let percent = (self.received_bytes as f64 * 100.0) / self.total_bytes as f64;
        info!(
            "[{}/{}] [{}] downloaded {:.2}% ({}/{}), {} peers",
            self.received_pieces,
            self.pieces_count,
            index,
            percent,
            pretty_bytes(self.received_bytes),
            pretty_bytes(self.total_bytes),
            self.peers_alive,
        );
    }

    fn on_peer_finished(&mut self) {
        self.peers_alive = self.peers_alive.saturating_sub(1);
        debug!(
            alive = self.peers_alive,
            total = self.total_peers,
            "peer session finished"
        );
    }
}

fn pretty_bytes(bytes: u64) -> String {
    const SUFFIXES: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut count = bytes as f64;
    let mut suffix = 0;
    while count >= 1024.0 && suffix + 1 < SUFFIXES.len() {
        count /= 1024.0;
        suffix += 1;
    }
    if count.fract() == 0.0 {
        format!("{} {}", count as u64, SUFFIXES[suffix])
    } else {
        format!("{:.1} {}", count, SUFFIXES[suffix])
    }
}
