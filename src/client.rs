//! The download orchestrator.
//!
//! Ties the subsystems together: announces to the torrent's trackers,
//! spawns one session task per discovered peer against the shared
//! scheduler, waits the round out, and re-announces with fresh progress
//! counters until every piece is on disk.
use crate::peer::PeerSession;
use crate::scheduler::{PieceState, Progress, Scheduler, SharedScheduler};
use crate::storage::Storage;
use crate::torrent::Metainfo;
use crate::tracker::{self, AnnounceParams, AnnounceTarget, PeerAddress, UdpConfig};
use anyhow::bail;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Progress hooks, fired serialized with the scheduler. Implementors
/// should return quickly; a piece completion callback runs inside the
/// scheduler's critical section.
pub trait Observer: Send {
    fn on_peer_list_received(&mut self, peers: &[PeerAddress]) {
        let _ = peers;
    }

    fn on_piece_completed(&mut self, index: u32, size: u32) {
        let _ = (index, size);
    }

    fn on_peer_finished(&mut self) {}
}

/// An [`Observer`] that ignores everything.
pub struct NullObserver;

impl Observer for NullObserver {}

pub type SharedObserver = Arc<Mutex<dyn Observer>>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub out_dir: PathBuf,
    /// Advertised listening port; nothing is bound to it.
    pub port: u16,
    /// Cap on concurrent peer sessions per tracker round.
    pub max_peers: usize,
    /// Sleep between rounds that produced no peers.
    pub round_backoff: Duration,
    /// Consecutive empty announce rounds tolerated before giving up.
    pub max_empty_rounds: u32,
    pub udp: UdpConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            port: 6881,
            max_peers: 50,
            round_backoff: Duration::from_secs(10),
            max_empty_rounds: 5,
            udp: UdpConfig::default(),
        }
    }
}

pub struct Client {
    metainfo: Metainfo,
    config: ClientConfig,
    peer_id: [u8; 20],
    scheduler: SharedScheduler,
    observer: SharedObserver,
}

impl Client {
    /// Prepares the storage layout and the scheduler. Completed pieces
    /// flow from the scheduler into storage and the observer without the
    /// sessions seeing either.
    pub fn new(
        metainfo: Metainfo,
        config: ClientConfig,
        observer: SharedObserver,
    ) -> anyhow::Result<Self> {
        let mut storage = Storage::new(&metainfo, &config.out_dir)?;
        let piece_observer = Arc::clone(&observer);
        let scheduler = Scheduler::new(&metainfo, move |piece: &PieceState| {
            storage.write_piece(piece.index, &piece.data)?;
            piece_observer
                .lock()
                .expect("observer mutex poisoned")
                .on_piece_completed(piece.index, piece.size);
            Ok(())
        });
        Ok(Self {
            metainfo,
            config,
            peer_id: tracker::generate_peer_id(),
            scheduler: SharedScheduler::new(scheduler),
            observer,
        })
    }

    pub fn progress(&self) -> Progress {
        self.scheduler.progress()
    }

    /// Downloads the whole payload: tracker round after tracker round
    /// until the scheduler reports completion.
    ///
    /// A round that yields no peers at all aborts the client when it is
    /// the first one (nothing will ever arrive) and otherwise backs off
    /// and retries, up to a cap of consecutive empty rounds.
    pub async fn download(&self) -> anyhow::Result<()> {
        let targets = tracker::build_targets(&self.metainfo);
        if targets.is_empty() {
            bail!("metainfo names no usable tracker");
        }
        let mut round: u32 = 0;
        let mut empty_rounds: u32 = 0;
        while !self.scheduler.is_complete() {
            let peers = self.announce(&targets).await;
            if peers.is_empty() {
                if round == 0 {
                    bail!("no peers from any tracker");
                }
                empty_rounds += 1;
                if empty_rounds > self.config.max_empty_rounds {
                    bail!("no peers after {empty_rounds} announce rounds");
                }
                debug!(empty_rounds, "no peers this round, backing off");
                tokio::time::sleep(self.config.round_backoff).await;
                continue;
            }
            empty_rounds = 0;
            self.notify(|observer| observer.on_peer_list_received(&peers));
            info!(round, peers = peers.len(), "starting tracker round");
            self.run_round(peers).await;
            if let Some(message) = self.scheduler.fatal_error() {
                bail!("writing pieces failed: {message}");
            }
            round += 1;
        }
        Ok(())
    }

    async fn announce(&self, targets: &[AnnounceTarget]) -> Vec<PeerAddress> {
        let progress = self.scheduler.progress();
        let params = AnnounceParams {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            uploaded: 0,
            downloaded: progress.bytes_downloaded,
            left: progress.bytes_left,
        };
        tracker::announce_all(targets, &params, &self.config.udp).await
    }

    /// Spawns one session per address and waits for all of them. There is
    /// no mid-round cancellation; a round ends when every session has
    /// terminated on its own.
    async fn run_round(&self, peers: Vec<PeerAddress>) {
        let mut sessions = JoinSet::new();
        for address in peers.into_iter().take(self.config.max_peers) {
            let session = PeerSession::new(
                address,
                self.metainfo.info_hash,
                self.peer_id,
                self.scheduler.clone(),
            );
            sessions.spawn(async move { (address, session.run().await) });
        }
        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((address, Ok(()))) => debug!(peer = %address, "session finished"),
                Ok((address, Err(error))) => debug!(peer = %address, %error, "session failed"),
                Err(error) => warn!(%error, "session task panicked"),
            }
            self.notify(|observer| observer.on_peer_finished());
        }
    }

    fn notify(&self, f: impl FnOnce(&mut dyn Observer)) {
        let mut observer = self.observer.lock().expect("observer mutex poisoned");
        f(&mut *observer);
    }
}
