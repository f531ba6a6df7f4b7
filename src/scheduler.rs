//! The shared piece work-queue.
//!
//! Every peer session pulls work from one [`Scheduler`]: fresh piece
//! indices are handed out sequentially, pieces dropped by a failed peer
//! wait in a retry queue, and completed pieces are hash-checked and passed
//! to the completion callback (the piece writer). Sessions own the
//! in-progress [`PieceState`] buffer; the scheduler tracks assignment
//! accounting, so its locks are short and never held across I/O.
use crate::peer::Bitfield;
use crate::storage::StorageError;
use crate::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One piece in flight: how much has been requested from the peer, how
/// much has arrived, and the accumulated bytes.
///
/// `downloaded <= requested <= size` holds throughout, and `data.len()`
/// tracks `downloaded` because blocks are requested and received in
/// strictly increasing offset order.
#[derive(Debug)]
pub struct PieceState {
    pub index: u32,
    pub size: u32,
    pub requested: u32,
    pub downloaded: u32,
    pub data: Vec<u8>,
}

impl PieceState {
    fn new(index: u32, size: u32) -> Self {
        Self {
            index,
            size,
            requested: 0,
            downloaded: 0,
            data: Vec::with_capacity(size as usize),
        }
    }
}

/// Snapshot of overall progress, used for announces and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed_pieces: u32,
    pub pieces_count: u32,
    pub bytes_downloaded: u64,
    pub bytes_left: u64,
}

type CompletionCallback = Box<dyn FnMut(&PieceState) -> Result<(), StorageError> + Send>;

pub struct Scheduler {
    pieces_count: u32,
    piece_length: u64,
    total_size: u64,
    pieces_sha1: Vec<u8>,
    next_index: u32,
    assigned: HashSet<u32>,
    retry_queue: VecDeque<u32>,
    completed_count: u32,
    bytes_downloaded: u64,
    fatal: Option<String>,
    on_complete: CompletionCallback,
}

impl Scheduler {
    pub fn new(
        metainfo: &Metainfo,
        on_complete: impl FnMut(&PieceState) -> Result<(), StorageError> + Send + 'static,
    ) -> Self {
        Self {
            pieces_count: metainfo.pieces_count(),
            piece_length: metainfo.info.piece_length,
            total_size: metainfo.total_size(),
            pieces_sha1: metainfo.info.pieces_sha1.clone(),
            next_index: 0,
            assigned: HashSet::new(),
            retry_queue: VecDeque::new(),
            completed_count: 0,
            bytes_downloaded: 0,
            fatal: None,
            on_complete: Box::new(on_complete),
        }
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        if index + 1 < self.pieces_count {
            self.piece_length as u32
        } else {
            (self.total_size - self.piece_length * u64::from(self.pieces_count - 1)) as u32
        }
    }

    /// Hands out the next piece of work.
    ///
    /// Fresh indices are assigned without consulting the caller's bitfield:
    /// the caller releases a piece it cannot serve, which routes the piece
    /// through the retry queue so later-connecting peers get a chance at
    /// it. Only retry pops are filtered. Returns `None` when nothing the
    /// caller has is left, which is the session's signal to finish.
    pub fn pop(&mut self, have: &Bitfield) -> Option<PieceState> {
        if self.next_index < self.pieces_count {
            let index = self.next_index;
            self.next_index += 1;
            self.assigned.insert(index);
            return Some(PieceState::new(index, self.piece_size(index)));
        }
        let position = self
            .retry_queue
            .iter()
            .position(|&index| have.has_piece(index))?;
        let index = self.retry_queue.remove(position)?;
        self.assigned.insert(index);
        Some(PieceState::new(index, self.piece_size(index)))
    }

    /// Returns a piece to the retry queue. Progress is discarded; whoever
    /// picks it up re-downloads the piece from offset zero.
    pub fn release(&mut self, piece: PieceState) {
        debug!(index = piece.index, downloaded = piece.downloaded, "piece released for retry");
        self.assigned.remove(&piece.index);
        self.retry_queue.push_back(piece.index);
    }

    /// Accepts a fully downloaded piece. The SHA-1 of the data is checked
    /// against the metainfo; a mismatch re-queues the piece and returns
    /// `Ok(false)`. On success the completion callback runs (still inside
    /// the scheduler's critical section, so completions are serialized)
    /// and the method returns `Ok(true)`.
    pub fn complete(&mut self, piece: PieceState) -> Result<bool, StorageError> {
        if !self.verify(&piece) {
            warn!(index = piece.index, "piece failed hash check, re-queueing");
            self.assigned.remove(&piece.index);
            self.retry_queue.push_back(piece.index);
            return Ok(false);
        }
        self.assigned.remove(&piece.index);
        self.completed_count += 1;
        self.bytes_downloaded += u64::from(piece.size);
        if let Err(error) = (self.on_complete)(&piece) {
            // A failed write is fatal to the whole download, not just to
            // the session that happened to deliver the piece.
            self.fatal = Some(error.to_string());
            return Err(error);
        }
        Ok(true)
    }

    fn verify(&self, piece: &PieceState) -> bool {
        let start = piece.index as usize * 20;
        let expected = &self.pieces_sha1[start..start + 20];
        let actual: [u8; 20] = Sha1::digest(&piece.data).into();
        actual[..] == *expected
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count == self.pieces_count
    }

    pub fn progress(&self) -> Progress {
        Progress {
            completed_pieces: self.completed_count,
            pieces_count: self.pieces_count,
            bytes_downloaded: self.bytes_downloaded,
            bytes_left: self.total_size - self.bytes_downloaded,
        }
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    #[cfg(test)]
    fn accounting(&self) -> (u32, usize, usize, u32) {
        (
            self.completed_count,
            self.assigned.len(),
            self.retry_queue.len(),
            self.pieces_count - self.next_index,
        )
    }
}

/// Clonable handle sessions use to reach the scheduler. Every method is a
/// synchronous critical section; the lock is never held across an await.
#[derive(Clone)]
pub struct SharedScheduler {
    inner: Arc<Mutex<Scheduler>>,
}

impl SharedScheduler {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(Mutex::new(scheduler)),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        let mut guard = self.inner.lock().expect("scheduler mutex poisoned");
        f(&mut guard)
    }

    pub fn pop(&self, have: &Bitfield) -> Option<PieceState> {
        self.with(|scheduler| scheduler.pop(have))
    }

    pub fn release(&self, piece: PieceState) {
        self.with(|scheduler| scheduler.release(piece));
    }

    pub fn complete(&self, piece: PieceState) -> Result<bool, StorageError> {
        self.with(|scheduler| scheduler.complete(piece))
    }

    pub fn is_complete(&self) -> bool {
        self.with(|scheduler| scheduler.is_complete())
    }

    pub fn progress(&self) -> Progress {
        self.with(|scheduler| scheduler.progress())
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.with(|scheduler| scheduler.fatal_error().map(str::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Position;
    use crate::torrent::{AnnounceEntry, Info, Layout};

    fn metainfo(pieces: &[&[u8]], piece_length: u64, total: u64) -> Metainfo {
        let mut pieces_sha1 = Vec::new();
        for data in pieces {
            let hash: [u8; 20] = Sha1::digest(data).into();
            pieces_sha1.extend_from_slice(&hash);
        }
        Metainfo {
            announce: "http://tracker/announce".to_owned(),
            announce_list: Vec::<AnnounceEntry>::new(),
            info: Info {
                suggested_name: "f".to_owned(),
                piece_length,
                pieces_sha1,
                layout: Layout::Single { length: total },
            },
            info_position: Position { start: 0, end: 0 },
            info_hash: [0; 20],
        }
    }

    fn full_bitfield(pieces_count: u32) -> Bitfield {
        let mut bitfield = Bitfield::empty(pieces_count);
        for index in 0..pieces_count {
            bitfield.set_piece(index);
        }
        bitfield
    }

    fn finish(piece: &mut PieceState, content: &[u8]) {
        piece.requested = piece.size;
        piece.downloaded = piece.size;
        piece.data.extend_from_slice(content);
    }

    #[test]
    fn hands_out_sequential_indices_then_none() {
        let metainfo = metainfo(&[b"aa", b"b"], 2, 3);
        let mut scheduler = Scheduler::new(&metainfo, |_| Ok(()));
        let have = full_bitfield(2);

        let mut first = scheduler.pop(&have).unwrap();
        let mut second = scheduler.pop(&have).unwrap();
        assert_eq!((first.index, first.size), (0, 2));
        assert_eq!((second.index, second.size), (1, 1));
        assert!(scheduler.pop(&have).is_none());

        finish(&mut first, b"aa");
        finish(&mut second, b"b");
        assert!(scheduler.complete(first).unwrap());
        assert!(scheduler.complete(second).unwrap());
        assert!(scheduler.is_complete());
        assert!(scheduler.pop(&have).is_none());
    }

    #[test]
    fn fresh_pieces_skip_the_bitfield_filter() {
        let metainfo = metainfo(&[b"aa", b"b"], 2, 3);
        let mut scheduler = Scheduler::new(&metainfo, |_| Ok(()));
        let empty = Bitfield::empty(2);
        // A peer with nothing still receives fresh assignments; releasing
        // them routes the pieces into the retry queue.
        let piece = scheduler.pop(&empty).unwrap();
        assert_eq!(piece.index, 0);
        scheduler.release(piece);
        let piece = scheduler.pop(&empty).unwrap();
        assert_eq!(piece.index, 1);
        scheduler.release(piece);
        // Retry pops are filtered, so this peer is done.
        assert!(scheduler.pop(&empty).is_none());
    }

    #[test]
    fn retry_pop_honors_the_bitfield() {
        let pieces: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 4]).collect();
        let refs: Vec<&[u8]> = pieces.iter().map(|p| p.as_slice()).collect();
        let metainfo = metainfo(&refs, 4, 40);
        let mut scheduler = Scheduler::new(&metainfo, |_| Ok(()));
        let all = full_bitfield(10);
        let mut handed = Vec::new();
        while let Some(piece) = scheduler.pop(&all) {
            handed.push(piece);
        }
        // Release 7 and 9, complete the rest.
        for piece in handed {
            if piece.index == 7 || piece.index == 9 {
                scheduler.release(piece);
            } else {
                let mut piece = piece;
                let content = vec![piece.index as u8; 4];
                finish(&mut piece, &content);
                assert!(scheduler.complete(piece).unwrap());
            }
        }
        let mut only_seven = Bitfield::empty(10);
        only_seven.set_piece(7);
        let piece = scheduler.pop(&only_seven).unwrap();
        assert_eq!(piece.index, 7);
        // 9 is still queued but this peer lacks it.
        assert!(scheduler.pop(&only_seven).is_none());
        scheduler.release(piece);
    }

    #[test]
    fn accounting_invariant_holds() {
        let pieces: Vec<Vec<u8>> = (0..6u8).map(|i| vec![i; 4]).collect();
        let refs: Vec<&[u8]> = pieces.iter().map(|p| p.as_slice()).collect();
        let metainfo = metainfo(&refs, 4, 24);
        let mut scheduler = Scheduler::new(&metainfo, |_| Ok(()));
        let all = full_bitfield(6);

        let a = scheduler.pop(&all).unwrap();
        let b = scheduler.pop(&all).unwrap();
        let mut c = scheduler.pop(&all).unwrap();
        let (completed, assigned, retry, unassigned) = scheduler.accounting();
        assert_eq!(completed as usize + assigned + retry + unassigned as usize, 6);

        scheduler.release(a);
        scheduler.release(b);
        finish(&mut c, &[2; 4]);
        assert!(scheduler.complete(c).unwrap());
        let (completed, assigned, retry, unassigned) = scheduler.accounting();
        assert_eq!(completed, 1);
        assert_eq!(assigned, 0);
        assert_eq!(retry, 2);
        assert_eq!(unassigned, 3);
    }

    #[test]
    fn hash_mismatch_requeues_the_piece() {
        let metainfo = metainfo(&[b"good"], 4, 4);
        let mut scheduler = Scheduler::new(&metainfo, |_| Ok(()));
        let have = full_bitfield(1);

        let mut piece = scheduler.pop(&have).unwrap();
        finish(&mut piece, b"evil");
        assert!(!scheduler.complete(piece).unwrap());
        assert!(!scheduler.is_complete());

        // The piece comes back out of the retry queue for another attempt.
        let mut piece = scheduler.pop(&have).unwrap();
        assert_eq!(piece.index, 0);
        finish(&mut piece, b"good");
        assert!(scheduler.complete(piece).unwrap());
        assert!(scheduler.is_complete());
    }

    #[test]
    fn completion_callback_receives_pieces_and_errors_are_fatal() {
        let metainfo = metainfo(&[b"data"], 4, 4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut scheduler = Scheduler::new(&metainfo, move |piece| {
            sink.lock().unwrap().push((piece.index, piece.data.clone()));
            Ok(())
        });
        let have = full_bitfield(1);
        let mut piece = scheduler.pop(&have).unwrap();
        finish(&mut piece, b"data");
        assert!(scheduler.complete(piece).unwrap());
        assert_eq!(seen.lock().unwrap().as_slice(), &[(0, b"data".to_vec())]);

        let metainfo = metainfo_err();
        let mut scheduler = Scheduler::new(&metainfo, |_| {
            Err(StorageError::UnsafePath("nope".to_owned()))
        });
        let mut piece = scheduler.pop(&have).unwrap();
        finish(&mut piece, b"data");
        assert!(scheduler.complete(piece).is_err());
        assert!(scheduler.fatal_error().is_some());
    }

    fn metainfo_err() -> Metainfo {
        metainfo(&[b"data"], 4, 4)
    }

    #[test]
    fn progress_tracks_bytes() {
        let metainfo = metainfo(&[b"aaaa", b"bb"], 4, 6);
        let mut scheduler = Scheduler::new(&metainfo, |_| Ok(()));
        let have = full_bitfield(2);
        assert_eq!(scheduler.progress().bytes_left, 6);
        let mut piece = scheduler.pop(&have).unwrap();
        finish(&mut piece, b"aaaa");
        scheduler.complete(piece).unwrap();
        let progress = scheduler.progress();
        assert_eq!(progress.completed_pieces, 1);
        assert_eq!(progress.bytes_downloaded, 4);
        assert_eq!(progress.bytes_left, 2);
    }
}
